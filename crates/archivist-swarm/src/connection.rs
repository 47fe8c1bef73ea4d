use std::fmt;

use archivist_types::PeerId;
use tokio::sync::{mpsc, oneshot};

const EVENT_CAPACITY: usize = 16;

/// Which side opened the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

/// Something the transport observed on a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The peer completed the replication handshake.
    Handshake,
    /// The transport failed; the connection is unusable.
    Error(String),
    /// The peer closed the connection.
    Closed,
}

/// Why the replicator tore a connection down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestroyReason {
    HandshakeTimeout,
    TransportError,
    Shutdown,
}

/// Replicator-side end of a peer connection.
///
/// Produced by a transport through [`PeerConnection::pair`] and delivered to
/// the replicator over the membership's connection channel.
pub struct PeerConnection {
    pub(crate) peer: PeerId,
    pub(crate) direction: Direction,
    pub(crate) events: mpsc::Receiver<ConnectionEvent>,
    pub(crate) destroy: oneshot::Sender<DestroyReason>,
}

impl PeerConnection {
    /// Create a connected pair: the `PeerConnection` goes to the replicator,
    /// the [`ConnectionDriver`] stays with the transport.
    pub fn pair(peer: PeerId, direction: Direction) -> (PeerConnection, ConnectionDriver) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (destroy_tx, destroy_rx) = oneshot::channel();
        let conn = PeerConnection {
            peer: peer.clone(),
            direction,
            events: events_rx,
            destroy: destroy_tx,
        };
        let driver = ConnectionDriver {
            peer,
            events: events_tx,
            destroy: destroy_rx,
            outcome: None,
        };
        (conn, driver)
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .finish()
    }
}

/// Transport-side end of a peer connection.
///
/// Event methods return `false` once the replicator side has gone away,
/// which tells the transport to stop driving the connection.
pub struct ConnectionDriver {
    peer: PeerId,
    events: mpsc::Sender<ConnectionEvent>,
    destroy: oneshot::Receiver<DestroyReason>,
    outcome: Option<Option<DestroyReason>>,
}

impl ConnectionDriver {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub async fn handshake(&self) -> bool {
        self.events.send(ConnectionEvent::Handshake).await.is_ok()
    }

    pub async fn error(&self, reason: impl Into<String>) -> bool {
        self.events
            .send(ConnectionEvent::Error(reason.into()))
            .await
            .is_ok()
    }

    pub async fn close(&self) -> bool {
        self.events.send(ConnectionEvent::Closed).await.is_ok()
    }

    /// Resolve once the replicator destroys this connection or drops its end.
    ///
    /// Yields the reason for an explicit destroy and `None` if the replicator
    /// side was dropped. Cancel-safe, and may be awaited again after it
    /// resolved.
    pub async fn destroyed(&mut self) -> Option<DestroyReason> {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        let outcome = (&mut self.destroy).await.ok();
        self.outcome = Some(outcome);
        outcome
    }
}

impl fmt::Debug for ConnectionDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDriver")
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_flow_from_driver_to_connection() {
        let (mut conn, driver) = PeerConnection::pair(PeerId::new("p"), Direction::Inbound);
        assert!(driver.handshake().await);
        assert!(driver.close().await);
        assert_eq!(conn.events.recv().await, Some(ConnectionEvent::Handshake));
        assert_eq!(conn.events.recv().await, Some(ConnectionEvent::Closed));
    }

    #[tokio::test]
    async fn destroy_reaches_driver() {
        let (conn, mut driver) = PeerConnection::pair(PeerId::new("p"), Direction::Outbound);
        conn.destroy.send(DestroyReason::Shutdown).unwrap();
        assert_eq!(driver.destroyed().await, Some(DestroyReason::Shutdown));
        assert_eq!(driver.destroyed().await, Some(DestroyReason::Shutdown));
    }

    #[tokio::test]
    async fn dropped_connection_reads_as_destroyed() {
        let (conn, mut driver) = PeerConnection::pair(PeerId::new("p"), Direction::Inbound);
        drop(conn);
        assert_eq!(driver.destroyed().await, None);
        assert!(!driver.handshake().await);
    }
}
