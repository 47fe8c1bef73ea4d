use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use archivist_sync::CompletionBarrier;
use archivist_types::PeerId;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::connection::{ConnectionEvent, DestroyReason, Direction, PeerConnection};
use crate::error::{SwarmError, SwarmResult};

/// How a replication stream ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// The peer closed the connection.
    Closed,
    /// The transport reported an error.
    Errored(String),
    /// No handshake arrived before the deadline.
    HandshakeTimeout,
    /// The owning archive was closed.
    Shutdown,
}

impl StreamEnd {
    /// Failures as errors; clean closes and shutdowns as `Ok`.
    pub fn into_result(self, peer: &PeerId, timeout: Duration) -> SwarmResult<()> {
        match self {
            Self::Closed | Self::Shutdown => Ok(()),
            Self::Errored(reason) => Err(SwarmError::Transport {
                peer: peer.clone(),
                reason,
            }),
            Self::HandshakeTimeout => Err(SwarmError::HandshakeTimeout {
                peer: peer.clone(),
                timeout,
            }),
        }
    }
}

/// One open replication channel with a single peer.
///
/// A stream sits in its archive's stream set from creation until its driver
/// observes the end of the connection; [`ReplicationStream::wait_closed`]
/// resolves only after it has been removed from that set.
pub struct ReplicationStream {
    id: u64,
    peer: PeerId,
    direction: Direction,
    opened_at: Instant,
    handshaken: AtomicBool,
    transport: Mutex<Option<oneshot::Sender<DestroyReason>>>,
    destroy_reason: Mutex<Option<DestroyReason>>,
    destroy_requested: Notify,
    end: CompletionBarrier<StreamEnd>,
}

impl ReplicationStream {
    /// Wrap a delivered connection. The event receiver is handed back for
    /// the stream driver to consume.
    pub(crate) fn from_connection(
        id: u64,
        conn: PeerConnection,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let stream = Self {
            id,
            peer: conn.peer,
            direction: conn.direction,
            opened_at: Instant::now(),
            handshaken: AtomicBool::new(false),
            transport: Mutex::new(Some(conn.destroy)),
            destroy_reason: Mutex::new(None),
            destroy_requested: Notify::new(),
            end: CompletionBarrier::new(),
        };
        (stream, conn.events)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn is_handshaken(&self) -> bool {
        self.handshaken.load(Ordering::Acquire)
    }

    /// Returns `true` on the first handshake only.
    pub(crate) fn mark_handshaken(&self) -> bool {
        !self.handshaken.swap(true, Ordering::AcqRel)
    }

    /// Tear the stream down. Only the first call has any effect; returns
    /// whether this call was it.
    pub fn destroy(&self, reason: DestroyReason) -> bool {
        {
            let mut slot = self.destroy_reason.lock().expect("stream lock poisoned");
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        if let Some(tx) = self.transport.lock().expect("stream lock poisoned").take() {
            // The transport may already be gone; that is the outcome we want.
            let _ = tx.send(reason);
        }
        self.destroy_requested.notify_one();
        true
    }

    pub(crate) async fn destroy_requested(&self) -> DestroyReason {
        loop {
            let requested = *self.destroy_reason.lock().expect("stream lock poisoned");
            if let Some(reason) = requested {
                return reason;
            }
            self.destroy_requested.notified().await;
        }
    }

    pub(crate) fn finish(&self, end: StreamEnd) {
        // A driver finishes its stream exactly once.
        let _ = self.end.set(end);
    }

    /// How the stream ended, if it has.
    pub fn end(&self) -> Option<StreamEnd> {
        self.end.get()
    }

    pub fn is_closed(&self) -> bool {
        self.end.is_set()
    }

    /// Suspend until the stream has ended and left its archive's stream set.
    pub async fn wait_closed(&self) -> StreamEnd {
        self.end.wait().await
    }
}

impl fmt::Debug for ReplicationStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationStream")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("handshaken", &self.is_handshaken())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> (ReplicationStream, crate::connection::ConnectionDriver) {
        let (conn, driver) = PeerConnection::pair(PeerId::new("peer"), Direction::Inbound);
        let (stream, _events) = ReplicationStream::from_connection(7, conn);
        (stream, driver)
    }

    #[tokio::test]
    async fn destroy_is_first_wins() {
        let (stream, mut driver) = stream();
        assert!(stream.destroy(DestroyReason::HandshakeTimeout));
        assert!(!stream.destroy(DestroyReason::Shutdown));
        assert_eq!(stream.destroy_requested().await, DestroyReason::HandshakeTimeout);
        assert_eq!(driver.destroyed().await, Some(DestroyReason::HandshakeTimeout));
    }

    #[test]
    fn handshake_is_marked_once() {
        let (stream, _driver) = stream();
        assert!(!stream.is_handshaken());
        assert!(stream.mark_handshaken());
        assert!(!stream.mark_handshaken());
        assert!(stream.is_handshaken());
    }

    #[test]
    fn end_maps_to_errors() {
        let peer = PeerId::new("p");
        let t = Duration::from_secs(5);
        assert!(StreamEnd::Closed.into_result(&peer, t).is_ok());
        assert!(StreamEnd::Shutdown.into_result(&peer, t).is_ok());
        assert!(matches!(
            StreamEnd::HandshakeTimeout.into_result(&peer, t),
            Err(SwarmError::HandshakeTimeout { .. })
        ));
        assert!(matches!(
            StreamEnd::Errored("reset".into()).into_result(&peer, t),
            Err(SwarmError::Transport { .. })
        ));
    }
}
