use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use archivist_types::{ArchiveKey, DiscoveryKey};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HANDSHAKE_TIMEOUT;
use crate::connection::{ConnectionEvent, DestroyReason, PeerConnection};
use crate::discovery::{Discovery, Joined, Membership};
use crate::error::{SwarmError, SwarmResult};
use crate::stream::{ReplicationStream, StreamEnd};

/// Joins the discovery network for resident archives and manages their
/// replication streams.
pub struct SwarmReplicator {
    discovery: Option<Arc<dyn Discovery>>,
    handshake_timeout: Duration,
}

impl SwarmReplicator {
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self {
            discovery: Some(discovery),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// A replicator that never joins a network; archives stay local.
    pub fn disabled() -> Self {
        Self {
            discovery: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn is_enabled(&self) -> bool {
        self.discovery.is_some()
    }

    /// Join the swarm for `replication`'s archive and start accepting peers.
    ///
    /// A failed join is logged and leaves the archive unreplicated; it never
    /// fails the caller. Returns whether the archive is now in the swarm.
    pub async fn attach(&self, replication: &Arc<Replication>) -> bool {
        let Some(discovery) = &self.discovery else {
            debug!(key = %replication.key(), "swarm disabled, not replicating");
            return false;
        };

        let joined = match discovery.join(replication.discovery_key()).await {
            Ok(joined) => joined,
            Err(e) => {
                warn!(key = %replication.key(), error = %e, "swarm join failed, archive stays unreplicated");
                return false;
            }
        };

        let Joined {
            membership,
            connections,
        } = joined;
        replication.set_membership(membership);
        let task = tokio::spawn(accept_loop(
            Arc::clone(replication),
            connections,
            self.handshake_timeout,
        ));
        replication.set_accept_task(task);

        info!(
            key = %replication.key(),
            discovery_key = %replication.discovery_key(),
            "joined swarm"
        );
        true
    }
}

impl Default for SwarmReplicator {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for SwarmReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmReplicator")
            .field("enabled", &self.is_enabled())
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

#[derive(Default)]
struct StreamSet {
    open: Vec<Arc<ReplicationStream>>,
    closed: bool,
}

/// Replication state of one resident archive.
///
/// The stream set is mutated only by the replicator's tasks: the accept
/// loop adds, each stream's driver removes its own stream.
pub struct Replication {
    key: ArchiveKey,
    discovery_key: DiscoveryKey,
    next_stream_id: AtomicU64,
    streams: Mutex<StreamSet>,
    membership: Mutex<Option<Box<dyn Membership>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Replication {
    pub fn new(key: ArchiveKey) -> Self {
        Self {
            key,
            discovery_key: key.discovery_key(),
            next_stream_id: AtomicU64::new(1),
            streams: Mutex::new(StreamSet::default()),
            membership: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &ArchiveKey {
        &self.key
    }

    pub fn discovery_key(&self) -> DiscoveryKey {
        self.discovery_key
    }

    /// Snapshot of the open streams in creation order.
    pub fn streams(&self) -> Vec<Arc<ReplicationStream>> {
        self.streams.lock().expect("stream set lock poisoned").open.clone()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().expect("stream set lock poisoned").open.len()
    }

    /// Whether the archive currently holds a swarm membership.
    pub fn is_joined(&self) -> bool {
        self.membership.lock().expect("membership lock poisoned").is_some()
    }

    /// Whether [`Self::shutdown`] has started.
    pub fn is_shut_down(&self) -> bool {
        self.streams.lock().expect("stream set lock poisoned").closed
    }

    fn set_membership(&self, membership: Box<dyn Membership>) {
        *self.membership.lock().expect("membership lock poisoned") = Some(membership);
    }

    fn set_accept_task(&self, task: JoinHandle<()>) {
        *self.accept_task.lock().expect("accept task lock poisoned") = Some(task);
    }

    fn add_stream(&self, stream: Arc<ReplicationStream>) -> bool {
        let mut set = self.streams.lock().expect("stream set lock poisoned");
        if set.closed {
            return false;
        }
        set.open.push(stream);
        true
    }

    fn remove_stream(&self, id: u64) {
        let mut set = self.streams.lock().expect("stream set lock poisoned");
        set.open.retain(|s| s.id() != id);
    }

    /// Tear down replication: stop accepting peers, destroy every open
    /// stream and wait for each to leave the set, then leave the swarm.
    ///
    /// Safe to call more than once; later calls find nothing left to do.
    pub async fn shutdown(&self) -> SwarmResult<()> {
        let streams = {
            let mut set = self.streams.lock().expect("stream set lock poisoned");
            set.closed = true;
            set.open.clone()
        };

        let accept = self.accept_task.lock().expect("accept task lock poisoned").take();
        if let Some(task) = accept {
            task.abort();
        }

        for stream in &streams {
            stream.destroy(DestroyReason::Shutdown);
        }
        for stream in &streams {
            stream.wait_closed().await;
        }
        debug!(key = %self.key, streams = streams.len(), "replication streams destroyed");

        let membership = self.membership.lock().expect("membership lock poisoned").take();
        if let Some(membership) = membership {
            membership.leave().await.map_err(|e| match e {
                SwarmError::Leave { .. } => e,
                other => SwarmError::Leave {
                    key: self.discovery_key,
                    reason: other.to_string(),
                },
            })?;
            info!(key = %self.key, "left swarm");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Replication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replication")
            .field("key", &self.key)
            .field("streams", &self.stream_count())
            .field("joined", &self.is_joined())
            .finish()
    }
}

async fn accept_loop(
    replication: Arc<Replication>,
    mut connections: mpsc::Receiver<PeerConnection>,
    handshake_timeout: Duration,
) {
    while let Some(conn) = connections.recv().await {
        let id = replication.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (stream, events) = ReplicationStream::from_connection(id, conn);
        let stream = Arc::new(stream);

        if !replication.add_stream(Arc::clone(&stream)) {
            stream.destroy(DestroyReason::Shutdown);
            stream.finish(StreamEnd::Shutdown);
            break;
        }
        debug!(
            key = %replication.key(),
            stream = id,
            peer = %stream.peer(),
            direction = %stream.direction(),
            "replication stream opened"
        );
        tokio::spawn(drive_stream(
            Arc::clone(&replication),
            stream,
            events,
            handshake_timeout,
        ));
    }
    debug!(key = %replication.key(), "connection channel closed");
}

/// Run one stream until its connection ends, enforcing the handshake
/// deadline, then remove it from the set.
async fn drive_stream(
    replication: Arc<Replication>,
    stream: Arc<ReplicationStream>,
    mut events: mpsc::Receiver<ConnectionEvent>,
    handshake_timeout: Duration,
) {
    let deadline = tokio::time::sleep(handshake_timeout);
    tokio::pin!(deadline);

    let end = loop {
        tokio::select! {
            // Events first: a handshake that lands together with the
            // deadline still counts.
            biased;

            event = events.recv() => match event {
                Some(ConnectionEvent::Handshake) => {
                    if stream.mark_handshaken() {
                        debug!(stream = stream.id(), peer = %stream.peer(), "handshake complete");
                    }
                }
                Some(ConnectionEvent::Error(reason)) => {
                    warn!(stream = stream.id(), peer = %stream.peer(), error = %reason, "replication stream failed");
                    stream.destroy(DestroyReason::TransportError);
                    break StreamEnd::Errored(reason);
                }
                Some(ConnectionEvent::Closed) | None => break StreamEnd::Closed,
            },
            reason = stream.destroy_requested() => {
                break match reason {
                    DestroyReason::HandshakeTimeout => StreamEnd::HandshakeTimeout,
                    DestroyReason::TransportError => StreamEnd::Errored("destroyed".into()),
                    DestroyReason::Shutdown => StreamEnd::Shutdown,
                };
            }
            () = &mut deadline, if !stream.is_handshaken() => {
                warn!(
                    stream = stream.id(),
                    peer = %stream.peer(),
                    timeout = ?handshake_timeout,
                    "handshake timed out, destroying stream"
                );
                stream.destroy(DestroyReason::HandshakeTimeout);
                break StreamEnd::HandshakeTimeout;
            }
        }
    };

    replication.remove_stream(stream.id());
    debug!(key = %replication.key(), stream = stream.id(), end = ?end, "replication stream closed");
    stream.finish(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionDriver;
    use crate::memory::MemorySwarm;
    use archivist_types::PeerId;

    const SHORT: Duration = Duration::from_millis(100);

    fn key(b: u8) -> ArchiveKey {
        ArchiveKey::from_bytes([b; 32])
    }

    async fn attached(swarm: &MemorySwarm, k: ArchiveKey) -> Arc<Replication> {
        let replicator =
            SwarmReplicator::new(Arc::new(swarm.clone())).with_handshake_timeout(SHORT);
        let replication = Arc::new(Replication::new(k));
        assert!(replicator.attach(&replication).await);
        replication
    }

    async fn connect(swarm: &MemorySwarm, k: ArchiveKey, peer: &str) -> ConnectionDriver {
        let driver = swarm
            .connect(k.discovery_key(), PeerId::new(peer))
            .await
            .expect("archive is in the swarm");
        // Give the accept loop a moment to register the stream.
        tokio::time::sleep(Duration::from_millis(10)).await;
        driver
    }

    #[tokio::test]
    async fn stream_without_handshake_times_out() {
        let swarm = MemorySwarm::new();
        let replication = attached(&swarm, key(1)).await;
        let mut driver = connect(&swarm, key(1), "slow").await;

        let streams = replication.streams();
        assert_eq!(streams.len(), 1);
        let end = streams[0].wait_closed().await;
        assert_eq!(end, StreamEnd::HandshakeTimeout);
        let reported = streams[0].end().unwrap().into_result(streams[0].peer(), SHORT);
        assert!(matches!(reported, Err(SwarmError::HandshakeTimeout { .. })));
        assert_eq!(replication.stream_count(), 0);
        assert_eq!(driver.destroyed().await, Some(DestroyReason::HandshakeTimeout));
    }

    #[tokio::test]
    async fn handshake_before_deadline_keeps_stream() {
        let swarm = MemorySwarm::new();
        let replication = attached(&swarm, key(2)).await;
        let driver = connect(&swarm, key(2), "prompt").await;

        tokio::time::sleep(SHORT / 2).await;
        assert!(driver.handshake().await);
        tokio::time::sleep(SHORT * 2).await;

        let streams = replication.streams();
        assert_eq!(streams.len(), 1);
        assert!(streams[0].is_handshaken());
        assert!(!streams[0].is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_just_before_deadline_keeps_stream() {
        let swarm = MemorySwarm::new();
        let replication = attached(&swarm, key(9)).await;
        let driver = swarm
            .connect(key(9).discovery_key(), PeerId::new("late"))
            .await
            .expect("archive is in the swarm");
        while replication.stream_count() == 0 {
            tokio::task::yield_now().await;
        }
        // Let the stream task start and arm its deadline.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        tokio::time::advance(SHORT - Duration::from_millis(1)).await;
        let stream = replication.streams().remove(0);
        assert!(!stream.is_closed());
        assert!(driver.handshake().await);
        while !stream.is_handshaken() {
            tokio::task::yield_now().await;
        }

        tokio::time::advance(SHORT).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(!stream.is_closed());
        assert_eq!(replication.stream_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_handshake_fails_exactly_at_deadline() {
        let swarm = MemorySwarm::new();
        let replication = attached(&swarm, key(10)).await;
        let _driver = swarm
            .connect(key(10).discovery_key(), PeerId::new("silent"))
            .await
            .expect("archive is in the swarm");
        while replication.stream_count() == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        let stream = replication.streams().remove(0);

        tokio::time::advance(SHORT - Duration::from_millis(1)).await;
        assert!(!stream.is_closed());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(stream.wait_closed().await, StreamEnd::HandshakeTimeout);
        assert_eq!(replication.stream_count(), 0);
    }

    #[tokio::test]
    async fn closed_stream_leaves_the_set() {
        let swarm = MemorySwarm::new();
        let replication = attached(&swarm, key(3)).await;
        let a = connect(&swarm, key(3), "a").await;
        let b = connect(&swarm, key(3), "b").await;
        assert!(a.handshake().await);
        assert!(b.handshake().await);
        assert_eq!(replication.stream_count(), 2);

        let first = replication.streams()[0].clone();
        assert_eq!(first.peer().as_str(), "a");
        assert!(a.close().await);
        assert_eq!(first.wait_closed().await, StreamEnd::Closed);

        let left = replication.streams();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].peer().as_str(), "b");
    }

    #[tokio::test]
    async fn transport_error_only_ends_that_stream() {
        let swarm = MemorySwarm::new();
        let replication = attached(&swarm, key(4)).await;
        let bad = connect(&swarm, key(4), "bad").await;
        let good = connect(&swarm, key(4), "good").await;
        assert!(good.handshake().await);

        let bad_stream = replication.streams()[0].clone();
        assert!(bad.error("connection reset").await);
        assert_eq!(
            bad_stream.wait_closed().await,
            StreamEnd::Errored("connection reset".into())
        );
        assert_eq!(replication.stream_count(), 1);
        assert!(replication.is_joined());
    }

    #[tokio::test]
    async fn shutdown_destroys_streams_and_leaves() {
        let swarm = MemorySwarm::new();
        let replication = attached(&swarm, key(5)).await;
        let mut drivers = Vec::new();
        for i in 0..3 {
            let d = connect(&swarm, key(5), &format!("p{i}")).await;
            assert!(d.handshake().await);
            drivers.push(d);
        }
        assert_eq!(replication.stream_count(), 3);

        replication.shutdown().await.unwrap();
        assert_eq!(replication.stream_count(), 0);
        assert!(!replication.is_joined());
        assert_eq!(swarm.member_count(&key(5).discovery_key()), 0);
        for d in &mut drivers {
            assert_eq!(d.destroyed().await, Some(DestroyReason::Shutdown));
        }

        // Nothing left to do the second time.
        replication.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn join_failure_is_not_fatal() {
        let swarm = MemorySwarm::new();
        swarm.fail_joins(true);
        let replicator = SwarmReplicator::new(Arc::new(swarm.clone()));
        let replication = Arc::new(Replication::new(key(6)));
        assert!(!replicator.attach(&replication).await);
        assert!(!replication.is_joined());
        replication.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn leave_failure_is_reported() {
        let swarm = MemorySwarm::new();
        let replication = attached(&swarm, key(7)).await;
        swarm.fail_leaves(true);
        let err = replication.shutdown().await.unwrap_err();
        assert!(matches!(err, SwarmError::Leave { .. }));
    }

    #[tokio::test]
    async fn disabled_replicator_never_joins() {
        let replicator = SwarmReplicator::disabled();
        let replication = Arc::new(Replication::new(key(8)));
        assert!(!replicator.attach(&replication).await);
        assert!(!replicator.is_enabled());
    }

    #[tokio::test]
    async fn two_members_replicate_with_each_other() {
        let swarm = MemorySwarm::new();
        let a = attached(&swarm, key(9)).await;
        let b = attached(&swarm, key(9)).await;
        tokio::time::sleep(SHORT * 2).await;

        assert_eq!(a.stream_count(), 1);
        assert_eq!(b.stream_count(), 1);
        assert!(a.streams()[0].is_handshaken());

        a.shutdown().await.unwrap();
        let remote = b.streams();
        if let Some(s) = remote.first() {
            assert_eq!(s.wait_closed().await, StreamEnd::Closed);
        }
        assert_eq!(b.stream_count(), 0);
    }
}
