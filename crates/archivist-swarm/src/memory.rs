use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use archivist_types::{DiscoveryKey, PeerId};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::{ConnectionDriver, Direction, PeerConnection};
use crate::discovery::{Discovery, Joined, Membership};
use crate::error::{SwarmError, SwarmResult};

const CONNECTION_BACKLOG: usize = 64;

struct Member {
    id: u64,
    connections: mpsc::Sender<PeerConnection>,
}

#[derive(Default)]
struct Hub {
    topics: Mutex<HashMap<DiscoveryKey, Vec<Member>>>,
    next_member: AtomicU64,
    fail_joins: AtomicBool,
    fail_leaves: AtomicBool,
}

/// In-process discovery network.
///
/// Every member that joins a topic is connected to every member already on
/// it; those links handshake immediately and close both ends when either
/// side is destroyed. Tests can also inject raw connections with
/// [`MemorySwarm::connect`] and drive them by hand. Clones share the hub.
#[derive(Clone, Default)]
pub struct MemorySwarm {
    hub: Arc<Hub>,
}

impl MemorySwarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `join` fail.
    pub fn fail_joins(&self, fail: bool) {
        self.hub.fail_joins.store(fail, Ordering::Release);
    }

    /// Make every subsequent `leave` fail (the member is still removed).
    pub fn fail_leaves(&self, fail: bool) {
        self.hub.fail_leaves.store(fail, Ordering::Release);
    }

    pub fn member_count(&self, key: &DiscoveryKey) -> usize {
        let topics = self.hub.topics.lock().expect("hub lock poisoned");
        topics.get(key).map_or(0, Vec::len)
    }

    /// Deliver an inbound connection from `peer` to the first member of
    /// `key` and return the transport side for the caller to drive.
    ///
    /// Returns `None` if nobody is on the topic.
    pub async fn connect(&self, key: DiscoveryKey, peer: PeerId) -> Option<ConnectionDriver> {
        let sender = {
            let topics = self.hub.topics.lock().expect("hub lock poisoned");
            topics.get(&key)?.first()?.connections.clone()
        };
        let (conn, driver) = PeerConnection::pair(peer, Direction::Inbound);
        sender.send(conn).await.ok()?;
        Some(driver)
    }
}

impl std::fmt::Debug for MemorySwarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self.hub.topics.lock().expect("hub lock poisoned").len();
        f.debug_struct("MemorySwarm").field("topics", &topics).finish()
    }
}

#[async_trait]
impl Discovery for MemorySwarm {
    async fn join(&self, key: DiscoveryKey) -> SwarmResult<Joined> {
        if self.hub.fail_joins.load(Ordering::Acquire) {
            return Err(SwarmError::Join {
                key,
                reason: "joins disabled".into(),
            });
        }

        let id = self.hub.next_member.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONNECTION_BACKLOG);
        let peers: Vec<(u64, mpsc::Sender<PeerConnection>)> = {
            let mut topics = self.hub.topics.lock().expect("hub lock poisoned");
            let members = topics.entry(key).or_default();
            let peers = members
                .iter()
                .map(|m| (m.id, m.connections.clone()))
                .collect();
            members.push(Member {
                id,
                connections: tx.clone(),
            });
            peers
        };

        for (peer_id, peer_tx) in peers {
            let (ours, our_driver) =
                PeerConnection::pair(PeerId::new(format!("mem-{peer_id}")), Direction::Outbound);
            let (theirs, their_driver) =
                PeerConnection::pair(PeerId::new(format!("mem-{id}")), Direction::Inbound);
            // Our receiver is not handed out until join returns, so never
            // wait on our own channel.
            if tx.try_send(ours).is_err() || peer_tx.send(theirs).await.is_err() {
                continue;
            }
            tokio::spawn(link(our_driver, their_driver));
        }

        debug!(discovery_key = %key, member = id, "joined in-memory swarm");
        Ok(Joined {
            membership: Box::new(MemoryMembership {
                key,
                id,
                hub: Arc::clone(&self.hub),
            }),
            connections: rx,
        })
    }
}

/// Handshake both ends, then close each when the other is destroyed.
async fn link(mut a: ConnectionDriver, mut b: ConnectionDriver) {
    if !a.handshake().await || !b.handshake().await {
        a.close().await;
        b.close().await;
        return;
    }
    tokio::select! {
        _ = a.destroyed() => {}
        _ = b.destroyed() => {}
    }
    a.close().await;
    b.close().await;
}

struct MemoryMembership {
    key: DiscoveryKey,
    id: u64,
    hub: Arc<Hub>,
}

#[async_trait]
impl Membership for MemoryMembership {
    fn discovery_key(&self) -> DiscoveryKey {
        self.key
    }

    async fn leave(&self) -> SwarmResult<()> {
        {
            let mut topics = self.hub.topics.lock().expect("hub lock poisoned");
            if let Some(members) = topics.get_mut(&self.key) {
                members.retain(|m| m.id != self.id);
                if members.is_empty() {
                    topics.remove(&self.key);
                }
            }
        }
        if self.hub.fail_leaves.load(Ordering::Acquire) {
            return Err(SwarmError::Leave {
                key: self.key,
                reason: "leaves disabled".into(),
            });
        }
        Ok(())
    }
}
