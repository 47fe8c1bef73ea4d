use archivist_types::DiscoveryKey;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::connection::PeerConnection;
use crate::error::SwarmResult;

/// A peer discovery network.
///
/// Joining announces interest in a topic and yields every connection, in
/// either direction, made with peers interested in the same topic.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn join(&self, key: DiscoveryKey) -> SwarmResult<Joined>;
}

/// Subscription to one topic, held until [`Membership::leave`].
#[async_trait]
pub trait Membership: Send + Sync {
    fn discovery_key(&self) -> DiscoveryKey;

    /// Stop announcing the topic. No new connections are delivered after
    /// this returns; existing ones are unaffected.
    async fn leave(&self) -> SwarmResult<()>;
}

/// Result of a successful [`Discovery::join`].
pub struct Joined {
    pub membership: Box<dyn Membership>,
    pub connections: mpsc::Receiver<PeerConnection>,
}

impl std::fmt::Debug for Joined {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Joined")
            .field("discovery_key", &self.membership.discovery_key())
            .finish()
    }
}
