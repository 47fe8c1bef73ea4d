use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long a new peer connection may take to complete its handshake before
/// the stream is destroyed.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default listen address of the TCP swarm.
pub const DEFAULT_SWARM_ADDR: &str = "0.0.0.0:3282";

/// Discovery network settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// When `false`, archives are hosted without joining any network.
    pub enabled: bool,
    /// Address the TCP swarm listens on for inbound peers.
    pub listen_addr: SocketAddr,
    /// Peers dialed whenever an archive joins the swarm.
    pub bootstrap: Vec<SocketAddr>,
    pub handshake_timeout_ms: u64,
}

impl SwarmConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: DEFAULT_SWARM_ADDR.parse().expect("valid default address"),
            bootstrap: Vec::new(),
            handshake_timeout_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = SwarmConfig::default();
        assert!(c.enabled);
        assert_eq!(c.listen_addr.port(), 3282);
        assert!(c.bootstrap.is_empty());
        assert_eq!(c.handshake_timeout(), Duration::from_secs(5));
    }
}
