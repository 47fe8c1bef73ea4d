use std::time::Duration;

use archivist_types::{DiscoveryKey, PeerId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("failed to join swarm for {key}: {reason}")]
    Join { key: DiscoveryKey, reason: String },

    #[error("failed to leave swarm for {key}: {reason}")]
    Leave { key: DiscoveryKey, reason: String },

    #[error("peer {peer} did not complete the handshake within {timeout:?}")]
    HandshakeTimeout { peer: PeerId, timeout: Duration },

    #[error("transport error with {peer}: {reason}")]
    Transport { peer: PeerId, reason: String },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("framing error: {0}")]
    Framing(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SwarmResult<T> = Result<T, SwarmError>;
