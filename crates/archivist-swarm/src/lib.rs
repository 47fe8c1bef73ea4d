//! Peer discovery and replication for Archivist.
//!
//! Once an archive is open, the host announces its [`DiscoveryKey`] on a
//! discovery network and replicates with every peer that shows up. This
//! crate owns that lifecycle:
//!
//! - [`Discovery`] / [`Membership`] -- the seam to a discovery network.
//!   [`MemorySwarm`] runs in-process, [`TcpSwarm`] over TCP.
//! - [`PeerConnection`] / [`ConnectionDriver`] -- the two ends of one peer
//!   connection: the replicator consumes events, the transport produces them.
//! - [`SwarmReplicator`] -- joins the network for an archive and turns each
//!   connection into a [`ReplicationStream`] with a handshake deadline.
//! - [`Replication`] -- per-archive state: the open streams and the
//!   membership, torn down by [`Replication::shutdown`].
//!
//! [`DiscoveryKey`]: archivist_types::DiscoveryKey

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod memory;
pub mod replicator;
pub mod stream;
pub mod tcp;
pub mod wire;

pub use config::{SwarmConfig, DEFAULT_SWARM_ADDR, HANDSHAKE_TIMEOUT};
pub use connection::{ConnectionDriver, ConnectionEvent, DestroyReason, Direction, PeerConnection};
pub use discovery::{Discovery, Joined, Membership};
pub use error::{SwarmError, SwarmResult};
pub use memory::MemorySwarm;
pub use replicator::{Replication, SwarmReplicator};
pub use stream::{ReplicationStream, StreamEnd};
pub use tcp::TcpSwarm;
pub use wire::{WireCodec, WireMessage, WIRE_VERSION};
