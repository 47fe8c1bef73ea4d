//! Foundation types for Archivist.
//!
//! Every other Archivist crate depends on `archivist-types`. The types here
//! carry no behavior beyond parsing, formatting, and derivation.
//!
//! # Key Types
//!
//! - [`ArchiveKey`]: 32-byte content-address of a hosted archive
//! - [`DiscoveryKey`]: swarm topic derived from an [`ArchiveKey`]
//! - [`PeerId`]: printable label for a remote replication peer

pub mod error;
pub mod key;
pub mod peer;

pub use error::TypeError;
pub use key::{ArchiveKey, DiscoveryKey, KEY_LENGTH};
pub use peer::PeerId;
