//! Archive lifecycle management for Archivist.
//!
//! The [`ArchiveRegistry`] is the single owner of which archives are open.
//! Callers ask it to load an archive by key; it opens the storage through
//! the [`ArchiveLoader`], hands the archive to the
//! [`SwarmReplicator`](archivist_swarm::SwarmReplicator), and publishes the
//! resulting [`ArchiveHandle`]. Closing runs the same steps in reverse.
//!
//! Each key moves through `Absent -> Loading -> Resident -> Closing -> Absent`:
//!
//! - concurrent loads of one key share a single storage open;
//! - a close that arrives during a load waits for the load to settle;
//! - a load that arrives during a close waits for the close, then reopens.
//!
//! Around the registry sit the startup [`bootstrap`], the [`RecordStore`] of
//! which accounts host which archives, and the listener that keeps the two
//! in step.

pub mod bootstrap;
pub mod error;
pub mod events;
pub mod handle;
pub mod loader;
pub mod records;
pub mod registry;
pub mod shutdown;

pub use bootstrap::{bootstrap, ArchiveRecord, ArchiveSource, BootstrapReport, DirectorySource, StaticSource};
pub use error::{CloseStep, HostError, HostResult};
pub use events::RegistryEvent;
pub use handle::ArchiveHandle;
pub use loader::ArchiveLoader;
pub use records::{
    spawn_record_listener, AccountRecord, MemoryRecordBackend, RecordBackend, RecordEvent,
    RecordStore,
};
pub use registry::{ArchiveRegistry, ArchiveState, LoadFuture};
pub use shutdown::CloseReport;
