//! Archive storage lifecycle for Archivist.
//!
//! The on-disk format of an archive belongs to the storage backend; this
//! crate only defines how the host opens a backend's storage for one
//! archive, waits for it to become ready, and closes it again.
//!
//! # Backends
//!
//! All backends implement [`StorageBackend`], producing [`ArchiveStorage`]
//! handles:
//!
//! - [`FsStorageBackend`] -- one directory per archive with a JSON manifest
//! - [`InMemoryStorageBackend`] -- counters and fault injection for tests
//!   and embedding
//!
//! # Rules
//!
//! 1. `open` may be called on a directory that already exists.
//! 2. A storage handle is usable only after `ready` returns `Ok`.
//! 3. `close` is idempotent.

pub mod error;
pub mod fs;
pub mod memory;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use fs::{FsStorage, FsStorageBackend, Manifest, MANIFEST_FILE};
pub use memory::{InMemoryStorage, InMemoryStorageBackend, StoragePhase};
pub use traits::{ArchiveStorage, StorageBackend};
