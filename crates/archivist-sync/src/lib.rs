//! Async coordination primitives shared across Archivist.
//!
//! - [`KeyedMutex`] serializes read-modify-write sequences that touch the
//!   same record while leaving unrelated records free to proceed.
//! - [`CompletionBarrier`] is a value that is set exactly once and can be
//!   awaited by any number of tasks.

pub mod barrier;
pub mod error;
pub mod keyed_mutex;

pub use barrier::CompletionBarrier;
pub use error::BarrierError;
pub use keyed_mutex::{KeyedGuard, KeyedMutex};
