//! HTTP server for Archivist.
//!
//! Exposes the archive registry over a small REST API: inspect, load and
//! close archives by key, and add or remove the account records that decide
//! which archives stay hosted.

pub mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;

pub use config::{ArchivistConfig, DEFAULT_BIND_ADDR};
pub use error::{ServerError, ServerResult};
pub use handler::AppState;
pub use server::ArchivistServer;
