use std::sync::Arc;

use archivist_host::{
    ArchiveHandle, ArchiveRegistry, ArchiveState, BootstrapReport, RecordStore,
};
use archivist_sync::CompletionBarrier;
use archivist_types::ArchiveKey;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Serialize;
use serde_json::json;

use crate::error::{ServerError, ServerResult};

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub registry: ArchiveRegistry,
    pub records: Arc<RecordStore>,
    pub bootstrapped: CompletionBarrier<BootstrapReport>,
}

impl AppState {
    pub fn new(registry: ArchiveRegistry, records: Arc<RecordStore>) -> Self {
        Self {
            registry,
            records,
            bootstrapped: CompletionBarrier::new(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub bootstrapped: bool,
}

#[derive(Debug, Serialize)]
pub struct ArchiveStatus {
    pub key: ArchiveKey,
    pub state: ArchiveState,
    pub streams: usize,
    pub replicating: bool,
}

impl ArchiveStatus {
    fn resident(handle: &ArchiveHandle) -> Self {
        Self {
            key: *handle.key(),
            state: ArchiveState::Resident,
            streams: handle.stream_count(),
            replicating: handle.is_replicating(),
        }
    }
}

fn parse_key(raw: &str) -> ServerResult<ArchiveKey> {
    Ok(raw.parse::<ArchiveKey>()?)
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        bootstrapped: state.bootstrapped.is_set(),
    })
}

pub async fn info_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "name": "archivist",
        "version": env!("CARGO_PKG_VERSION"),
        "resident": state.registry.resident_count(),
        "replicating": state.registry.replicator().is_enabled(),
        "bootstrap": state.bootstrapped.get(),
    }))
}

pub async fn list_archives_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "archives": state.registry.resident_keys() }))
}

pub async fn get_archive_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ServerResult<Json<ArchiveStatus>> {
    let key = parse_key(&key)?;
    if let Some(handle) = state.registry.get_archive(&key) {
        return Ok(Json(ArchiveStatus::resident(&handle)));
    }
    match state.registry.archive_state(&key) {
        ArchiveState::Absent => Err(ServerError::ArchiveNotFound(key)),
        other => Ok(Json(ArchiveStatus {
            key,
            state: other,
            streams: 0,
            replicating: false,
        })),
    }
}

pub async fn load_archive_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ServerResult<Json<ArchiveStatus>> {
    let key = parse_key(&key)?;
    let handle = state.registry.load_archive(&key).await?;
    Ok(Json(ArchiveStatus::resident(&handle)))
}

pub async fn close_archive_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ServerResult<StatusCode> {
    let key = parse_key(&key)?;
    state.registry.close_archive(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_account_archive_handler(
    State(state): State<AppState>,
    Path((owner, key)): Path<(String, String)>,
) -> ServerResult<Json<serde_json::Value>> {
    let key = parse_key(&key)?;
    let added = state.records.add_archive(&owner, key).await?;
    Ok(Json(json!({ "owner": owner, "key": key, "added": added })))
}

pub async fn remove_account_archive_handler(
    State(state): State<AppState>,
    Path((owner, key)): Path<(String, String)>,
) -> ServerResult<Json<serde_json::Value>> {
    let key = parse_key(&key)?;
    let removed = state.records.remove_archive(&owner, key).await?;
    Ok(Json(json!({ "owner": owner, "key": key, "removed": removed })))
}
