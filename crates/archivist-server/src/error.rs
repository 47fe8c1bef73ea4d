use archivist_host::HostError;
use archivist_types::{ArchiveKey, TypeError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid archive key: {0}")]
    InvalidKey(#[from] TypeError),

    #[error("archive not found: {}", .0.short_id())]
    ArchiveNotFound(ArchiveKey),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidKey(_) => StatusCode::BAD_REQUEST,
            Self::ArchiveNotFound(_) => StatusCode::NOT_FOUND,
            Self::Host(HostError::InvalidRecord(_)) => StatusCode::BAD_REQUEST,
            Self::Host(HostError::Records(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Host(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Io(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = %status, error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
