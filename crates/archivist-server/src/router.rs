use axum::routing::{get, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handler::{self, AppState};

/// Build the axum router with all Archivist endpoints.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(handler::health_handler))
        .route("/v1/info", get(handler::info_handler))
        .route("/v1/archives", get(handler::list_archives_handler))
        .route(
            "/v1/archives/:key",
            get(handler::get_archive_handler)
                .post(handler::load_archive_handler)
                .delete(handler::close_archive_handler),
        )
        .route(
            "/v1/accounts/:owner/archives/:key",
            put(handler::add_account_archive_handler)
                .delete(handler::remove_account_archive_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
