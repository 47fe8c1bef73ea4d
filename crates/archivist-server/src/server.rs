use std::future::Future;

use tokio::net::TcpListener;

use crate::config::ArchivistConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::AppState;
use crate::router::build_router;

/// Archivist HTTP server.
pub struct ArchivistServer {
    config: ArchivistConfig,
    state: AppState,
}

impl ArchivistServer {
    pub fn new(config: ArchivistConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn config(&self) -> &ArchivistConfig {
        &self.config
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(self.state.clone())
    }

    /// Serve until ctrl-c, then close every archive.
    pub async fn serve(self) -> ServerResult<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve_on(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` resolves, then close every
    /// archive.
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = build_router(self.state.clone());
        tracing::info!(addr = %listener.local_addr()?, "archivist listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?;

        tracing::info!("shutting down, closing archives");
        let report = self.state.registry.close_all_archives().await;
        for (key, error) in &report.failed {
            tracing::warn!(key = %key, error = %error, "archive did not close cleanly");
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
