use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use loom_core::config::GatewayConfig;
use loom_engine::Runtime;

use crate::routes;
use crate::state::AppState;

/// HTTP control surface over a [`Runtime`], built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    runtime: Arc<Runtime>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, runtime: Arc<Runtime>) -> Self {
        Self { config, runtime }
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            runtime: self.runtime.clone(),
        });

        Router::new()
            .route("/health", get(routes::health))
            .route("/status", get(routes::status))
            .route("/trigger/{id}", post(routes::trigger))
            .route("/trigger/{id}/wait", post(routes::trigger_and_wait))
            .route("/executions/{id}/{execution_id}", get(routes::execution_result))
            .route("/stop", post(routes::stop))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind `config.bind` and serve until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener, for embedders that pick their own port.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();
        info!(addr = %listener.local_addr()?, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
