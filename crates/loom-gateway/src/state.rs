use std::sync::Arc;

use loom_core::config::GatewayConfig;
use loom_engine::Runtime;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub runtime: Arc<Runtime>,
}
