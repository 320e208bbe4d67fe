use weaver_core::config::GatewayConfig;
use weaver_engine::WorkflowEngine;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: WorkflowEngine,
}
