use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use weaver_core::config::GatewayConfig;
use weaver_engine::WorkflowEngine;

use crate::routes;
use crate::state::AppState;

/// HTTP + SSE gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: WorkflowEngine,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: WorkflowEngine) -> Self {
        Self { config, engine }
    }

    /// The full route table, without a listener.
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
        });

        Router::new()
            .route("/api/health", get(routes::health))
            .route(
                "/api/executions",
                get(routes::list_executions).post(routes::start_execution),
            )
            .route("/api/executions/{id}", get(routes::get_execution))
            .route("/api/executions/{id}/pause", post(routes::pause_execution))
            .route("/api/executions/{id}/resume", post(routes::resume_execution))
            .route("/api/executions/{id}/abort", post(routes::abort_execution))
            .route("/api/executions/{id}/gates", get(routes::list_gates))
            .route(
                "/api/executions/{id}/gates/{gate_id}/decision",
                post(routes::decide_gate),
            )
            .route("/api/executions/{id}/events", get(routes::execution_events))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
