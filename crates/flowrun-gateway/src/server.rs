use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use flowrun_core::config::GatewayConfig;
use flowrun_engine::FlowEngine;

use crate::routes;
use crate::state::AppState;

/// HTTP + WebSocket gateway over a [`FlowEngine`], built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    engine: Arc<FlowEngine>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: Arc<FlowEngine>) -> Self {
        Self { config, engine }
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
        });

        Router::new()
            .route("/api/health", get(routes::health))
            .route("/api/flows", get(routes::list_flows))
            .route("/api/flows/{id}/executions", post(routes::submit_execution))
            .route("/api/executions", get(routes::list_executions))
            .route("/api/executions/{id}", get(routes::get_execution))
            .route("/api/executions/{id}/cancel", post(routes::cancel_execution))
            .route("/api/executions/{id}/approval", post(routes::submit_approval))
            .route("/api/executions/{id}/events", get(routes::list_events))
            .route("/api/executions/{id}/stream", get(routes::stream_events))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(bind = %addr, "Gateway listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
