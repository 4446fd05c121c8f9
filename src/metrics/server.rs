//! HTTP exposition of the ping metrics
//!
//! - `GET /metrics` - registry in the Prometheus text format
//! - `GET /health` - liveness of the exporter itself

use std::net::SocketAddr;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::PingMetrics;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Metrics server bound to its listen address but not serving yet
pub struct MetricsServer {
    listener: TcpListener,
    metrics: PingMetrics,
}

impl MetricsServer {
    /// Bind the listener; fails when the address is unavailable
    pub async fn bind(addr: SocketAddr, metrics: PingMetrics) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, metrics })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires, then finish in-flight requests
    pub async fn serve(self, shutdown: CancellationToken) -> std::io::Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            info!("metrics server listening on {addr}");
        }

        let app = router(self.metrics);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .inspect_err(|e| error!("metrics server failed to start or stop gracefully: {e}"))?;

        info!("metrics server stopped");
        Ok(())
    }
}

fn router(metrics: PingMetrics) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .route("/health", get(health_check))
        .with_state(metrics)
        .layer(TraceLayer::new_for_http())
}

async fn render_metrics(State(metrics): State<PingMetrics>) -> Response {
    match metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("unable to render metrics: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health_check() -> &'static str {
    "ok"
}
