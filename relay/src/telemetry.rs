//! Telemetry
//!
//! Optional Prometheus endpoint. The registry carries the libp2p swarm
//! metrics plus the relay's own gauges and is served at
//! `/debug/metrics/prometheus`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Gauges describing the relay's live state.
#[derive(Clone, Default)]
pub struct RelayGauges {
    /// Local rooms, owned and mirrored.
    pub rooms: Gauge,
    /// Connected viewer participants across all rooms.
    pub viewers: Gauge,
}

impl RelayGauges {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the gauges on a registry.
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "sr_relay_rooms",
            "Local rooms (owned and mirrored)",
            self.rooms.clone(),
        );
        registry.register(
            "sr_relay_viewers",
            "Connected viewer participants",
            self.viewers.clone(),
        );
    }
}

#[derive(Clone)]
struct MetricsState {
    registry: Arc<Mutex<Registry>>,
}

async fn serve_metrics(State(state): State<MetricsState>) -> Response {
    let mut body = String::new();
    match encode(&mut body, &state.registry.lock()) {
        Ok(()) => (
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Bind and serve the metrics endpoint until cancellation.
pub async fn spawn_metrics_server(
    port: u16,
    registry: Arc<Mutex<Registry>>,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    let app = Router::new()
        .route("/debug/metrics/prometheus", get(serve_metrics))
        .with_state(MetricsState { registry });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Metrics endpoint listening");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            warn!(error = %e, "Metrics server stopped");
        }
    }))
}
