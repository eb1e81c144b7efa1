//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics: Prometheus text format
//!   GET /healthz: Liveness probe (always 200 if process is running)
//!   GET /readyz: Readiness probe (200 if every location is available)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use ferry_transfer::{JobEvent, JobStatus, TransferEngine};
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

type Labels = Vec<(String, String)>;

#[derive(Clone)]
pub struct JobMetrics {
    jobs_total: Family<Labels, Counter>,
    bytes_transferred: Counter,
    jobs_active: Gauge,
}

impl JobMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let jobs_total = Family::<Labels, Counter>::default();
        let bytes_transferred = Counter::default();
        let jobs_active = Gauge::default();

        // Counters get the `_total` suffix on encode
        registry.register(
            "ferry_jobs",
            "Jobs that reached a terminal status",
            jobs_total.clone(),
        );
        registry.register(
            "ferry_bytes_transferred",
            "Bytes moved by finished jobs",
            bytes_transferred.clone(),
        );
        registry.register(
            "ferry_jobs_active",
            "Jobs not yet in a terminal status",
            jobs_active.clone(),
        );

        Self {
            jobs_total,
            bytes_transferred,
            jobs_active,
        }
    }

    pub fn record(&self, event: &JobEvent) {
        match event.status {
            JobStatus::Queued => {
                self.jobs_active.inc();
            }
            JobStatus::Active => {}
            status => {
                self.jobs_active.dec();
                self.jobs_total
                    .get_or_create(&vec![("status".to_string(), status.as_str().to_string())])
                    .inc();
                self.bytes_transferred.inc_by(event.progress.loaded_bytes);
            }
        }
    }
}

/// Feed lifecycle events into the metrics until the engine goes away.
pub async fn record_events(metrics: JobMetrics, mut events: broadcast::Receiver<JobEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => metrics.record(&event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "metrics fell behind job events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub engine: TransferEngine,
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9464")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: 200 when every configured location is reachable.
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let unavailable: Vec<String> = state
        .engine
        .locations()
        .await
        .into_iter()
        .filter(|l| !l.available)
        .map(|l| l.id)
        .collect();
    if unavailable.is_empty() {
        (StatusCode::OK, "ready".to_string())
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("unavailable: {}", unavailable.join(", ")),
        )
    }
}
