//! Daemon lifecycle: storage wiring, engine startup, job API, background tasks, shutdown

use anyhow::{Context, Result};
use ferry_core::config::FerryConfig;
use ferry_storage::{LocalFileOps, OpendalObjectStore, PathValidator};
use ferry_transfer::{TransferEngine, TransferExecutor};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::api;
use crate::metrics::{self, HealthState, JobMetrics};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(config: FerryConfig) -> Result<()> {
    info!("daemon starting");

    // ── Object storage ──────────────────────────────────────────────────
    let objects = Arc::new(OpendalObjectStore::new(config.transfer.chunk_size));
    if config.storage.buckets.is_empty() {
        info!("no buckets configured, object storage disabled");
    } else {
        let (access_key, secret_key) = s3_credentials()?;
        let operators =
            ferry_storage::operator::build_from_core_config(&config.storage, &access_key, &secret_key)?;
        for (bucket, op) in operators {
            match ferry_storage::check_health(&op).await {
                Ok(()) => info!(bucket = %bucket, endpoint = %config.storage.endpoint, "bucket: connected"),
                Err(e) => warn!(bucket = %bucket, "bucket: {e}  (kept, reported unavailable)"),
            }
            objects.register(bucket, config.storage.region.clone(), op);
        }
    }

    // ── Local roots ─────────────────────────────────────────────────────
    if config.local.roots.is_empty() {
        warn!("no local roots configured");
    }
    let validator = Arc::new(PathValidator::new(&config.local.roots));
    let local = LocalFileOps::new(validator);

    // ── Engine ──────────────────────────────────────────────────────────
    let executor = TransferExecutor::new(
        objects,
        local,
        config.transfer.chunk_size,
        config.transfer.max_file_size_bytes(),
    );
    let engine = TransferEngine::new(executor, &config.transfer).context("starting transfer engine")?;

    for location in engine.locations().await {
        info!(
            id = %location.id,
            name = %location.display_name,
            kind = ?location.kind,
            available = location.available,
            "location"
        );
    }

    // ── Job API ─────────────────────────────────────────────────────────
    match config.daemon.api_addr.clone() {
        Some(addr) => {
            let api_engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = api::serve(addr, api_engine).await {
                    error!("api server failed: {e}");
                }
            });
        }
        None => warn!("daemon.api_addr unset, jobs cannot be submitted"),
    }

    // ── Metrics + health endpoints ──────────────────────────────────────
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let mut registry = Registry::default();
        let job_metrics = JobMetrics::new(&mut registry);
        tokio::spawn(metrics::record_events(job_metrics, engine.subscribe_events()));

        let state = HealthState {
            registry: Arc::new(registry),
            engine: engine.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, state).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    // ── Retention sweeper ───────────────────────────────────────────────
    let sweeper_engine = engine.clone();
    let sweeper = tokio::spawn(async move {
        let mut tick = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        tick.tick().await;
        loop {
            tick.tick().await;
            let purged = sweeper_engine.purge_expired();
            if purged > 0 {
                info!(purged, "retention sweep");
            }
        }
    });

    info!("ferryd ready");

    // Wait for SIGTERM or SIGINT
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    sweeper.abort();
    let active = engine.active_jobs();
    if active > 0 {
        warn!(active, "exiting with jobs still in progress");
    }
    info!("ferryd exiting");
    Ok(())
}

/// S3 credentials from the environment: `AWS_*` first, then `FERRY_*`.
fn s3_credentials() -> Result<(String, String)> {
    let access_key = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("FERRY_ACCESS_KEY_ID"))
        .context("AWS_ACCESS_KEY_ID or FERRY_ACCESS_KEY_ID must be set when buckets are configured")?;
    let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("FERRY_SECRET_ACCESS_KEY"))
        .context(
            "AWS_SECRET_ACCESS_KEY or FERRY_SECRET_ACCESS_KEY must be set when buckets are configured",
        )?;
    Ok((access_key, secret_key))
}
