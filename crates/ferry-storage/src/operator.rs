//! OpenDAL Operator factory for object storage locations

use anyhow::{Context, Result};
use opendal::Operator;

/// Minimal config needed to build an operator for one bucket
/// (full config lives in ferry-core's StorageConfig)
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Build an OpenDAL Operator for an S3-compatible bucket
///
/// Uses path-style addressing (default in opendal 0.55), which MinIO and
/// most self-hosted gateways require.
pub fn build_operator(cfg: &ObjectStoreConfig) -> Result<Operator> {
    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);

    let op = Operator::new(builder)
        .with_context(|| format!("creating OpenDAL S3 operator for bucket {}", cfg.bucket))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// Build one operator per configured bucket from ferry-core config + credentials.
///
/// If `enforce_tls` is true and the endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_from_core_config(
    storage: &ferry_core::config::StorageConfig,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Vec<(String, Operator)>> {
    if storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                storage.endpoint
            );
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
        );
    }

    storage
        .buckets
        .iter()
        .map(|bucket| {
            let op = build_operator(&ObjectStoreConfig {
                endpoint: storage.endpoint.clone(),
                region: storage.region.clone(),
                bucket: bucket.clone(),
                access_key_id: access_key_id.to_string(),
                secret_access_key: secret_access_key.to_string(),
            })?;
            Ok((bucket.clone(), op))
        })
        .collect()
}
