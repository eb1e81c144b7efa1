use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{FerryError, FerryResult};

/// Top-level configuration (loaded from ferry.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageConfig,
    pub local: LocalConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// JSON job API listen address (default: 127.0.0.1:7878); unset disables it
    pub api_addr: Option<String>,
    /// Prometheus metrics endpoint (default: 127.0.0.1:9464)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// S3-compatible endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Buckets exposed as object locations
    pub buckets: Vec<String>,
    /// Enforce HTTPS for S3 connections (warn/error on HTTP endpoints)
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Ordered local roots; position N becomes location id `local-N`
    pub roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Global cap on simultaneously streaming tasks (default: 2)
    pub max_concurrency: usize,
    /// Bytes per streamed chunk (default: 64 KiB)
    pub chunk_size: usize,
    /// Per-file size limit in GiB (default: 20)
    pub max_file_size_gb: u64,
    /// Terminal jobs older than this are purged (default: 3600)
    pub job_retention_secs: u64,
    /// Cap on retained terminal jobs (default: 100)
    pub max_retained_jobs: usize,
    /// Per-job progress channel capacity (default: 256)
    pub progress_buffer: usize,
}

impl TransferConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_gb.saturating_mul(1024 * 1024 * 1024)
    }

    pub fn validate(&self) -> FerryResult<()> {
        if self.max_concurrency == 0 {
            return Err(FerryError::Config(
                "transfer.max_concurrency must be at least 1".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(FerryError::Config(
                "transfer.chunk_size must be at least 1".into(),
            ));
        }
        if self.progress_buffer == 0 {
            return Err(FerryError::Config(
                "transfer.progress_buffer must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl FerryConfig {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(content: &str) -> FerryResult<Self> {
        let config: FerryConfig =
            toml::from_str(content).map_err(|e| FerryError::Config(e.to_string()))?;
        config.transfer.validate()?;
        Ok(config)
    }

    /// Replace the local roots with a comma separated list (`FERRY_LOCAL_PATHS` style)
    pub fn override_local_roots(&mut self, list: &str) {
        let roots: Vec<PathBuf> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        if !roots.is_empty() {
            tracing::debug!(count = roots.len(), "local roots overridden");
            self.local.roots = roots;
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            api_addr: Some("127.0.0.1:7878".into()),
            metrics_addr: Some("127.0.0.1:9464".into()),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            buckets: Vec::new(),
            enforce_tls: false,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            chunk_size: 64 * 1024,
            max_file_size_gb: 20,
            job_retention_secs: 3600,
            max_retained_jobs: 100,
            progress_buffer: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
api_addr = "0.0.0.0:7878"
metrics_addr = "0.0.0.0:9464"
log_level = "debug"
log_format = "json"

[storage]
endpoint = "https://s3.example.com"
region = "eu-west-1"
buckets = ["models", "datasets"]
enforce_tls = true

[local]
roots = ["/srv/data", "/mnt/models"]

[transfer]
max_concurrency = 4
chunk_size = 1048576
max_file_size_gb = 50
job_retention_secs = 600
max_retained_jobs = 10
progress_buffer = 64
"#;
        let config = FerryConfig::from_toml_str(toml_str).unwrap();

        assert_eq!(config.daemon.api_addr.as_deref(), Some("0.0.0.0:7878"));
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.log_format, "json");
        assert_eq!(config.storage.endpoint, "https://s3.example.com");
        assert_eq!(config.storage.buckets, vec!["models", "datasets"]);
        assert!(config.storage.enforce_tls);
        assert_eq!(config.local.roots.len(), 2);
        assert_eq!(config.local.roots[1], PathBuf::from("/mnt/models"));
        assert_eq!(config.transfer.max_concurrency, 4);
        assert_eq!(config.transfer.chunk_size, 1048576);
        assert_eq!(
            config.transfer.max_file_size_bytes(),
            50 * 1024 * 1024 * 1024
        );
        assert_eq!(config.transfer.max_retained_jobs, 10);
    }

    #[test]
    fn test_parse_defaults() {
        let config = FerryConfig::from_toml_str("").unwrap();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.api_addr.as_deref(), Some("127.0.0.1:7878"));
        assert_eq!(config.storage.region, "us-east-1");
        assert!(config.storage.buckets.is_empty());
        assert!(config.local.roots.is_empty());
        assert_eq!(config.transfer.max_concurrency, 2);
        assert_eq!(config.transfer.chunk_size, 64 * 1024);
        assert_eq!(config.transfer.max_file_size_gb, 20);
        assert_eq!(config.transfer.job_retention_secs, 3600);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[transfer]
max_concurrency = 8
"#;
        let config = FerryConfig::from_toml_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.transfer.max_concurrency, 8);
        // Defaults
        assert_eq!(config.transfer.progress_buffer, 256);
        assert_eq!(config.storage.endpoint, "http://localhost:9000");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = FerryConfig::from_toml_str("[transfer]\nmax_concurrency = 0\n").unwrap_err();
        assert!(matches!(err, FerryError::Config(_)));
        assert!(err.to_string().contains("max_concurrency"));
    }

    #[test]
    fn test_override_local_roots() {
        let mut config = FerryConfig::default();
        config.override_local_roots(" /a , /b,,");
        assert_eq!(
            config.local.roots,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );

        // An empty override leaves the configured roots alone
        config.override_local_roots("");
        assert_eq!(config.local.roots.len(), 2);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = FerryConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed = FerryConfig::from_toml_str(&toml_str).unwrap();

        assert_eq!(config.storage.endpoint, parsed.storage.endpoint);
        assert_eq!(
            config.transfer.max_concurrency,
            parsed.transfer.max_concurrency
        );
    }
}
