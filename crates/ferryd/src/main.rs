//! ferryd: ferry transfer daemon
//!
//! Usage:
//!   ferryd [--config /etc/ferry/ferry.toml] [--local-path DIR]...
//!
//! Hosts the transfer engine over the configured local roots and buckets,
//! accepts jobs over an HTTP JSON API, sweeps finished jobs, and serves
//! Prometheus metrics plus health probes.

mod api;
mod daemon;
mod metrics;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ferry_core::config::FerryConfig;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ferryd", version, about = "ferry transfer daemon")]
struct Cli {
    /// Path to ferry.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "FERRY_CONFIG",
        default_value = "/etc/ferry/ferry.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to daemon.log_level
    #[arg(long, env = "FERRY_LOG")]
    log: Option<String>,

    /// Log format; defaults to daemon.log_format
    #[arg(long, env = "FERRY_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Local root exposed as a location (repeatable); replaces local.roots
    #[arg(long = "local-path", env = "FERRY_LOCAL_PATHS", value_delimiter = ',')]
    local_paths: Vec<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, found) = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli.log_format.unwrap_or(if config.daemon.log_format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    init_logging(&level, format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "ferryd starting"
    );
    if !found {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }

    if !cli.local_paths.is_empty() {
        let joined: Vec<String> = cli
            .local_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        config.override_local_roots(&joined.join(","));
    }

    daemon::run(config).await
}

/// Parse the config file, or defaults if it does not exist. The flag reports
/// whether the file was found.
async fn load_config(path: &Path) -> Result<(FerryConfig, bool)> {
    if !path.exists() {
        return Ok((FerryConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = FerryConfig::from_toml_str(&content)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok((config, true))
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
