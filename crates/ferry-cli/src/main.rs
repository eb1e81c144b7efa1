//! ferry: copy files between local roots and S3-compatible buckets
//!
//! Commands:
//!   locations                              - list configured locations
//!   ls <location>[:<path>]                 - list a directory or prefix
//!   conflicts <location>:<dir> <name>...   - report names that already exist
//!   cp <src> <dst> [--policy P]            - run a copy job with live progress
//!
//! The engine runs in-process over the same ferry.toml the daemon reads.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ferry_core::config::FerryConfig;
use ferry_core::types::{ConflictPolicy, EntryType, FileEntry, StorageKind, TransferRef};
use ferry_storage::{LocalFileOps, OpendalObjectStore, PathValidator};
use ferry_transfer::conflict::join_dest;
use ferry_transfer::{
    JobStatus, ProgressEvent, TaskSpec, TaskStatus, TransferEngine, TransferExecutor, TransferJob,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "ferry",
    version,
    about = "Copy files between local roots and object storage"
)]
struct Cli {
    /// Path to ferry.toml configuration file
    #[arg(long, short = 'c', env = "FERRY_CONFIG", default_value = "/etc/ferry/ferry.toml")]
    config: PathBuf,

    /// Local root exposed as a location (repeatable); replaces local.roots
    #[arg(long = "local-path", env = "FERRY_LOCAL_PATHS", value_delimiter = ',', global = true)]
    local_paths: Vec<PathBuf>,

    /// Log level for diagnostics on stderr
    #[arg(long, env = "FERRY_LOG", default_value = "warn", global = true)]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List local and object locations
    Locations,

    /// List a directory (local) or prefix (object)
    Ls {
        /// <location>[:<path>]
        target: String,
    },

    /// Report which names already exist in a destination directory
    Conflicts {
        /// <location>:<dir>
        dir: String,
        /// Candidate names
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Copy a file or directory tree
    ///
    /// A directory source copies its contents under the destination path.
    /// A file source copied to a path ending in '/' keeps its name.
    Cp {
        /// <location>:<path>
        source: String,
        /// <location>:<path>
        dest: String,
        /// What to do when a destination already exists
        #[arg(long, value_enum, default_value = "overwrite")]
        policy: PolicyArg,
        /// Simultaneous transfers (overrides transfer.max_concurrency)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Remove partially written destinations if the job fails or is interrupted
        #[arg(long)]
        cleanup_partial: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum PolicyArg {
    Overwrite,
    Skip,
    Rename,
}

impl From<PolicyArg> for ConflictPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Overwrite => ConflictPolicy::Overwrite,
            PolicyArg::Skip => ConflictPolicy::Skip,
            PolicyArg::Rename => ConflictPolicy::Rename,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let mut config = load_config(&cli.config).await?;
    if !cli.local_paths.is_empty() {
        let joined: Vec<String> = cli
            .local_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        config.override_local_roots(&joined.join(","));
    }
    if let Commands::Cp {
        concurrency: Some(n),
        ..
    } = &cli.command
    {
        config.transfer.max_concurrency = *n;
    }

    let engine = build_engine(&config)?;

    match cli.command {
        Commands::Locations => cmd_locations(&engine).await,
        Commands::Ls { target } => cmd_ls(&engine, &target).await,
        Commands::Conflicts { dir, names } => cmd_conflicts(&engine, &dir, &names).await,
        Commands::Cp {
            source,
            dest,
            policy,
            cleanup_partial,
            ..
        } => {
            let status = cmd_cp(&engine, &source, &dest, policy.into(), cleanup_partial).await?;
            if status != JobStatus::Completed {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Config + engine ───────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<FerryConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        FerryConfig::from_toml_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(FerryConfig::default())
    }
}

/// Wire storage and the engine from config.
///
/// Buckets are skipped with a warning when no S3 credentials are set, so
/// local-only use needs none.
fn build_engine(config: &FerryConfig) -> Result<TransferEngine> {
    let objects = Arc::new(OpendalObjectStore::new(config.transfer.chunk_size));
    if !config.storage.buckets.is_empty() {
        match s3_credentials_from_env() {
            Some((access_key, secret_key)) => {
                let operators = ferry_storage::operator::build_from_core_config(
                    &config.storage,
                    &access_key,
                    &secret_key,
                )
                .context("building storage operators")?;
                for (bucket, op) in operators {
                    objects.register(bucket, config.storage.region.clone(), op);
                }
            }
            None => tracing::warn!(
                "S3 credentials not set (AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY); buckets skipped"
            ),
        }
    }

    let local = LocalFileOps::new(Arc::new(PathValidator::new(&config.local.roots)));
    let executor = TransferExecutor::new(
        objects,
        local,
        config.transfer.chunk_size,
        config.transfer.max_file_size_bytes(),
    );
    TransferEngine::new(executor, &config.transfer).context("starting transfer engine")
}

fn s3_credentials_from_env() -> Option<(String, String)> {
    let access_key = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("FERRY_ACCESS_KEY_ID"))
        .ok()?;
    let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("FERRY_SECRET_ACCESS_KEY"))
        .ok()?;
    Some((access_key, secret_key))
}

// ── Location references ───────────────────────────────────────────────────────

/// Split `<location>[:<path>]`. The path may be empty (location root).
fn split_target(raw: &str) -> Result<(&str, &str)> {
    let (location, path) = raw.split_once(':').unwrap_or((raw, ""));
    if location.is_empty() {
        anyhow::bail!("missing location in {raw:?} (expected <location>:<path>)");
    }
    Ok((location, path))
}

/// Resolve `<location>:<path>` against the known locations.
async fn resolve_target(engine: &TransferEngine, raw: &str) -> Result<TransferRef> {
    let (location, path) = split_target(raw)?;
    let kind = engine
        .locations()
        .await
        .into_iter()
        .find(|l| l.id == location)
        .map(|l| l.kind)
        .with_context(|| format!("unknown location {location:?} (see `ferry locations`)"))?;
    Ok(match kind {
        StorageKind::Local => TransferRef::local(location, path),
        StorageKind::Object => TransferRef::object(location, path),
    })
}

// ── `ferry locations` ─────────────────────────────────────────────────────────

async fn cmd_locations(engine: &TransferEngine) -> Result<()> {
    let locations = engine.locations().await;
    if locations.is_empty() {
        println!("no locations configured");
        return Ok(());
    }
    println!("{:<20} {:<7} {:<9} NAME", "ID", "KIND", "STATUS");
    for l in locations {
        println!(
            "{:<20} {:<7} {:<9} {}",
            l.id,
            l.kind.to_string(),
            if l.available { "ok" } else { "offline" },
            l.display_name
        );
    }
    Ok(())
}

// ── `ferry ls` ────────────────────────────────────────────────────────────────

async fn cmd_ls(engine: &TransferEngine, raw: &str) -> Result<()> {
    let target = resolve_target(engine, raw).await?;
    let entries = list_all(engine.executor(), &target).await?;
    for entry in &entries {
        let size = match entry.entry_type {
            EntryType::File => entry.size.map(fmt_bytes).unwrap_or_default(),
            EntryType::Directory => "-".to_string(),
            EntryType::Symlink => "->".to_string(),
        };
        match &entry.link_target {
            Some(link) => println!("{size:>10}  {} -> {link}", entry.name),
            None if entry.entry_type == EntryType::Directory => {
                println!("{size:>10}  {}/", entry.name)
            }
            None => println!("{size:>10}  {}", entry.name),
        }
    }
    Ok(())
}

/// Every entry directly under `dir`, following object continuation tokens.
async fn list_all(executor: &TransferExecutor, dir: &TransferRef) -> Result<Vec<FileEntry>> {
    match dir.kind {
        StorageKind::Local => executor
            .local()
            .list(&dir.location_id, &dir.path)
            .await
            .with_context(|| format!("listing {dir}")),
        StorageKind::Object => {
            let mut entries = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let page = executor
                    .objects()
                    .list_objects(&dir.location_id, &dir.path, token.as_deref())
                    .await
                    .with_context(|| format!("listing {dir}"))?;
                entries.extend(page.entries);
                match page.next_page_token {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
            Ok(entries)
        }
    }
}

// ── `ferry conflicts` ─────────────────────────────────────────────────────────

async fn cmd_conflicts(engine: &TransferEngine, raw: &str, names: &[String]) -> Result<()> {
    let dir = resolve_target(engine, raw).await?;
    let existing = engine
        .check_conflicts(&dir, names)
        .await
        .with_context(|| format!("checking {dir}"))?;
    if existing.is_empty() {
        println!("no conflicts in {dir}");
    } else {
        for name in &existing {
            println!("{name}");
        }
    }
    Ok(())
}

// ── `ferry cp` ────────────────────────────────────────────────────────────────

async fn cmd_cp(
    engine: &TransferEngine,
    source: &str,
    dest: &str,
    policy: ConflictPolicy,
    cleanup_partial: bool,
) -> Result<JobStatus> {
    let source = resolve_target(engine, source).await?;
    let dest = resolve_target(engine, dest).await?;
    let specs = expand_copy(engine.executor(), &source, &dest).await?;

    let receipt = engine
        .submit(specs, policy)
        .context("submitting copy job")?;
    let job_id = receipt.job_id;
    let mut subscription = engine.subscribe(&job_id)?;

    let pb = make_progress_bar(&job_id)?;
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else { break };
                render(&pb, &event);
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                pb.set_message("cancelling...");
                engine.cancel(&job_id)?;
            }
        }
    }

    let job = engine.get(&job_id)?;
    pb.finish_with_message(job.status.to_string());
    print_summary(&job);

    if cleanup_partial && job.status != JobStatus::Completed {
        for removed in engine.cleanup_partial(&job_id).await? {
            println!("  removed partial {removed}");
        }
    }
    Ok(job.status)
}

/// One task per file. A directory (or object prefix) source is walked
/// recursively and mirrored under `dest`.
async fn expand_copy(
    executor: &TransferExecutor,
    source: &TransferRef,
    dest: &TransferRef,
) -> Result<Vec<TaskSpec>> {
    if let Some(size) = single_file_size(executor, source).await? {
        let name = source.path.rsplit('/').next().unwrap_or_default();
        let dest_path = if dest.path.is_empty() || dest.path.ends_with('/') {
            join_dest(&dest.path, name)
        } else {
            dest.path.clone()
        };
        return Ok(vec![
            TaskSpec::new(source.clone(), dest.with_path(dest_path)).with_size(size)
        ]);
    }

    let base = source.path.trim_matches('/').to_string();
    let mut specs = Vec::new();
    let mut pending = vec![source.with_path(base.clone())];
    while let Some(dir) = pending.pop() {
        for entry in list_all(executor, &dir).await? {
            match entry.entry_type {
                EntryType::Directory => pending.push(dir.with_path(entry.path)),
                EntryType::File => {
                    let rel = relative_to(&base, &entry.path);
                    let target = dest.with_path(join_dest(&dest.path, rel));
                    let spec = TaskSpec::new(dir.with_path(entry.path.clone()), target);
                    specs.push(match entry.size {
                        Some(size) => spec.with_size(size),
                        None => spec,
                    });
                }
                EntryType::Symlink => {
                    tracing::warn!(path = %entry.path, "symlink skipped");
                }
            }
        }
    }

    if specs.is_empty() {
        anyhow::bail!("nothing to copy under {source}");
    }
    specs.sort_by(|a, b| a.source.path.cmp(&b.source.path));
    Ok(specs)
}

/// `Some(size)` when `source` names a single file or object. An object path
/// ending in `/` is always a prefix.
async fn single_file_size(executor: &TransferExecutor, source: &TransferRef) -> Result<Option<u64>> {
    if source.path.trim_matches('/').is_empty() {
        return Ok(None);
    }
    if source.kind == StorageKind::Object && source.path.ends_with('/') {
        return Ok(None);
    }
    match source.kind {
        StorageKind::Local => {
            let entry = executor
                .local()
                .stat(&source.location_id, &source.path)
                .await
                .with_context(|| format!("reading {source}"))?;
            Ok(match entry.entry_type {
                EntryType::Directory => None,
                _ => Some(entry.size.unwrap_or(0)),
            })
        }
        StorageKind::Object => Ok(executor
            .objects()
            .head_object(&source.location_id, &source.path)
            .await
            .with_context(|| format!("reading {source}"))?
            .map(|head| head.size)),
    }
}

fn relative_to<'a>(base: &str, path: &'a str) -> &'a str {
    if base.is_empty() {
        return path;
    }
    path.strip_prefix(base)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(path)
}

// ── Progress rendering ────────────────────────────────────────────────────────

fn make_progress_bar(job_id: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
        )
        .context("progress bar template")?
        .progress_chars("=>-"),
    );
    pb.set_prefix(job_id.chars().take(8).collect::<String>());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn render(pb: &ProgressBar, event: &ProgressEvent) {
    match event {
        ProgressEvent::Snapshot(job) => {
            pb.set_length(job.progress.total_bytes);
            pb.set_position(job.progress.loaded_bytes);
            pb.set_message(format!("{} tasks", job.tasks.len()));
        }
        ProgressEvent::Task(ev) => {
            pb.set_length(ev.job_progress.total_bytes);
            pb.set_position(ev.job_progress.loaded_bytes);
            let name = ev.dest.path.rsplit('/').next().unwrap_or_default();
            pb.set_message(format!("{name} {}", status_label(ev.status, false)));
        }
    }
}

fn status_label(status: TaskStatus, skipped: bool) -> &'static str {
    match status {
        TaskStatus::Completed if skipped => "skipped",
        TaskStatus::Queued => "queued",
        TaskStatus::Transferring => "transferring",
        TaskStatus::Completed => "done",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn print_summary(job: &TransferJob) {
    println!();
    println!("Job {}: {}", job.job_id, job.status);
    for task in &job.tasks {
        let label = status_label(task.status, task.skipped);
        match &task.error {
            Some(err) => println!("  {label:<10} {} -> {}  ({err})", task.source, task.dest),
            None => println!(
                "  {label:<10} {} -> {}  {}",
                task.source,
                task.dest,
                fmt_bytes(task.bytes_transferred)
            ),
        }
    }
    println!(
        "  total: {} of {} ({}%)",
        fmt_bytes(job.progress.loaded_bytes),
        fmt_bytes(job.progress.total_bytes),
        job.progress.percentage
    );
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
