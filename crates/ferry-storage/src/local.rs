//! Validated wrappers over local filesystem primitives.
//!
//! Every method takes a location id and a location-relative path and routes it
//! through [`PathValidator`] before touching the filesystem.

use ferry_core::types::{EntryType, FileEntry};
use ferry_core::{FerryError, FerryResult};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::{debug, info};

use crate::validator::PathValidator;

#[derive(Debug, Clone)]
pub struct LocalFileOps {
    validator: Arc<PathValidator>,
}

impl LocalFileOps {
    pub fn new(validator: Arc<PathValidator>) -> Self {
        Self { validator }
    }

    pub fn validator(&self) -> &PathValidator {
        &self.validator
    }

    /// Confined absolute path for `path` (see [`PathValidator::resolve`]).
    pub async fn resolve(&self, location_id: &str, path: &str) -> FerryResult<PathBuf> {
        self.validator.resolve(location_id, path).await
    }

    /// List a directory: directories first, then by name. Symlinks are not followed.
    /// Entries whose names [`PathValidator::resolve`] would refuse or reinterpret
    /// are left out, so every listed path can be opened again.
    pub async fn list(&self, location_id: &str, dir: &str) -> FerryResult<Vec<FileEntry>> {
        let rel_dir = PathValidator::normalize(location_id, dir)?;
        let abs = self.validator.resolve(location_id, &rel_dir).await?;
        let ctx = format!("{location_id}:{rel_dir}");

        let mut rd = fs::read_dir(&abs)
            .await
            .map_err(|e| FerryError::from_io(&e, &ctx))?;

        let mut entries = Vec::new();
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|e| FerryError::from_io(&e, &ctx))?
        {
            // Names that cannot round-trip through resolve are not listed
            let name = match entry.file_name().into_string() {
                Ok(name) if PathValidator::is_addressable_name(&name) => name,
                other => {
                    let raw = match other {
                        Ok(name) => name,
                        Err(os) => os.to_string_lossy().into_owned(),
                    };
                    debug!(location = %location_id, dir = %rel_dir, name = %raw.escape_debug(), "skipping unaddressable entry");
                    continue;
                }
            };
            let meta = match entry.metadata().await {
                Ok(m) => m,
                // Vanished between readdir and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(FerryError::from_io(&e, &ctx)),
            };
            let path = join_rel(&rel_dir, &name);

            let file_type = meta.file_type();
            let (entry_type, size, link_target) = if file_type.is_symlink() {
                let target = fs::read_link(entry.path())
                    .await
                    .ok()
                    .map(|t| t.to_string_lossy().into_owned());
                (EntryType::Symlink, None, target)
            } else if file_type.is_dir() {
                (EntryType::Directory, None, None)
            } else {
                (EntryType::File, Some(meta.len()), None)
            };

            entries.push(FileEntry {
                name,
                path,
                entry_type,
                size,
                modified_at: unix_secs(meta.modified().ok()),
                link_target,
            });
        }

        entries.sort_by(|a, b| {
            let a_file = a.entry_type != EntryType::Directory;
            let b_file = b.entry_type != EntryType::Directory;
            a_file.cmp(&b_file).then_with(|| a.name.cmp(&b.name))
        });
        debug!(location = %location_id, dir = %rel_dir, count = entries.len(), "listed");
        Ok(entries)
    }

    /// Stat a path, following symlinks that stay inside the root.
    pub async fn stat(&self, location_id: &str, path: &str) -> FerryResult<FileEntry> {
        let rel = PathValidator::normalize(location_id, path)?;
        let abs = self.validator.resolve(location_id, &rel).await?;
        let meta = fs::metadata(&abs)
            .await
            .map_err(|e| FerryError::from_io(&e, format_args!("{location_id}:{rel}")))?;

        let name = rel.rsplit('/').next().unwrap_or_default().to_string();
        let (entry_type, size) = if meta.is_dir() {
            (EntryType::Directory, None)
        } else {
            (EntryType::File, Some(meta.len()))
        };
        Ok(FileEntry {
            name,
            path: rel,
            entry_type,
            size,
            modified_at: unix_secs(meta.modified().ok()),
            link_target: None,
        })
    }

    pub async fn exists(&self, location_id: &str, path: &str) -> FerryResult<bool> {
        let abs = self.validator.resolve(location_id, path).await?;
        match fs::metadata(&abs).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FerryError::from_io(&e, format_args!("{location_id}:{path}"))),
        }
    }

    /// Create a directory and any missing parents.
    pub async fn mkdir(&self, location_id: &str, path: &str) -> FerryResult<()> {
        let abs = self.validator.resolve(location_id, path).await?;
        fs::create_dir_all(&abs)
            .await
            .map_err(|e| FerryError::from_io(&e, format_args!("{location_id}:{path}")))?;
        debug!(location = %location_id, path = %path, "directory created");
        Ok(())
    }

    /// Delete a file, symlink, or directory tree. A symlink is removed itself,
    /// never its target. The location root cannot be deleted.
    pub async fn delete(&self, location_id: &str, path: &str) -> FerryResult<()> {
        let (parent, name) = self.validator.resolve_parent(location_id, path).await?;
        let target = parent.join(&name);
        let ctx = format!("{location_id}:{path}");

        let meta = fs::symlink_metadata(&target)
            .await
            .map_err(|e| FerryError::from_io(&e, &ctx))?;

        let result = if meta.is_dir() {
            fs::remove_dir_all(&target).await
        } else {
            fs::remove_file(&target).await
        };
        result.map_err(|e| FerryError::from_io(&e, &ctx))?;
        info!(location = %location_id, path = %path, "deleted");
        Ok(())
    }

    /// Open a file for streaming reads, returning it with its length.
    pub async fn open_read(&self, location_id: &str, path: &str) -> FerryResult<(fs::File, u64)> {
        let abs = self.validator.resolve(location_id, path).await?;
        let ctx = format!("{location_id}:{path}");
        let meta = fs::metadata(&abs)
            .await
            .map_err(|e| FerryError::from_io(&e, &ctx))?;
        if meta.is_dir() {
            return Err(FerryError::InvalidRequest(format!("{ctx} is a directory")));
        }
        let file = fs::File::open(&abs)
            .await
            .map_err(|e| FerryError::from_io(&e, &ctx))?;
        Ok((file, meta.len()))
    }

    /// Create (or truncate) a file for streaming writes, creating parent
    /// directories inside the root as needed.
    pub async fn open_write(&self, location_id: &str, path: &str) -> FerryResult<fs::File> {
        let root = self.validator.canonical_root(location_id).await?;
        let abs = self.validator.resolve(location_id, path).await?;
        let ctx = format!("{location_id}:{path}");
        if abs == root {
            return Err(FerryError::InvalidRequest(format!(
                "{ctx} refers to the location root"
            )));
        }
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| FerryError::from_io(&e, &ctx))?;
        }
        fs::File::create(&abs)
            .await
            .map_err(|e| FerryError::from_io(&e, &ctx))
    }
}

fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn unix_secs(t: Option<SystemTime>) -> Option<u64> {
    t.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}
