//! Object storage collaborator: the primitives the transfer core drives.
//!
//! [`ObjectStore`] is the seam between ferry and a remote object service.
//! [`OpendalObjectStore`] implements it over one OpenDAL operator per bucket;
//! tests register in-memory operators the same way the daemon registers S3 ones.
//!
//! Object "directories" are synthetic (common key prefixes) and are presented
//! as ordinary `directory` rows in [`FileEntry`].

use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::types::{EntryType, FileEntry, LocationMeta, StorageKind, StorageLocation};
use ferry_core::{FerryError, FerryResult};
use futures::stream::{BoxStream, StreamExt};
use opendal::{ErrorKind, Operator};
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Chunked byte stream passed between readers and uploaders
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Listing page size for object locations
pub const LIST_PAGE_SIZE: usize = 1000;

/// Result of `head_object`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub modified_at: Option<u64>,
}

/// One page of an object listing.
///
/// `next_page_token` is the last key of this page; the next page starts
/// strictly after it.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub entries: Vec<FileEntry>,
    pub next_page_token: Option<String>,
}

/// A remote read stream with its known length
pub struct ObjectReader {
    pub size: u64,
    pub stream: ByteStream,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Object locations currently known, availability evaluated now.
    async fn locations(&self) -> Vec<StorageLocation>;

    async fn list_objects(
        &self,
        location_id: &str,
        prefix: &str,
        page_token: Option<&str>,
    ) -> FerryResult<ObjectPage>;

    async fn get_object_stream(&self, location_id: &str, key: &str) -> FerryResult<ObjectReader>;

    /// Consume `body` into the object at `key`, returning the bytes written.
    ///
    /// A body item failing with `io::ErrorKind::Interrupted` means the caller
    /// cancelled; the upload is abandoned and `FerryError::Cancelled` returned.
    async fn put_object_stream(
        &self,
        location_id: &str,
        key: &str,
        body: ByteStream,
    ) -> FerryResult<u64>;

    /// Whether `copy_object` can run server-side between these two locations.
    fn supports_server_side_copy(&self, source_location: &str, dest_location: &str) -> bool;

    async fn copy_object(
        &self,
        source_location: &str,
        source_key: &str,
        dest_location: &str,
        dest_key: &str,
    ) -> FerryResult<()>;

    async fn delete_object(&self, location_id: &str, key: &str) -> FerryResult<()>;

    /// `Ok(None)` when the key does not exist.
    async fn head_object(&self, location_id: &str, key: &str) -> FerryResult<Option<ObjectHead>>;
}

struct Bucket {
    id: String,
    region: String,
    op: Operator,
}

/// [`ObjectStore`] over OpenDAL operators, one per bucket.
pub struct OpendalObjectStore {
    buckets: RwLock<Vec<Bucket>>,
    chunk_size: usize,
}

impl OpendalObjectStore {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            buckets: RwLock::new(Vec::new()),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Register (or replace) a bucket under `location_id`.
    pub fn register(&self, location_id: impl Into<String>, region: impl Into<String>, op: Operator) {
        let id = location_id.into();
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let bucket = Bucket {
            id: id.clone(),
            region: region.into(),
            op,
        };
        match buckets.iter_mut().find(|b| b.id == id) {
            Some(existing) => *existing = bucket,
            None => buckets.push(bucket),
        }
        info!(location = %id, "object location registered");
    }

    /// Forget a bucket. Returns whether it was registered.
    pub fn deregister(&self, location_id: &str) -> bool {
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        let before = buckets.len();
        buckets.retain(|b| b.id != location_id);
        before != buckets.len()
    }

    fn operator(&self, location_id: &str) -> FerryResult<Operator> {
        let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
        buckets
            .iter()
            .find(|b| b.id == location_id)
            .map(|b| b.op.clone())
            .ok_or_else(|| FerryError::NotFound(format!("unknown location: {location_id}")))
    }
}

/// Map an OpenDAL error onto the ferry taxonomy.
pub fn map_opendal_error(err: opendal::Error, context: impl std::fmt::Display) -> FerryError {
    match err.kind() {
        ErrorKind::NotFound => FerryError::NotFound(context.to_string()),
        ErrorKind::PermissionDenied => FerryError::Permission(context.to_string()),
        _ => FerryError::Storage(format!("{context}: {err}")),
    }
}

fn validate_key(location_id: &str, key: &str) -> FerryResult<String> {
    let key = key.trim_start_matches('/');
    if key.is_empty() || key.ends_with('/') {
        return Err(FerryError::InvalidRequest(format!(
            "{location_id}: not an object key: {key:?}"
        )));
    }
    if key.split('/').any(|seg| seg == "..") {
        return Err(FerryError::Security(format!(
            "{location_id}: object key contains '..': {key:?}"
        )));
    }
    Ok(key.to_string())
}

/// Parse an OpenDAL timestamp rendering into Unix seconds.
fn parse_timestamp(raw: &str) -> Option<u64> {
    let secs = chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.timestamp())
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f UTC")
                .map(|dt| dt.and_utc().timestamp())
        })
        .ok()?;
    u64::try_from(secs).ok()
}

fn modified_secs(meta: &opendal::Metadata) -> Option<u64> {
    meta.last_modified()
        .and_then(|t| parse_timestamp(&t.to_string()))
}

#[async_trait]
impl ObjectStore for OpendalObjectStore {
    async fn locations(&self) -> Vec<StorageLocation> {
        let snapshot: Vec<(String, String, Operator)> = {
            let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
            buckets
                .iter()
                .map(|b| (b.id.clone(), b.region.clone(), b.op.clone()))
                .collect()
        };

        let mut out = Vec::with_capacity(snapshot.len());
        for (id, region, op) in snapshot {
            let available = crate::health::is_healthy(&op).await;
            if !available {
                warn!(location = %id, "object location unreachable");
            }
            out.push(StorageLocation {
                display_name: id.clone(),
                id,
                kind: StorageKind::Object,
                available,
                meta: LocationMeta::Object { region },
            });
        }
        out
    }

    async fn list_objects(
        &self,
        location_id: &str,
        prefix: &str,
        page_token: Option<&str>,
    ) -> FerryResult<ObjectPage> {
        let op = self.operator(location_id)?;
        let trimmed = prefix.trim_matches('/');
        if trimmed.split('/').any(|seg| seg == "..") {
            return Err(FerryError::Security(format!(
                "{location_id}: prefix contains '..': {prefix:?}"
            )));
        }
        let dir = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("{trimmed}/")
        };

        let mut listed = op
            .list_with(&dir)
            .recursive(false)
            .await
            .map_err(|e| map_opendal_error(e, format_args!("{location_id}:{dir}")))?;
        listed.retain(|e| e.path() != dir && e.path() != "/" && !e.path().is_empty());
        listed.sort_by(|a, b| a.path().cmp(b.path()));

        let start = match page_token {
            Some(token) => listed.partition_point(|e| e.path() <= token),
            None => 0,
        };
        let remaining = &listed[start..];
        let page = &remaining[..remaining.len().min(LIST_PAGE_SIZE)];
        let next_page_token = if remaining.len() > LIST_PAGE_SIZE {
            page.last().map(|e| e.path().to_string())
        } else {
            None
        };

        let entries = page
            .iter()
            .map(|e| {
                let meta = e.metadata();
                let is_dir = meta.is_dir();
                FileEntry {
                    name: e.name().trim_end_matches('/').to_string(),
                    path: e.path().trim_end_matches('/').to_string(),
                    entry_type: if is_dir {
                        EntryType::Directory
                    } else {
                        EntryType::File
                    },
                    size: (!is_dir).then(|| meta.content_length()),
                    modified_at: modified_secs(meta),
                    link_target: None,
                }
            })
            .collect();

        Ok(ObjectPage {
            entries,
            next_page_token,
        })
    }

    async fn get_object_stream(&self, location_id: &str, key: &str) -> FerryResult<ObjectReader> {
        let key = validate_key(location_id, key)?;
        let op = self.operator(location_id)?;
        let ctx = format!("{location_id}:{key}");

        let meta = op
            .stat(&key)
            .await
            .map_err(|e| map_opendal_error(e, &ctx))?;
        let size = meta.content_length();

        let stream: ByteStream = if size == 0 {
            futures::stream::empty().boxed()
        } else {
            let reader = op
                .reader_with(&key)
                .chunk(self.chunk_size)
                .await
                .map_err(|e| map_opendal_error(e, &ctx))?;
            reader
                .into_bytes_stream(..)
                .await
                .map_err(|e| map_opendal_error(e, &ctx))?
                .boxed()
        };

        debug!(location = %location_id, key = %key, size, "object stream opened");
        Ok(ObjectReader { size, stream })
    }

    async fn put_object_stream(
        &self,
        location_id: &str,
        key: &str,
        mut body: ByteStream,
    ) -> FerryResult<u64> {
        let key = validate_key(location_id, key)?;
        let op = self.operator(location_id)?;
        let ctx = format!("{location_id}:{key}");

        let mut writer = op
            .writer(&key)
            .await
            .map_err(|e| map_opendal_error(e, &ctx))?;

        let mut written = 0u64;
        while let Some(item) = body.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    if let Err(abort_err) = writer.abort().await {
                        warn!(location = %location_id, key = %key, "abort failed: {abort_err}");
                    }
                    return Err(if e.kind() == std::io::ErrorKind::Interrupted {
                        FerryError::Cancelled
                    } else {
                        FerryError::from_io(&e, &ctx)
                    });
                }
            };
            let len = chunk.len() as u64;
            if let Err(e) = writer.write(chunk).await {
                if let Err(abort_err) = writer.abort().await {
                    warn!(location = %location_id, key = %key, "abort failed: {abort_err}");
                }
                return Err(map_opendal_error(e, &ctx));
            }
            written += len;
        }

        writer
            .close()
            .await
            .map_err(|e| map_opendal_error(e, &ctx))?;

        debug!(location = %location_id, key = %key, bytes = written, "object uploaded");
        Ok(written)
    }

    fn supports_server_side_copy(&self, source_location: &str, dest_location: &str) -> bool {
        if source_location != dest_location {
            return false;
        }
        self.operator(source_location)
            .map(|op| op.info().full_capability().copy)
            .unwrap_or(false)
    }

    async fn copy_object(
        &self,
        source_location: &str,
        source_key: &str,
        dest_location: &str,
        dest_key: &str,
    ) -> FerryResult<()> {
        if !self.supports_server_side_copy(source_location, dest_location) {
            return Err(FerryError::Storage(format!(
                "server-side copy unavailable from {source_location} to {dest_location}"
            )));
        }
        let from = validate_key(source_location, source_key)?;
        let to = validate_key(dest_location, dest_key)?;
        let op = self.operator(source_location)?;
        op.copy(&from, &to)
            .await
            .map_err(|e| map_opendal_error(e, format_args!("{source_location}:{from}")))?;
        info!(location = %source_location, from = %from, to = %to, "server-side copy");
        Ok(())
    }

    async fn delete_object(&self, location_id: &str, key: &str) -> FerryResult<()> {
        let key = validate_key(location_id, key)?;
        let op = self.operator(location_id)?;
        op.delete(&key)
            .await
            .map_err(|e| map_opendal_error(e, format_args!("{location_id}:{key}")))
    }

    async fn head_object(&self, location_id: &str, key: &str) -> FerryResult<Option<ObjectHead>> {
        let key = validate_key(location_id, key)?;
        let op = self.operator(location_id)?;
        match op.stat(&key).await {
            Ok(meta) => Ok(Some(ObjectHead {
                size: meta.content_length(),
                modified_at: modified_secs(&meta),
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_opendal_error(e, format_args!("{location_id}:{key}"))),
        }
    }
}
