//! Shared fixtures: a temp local root, in-memory object buckets, and an
//! instrumented object store.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::config::TransferConfig;
use ferry_core::types::StorageLocation;
use ferry_core::FerryResult;
use ferry_storage::{
    ByteStream, LocalFileOps, ObjectHead, ObjectPage, ObjectReader, ObjectStore,
    OpendalObjectStore, PathValidator,
};
use ferry_transfer::{TransferEngine, TransferExecutor, TransferJob};
use futures::StreamExt;
use opendal::Operator;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

/// Deterministic, non-repeating-ish content
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len as u64)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 5)) as u8)
        .collect()
}

pub fn write_file(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(path, content).expect("write test file");
}

/// Object store wrapper that counts concurrent streams and can hold reads
/// until the test releases them.
pub struct InstrumentedStore {
    inner: Arc<OpendalObjectStore>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
}

impl InstrumentedStore {
    pub fn new(inner: Arc<OpendalObjectStore>, gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            inner,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            gate,
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for InstrumentedStore {
    async fn locations(&self) -> Vec<StorageLocation> {
        self.inner.locations().await
    }

    async fn list_objects(
        &self,
        location_id: &str,
        prefix: &str,
        page_token: Option<&str>,
    ) -> FerryResult<ObjectPage> {
        self.inner.list_objects(location_id, prefix, page_token).await
    }

    async fn get_object_stream(&self, location_id: &str, key: &str) -> FerryResult<ObjectReader> {
        let reader = self.inner.get_object_stream(location_id, key).await?;
        let Some(gate) = self.gate.clone() else {
            return Ok(reader);
        };
        // Hold the first chunk until the test adds a permit
        let wait = futures::stream::once(async move {
            if let Ok(permit) = gate.acquire_owned().await {
                permit.forget();
            }
        })
        .filter_map(|()| futures::future::ready(None::<std::io::Result<Bytes>>));
        Ok(ObjectReader {
            size: reader.size,
            stream: wait.chain(reader.stream).boxed(),
        })
    }

    async fn put_object_stream(
        &self,
        location_id: &str,
        key: &str,
        body: ByteStream,
    ) -> FerryResult<u64> {
        self.enter();
        tokio::task::yield_now().await;
        let result = self.inner.put_object_stream(location_id, key, body).await;
        self.exit();
        result
    }

    fn supports_server_side_copy(&self, source_location: &str, dest_location: &str) -> bool {
        self.inner
            .supports_server_side_copy(source_location, dest_location)
    }

    async fn copy_object(
        &self,
        source_location: &str,
        source_key: &str,
        dest_location: &str,
        dest_key: &str,
    ) -> FerryResult<()> {
        self.inner
            .copy_object(source_location, source_key, dest_location, dest_key)
            .await
    }

    async fn delete_object(&self, location_id: &str, key: &str) -> FerryResult<()> {
        self.inner.delete_object(location_id, key).await
    }

    async fn head_object(&self, location_id: &str, key: &str) -> FerryResult<Option<ObjectHead>> {
        self.inner.head_object(location_id, key).await
    }
}

pub struct Fixture {
    _tmp: TempDir,
    /// Root of location `local-0`
    pub root: PathBuf,
    pub buckets: Arc<OpendalObjectStore>,
    pub store: Arc<InstrumentedStore>,
    pub engine: TransferEngine,
}

pub struct FixtureBuilder {
    config: TransferConfig,
    gate: Option<Arc<Semaphore>>,
}

impl FixtureBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.max_concurrency = n;
        self
    }

    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.config.chunk_size = bytes;
        self
    }

    pub fn gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut TransferConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn build(self) -> Fixture {
        let tmp = TempDir::new().expect("tempdir");
        let root = tmp.path().join("data");
        std::fs::create_dir(&root).expect("create root");

        let buckets = Arc::new(OpendalObjectStore::new(self.config.chunk_size));
        buckets.register("models", "us-east-1", memory_operator());
        let store = Arc::new(InstrumentedStore::new(buckets.clone(), self.gate));

        let validator = Arc::new(PathValidator::new(&[&root]));
        let executor = TransferExecutor::new(
            store.clone(),
            LocalFileOps::new(validator),
            self.config.chunk_size,
            self.config.max_file_size_bytes(),
        );
        let engine = TransferEngine::new(executor, &self.config).expect("engine");

        Fixture {
            _tmp: tmp,
            root,
            buckets,
            store,
            engine,
        }
    }
}

pub fn fixture() -> FixtureBuilder {
    FixtureBuilder {
        config: TransferConfig::default(),
        gate: None,
    }
}

impl Fixture {
    /// Poll the job until `done` holds, failing the test after 30 s.
    pub async fn wait_until(
        &self,
        job_id: &str,
        mut done: impl FnMut(&TransferJob) -> bool,
    ) -> TransferJob {
        let engine = self.engine.clone();
        let job_id = job_id.to_string();
        tokio::time::timeout(Duration::from_secs(30), async move {
            loop {
                let job = engine.get(&job_id).expect("job exists");
                if done(&job) {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for job")
    }

    pub async fn wait_terminal(&self, job_id: &str) -> TransferJob {
        self.wait_until(job_id, |job| job.status.is_terminal()).await
    }

    pub async fn read_object(&self, key: &str) -> Vec<u8> {
        let mut reader = self
            .buckets
            .get_object_stream("models", key)
            .await
            .expect("object exists");
        let mut out = Vec::new();
        while let Some(chunk) = reader.stream.next().await {
            out.extend_from_slice(&chunk.expect("chunk"));
        }
        out
    }

    pub async fn put_object(&self, key: &str, content: Vec<u8>) {
        let body = futures::stream::iter(vec![Ok(Bytes::from(content))]).boxed();
        self.buckets
            .put_object_stream("models", key, body)
            .await
            .expect("put object");
    }
}
