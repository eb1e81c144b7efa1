//! Transfer executor: moves the bytes for one task.
//!
//! The strategy is selected from the `(source kind, destination kind)` pair:
//!
//! | source | destination | strategy |
//! |--------|-------------|----------|
//! | object | local  | remote read stream piped into a local file |
//! | local  | object | local file stream handed to the streaming upload |
//! | local  | local  | chunked file-to-file copy |
//! | object | object | server-side copy, else stream through this process |
//!
//! Conflict resolution happens first, before anything is opened for writing.
//! Cancellation is observed at chunk boundaries: a pending read may be
//! abandoned, a chunk write never is.

use ferry_core::types::{StorageKind, StorageLocation, TransferRef};
use ferry_core::{FerryError, FerryResult};
use ferry_storage::{ByteStream, LocalFileOps, ObjectStore, PathValidator};
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::conflict::{self, Resolution};
use crate::job::TransferTask;
use crate::tap::CountingStream;

/// Receives a running task's updates. Implemented by the engine.
pub trait TaskObserver: Send + Sync {
    /// The source size became known.
    fn size_known(&self, size: u64);
    /// The `rename` policy moved the destination.
    fn destination_changed(&self, dest: &TransferRef);
    /// A local destination file was created or truncated.
    fn destination_opened(&self);
    /// Cumulative bytes written to the destination.
    fn progress(&self, bytes_transferred: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    ObjectToLocal,
    LocalToObject,
    LocalToLocal,
    ObjectToObject,
}

impl Strategy {
    pub fn select(source: StorageKind, dest: StorageKind) -> Self {
        match (source, dest) {
            (StorageKind::Object, StorageKind::Local) => Strategy::ObjectToLocal,
            (StorageKind::Local, StorageKind::Object) => Strategy::LocalToObject,
            (StorageKind::Local, StorageKind::Local) => Strategy::LocalToLocal,
            (StorageKind::Object, StorageKind::Object) => Strategy::ObjectToObject,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::ObjectToLocal => "object_to_local",
            Strategy::LocalToObject => "local_to_object",
            Strategy::LocalToLocal => "local_to_local",
            Strategy::ObjectToObject => "object_to_object",
        }
    }
}

/// How a task ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOutcome {
    pub bytes: u64,
    /// Destination existed and the policy was `skip`
    pub skipped: bool,
}

#[derive(Clone)]
pub struct TransferExecutor {
    objects: Arc<dyn ObjectStore>,
    local: LocalFileOps,
    chunk_size: usize,
    max_file_size: u64,
}

impl TransferExecutor {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        local: LocalFileOps,
        chunk_size: usize,
        max_file_size: u64,
    ) -> Self {
        Self {
            objects,
            local,
            chunk_size: chunk_size.max(1),
            max_file_size,
        }
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn local(&self) -> &LocalFileOps {
        &self.local
    }

    /// Local locations first, then object locations, each in configured order.
    pub async fn locations(&self) -> Vec<StorageLocation> {
        let mut all = self.local.validator().locations().await;
        all.extend(self.objects.locations().await);
        all
    }

    /// Run one task to completion.
    ///
    /// Returns `FerryError::Cancelled` when the job's token fired at a chunk
    /// boundary; any partial destination is left in place.
    pub async fn execute(
        &self,
        task: &TransferTask,
        cancel: &CancellationToken,
        observer: Arc<dyn TaskObserver>,
    ) -> FerryResult<TaskOutcome> {
        if cancel.is_cancelled() {
            return Err(FerryError::Cancelled);
        }

        let source = normalized(&task.source)?;
        let dest = normalized(&task.dest)?;

        let dest = match conflict::resolve(&dest, task.policy, |r| self.exists(r)).await? {
            Resolution::Skip => {
                info!(task = task.index, dest = %dest, "destination exists, skipped");
                observer.size_known(0);
                return Ok(TaskOutcome {
                    bytes: 0,
                    skipped: true,
                });
            }
            Resolution::Write(resolved) => resolved,
        };
        if dest != task.dest {
            debug!(task = task.index, from = %task.dest, to = %dest, "destination renamed");
            observer.destination_changed(&dest);
        }

        let strategy = Strategy::select(source.kind, dest.kind);
        debug!(task = task.index, strategy = strategy.as_str(), source = %source, dest = %dest, "executing");

        let bytes = match strategy {
            Strategy::ObjectToLocal => self.object_to_local(&source, &dest, cancel, &observer).await?,
            Strategy::LocalToObject => self.local_to_object(&source, &dest, cancel, &observer).await?,
            Strategy::LocalToLocal => self.local_to_local(&source, &dest, cancel, &observer).await?,
            Strategy::ObjectToObject => {
                self.object_to_object(&source, &dest, cancel, &observer).await?
            }
        };

        Ok(TaskOutcome {
            bytes,
            skipped: false,
        })
    }

    /// Whether anything exists at `target`.
    pub async fn exists(&self, target: TransferRef) -> FerryResult<bool> {
        match target.kind {
            StorageKind::Local => self.local.exists(&target.location_id, &target.path).await,
            StorageKind::Object => Ok(self
                .objects
                .head_object(&target.location_id, &target.path)
                .await?
                .is_some()),
        }
    }

    /// Names under the directory `dir` that already exist.
    pub async fn check_conflicts(
        &self,
        dir: &TransferRef,
        names: &[String],
    ) -> FerryResult<Vec<String>> {
        let mut existing = Vec::new();
        for name in names {
            let target = dir.with_path(conflict::join_dest(&dir.path, name));
            if self.exists(target).await? {
                existing.push(name.clone());
            }
        }
        Ok(existing)
    }

    /// Remove whatever is at `target`. Returns `false` if nothing was there.
    pub async fn remove(&self, target: &TransferRef) -> FerryResult<bool> {
        let result = match target.kind {
            StorageKind::Local => self.local.delete(&target.location_id, &target.path).await,
            StorageKind::Object => {
                if self.exists(target.clone()).await? {
                    self.objects
                        .delete_object(&target.location_id, &target.path)
                        .await
                } else {
                    return Ok(false);
                }
            }
        };
        match result {
            Ok(()) => Ok(true),
            Err(FerryError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn check_size(&self, source: &TransferRef, size: u64) -> FerryResult<()> {
        if size > self.max_file_size {
            return Err(FerryError::Storage(format!(
                "{source}: {size} bytes exceeds the {} byte file size limit",
                self.max_file_size
            )));
        }
        Ok(())
    }

    // ── Strategies ────────────────────────────────────────────────────────────

    async fn object_to_local(
        &self,
        source: &TransferRef,
        dest: &TransferRef,
        cancel: &CancellationToken,
        observer: &Arc<dyn TaskObserver>,
    ) -> FerryResult<u64> {
        let reader = self
            .objects
            .get_object_stream(&source.location_id, &source.path)
            .await?;
        self.check_size(source, reader.size)?;
        observer.size_known(reader.size);

        self.pump_to_local(reader.stream, dest, cancel, observer).await
    }

    async fn local_to_object(
        &self,
        source: &TransferRef,
        dest: &TransferRef,
        cancel: &CancellationToken,
        observer: &Arc<dyn TaskObserver>,
    ) -> FerryResult<u64> {
        let (file, size) = self.local.open_read(&source.location_id, &source.path).await?;
        self.check_size(source, size)?;
        observer.size_known(size);

        let body = ReaderStream::with_capacity(file, self.chunk_size).boxed();
        let tap = CountingStream::new(body, cancel.clone(), Some(observer.clone()));
        let written = self
            .objects
            .put_object_stream(&dest.location_id, &dest.path, tap.boxed())
            .await?;
        info!(source = %source, dest = %dest, bytes = written, "uploaded");
        Ok(written)
    }

    async fn local_to_local(
        &self,
        source: &TransferRef,
        dest: &TransferRef,
        cancel: &CancellationToken,
        observer: &Arc<dyn TaskObserver>,
    ) -> FerryResult<u64> {
        let src_abs = self.local.resolve(&source.location_id, &source.path).await?;
        let dst_abs = self.local.resolve(&dest.location_id, &dest.path).await?;
        if src_abs == dst_abs {
            return Err(FerryError::Conflict(format!(
                "{source} and {dest} are the same file"
            )));
        }

        let (file, size) = self.local.open_read(&source.location_id, &source.path).await?;
        self.check_size(source, size)?;
        observer.size_known(size);

        let body = ReaderStream::with_capacity(file, self.chunk_size).boxed();
        self.pump_to_local(body, dest, cancel, observer).await
    }

    async fn object_to_object(
        &self,
        source: &TransferRef,
        dest: &TransferRef,
        cancel: &CancellationToken,
        observer: &Arc<dyn TaskObserver>,
    ) -> FerryResult<u64> {
        if source.location_id == dest.location_id && source.path == dest.path {
            return Err(FerryError::Conflict(format!(
                "{source} and {dest} are the same object"
            )));
        }

        let head = self
            .objects
            .head_object(&source.location_id, &source.path)
            .await?
            .ok_or_else(|| FerryError::NotFound(source.to_string()))?;
        self.check_size(source, head.size)?;
        observer.size_known(head.size);

        if self
            .objects
            .supports_server_side_copy(&source.location_id, &dest.location_id)
        {
            self.objects
                .copy_object(
                    &source.location_id,
                    &source.path,
                    &dest.location_id,
                    &dest.path,
                )
                .await?;
            observer.progress(head.size);
            return Ok(head.size);
        }

        // Streamed through this process; progress only once the upload is confirmed
        let reader = self
            .objects
            .get_object_stream(&source.location_id, &source.path)
            .await?;
        let tap = CountingStream::new(reader.stream, cancel.clone(), None);
        let written = self
            .objects
            .put_object_stream(&dest.location_id, &dest.path, tap.boxed())
            .await?;
        observer.progress(written);
        info!(source = %source, dest = %dest, bytes = written, "copied via stream");
        Ok(written)
    }

    /// Write `body` into a local destination chunk by chunk.
    async fn pump_to_local(
        &self,
        mut body: ByteStream,
        dest: &TransferRef,
        cancel: &CancellationToken,
        observer: &Arc<dyn TaskObserver>,
    ) -> FerryResult<u64> {
        let ctx = dest.to_string();
        let mut file = self.local.open_write(&dest.location_id, &dest.path).await?;
        observer.destination_opened();

        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FerryError::Cancelled),
                next = body.next() => next,
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => return Err(FerryError::from_io(&e, &ctx)),
                None => break,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| FerryError::from_io(&e, &ctx))?;
            written += chunk.len() as u64;
            observer.progress(written);
            tracing::trace!(dest = %ctx, bytes = written, "chunk written");

            if cancel.is_cancelled() {
                return Err(FerryError::Cancelled);
            }
        }

        file.flush()
            .await
            .map_err(|e| FerryError::from_io(&e, &ctx))?;
        Ok(written)
    }
}

/// Lexically validate a local reference up front; object keys are checked by
/// the store.
fn normalized(r: &TransferRef) -> FerryResult<TransferRef> {
    match r.kind {
        StorageKind::Local => Ok(r.with_path(PathValidator::normalize(&r.location_id, &r.path)?)),
        StorageKind::Object => Ok(r.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::types::ConflictPolicy;
    use ferry_storage::{OpendalObjectStore, PathValidator};
    use std::sync::Mutex;
    use tempfile::TempDir;

    use crate::job::TaskSpec;

    #[derive(Default)]
    struct Recorder {
        sizes: Mutex<Vec<u64>>,
        progress: Mutex<Vec<u64>>,
        renamed: Mutex<Option<TransferRef>>,
        opened: Mutex<bool>,
    }

    impl TaskObserver for Recorder {
        fn size_known(&self, size: u64) {
            self.sizes.lock().unwrap().push(size);
        }
        fn destination_changed(&self, dest: &TransferRef) {
            *self.renamed.lock().unwrap() = Some(dest.clone());
        }
        fn destination_opened(&self) {
            *self.opened.lock().unwrap() = true;
        }
        fn progress(&self, bytes_transferred: u64) {
            self.progress.lock().unwrap().push(bytes_transferred);
        }
    }

    struct Fixture {
        _dir: TempDir,
        root: std::path::PathBuf,
        store: Arc<OpendalObjectStore>,
        executor: TransferExecutor,
    }

    fn fixture(chunk_size: usize, max_file_size: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let validator = Arc::new(PathValidator::new(&[&root]));
        let store = Arc::new(OpendalObjectStore::new(chunk_size));
        let op = opendal::Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        store.register("models", "us-east-1", op);
        let executor = TransferExecutor::new(
            store.clone(),
            LocalFileOps::new(validator),
            chunk_size,
            max_file_size,
        );
        Fixture {
            _dir: dir,
            root,
            store,
            executor,
        }
    }

    fn task(source: TransferRef, dest: TransferRef, policy: ConflictPolicy) -> TransferTask {
        TransferTask::queued(0, TaskSpec::new(source, dest), policy)
    }

    async fn put(store: &OpendalObjectStore, key: &str, data: Vec<u8>) {
        let body = futures::stream::iter(vec![Ok(bytes::Bytes::from(data))]).boxed();
        store.put_object_stream("models", key, body).await.unwrap();
    }

    async fn get(store: &OpendalObjectStore, key: &str) -> Vec<u8> {
        let mut reader = store.get_object_stream("models", key).await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = reader.stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[test]
    fn strategy_matrix() {
        use StorageKind::*;
        assert_eq!(Strategy::select(Object, Local), Strategy::ObjectToLocal);
        assert_eq!(Strategy::select(Local, Object), Strategy::LocalToObject);
        assert_eq!(Strategy::select(Local, Local), Strategy::LocalToLocal);
        assert_eq!(Strategy::select(Object, Object), Strategy::ObjectToObject);
    }

    #[tokio::test]
    async fn local_to_local_reports_each_chunk() {
        let fx = fixture(4, u64::MAX);
        std::fs::write(fx.root.join("a.txt"), b"0123456789").unwrap();
        let rec = Arc::new(Recorder::default());

        let t = task(
            TransferRef::local("local-0", "a.txt"),
            TransferRef::local("local-0", "copy/a.txt"),
            ConflictPolicy::Overwrite,
        );
        let out = fx
            .executor
            .execute(&t, &CancellationToken::new(), rec.clone())
            .await
            .unwrap();

        assert_eq!(out.bytes, 10);
        assert_eq!(std::fs::read(fx.root.join("copy/a.txt")).unwrap(), b"0123456789");
        let progress = rec.progress.lock().unwrap().clone();
        assert!(progress.len() >= 3, "one report per chunk: {progress:?}");
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.last(), Some(&10));
        assert_eq!(*rec.sizes.lock().unwrap(), vec![10]);
        assert!(*rec.opened.lock().unwrap());
    }

    #[tokio::test]
    async fn local_roundtrip_through_object_store() {
        let fx = fixture(3, u64::MAX);
        std::fs::write(fx.root.join("w.bin"), b"weights!").unwrap();
        let rec = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let up = task(
            TransferRef::local("local-0", "w.bin"),
            TransferRef::object("models", "llama/w.bin"),
            ConflictPolicy::Overwrite,
        );
        assert_eq!(fx.executor.execute(&up, &cancel, rec.clone()).await.unwrap().bytes, 8);
        assert_eq!(get(&fx.store, "llama/w.bin").await, b"weights!");
        assert_eq!(rec.progress.lock().unwrap().last(), Some(&8));

        let down = task(
            TransferRef::object("models", "llama/w.bin"),
            TransferRef::local("local-0", "back/w.bin"),
            ConflictPolicy::Overwrite,
        );
        fx.executor.execute(&down, &cancel, rec).await.unwrap();
        assert_eq!(std::fs::read(fx.root.join("back/w.bin")).unwrap(), b"weights!");
    }

    #[tokio::test]
    async fn object_to_object_reports_only_on_completion() {
        let fx = fixture(2, u64::MAX);
        put(&fx.store, "src.bin", b"abcdef".to_vec()).await;
        let rec = Arc::new(Recorder::default());

        let t = task(
            TransferRef::object("models", "src.bin"),
            TransferRef::object("models", "dst.bin"),
            ConflictPolicy::Overwrite,
        );
        let out = fx
            .executor
            .execute(&t, &CancellationToken::new(), rec.clone())
            .await
            .unwrap();
        assert_eq!(out.bytes, 6);
        assert_eq!(*rec.progress.lock().unwrap(), vec![6]);
        assert_eq!(get(&fx.store, "dst.bin").await, b"abcdef");
    }

    #[tokio::test]
    async fn same_file_is_a_conflict() {
        let fx = fixture(4, u64::MAX);
        std::fs::write(fx.root.join("a.txt"), b"keep me").unwrap();
        let t = task(
            TransferRef::local("local-0", "a.txt"),
            TransferRef::local("local-0", "./a.txt"),
            ConflictPolicy::Overwrite,
        );
        let err = fx
            .executor
            .execute(&t, &CancellationToken::new(), Arc::new(Recorder::default()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(std::fs::read(fx.root.join("a.txt")).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn oversized_source_fails_before_writing() {
        let fx = fixture(4, 5);
        std::fs::write(fx.root.join("big.bin"), b"0123456789").unwrap();
        let rec = Arc::new(Recorder::default());
        let t = task(
            TransferRef::local("local-0", "big.bin"),
            TransferRef::local("local-0", "out.bin"),
            ConflictPolicy::Overwrite,
        );
        let err = fx
            .executor
            .execute(&t, &CancellationToken::new(), rec.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "storage");
        assert!(!fx.root.join("out.bin").exists());
        assert!(!*rec.opened.lock().unwrap());
    }

    #[tokio::test]
    async fn escaping_destination_is_rejected() {
        let fx = fixture(4, u64::MAX);
        put(&fx.store, "x.bin", b"x".to_vec()).await;
        let t = task(
            TransferRef::object("models", "x.bin"),
            TransferRef::local("local-0", "../outside.bin"),
            ConflictPolicy::Overwrite,
        );
        let err = fx
            .executor
            .execute(&t, &CancellationToken::new(), Arc::new(Recorder::default()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "security");
    }

    #[tokio::test]
    async fn rename_reports_new_destination() {
        let fx = fixture(4, u64::MAX);
        std::fs::write(fx.root.join("report.txt"), b"old").unwrap();
        std::fs::write(fx.root.join("incoming.txt"), b"new").unwrap();
        let rec = Arc::new(Recorder::default());
        let t = task(
            TransferRef::local("local-0", "incoming.txt"),
            TransferRef::local("local-0", "report.txt"),
            ConflictPolicy::Rename,
        );
        fx.executor
            .execute(&t, &CancellationToken::new(), rec.clone())
            .await
            .unwrap();
        assert_eq!(
            rec.renamed.lock().unwrap().as_ref().map(|r| r.path.as_str()),
            Some("report (1).txt")
        );
        assert_eq!(std::fs::read(fx.root.join("report.txt")).unwrap(), b"old");
        assert_eq!(std::fs::read(fx.root.join("report (1).txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn pre_cancelled_task_does_nothing() {
        let fx = fixture(4, u64::MAX);
        std::fs::write(fx.root.join("a.txt"), b"data").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let t = task(
            TransferRef::local("local-0", "a.txt"),
            TransferRef::local("local-0", "b.txt"),
            ConflictPolicy::Overwrite,
        );
        let err = fx
            .executor
            .execute(&t, &cancel, Arc::new(Recorder::default()))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!fx.root.join("b.txt").exists());
    }

    #[tokio::test]
    async fn conflicts_and_removal() {
        let fx = fixture(4, u64::MAX);
        std::fs::create_dir(fx.root.join("out")).unwrap();
        std::fs::write(fx.root.join("out/a.txt"), b"a").unwrap();
        put(&fx.store, "out/b.txt", b"b".to_vec()).await;

        let names = vec!["a.txt".to_string(), "b.txt".to_string()];
        let local = fx
            .executor
            .check_conflicts(&TransferRef::local("local-0", "out"), &names)
            .await
            .unwrap();
        assert_eq!(local, vec!["a.txt"]);
        let remote = fx
            .executor
            .check_conflicts(&TransferRef::object("models", "out"), &names)
            .await
            .unwrap();
        assert_eq!(remote, vec!["b.txt"]);

        assert!(fx
            .executor
            .remove(&TransferRef::object("models", "out/b.txt"))
            .await
            .unwrap());
        assert!(!fx
            .executor
            .remove(&TransferRef::object("models", "out/b.txt"))
            .await
            .unwrap());
        assert!(fx
            .executor
            .remove(&TransferRef::local("local-0", "out/a.txt"))
            .await
            .unwrap());
        assert!(!fx
            .executor
            .remove(&TransferRef::local("local-0", "out/a.txt"))
            .await
            .unwrap());
    }
}
