use std::{
    collections::VecDeque,
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use temp_dir::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::{
    io::{AsyncFile, Filesystem, Metadata, ProductionFilesystem},
    Cache, CacheConfigBuilder, Scheduler, Snapshot,
};

mod eviction;

/// Application version baked into every journal the tests write.
pub(crate) const APP_VERSION: u32 = 100;

/// Value slots per entry in every cache the tests build.
pub(crate) const VALUE_COUNT: usize = 2;

#[macro_export]
macro_rules! assert_file_exists {
    ($file_path:expr) => {{
        let result = tokio::fs::metadata($file_path).await;
        assert!(
            result.is_ok() && result.expect("is_ok() was true").is_file(),
            "expected file to exist: {}",
            $file_path.display()
        );
    }};
}

#[macro_export]
macro_rules! assert_file_does_not_exist {
    ($file_path:expr) => {{
        let result = tokio::fs::metadata($file_path).await;
        assert!(result.is_err());
        assert_eq!(
            std::io::ErrorKind::NotFound,
            result.expect_err("is_err() was true").kind(),
            "got unexpected error kind for {}",
            $file_path.display()
        );
    }};
}

/// Run a future with a temporary directory.
///
/// # Panics
///
/// Will panic if function cannot create a temp directory.
pub(crate) async fn with_temp_dir<F, Fut, V>(f: F) -> V
where
    F: FnOnce(&Path) -> Fut,
    Fut: Future<Output = V>,
{
    let cache_dir = TempDir::with_prefix("disk-cache")
        .expect("cannot recover from failure to create temp dir");
    f(cache_dir.path()).await
}

/// A [`Scheduler`] that queues tasks until the test explicitly steps them.
///
/// Maintenance stays perfectly deterministic this way: a test can assert on the state both
/// before and after a background trim or journal rebuild runs.
pub(crate) struct ManualScheduler {
    tasks: Mutex<VecDeque<BoxFuture<'static, ()>>>,
}

impl ManualScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(VecDeque::new()),
        })
    }

    /// Gets the number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.tasks.lock().expect("poisoned").len()
    }

    /// Runs queued tasks, in submission order, until none remain.
    pub async fn run_pending(&self) {
        loop {
            let task = self.tasks.lock().expect("poisoned").pop_front();
            match task {
                Some(task) => task.await,
                None => break,
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, task: BoxFuture<'static, ()>) {
        self.tasks.lock().expect("poisoned").push_back(task);
    }
}

/// Creates a cache over `dir` with two value slots and the given size cap, driven by a manual
/// scheduler.
pub(crate) async fn create_cache(
    dir: &Path,
    max_size: u64,
) -> (Cache<ProductionFilesystem>, Arc<ManualScheduler>) {
    let scheduler = ManualScheduler::new();
    let config = CacheConfigBuilder::from_path(dir)
        .app_version(APP_VERSION)
        .value_count(VALUE_COUNT)
        .max_size(max_size)
        .scheduler(scheduler.clone())
        .build()
        .expect("config should build");
    (Cache::open(config).await, scheduler)
}

/// As [`create_cache`], but with exclusive file access declared, which activates the deferred
/// deletion lifecycle for removed-but-referenced entries.
pub(crate) async fn create_exclusive_cache(
    dir: &Path,
    max_size: u64,
) -> (Cache<ProductionFilesystem>, Arc<ManualScheduler>) {
    let scheduler = ManualScheduler::new();
    let config = CacheConfigBuilder::from_path(dir)
        .app_version(APP_VERSION)
        .value_count(VALUE_COUNT)
        .max_size(max_size)
        .exclusive_file_access(true)
        .scheduler(scheduler.clone())
        .build()
        .expect("config should build");
    (Cache::open(config).await, scheduler)
}

/// As [`create_cache`], but over a fault-injecting filesystem whose failures the test can toggle.
pub(crate) async fn create_faulty_cache(
    dir: &Path,
    max_size: u64,
) -> (Cache<FaultyFilesystem>, Arc<ManualScheduler>, FaultyFilesystem) {
    let scheduler = ManualScheduler::new();
    let filesystem = FaultyFilesystem::default();
    let config = CacheConfigBuilder::from_path(dir)
        .app_version(APP_VERSION)
        .value_count(VALUE_COUNT)
        .max_size(max_size)
        .filesystem(filesystem.clone())
        .scheduler(scheduler.clone())
        .build()
        .expect("config should build");
    (Cache::open(config).await, scheduler, filesystem)
}

/// Writes all value slots of `key` and commits, creating or updating the entry.
pub(crate) async fn set_entry<FS>(cache: &Cache<FS>, key: &str, values: &[&str])
where
    FS: Filesystem + 'static,
{
    let mut editor = cache
        .edit(key)
        .await
        .expect("edit should not fail")
        .expect("editor should be available");
    for (index, value) in values.iter().enumerate() {
        let mut sink = editor.new_sink(index).await.expect("sink should open");
        sink.write_all(value.as_bytes())
            .await
            .expect("write should not fail");
        sink.shutdown().await.expect("shutdown should not fail");
    }
    editor.commit().await.expect("commit should not fail");
}

/// Reads every value slot of `key` through one snapshot, or `None` on a miss.
pub(crate) async fn read_entry<FS>(cache: &Cache<FS>, key: &str) -> Option<Vec<String>>
where
    FS: Filesystem + 'static,
{
    let mut snapshot = cache.get(key).await.expect("get should not fail")?;
    let values = read_snapshot(&mut snapshot).await;
    snapshot.close().await;
    Some(values)
}

/// Reads every value slot of an open snapshot to strings.
pub(crate) async fn read_snapshot<FS>(snapshot: &mut Snapshot<FS>) -> Vec<String>
where
    FS: Filesystem + 'static,
{
    let mut values = Vec::new();
    for index in 0..snapshot.value_count() {
        let mut value = String::new();
        snapshot
            .source(index)
            .read_to_string(&mut value)
            .await
            .expect("read should not fail");
        values.push(value);
    }
    values
}

/// Gets the full text of the journal file.
pub(crate) async fn journal_contents(dir: &Path) -> String {
    tokio::fs::read_to_string(dir.join(super::JOURNAL_FILE))
        .await
        .expect("journal should be readable")
}

/// Gets the keys of live entries in LRU order by walking the iterator.
pub(crate) async fn live_keys<FS>(cache: &Cache<FS>) -> Vec<String>
where
    FS: Filesystem + 'static,
{
    let mut keys = Vec::new();
    let mut snapshots = cache.snapshots().await.expect("snapshots should not fail");
    while let Some(snapshot) = snapshots.next().await.expect("next should not fail") {
        keys.push(snapshot.key().to_string());
        snapshot.close().await;
    }
    keys
}

fn injected_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "injected failure")
}

#[derive(Default)]
struct Faults {
    writes: AtomicBool,
    renames: AtomicBool,
    deletes: AtomicBool,
}

/// A [`Filesystem`] that passes through to the real one but fails selected operation kinds on
/// demand, including writes through files that are already open.
#[derive(Clone, Default)]
pub(crate) struct FaultyFilesystem {
    inner: ProductionFilesystem,
    faults: Arc<Faults>,
}

impl FaultyFilesystem {
    pub fn fail_writes(&self, fail: bool) {
        self.faults.writes.store(fail, Ordering::Release);
    }

    pub fn fail_renames(&self, fail: bool) {
        self.faults.renames.store(fail, Ordering::Release);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.faults.deletes.store(fail, Ordering::Release);
    }

    fn wrap(&self, file: tokio::fs::File) -> FaultyFile {
        FaultyFile {
            inner: file,
            faults: Arc::clone(&self.faults),
        }
    }
}

#[async_trait]
impl Filesystem for FaultyFilesystem {
    type File = FaultyFile;

    async fn open_file_readable(&self, path: &Path) -> io::Result<Self::File> {
        self.inner.open_file_readable(path).await.map(|f| self.wrap(f))
    }

    async fn open_file_writable(&self, path: &Path) -> io::Result<Self::File> {
        self.inner.open_file_writable(path).await.map(|f| self.wrap(f))
    }

    async fn open_file_appendable(&self, path: &Path) -> io::Result<Self::File> {
        self.inner
            .open_file_appendable(path)
            .await
            .map(|f| self.wrap(f))
    }

    async fn file_metadata(&self, path: &Path) -> io::Result<Metadata> {
        self.inner.file_metadata(path).await
    }

    async fn delete_file(&self, path: &Path) -> io::Result<()> {
        if self.faults.deletes.load(Ordering::Acquire) {
            return Err(injected_error());
        }
        self.inner.delete_file(path).await
    }

    async fn rename_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        if self.faults.renames.load(Ordering::Acquire) {
            return Err(injected_error());
        }
        self.inner.rename_file(from, to).await
    }

    async fn list_directory(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.inner.list_directory(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path).await
    }

    async fn delete_dir_all(&self, path: &Path) -> io::Result<()> {
        if self.faults.deletes.load(Ordering::Acquire) {
            return Err(injected_error());
        }
        self.inner.delete_dir_all(path).await
    }
}

pub(crate) struct FaultyFile {
    inner: tokio::fs::File,
    faults: Arc<Faults>,
}

impl AsyncRead for FaultyFile {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FaultyFile {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.faults.writes.load(Ordering::Acquire) {
            return Poll::Ready(Err(injected_error()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.faults.writes.load(Ordering::Acquire) {
            return Poll::Ready(Err(injected_error()));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl AsyncFile for FaultyFile {
    async fn metadata(&self) -> io::Result<Metadata> {
        AsyncFile::metadata(&self.inner).await
    }

    async fn sync_all(&self) -> io::Result<()> {
        if self.faults.writes.load(Ordering::Acquire) {
            return Err(injected_error());
        }
        AsyncFile::sync_all(&self.inner).await
    }
}
