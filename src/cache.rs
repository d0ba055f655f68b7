use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use indexmap::IndexMap;
use snafu::{ResultExt, Snafu};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufWriter},
    sync::Mutex,
};

use super::{
    common::{is_valid_key, CacheConfig, REDUNDANT_OP_COMPACT_THRESHOLD},
    editor::Editor,
    entry::{ActiveEditor, Entry},
    io::{AsyncFile, Filesystem},
    journal::{self, JournalRecord, JOURNAL_FILE, JOURNAL_FILE_BACKUP},
    scheduler::{Scheduler, TokioScheduler},
    snapshot::{Snapshot, Snapshots},
};

/// Error that occurred during calls to [`Cache`] and its handles.
#[derive(Debug, Snafu)]
pub enum CacheError {
    /// A general I/O error occurred.
    ///
    /// Journal write failures are not surfaced this way: they latch the engine into an errored
    /// state in which edits and removals are refused until a journal rebuild succeeds, while
    /// reads of already-consistent entries continue. This variant covers the remaining I/O:
    /// initialization, value file publication and deletion, and explicit flushes.
    #[snafu(display("cache I/O error: {source}"))]
    Io { source: io::Error },

    /// The key is not usable as a cache key.
    ///
    /// Keys appear verbatim in journal lines and file names, so they are restricted to
    /// `[a-z0-9_-]{1,120}`.
    #[snafu(display("keys must match [a-z0-9_-]{{1,120}}: {key:?}"))]
    InvalidKey { key: String },

    /// The cache has been closed.
    #[snafu(display("cache is closed"))]
    Closed,

    /// The maximum size must be greater than zero.
    #[snafu(display("max size cannot be zero"))]
    InvalidMaxSize,

    /// A commit creating a new entry left a value slot without a sink.
    ///
    /// The offending edit is aborted before this is returned.
    #[snafu(display("newly created entry did not supply a value for slot {index}"))]
    MissingValue { index: usize },

    /// The iterator has not yielded a snapshot to remove.
    #[snafu(display("no snapshot has been returned by this iterator yet"))]
    NoCurrentSnapshot,
}

impl From<io::Error> for CacheError {
    fn from(source: io::Error) -> Self {
        CacheError::Io { source }
    }
}

/// Error that occurred when loading an existing journal.
///
/// Any of these puts the directory on the purge-and-start-fresh path, so the distinction exists
/// for logging rather than recovery.
#[derive(Debug, Snafu)]
enum JournalLoadError {
    #[snafu(display("journal read error: {source}"))]
    Read { source: io::Error },

    #[snafu(display("journal unusable: {source}"))]
    Header { source: journal::JournalHeaderError },
}

/// A journaled, size-bounded, on-disk LRU cache.
///
/// Entries are keyed by short identifiers and hold a fixed number of opaque byte values. All
/// state mutations are serialized through a single engine monitor, while value bytes stream
/// through [`Snapshot`] sources and [`Editor`] sinks outside of it, so large values do not stall
/// unrelated cache operations.
///
/// The cache is cheap to clone; clones share the same engine.
pub struct Cache<FS = super::io::ProductionFilesystem>
where
    FS: Filesystem + 'static,
{
    shared: Arc<CacheShared<FS>>,
}

impl<FS> Clone for Cache<FS>
where
    FS: Filesystem + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<FS> Cache<FS>
where
    FS: Filesystem + 'static,
{
    /// Opens a cache over the given configuration.
    ///
    /// Opening is lazy: the directory is not touched until the first operation, which reads the
    /// journal (or writes a fresh one), recovers from any interrupted edits, and computes the
    /// current size. If that initialization fails, the triggering operation surfaces the error
    /// and the next operation retries it.
    pub async fn open(config: CacheConfig<FS>) -> Cache<FS> {
        let mut config = config;
        let scheduler = config
            .scheduler
            .take()
            .unwrap_or_else(|| Arc::new(TokioScheduler::new()));
        let journal_path = config.directory.join(JOURNAL_FILE);
        let backup_path = config.directory.join(JOURNAL_FILE_BACKUP);
        let state = CacheState {
            initialized: false,
            closed: false,
            entries: IndexMap::new(),
            size: 0,
            max_size: config.max_size,
            journal_writer: None,
            redundant_op_count: 0,
            next_sequence_number: 1,
            next_editor_token: 1,
            has_journal_errors: false,
            most_recent_trim_failed: false,
            most_recent_rebuild_failed: false,
            maintenance_scheduled: false,
        };

        Cache {
            shared: Arc::new_cyclic(|weak_self| CacheShared {
                config,
                journal_path,
                backup_path,
                scheduler,
                state: Mutex::new(state),
                weak_self: weak_self.clone(),
            }),
        }
    }

    /// Gets the directory this cache stores its files in.
    pub fn directory(&self) -> &Path {
        &self.shared.config.directory
    }

    /// Forces initialization, if it has not already happened.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred while reading or rewriting the journal, an error variant will be
    /// returned describing the underlying error.
    pub async fn initialize(&self) -> Result<(), CacheError> {
        let mut state = self.shared.state.lock().await;
        self.shared.ensure_initialized(&mut state).await
    }

    /// Gets a snapshot of the entry for `key`, or `None` if no committed entry exists.
    ///
    /// A returned snapshot holds open sources for every value slot and stays consistent even if
    /// the entry is concurrently updated or removed. Taking a snapshot counts as an access for
    /// LRU purposes.
    ///
    /// # Errors
    ///
    /// If the key is invalid, the cache has been closed, or initialization failed, an error
    /// variant will be returned describing the problem.
    pub async fn get(&self, key: &str) -> Result<Option<Snapshot<FS>>, CacheError> {
        self.shared.validate_key(key)?;
        self.shared.open_snapshot(key, true).await
    }

    /// Starts an edit of the entry for `key`, creating the entry if it does not exist.
    ///
    /// Returns `None` when the entry cannot currently be edited: another edit is in progress,
    /// the entry is awaiting deletion, readers hold it on a platform with exclusive file access,
    /// or the engine is recovering from a journal or trim failure.
    ///
    /// # Errors
    ///
    /// If the key is invalid, the cache has been closed, or initialization failed, an error
    /// variant will be returned describing the problem.
    pub async fn edit(&self, key: &str) -> Result<Option<Editor<FS>>, CacheError> {
        self.shared.validate_key(key)?;
        self.shared.edit_entry(key, None).await
    }

    /// Removes the entry for `key`, returning whether an entry existed.
    ///
    /// An in-flight edit of the entry is detached: its sinks become black holes and its commit
    /// will not resurrect the entry. Readers holding snapshots keep their bytes; the files are
    /// deleted immediately, or once the last holder closes on platforms with exclusive file
    /// access.
    ///
    /// # Errors
    ///
    /// If the key is invalid, the cache has been closed, or an I/O error occurred while deleting
    /// the entry's files, an error variant will be returned describing the problem.
    pub async fn remove(&self, key: &str) -> Result<bool, CacheError> {
        self.shared.validate_key(key)?;
        self.shared.remove_by_key(key).await
    }

    /// Removes every entry in the cache.
    ///
    /// In-flight edits are detached, as with [`remove`][Cache::remove].
    ///
    /// # Errors
    ///
    /// If the cache has been closed, or an I/O error occurred while deleting entry files, an
    /// error variant will be returned describing the problem.
    pub async fn evict_all(&self) -> Result<(), CacheError> {
        self.shared.evict_all().await
    }

    /// Gets the total size, in bytes, of all committed values.
    ///
    /// The size can transiently exceed the configured maximum between a commit and the
    /// background trim that follows it.
    ///
    /// # Errors
    ///
    /// If the cache has been closed or initialization failed, an error variant will be returned
    /// describing the problem.
    pub async fn size(&self) -> Result<u64, CacheError> {
        self.shared.size().await
    }

    /// Gets the maximum total size, in bytes, this cache may hold.
    pub async fn max_size(&self) -> u64 {
        self.shared.state.lock().await.max_size
    }

    /// Changes the maximum total size and schedules a trim to enforce it.
    ///
    /// # Errors
    ///
    /// If `max_size` is zero or the cache has been closed, an error variant will be returned
    /// describing the problem.
    pub async fn set_max_size(&self, max_size: u64) -> Result<(), CacheError> {
        self.shared.set_max_size(max_size).await
    }

    /// Flushes pending journal writes to durable storage, trimming first if the cache is over
    /// its limits.
    ///
    /// # Errors
    ///
    /// If the cache has been closed, or an I/O error occurred while trimming or flushing, an
    /// error variant will be returned describing the problem.
    pub async fn flush(&self) -> Result<(), CacheError> {
        self.shared.flush().await
    }

    /// Closes the cache.
    ///
    /// In-flight edits are aborted: entries being created vanish, and entries being updated keep
    /// their previous committed version. Open snapshots keep reading their already-open sources.
    /// Every subsequent operation on the cache fails.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred while aborting edits or flushing the journal, an error variant
    /// will be returned describing the underlying error.
    pub async fn close(&self) -> Result<(), CacheError> {
        self.shared.close().await
    }

    /// Returns `true` if the cache has been closed.
    pub async fn is_closed(&self) -> bool {
        self.shared.state.lock().await.closed
    }

    /// Creates a lazy iterator over the cache's entries.
    ///
    /// See [`Snapshots`] for the consistency contract under concurrent mutation.
    ///
    /// # Errors
    ///
    /// If the cache has been closed or initialization failed, an error variant will be returned
    /// describing the problem.
    pub async fn snapshots(&self) -> Result<Snapshots<FS>, CacheError> {
        self.shared.snapshots().await
    }
}

/// Engine state guarded by the monitor.
struct CacheState<FS>
where
    FS: Filesystem,
{
    initialized: bool,
    closed: bool,
    /// Insertion-ordered key to entry mapping; the order is the LRU order, oldest first.
    entries: IndexMap<String, Entry>,
    /// Total committed bytes across live (non-zombie) entries.
    size: u64,
    max_size: u64,
    journal_writer: Option<BufWriter<FS::File>>,
    /// Journal body lines beyond the minimum needed to reconstruct the table.
    redundant_op_count: u64,
    next_sequence_number: u64,
    next_editor_token: u64,
    /// Set when a journal append or flush fails; cleared by the next successful flush or
    /// rebuild. While set, edits and removals are refused.
    has_journal_errors: bool,
    most_recent_trim_failed: bool,
    most_recent_rebuild_failed: bool,
    maintenance_scheduled: bool,
}

impl<FS> CacheState<FS>
where
    FS: Filesystem,
{
    fn live_entry_count(&self) -> u64 {
        self.entries.values().filter(|entry| !entry.zombie).count() as u64
    }

    fn promote(&mut self, key: &str) {
        if let Some(index) = self.entries.get_index_of(key) {
            let tail = self.entries.len() - 1;
            self.entries.move_index(index, tail);
        }
    }
}

/// The engine shared by the [`Cache`] front and its outstanding handles.
pub(crate) struct CacheShared<FS>
where
    FS: Filesystem + 'static,
{
    config: CacheConfig<FS>,
    journal_path: PathBuf,
    backup_path: PathBuf,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<CacheState<FS>>,
    weak_self: std::sync::Weak<CacheShared<FS>>,
}

impl<FS> CacheShared<FS>
where
    FS: Filesystem + 'static,
{
    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    // Always succeeds while any handle to the engine is alive, which is the only time methods on
    // it can be running.
    fn arc(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("engine must be alive")
    }

    fn fs(&self) -> &FS {
        &self.config.filesystem
    }

    fn validate_key(&self, key: &str) -> Result<(), CacheError> {
        if is_valid_key(key) {
            Ok(())
        } else {
            Err(CacheError::InvalidKey {
                key: key.to_string(),
            })
        }
    }

    /// Deletes a file, treating "already gone" as success.
    async fn delete_if_exists(&self, path: &Path) -> Result<(), CacheError> {
        match self.fs().delete_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ---------------------------------------------------------------------
    // Initialization and recovery
    // ---------------------------------------------------------------------

    async fn ensure_initialized(
        &self,
        state: &mut CacheState<FS>,
    ) -> Result<(), CacheError> {
        if state.initialized {
            return Ok(());
        }

        self.fs()
            .create_dir_all(&self.config.directory)
            .await
            .context(IoSnafu)?;

        // An interrupted rebuild can leave a backup journal behind. If the primary survived, the
        // backup is stale; if not, the backup is the journal.
        if self.fs().file_exists(&self.backup_path).await.context(IoSnafu)? {
            if self.fs().file_exists(&self.journal_path).await.context(IoSnafu)? {
                self.delete_if_exists(&self.backup_path).await?;
            } else {
                self.fs()
                    .rename_file(&self.backup_path, &self.journal_path)
                    .await
                    .context(IoSnafu)?;
            }
        }

        if self.fs().file_exists(&self.journal_path).await.context(IoSnafu)? {
            match self.load_journal(state).await {
                Ok(journal_truncated) => {
                    if journal_truncated {
                        // Compact immediately so the malformed tail is dropped durably and never
                        // gets appended after.
                        self.rebuild_journal(state).await?;
                    }
                    state.initialized = true;
                    return Ok(());
                }
                Err(error) => {
                    warn!(
                        directory = %self.config.directory.display(),
                        %error,
                        "Cache journal unusable; purging cache contents.",
                    );
                    self.purge_directory(state).await?;
                }
            }
        }

        self.rebuild_journal(state).await?;
        state.initialized = true;
        Ok(())
    }

    /// Reads, validates, and replays the journal into the entry table.
    ///
    /// Returns whether the journal body was truncated at a malformed line and needs an immediate
    /// rebuild.
    #[cfg_attr(test, instrument(skip_all, level = "trace"))]
    async fn load_journal(&self, state: &mut CacheState<FS>) -> Result<bool, JournalLoadError> {
        let mut file = self
            .fs()
            .open_file_readable(&self.journal_path)
            .await
            .context(ReadSnafu)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await.context(ReadSnafu)?;
        drop(file);

        let mut parts = contents.splitn(6, '\n');
        let header_lines = parts.by_ref().take(5).collect::<Vec<_>>();
        let body = parts.next().unwrap_or("");
        journal::validate_header(
            &mut header_lines.into_iter(),
            self.config.app_version,
            self.config.value_count,
        )
        .context(HeaderSnafu)?;

        let body = journal::parse_body(body, self.config.value_count);
        let line_count = body.records.len() as u64;
        for record in body.records {
            self.replay_record(state, record);
        }

        // Entries whose last record was DIRTY were mid-edit when the process died. Their
        // temporary files, and any clean files from a prior version, are unusable.
        let abandoned = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.current_editor.is_some())
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in abandoned {
            debug!(%key, "Dropping entry left mid-edit by a previous process.");
            let entry = state.entries.shift_remove(&key).expect("entry must exist");
            for path in entry.clean_files.iter().chain(entry.dirty_files.iter()) {
                if let Err(error) = self.delete_if_exists(path).await {
                    warn!(path = %path.display(), %error, "Failed to delete abandoned file.");
                }
            }
        }

        state.size = state.entries.values().map(Entry::total_length).sum();
        state.redundant_op_count = line_count.saturating_sub(state.entries.len() as u64);

        if !body.truncated {
            let file = self
                .fs()
                .open_file_appendable(&self.journal_path)
                .await
                .context(ReadSnafu)?;
            state.journal_writer = Some(BufWriter::new(file));
        }

        debug!(
            entries = state.entries.len(),
            size = state.size,
            redundant_ops = state.redundant_op_count,
            truncated = body.truncated,
            "Cache journal replayed.",
        );
        Ok(body.truncated)
    }

    fn replay_record(&self, state: &mut CacheState<FS>, record: JournalRecord) {
        match record {
            JournalRecord::Remove { key } => {
                state.entries.shift_remove(&key);
            }
            JournalRecord::Read { key } => {
                state.promote(&key);
            }
            JournalRecord::Dirty { key } => {
                let entry = state.entries.entry(key.clone()).or_insert_with(|| {
                    Entry::new(&self.config.directory, &key, self.config.value_count)
                });
                entry.current_editor = Some(ActiveEditor::replay_marker());
                state.promote(&key);
            }
            JournalRecord::Clean { key, lengths } => {
                let entry = state.entries.entry(key.clone()).or_insert_with(|| {
                    Entry::new(&self.config.directory, &key, self.config.value_count)
                });
                entry.readable = true;
                entry.current_editor = None;
                entry.lengths = lengths;
                state.promote(&key);
            }
        }
    }

    /// Deletes everything under the cache directory, forgetting all in-memory state with it.
    async fn purge_directory(&self, state: &mut CacheState<FS>) -> Result<(), CacheError> {
        state.journal_writer = None;
        state.entries.clear();
        state.size = 0;
        state.redundant_op_count = 0;
        state.has_journal_errors = false;

        match self.fs().delete_dir_all(&self.config.directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.fs()
            .create_dir_all(&self.config.directory)
            .await
            .context(IoSnafu)?;
        Ok(())
    }

    /// Writes a compact journal reflecting the current table, then atomically swaps it in.
    ///
    /// The new journal is staged at the backup path, synced, and renamed over the primary, so a
    /// crash at any point leaves a readable journal on disk.
    #[cfg_attr(test, instrument(skip_all, level = "trace"))]
    async fn rebuild_journal(&self, state: &mut CacheState<FS>) -> Result<(), CacheError> {
        if let Some(writer) = state.journal_writer.as_mut() {
            // The old writer is about to be replaced wholesale; losing its tail is fine.
            let _ = writer.flush().await;
        }
        state.journal_writer = None;

        let mut contents =
            journal::encode_header(self.config.app_version, self.config.value_count);
        for (key, entry) in &state.entries {
            if entry.zombie {
                continue;
            }
            let record = if entry.current_editor.is_some() {
                JournalRecord::Dirty { key: key.clone() }
            } else if entry.readable {
                JournalRecord::Clean {
                    key: key.clone(),
                    lengths: entry.lengths.clone(),
                }
            } else {
                continue;
            };
            contents.push_str(&record.encode());
        }

        let mut file = self
            .fs()
            .open_file_writable(&self.backup_path)
            .await
            .context(IoSnafu)?;
        file.write_all(contents.as_bytes()).await.context(IoSnafu)?;
        file.flush().await.context(IoSnafu)?;
        file.sync_all().await.context(IoSnafu)?;
        drop(file);

        self.fs()
            .rename_file(&self.backup_path, &self.journal_path)
            .await
            .context(IoSnafu)?;

        let file = self
            .fs()
            .open_file_appendable(&self.journal_path)
            .await
            .context(IoSnafu)?;
        state.journal_writer = Some(BufWriter::new(file));
        state.redundant_op_count = 0;
        state.has_journal_errors = false;
        state.most_recent_rebuild_failed = false;
        debug!(entries = state.entries.len(), "Cache journal rebuilt.");
        Ok(())
    }

    fn journal_rebuild_required(&self, state: &CacheState<FS>) -> bool {
        state.redundant_op_count >= REDUNDANT_OP_COMPACT_THRESHOLD
            && state.redundant_op_count >= state.live_entry_count()
    }

    // ---------------------------------------------------------------------
    // Journal appends
    // ---------------------------------------------------------------------

    /// Appends a record to the journal.
    ///
    /// Failures are not surfaced here: they latch `has_journal_errors`, which refuses subsequent
    /// edits and removals until a flush or rebuild succeeds.
    async fn append_record(&self, state: &mut CacheState<FS>, record: JournalRecord) {
        let Some(writer) = state.journal_writer.as_mut() else {
            state.has_journal_errors = true;
            return;
        };
        if let Err(error) = writer.write_all(record.encode().as_bytes()).await {
            warn!(%error, "Failed to append journal record.");
            state.has_journal_errors = true;
        }
    }

    async fn flush_journal(&self, state: &mut CacheState<FS>) {
        let Some(writer) = state.journal_writer.as_mut() else {
            state.has_journal_errors = true;
            return;
        };
        match writer.flush().await {
            Ok(()) => state.has_journal_errors = false,
            Err(error) => {
                warn!(%error, "Failed to flush journal.");
                state.has_journal_errors = true;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// Opens a snapshot of `key`, if it has a committed, readable entry.
    ///
    /// `record_access` distinguishes a caller-facing `get` (which journals a `READ` record and
    /// promotes the entry) from iterator resolution, which must not disturb the LRU order.
    pub(crate) async fn open_snapshot(
        &self,
        key: &str,
        record_access: bool,
    ) -> Result<Option<Snapshot<FS>>, CacheError> {
        let mut state_guard = self.state.lock().await;
        let state = &mut *state_guard;
        self.ensure_initialized(state).await?;
        if state.closed {
            return Err(CacheError::Closed);
        }

        let Some(entry) = state.entries.get(key) else {
            return Ok(None);
        };
        if !entry.readable || entry.zombie {
            return Ok(None);
        }
        if self.config.exclusive_file_access && entry.current_editor.is_some() {
            return Ok(None);
        }

        let clean_files = entry.clean_files.clone();
        let lengths = entry.lengths.clone();
        let sequence_number = entry.sequence_number;

        let mut sources = Vec::with_capacity(clean_files.len());
        for path in &clean_files {
            match self.fs().open_file_readable(path).await {
                Ok(source) => sources.push(source),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // A value file was deleted out from under us. The entry can never be read
                    // again, so take it out of the table and the size accounting.
                    warn!(%key, path = %path.display(), "Value file missing; dropping entry.");
                    drop(sources);
                    self.remove_entry_locked(state, key).await?;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if self.config.exclusive_file_access {
            let entry = state.entries.get_mut(key).expect("entry must exist");
            entry.locking_source_count += clean_files.len();
        }

        if record_access {
            state.redundant_op_count += 1;
            self.append_record(
                state,
                JournalRecord::Read {
                    key: key.to_string(),
                },
            )
            .await;
            state.promote(key);
            if self.journal_rebuild_required(state) {
                self.schedule_maintenance(state);
            }
        }

        Ok(Some(Snapshot::new(
            self.arc(),
            key.to_string(),
            sequence_number,
            lengths,
            sources,
        )))
    }

    /// Releases a snapshot's hold on its entry, deleting residual files if the snapshot was the
    /// last holder of a removed entry.
    pub(crate) async fn release_snapshot(&self, key: &str) {
        if !self.config.exclusive_file_access {
            return;
        }

        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        entry.locking_source_count = entry
            .locking_source_count
            .saturating_sub(self.config.value_count);
        if entry.locking_source_count == 0 && entry.zombie && entry.current_editor.is_none() {
            let entry = state.entries.shift_remove(key).expect("entry must exist");
            for path in entry.clean_files.iter().chain(entry.dirty_files.iter()) {
                if let Err(error) = self.delete_if_exists(path).await {
                    warn!(%key, path = %path.display(), %error, "Failed to delete file of removed entry.");
                }
            }
        }
    }

    async fn snapshots(&self) -> Result<Snapshots<FS>, CacheError> {
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;
        if state.closed {
            return Err(CacheError::Closed);
        }

        let keys = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.zombie)
            .map(|(key, _)| key.clone())
            .collect::<VecDeque<_>>();
        Ok(Snapshots::new(self.arc(), keys))
    }

    // ---------------------------------------------------------------------
    // Edits
    // ---------------------------------------------------------------------

    /// Starts an edit, optionally refusing if the entry's version is not `expected_sequence`.
    pub(crate) async fn edit_entry(
        &self,
        key: &str,
        expected_sequence: Option<u64>,
    ) -> Result<Option<Editor<FS>>, CacheError> {
        let mut state_guard = self.state.lock().await;
        let state = &mut *state_guard;
        self.ensure_initialized(state).await?;
        if state.closed {
            return Err(CacheError::Closed);
        }

        let entry = state.entries.get(key);
        if let Some(expected) = expected_sequence {
            // The caller is editing through a snapshot; refuse if the entry changed since.
            match entry {
                Some(entry) if entry.sequence_number == expected => {}
                _ => return Ok(None),
            }
        }
        if let Some(entry) = entry {
            if entry.current_editor.is_some() {
                return Ok(None); // Another edit is in progress.
            }
            if entry.zombie {
                return Ok(None); // Awaiting deletion; the key is unusable until that finishes.
            }
            if entry.locking_source_count != 0 {
                return Ok(None); // A reader holds the files we would be replacing.
            }
        }

        if state.most_recent_trim_failed || state.most_recent_rebuild_failed {
            // The engine is over its size limit or unable to journal; either way, taking on new
            // writes would dig the hole deeper. Retry the cleanup instead.
            self.schedule_maintenance(state);
            return Ok(None);
        }

        // Journal the edit before creating any files, so a crash cannot leak unreferenced
        // temporary files.
        self.append_record(
            state,
            JournalRecord::Dirty {
                key: key.to_string(),
            },
        )
        .await;
        self.flush_journal(state).await;
        if state.has_journal_errors {
            return Ok(None); // Don't edit; the journal can't be written.
        }

        let token = state.next_editor_token;
        state.next_editor_token += 1;
        let active = ActiveEditor::new(token);
        let detached = Arc::clone(&active.detached);
        let entry = state.entries.entry(key.to_string()).or_insert_with(|| {
            Entry::new(&self.config.directory, key, self.config.value_count)
        });
        entry.current_editor = Some(active);

        Ok(Some(Editor::new(
            self.arc(),
            key.to_string(),
            token,
            detached,
            self.config.value_count,
        )))
    }

    /// Opens the dirty file for one slot of an active edit.
    ///
    /// Returns `None` when the entry no longer recognizes the editor, which happens after the
    /// edit was detached by a removal on a platform without exclusive file access.
    pub(crate) async fn editor_dirty_file(
        &self,
        key: &str,
        token: u64,
        index: usize,
    ) -> Result<Option<FS::File>, CacheError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(None);
        };
        if !matches!(&entry.current_editor, Some(active) if active.token == token) {
            return Ok(None);
        }

        let path = entry.dirty_files[index].clone();
        let file = self.fs().open_file_writable(&path).await.context(IoSnafu)?;
        Ok(Some(file))
    }

    /// Opens the committed clean file for one slot of an active edit, if the entry has ever been
    /// committed.
    pub(crate) async fn editor_clean_file(
        &self,
        key: &str,
        token: u64,
        index: usize,
    ) -> Result<Option<FS::File>, CacheError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(None);
        };
        if !matches!(&entry.current_editor, Some(active) if active.token == token) {
            return Ok(None);
        }
        if !entry.readable || entry.zombie {
            return Ok(None);
        }

        let path = entry.clean_files[index].clone();
        let file = self.fs().open_file_readable(&path).await.context(IoSnafu)?;
        Ok(Some(file))
    }

    /// Completes an edit, publishing (`success`) or discarding its written slots.
    pub(crate) async fn complete_edit(
        &self,
        key: &str,
        token: u64,
        written: Option<&[bool]>,
        success: bool,
    ) -> Result<(), CacheError> {
        let mut state_guard = self.state.lock().await;
        let state = &mut *state_guard;
        if state.closed {
            return Err(CacheError::Closed);
        }

        self.complete_edit_locked(state, key, token, written, success)
            .await
    }

    async fn complete_edit_locked(
        &self,
        state: &mut CacheState<FS>,
        key: &str,
        token: u64,
        written: Option<&[bool]>,
        success: bool,
    ) -> Result<(), CacheError> {
        let Some(entry) = state.entries.get(key) else {
            // The entry was removed and this editor detached; the removal already cleaned up.
            return Ok(());
        };
        if !matches!(&entry.current_editor, Some(active) if active.token == token) {
            return Ok(());
        }

        let zombie = entry.zombie;
        let readable = entry.readable;
        let clean_files = entry.clean_files.clone();
        let dirty_files = entry.dirty_files.clone();
        let old_lengths = entry.lengths.clone();

        // A commit creating the entry must have produced every slot; otherwise the commit
        // degrades into an abort and the caller is told which slot was missing.
        let mut effective_success = success;
        let mut missing_value = None;
        if success && !zombie && !readable {
            if let Some(written) = written {
                if let Some(index) = written.iter().position(|written| !written) {
                    effective_success = false;
                    missing_value = Some(index);
                }
            }
            if effective_success {
                for path in &dirty_files {
                    if !self.fs().file_exists(path).await.context(IoSnafu)? {
                        effective_success = false;
                        break;
                    }
                }
            }
        }

        let mut new_lengths = old_lengths.clone();
        let mut size_gained: u64 = 0;
        let mut size_lost: u64 = 0;
        for index in 0..self.config.value_count {
            let dirty = &dirty_files[index];
            if effective_success && !zombie {
                if self.fs().file_exists(dirty).await.context(IoSnafu)? {
                    let clean = &clean_files[index];
                    self.fs().rename_file(dirty, clean).await.context(IoSnafu)?;
                    let length = self.fs().file_metadata(clean).await.context(IoSnafu)?.len();
                    new_lengths[index] = length;
                    size_gained += length;
                    size_lost += old_lengths[index];
                }
            } else {
                self.delete_if_exists(dirty).await?;
            }
        }

        let entry = state.entries.get_mut(key).expect("entry must exist");
        entry.current_editor = None;
        entry.lengths = new_lengths.clone();
        state.size = state.size + size_gained - size_lost;

        if zombie {
            // The removal that zombied this entry already journaled it; all that is left is to
            // drop the files once nothing else holds them.
            if state.entries[key].locking_source_count == 0 {
                let entry = state.entries.shift_remove(key).expect("entry must exist");
                for path in entry.clean_files.iter() {
                    self.delete_if_exists(path).await?;
                }
            }
        } else {
            state.redundant_op_count += 1;
            if readable || effective_success {
                let entry = state.entries.get_mut(key).expect("entry must exist");
                entry.readable = true;
                if effective_success {
                    entry.sequence_number = state.next_sequence_number;
                    state.next_sequence_number += 1;
                }
                self.append_record(
                    state,
                    JournalRecord::Clean {
                        key: key.to_string(),
                        lengths: new_lengths,
                    },
                )
                .await;
                if effective_success {
                    state.promote(key);
                }
            } else {
                state.entries.shift_remove(key);
                self.append_record(
                    state,
                    JournalRecord::Remove {
                        key: key.to_string(),
                    },
                )
                .await;
            }
            self.flush_journal(state).await;

            if state.size > state.max_size
                || self.over_count_limit(state)
                || self.journal_rebuild_required(state)
            {
                self.schedule_maintenance(state);
            }
        }

        match missing_value {
            Some(index) => Err(CacheError::MissingValue { index }),
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Removal and trimming
    // ---------------------------------------------------------------------

    pub(crate) async fn remove_by_key(&self, key: &str) -> Result<bool, CacheError> {
        let mut state_guard = self.state.lock().await;
        let state = &mut *state_guard;
        self.ensure_initialized(state).await?;
        if state.closed {
            return Err(CacheError::Closed);
        }
        if state.has_journal_errors {
            // The removal could not be journaled, so refuse it and retry the rebuild instead.
            self.schedule_maintenance(state);
            return Ok(false);
        }

        let removed = self.remove_entry_locked(state, key).await?;
        if removed && state.size <= state.max_size {
            state.most_recent_trim_failed = false;
        }
        Ok(removed)
    }

    /// Removes an entry: detaches any active edit, journals a `REMOVE`, subtracts the entry's
    /// size, and deletes its files now or, for referenced entries on platforms with exclusive
    /// file access, when the last holder lets go.
    async fn remove_entry_locked(
        &self,
        state: &mut CacheState<FS>,
        key: &str,
    ) -> Result<bool, CacheError> {
        let Some(entry) = state.entries.get(key) else {
            return Ok(false);
        };
        if entry.zombie {
            return Ok(false); // Already logically removed.
        }

        if let Some(active) = &entry.current_editor {
            // Flip the edit's sinks to black holes. The editor handle stays with its caller;
            // when it eventually commits or aborts, the entry is gone and the completion is an
            // orphan no-op, so the REMOVE below is the edit's final word in the journal.
            active.detach();
        }
        let referenced = entry.is_referenced();

        if self.config.exclusive_file_access && referenced {
            // The files cannot be deleted while handles are open. Journal the removal and leave
            // a zombie behind to carry the files until the last handle closes.
            let entry = state.entries.get_mut(key).expect("entry must exist");
            let total = entry.total_length();
            entry.zombie = true;
            entry.lengths = vec![0; self.config.value_count];
            state.size -= total;
            state.redundant_op_count += 1;
            self.append_record(
                state,
                JournalRecord::Remove {
                    key: key.to_string(),
                },
            )
            .await;
            self.flush_journal(state).await;
            if self.journal_rebuild_required(state) {
                self.schedule_maintenance(state);
            }
            return Ok(true);
        }

        // Both file families go: the clean files of the committed version and any dirty files a
        // detached edit left behind. Nothing recreates the dirty paths afterwards, since the
        // detached sinks hold open handles rather than reopening by path.
        let entry = state.entries.get(key).expect("entry must exist");
        let files = entry
            .clean_files
            .iter()
            .chain(entry.dirty_files.iter())
            .cloned()
            .collect::<Vec<_>>();
        let total = entry.total_length();
        for path in &files {
            self.delete_if_exists(path).await?;
        }

        state.entries.shift_remove(key);
        state.size -= total;
        state.redundant_op_count += 1;
        self.append_record(
            state,
            JournalRecord::Remove {
                key: key.to_string(),
            },
        )
        .await;
        self.flush_journal(state).await;
        if self.journal_rebuild_required(state) {
            self.schedule_maintenance(state);
        }
        Ok(true)
    }

    async fn evict_all(&self) -> Result<(), CacheError> {
        let mut state_guard = self.state.lock().await;
        let state = &mut *state_guard;
        self.ensure_initialized(state).await?;
        if state.closed {
            return Err(CacheError::Closed);
        }

        let keys = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.zombie)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in keys {
            self.remove_entry_locked(state, &key).await?;
        }
        state.most_recent_trim_failed = false;
        Ok(())
    }

    fn over_count_limit(&self, state: &CacheState<FS>) -> bool {
        self.config
            .max_count
            .map_or(false, |max_count| state.live_entry_count() > max_count)
    }

    fn over_limits(&self, state: &CacheState<FS>) -> bool {
        state.size > state.max_size || self.over_count_limit(state)
    }

    /// Evicts least-recently-used entries until the cache is back under its limits.
    ///
    /// Entries being edited are skipped; their commit or abort re-triggers the trim.
    #[cfg_attr(test, instrument(skip_all, level = "trace"))]
    async fn trim_to_size(&self, state: &mut CacheState<FS>) -> Result<(), CacheError> {
        while self.over_limits(state) {
            let victim = state
                .entries
                .iter()
                .find(|(_, entry)| !entry.zombie && entry.current_editor.is_none())
                .map(|(key, _)| key.clone());
            let Some(key) = victim else {
                break; // Everything left is being edited or already awaiting deletion.
            };
            debug!(%key, size = state.size, max_size = state.max_size, "Evicting entry to reclaim space.");
            self.remove_entry_locked(state, &key).await?;
        }
        state.most_recent_trim_failed = false;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------------

    fn schedule_maintenance(&self, state: &mut CacheState<FS>) {
        if state.maintenance_scheduled || state.closed {
            return;
        }
        state.maintenance_scheduled = true;

        let shared = self.arc();
        self.scheduler.schedule(Box::pin(async move {
            shared.perform_maintenance().await;
        }));
    }

    /// Runs the background maintenance pass: trim to size, then rebuild the journal if it has
    /// accumulated enough redundancy or is in an errored state.
    #[cfg_attr(test, instrument(skip_all, level = "trace"))]
    pub(crate) async fn perform_maintenance(&self) {
        let mut state_guard = self.state.lock().await;
        let state = &mut *state_guard;
        state.maintenance_scheduled = false;
        if !state.initialized || state.closed {
            return;
        }

        if let Err(error) = self.trim_to_size(state).await {
            warn!(%error, "Background trim failed; suspending writes until it succeeds.");
            state.most_recent_trim_failed = true;
        }

        if state.has_journal_errors
            || state.most_recent_rebuild_failed
            || self.journal_rebuild_required(state)
        {
            if let Err(error) = self.rebuild_journal(state).await {
                warn!(%error, "Journal rebuild failed; suspending writes until it succeeds.");
                state.most_recent_rebuild_failed = true;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Whole-cache operations
    // ---------------------------------------------------------------------

    async fn size(&self) -> Result<u64, CacheError> {
        let mut state = self.state.lock().await;
        self.ensure_initialized(&mut state).await?;
        if state.closed {
            return Err(CacheError::Closed);
        }
        Ok(state.size)
    }

    async fn set_max_size(&self, max_size: u64) -> Result<(), CacheError> {
        if max_size == 0 {
            return Err(CacheError::InvalidMaxSize);
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(CacheError::Closed);
        }
        state.max_size = max_size;
        if state.initialized {
            self.schedule_maintenance(&mut state);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), CacheError> {
        let mut state_guard = self.state.lock().await;
        let state = &mut *state_guard;
        if !state.initialized {
            return Ok(()); // Nothing on disk to make durable yet.
        }
        if state.closed {
            return Err(CacheError::Closed);
        }

        if let Err(error) = self.trim_to_size(state).await {
            state.most_recent_trim_failed = true;
            return Err(error);
        }

        let Some(writer) = state.journal_writer.as_mut() else {
            return Ok(());
        };
        match writer.flush().await {
            Ok(()) => state.has_journal_errors = false,
            Err(e) => {
                state.has_journal_errors = true;
                return Err(e.into());
            }
        }
        writer.get_ref().sync_all().await.context(IoSnafu)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        let mut state_guard = self.state.lock().await;
        let state = &mut *state_guard;
        if !state.initialized || state.closed {
            state.closed = true;
            return Ok(());
        }

        // Complete in-flight edits as aborts: creations vanish, updates keep their previous
        // committed version. Detach first so any outstanding sinks go quiet.
        let editing = state
            .entries
            .iter()
            .filter_map(|(key, entry)| {
                entry.current_editor.as_ref().map(|active| {
                    active.detach();
                    (key.clone(), active.token)
                })
            })
            .collect::<Vec<_>>();
        for (key, token) in editing {
            self.complete_edit_locked(state, &key, token, None, false)
                .await?;
        }

        self.trim_to_size(state).await?;

        if let Some(mut writer) = state.journal_writer.take() {
            writer.flush().await.context(IoSnafu)?;
            writer.get_ref().sync_all().await.context(IoSnafu)?;
        }
        state.closed = true;
        Ok(())
    }
}
