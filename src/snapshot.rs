use std::{collections::VecDeque, sync::Arc};

use super::{
    cache::{CacheError, CacheShared},
    editor::Editor,
    io::Filesystem,
};

/// A consistent view of one cache entry's committed values.
///
/// A snapshot holds an open source per value slot, all belonging to the same committed version:
/// an edit committed after the snapshot was taken publishes new files without disturbing the
/// handles already open here, so the bytes read through a snapshot are immutable for its
/// lifetime.
///
/// Close snapshots promptly via [`close`][Snapshot::close]. Dropping an unclosed snapshot
/// schedules the release on the cache's background scheduler instead.
pub struct Snapshot<FS>
where
    FS: Filesystem + 'static,
{
    shared: Arc<CacheShared<FS>>,
    key: String,
    sequence_number: u64,
    lengths: Vec<u64>,
    sources: Vec<FS::File>,
    closed: bool,
}

impl<FS> Snapshot<FS>
where
    FS: Filesystem + 'static,
{
    pub(crate) fn new(
        shared: Arc<CacheShared<FS>>,
        key: String,
        sequence_number: u64,
        lengths: Vec<u64>,
        sources: Vec<FS::File>,
    ) -> Self {
        Self {
            shared,
            key,
            sequence_number,
            lengths,
            sources,
            closed: false,
        }
    }

    /// Gets the key of the entry this snapshot reads.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Gets the number of value slots.
    pub fn value_count(&self) -> usize {
        self.lengths.len()
    }

    /// Gets the source for the given value slot.
    ///
    /// Repeated calls for the same slot return the same handle, with its read position wherever
    /// the previous caller left it.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a valid slot index.
    pub fn source(&mut self, index: usize) -> &mut FS::File {
        &mut self.sources[index]
    }

    /// Gets the committed length, in bytes, of the given value slot at the time the snapshot was
    /// taken.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a valid slot index.
    pub fn length(&self, index: usize) -> u64 {
        self.lengths[index]
    }

    /// Starts an edit of this snapshot's entry, failing if the entry has been updated or removed
    /// since the snapshot was taken.
    ///
    /// # Errors
    ///
    /// If the cache has been closed, or an I/O error occurred when starting the edit, an error
    /// variant will be returned describing the problem.
    pub async fn edit(&self) -> Result<Option<Editor<FS>>, CacheError> {
        self.shared
            .edit_entry(&self.key, Some(self.sequence_number))
            .await
    }

    /// Closes this snapshot, releasing its hold on the entry's files.
    pub async fn close(mut self) {
        self.closed = true;
        self.sources.clear();
        self.shared.release_snapshot(&self.key).await;
    }
}

impl<FS> Drop for Snapshot<FS>
where
    FS: Filesystem + 'static,
{
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let key = std::mem::take(&mut self.key);
        self.shared.scheduler().schedule(Box::pin(async move {
            shared.release_snapshot(&key).await;
        }));
    }
}

/// A lazy iterator over the cache's entries.
///
/// The set of keys is captured when the iterator is created: entries inserted afterwards are not
/// yielded. Each key is re-resolved against the live table on [`next`][Snapshots::next], so
/// entries removed mid-iteration are skipped and entries updated mid-iteration are yielded with
/// their new values. Iteration does not count as an access for LRU purposes.
pub struct Snapshots<FS>
where
    FS: Filesystem + 'static,
{
    shared: Arc<CacheShared<FS>>,
    keys: VecDeque<String>,
    last_key: Option<String>,
}

impl<FS> Snapshots<FS>
where
    FS: Filesystem + 'static,
{
    pub(crate) fn new(shared: Arc<CacheShared<FS>>, keys: VecDeque<String>) -> Self {
        Self {
            shared,
            keys,
            last_key: None,
        }
    }

    /// Gets the next snapshot, or `None` once the captured keys are exhausted.
    ///
    /// # Errors
    ///
    /// If the cache has been closed, or an I/O error occurred while opening an entry's files, an
    /// error variant will be returned describing the problem.
    pub async fn next(&mut self) -> Result<Option<Snapshot<FS>>, CacheError> {
        while let Some(key) = self.keys.pop_front() {
            if let Some(snapshot) = self.shared.open_snapshot(&key, false).await? {
                self.last_key = Some(key);
                return Ok(Some(snapshot));
            }
        }

        Ok(None)
    }

    /// Removes the entry of the most recently returned snapshot from the cache.
    ///
    /// # Errors
    ///
    /// If `next` has not yet returned a snapshot, or the same entry was already removed through
    /// this iterator, an error variant will be returned. I/O errors during the removal are
    /// likewise surfaced.
    pub async fn remove_last(&mut self) -> Result<bool, CacheError> {
        let key = self
            .last_key
            .take()
            .ok_or(CacheError::NoCurrentSnapshot)?;
        self.shared.remove_by_key(&key).await
    }
}
