use std::{
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use tokio::io::{AsyncWrite, BufWriter};

use super::{
    cache::{CacheError, CacheShared},
    io::Filesystem,
};

/// An exclusive, short-lived writer for one cache entry.
///
/// An editor is obtained from [`Cache::edit`][super::Cache::edit] and holds the entry's write
/// exclusivity until it is consumed by [`commit`][Editor::commit] or [`abort`][Editor::abort].
/// The caller writes value slots through the sinks handed out by [`new_sink`][Editor::new_sink];
/// nothing is visible to readers until the commit publishes all slots atomically.
///
/// Dropping an editor without committing or aborting schedules an abort on the cache's background
/// scheduler, so an abandoned edit cannot wedge its entry forever. Explicit completion is still
/// the preferred path: it is synchronous and reports errors.
pub struct Editor<FS>
where
    FS: Filesystem + 'static,
{
    shared: Arc<CacheShared<FS>>,
    key: String,
    token: u64,
    detached: Arc<AtomicBool>,
    written: Vec<bool>,
    finished: bool,
}

impl<FS> Editor<FS>
where
    FS: Filesystem + 'static,
{
    pub(crate) fn new(
        shared: Arc<CacheShared<FS>>,
        key: String,
        token: u64,
        detached: Arc<AtomicBool>,
        value_count: usize,
    ) -> Self {
        Self {
            shared,
            key,
            token,
            detached,
            written: vec![false; value_count],
            finished: false,
        }
    }

    /// Gets the key of the entry this editor writes.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Creates a sink that writes the value for the given slot.
    ///
    /// The sink writes to the slot's dirty file; the bytes become visible to readers only when
    /// the edit is committed. Calling `new_sink` twice for the same slot returns a fresh sink
    /// whose contents replace the first's. The sink buffers internally, so it must be flushed or
    /// shut down before the edit is committed.
    ///
    /// If the entry was removed or evicted while this edit was in flight, the returned sink
    /// discards all bytes and never errors.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred when creating the slot's dirty file, an error variant will be
    /// returned describing the underlying error.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a valid slot index.
    pub async fn new_sink(&mut self, index: usize) -> Result<Sink<FS::File>, CacheError> {
        assert!(index < self.written.len(), "slot index out of range");

        self.written[index] = true;

        if self.detached.load(Ordering::Acquire) {
            return Ok(Sink::discard(Arc::clone(&self.detached)));
        }

        let file = match self
            .shared
            .editor_dirty_file(&self.key, self.token, index)
            .await?
        {
            Some(file) => file,
            // The entry no longer recognizes this editor, so there is nothing durable to write.
            None => return Ok(Sink::discard(Arc::clone(&self.detached))),
        };

        Ok(Sink::active(file, Arc::clone(&self.detached)))
    }

    /// Creates a source over the current committed value for the given slot, if any.
    ///
    /// During an update of an existing entry, this reads the previous committed version, letting
    /// the caller fall back to or build upon the old value. Returns `None` if the entry has never
    /// been committed.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred when opening the slot's clean file, an error variant will be
    /// returned describing the underlying error.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not a valid slot index.
    pub async fn new_source(&mut self, index: usize) -> Result<Option<FS::File>, CacheError> {
        assert!(index < self.written.len(), "slot index out of range");

        self.shared
            .editor_clean_file(&self.key, self.token, index)
            .await
    }

    /// Commits this edit, atomically publishing the written slots as the entry's new version.
    ///
    /// Slots that were not written retain their previous committed value, which is only possible
    /// when the entry had already been committed at least once before this edit.
    ///
    /// # Errors
    ///
    /// If this edit was creating the entry and left any slot without a sink, the edit is aborted
    /// and an error variant is returned. If an I/O error occurred while publishing the slots, an
    /// error variant will be returned describing the underlying error.
    pub async fn commit(mut self) -> Result<(), CacheError> {
        self.finished = true;
        let written = std::mem::take(&mut self.written);
        self.shared
            .complete_edit(&self.key, self.token, Some(&written), true)
            .await
    }

    /// Aborts this edit, discarding all written slots.
    ///
    /// If the entry had a committed version before this edit, it is left untouched; if the edit
    /// was creating the entry, the entry is removed.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred while discarding the edit, an error variant will be returned
    /// describing the underlying error.
    pub async fn abort(mut self) -> Result<(), CacheError> {
        self.finished = true;
        self.shared
            .complete_edit(&self.key, self.token, None, false)
            .await
    }
}

impl<FS> Drop for Editor<FS>
where
    FS: Filesystem + 'static,
{
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        // The editor was dropped without being committed or aborted. Its entry stays locked until
        // the edit completes, so schedule an abort rather than leaking the edit.
        let shared = Arc::clone(&self.shared);
        let key = std::mem::take(&mut self.key);
        let token = self.token;
        self.shared.scheduler().schedule(Box::pin(async move {
            if let Err(error) = shared.complete_edit(&key, token, None, false).await {
                debug!(%key, %error, "Failed to abort dropped editor.");
            }
        }));
    }
}

/// A byte sink for one value slot of an in-progress edit.
///
/// A sink is either backed by the slot's dirty file or, once the editor has been detached by a
/// concurrent removal, a black hole that accepts and discards writes without erroring.
pub struct Sink<F> {
    state: SinkState<F>,
    detached: Arc<AtomicBool>,
}

enum SinkState<F> {
    Active(BufWriter<F>),
    Discard,
}

impl<F> Sink<F>
where
    F: AsyncWrite + Unpin,
{
    fn active(file: F, detached: Arc<AtomicBool>) -> Self {
        Self {
            state: SinkState::Active(BufWriter::new(file)),
            detached,
        }
    }

    fn discard(detached: Arc<AtomicBool>) -> Self {
        Self {
            state: SinkState::Discard,
            detached,
        }
    }

    // A detached editor's sinks stop touching the filesystem entirely; whatever bytes already
    // reached the dirty file are deleted when the edit completes.
    fn flip_if_detached(&mut self) {
        if matches!(self.state, SinkState::Active(_)) && self.detached.load(Ordering::Acquire) {
            self.state = SinkState::Discard;
        }
    }
}

impl<F> AsyncWrite for Sink<F>
where
    F: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.flip_if_detached();
        match &mut self.state {
            SinkState::Active(writer) => Pin::new(writer).poll_write(cx, buf),
            SinkState::Discard => Poll::Ready(Ok(buf.len())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.flip_if_detached();
        match &mut self.state {
            SinkState::Active(writer) => Pin::new(writer).poll_flush(cx),
            SinkState::Discard => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.flip_if_detached();
        match &mut self.state {
            SinkState::Active(writer) => Pin::new(writer).poll_shutdown(cx),
            SinkState::Discard => Poll::Ready(Ok(())),
        }
    }
}
