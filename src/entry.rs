use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// The engine-side record of an in-progress edit.
///
/// The token ties an [`Editor`][super::Editor] handle back to the entry it was issued for, so a
/// handle that outlives its edit (after a detach or a cache close) is recognized and ignored.
/// The detach flag is shared with every sink the editor has handed out; once set, those sinks
/// stop touching the filesystem.
#[derive(Debug)]
pub(crate) struct ActiveEditor {
    pub token: u64,
    pub detached: Arc<AtomicBool>,
}

impl ActiveEditor {
    pub fn new(token: u64) -> Self {
        Self {
            token,
            detached: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marker for entries whose last replayed journal record was `DIRTY`.
    pub fn replay_marker() -> Self {
        Self::new(0)
    }

    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }
}

/// Metadata for one cache entry.
///
/// The engine owns the authoritative `Entry` for each key; editors and snapshots refer back to it
/// through the engine rather than holding it directly, which keeps the ownership graph acyclic.
/// All fields are mutated only while the engine monitor is held.
#[derive(Debug)]
pub(crate) struct Entry {
    /// Lengths of this entry's value slots, in bytes, as of the last committed edit.
    pub lengths: Vec<u64>,

    /// True once at least one version of this entry has been committed.
    pub readable: bool,

    /// True once the entry has been logically removed while sources or an editor still reference
    /// its files. The files persist until the last reference closes.
    pub zombie: bool,

    /// The active editor, if an edit is in progress.
    pub current_editor: Option<ActiveEditor>,

    /// Number of open snapshot sources reading this entry's files.
    pub locking_source_count: usize,

    /// Version number assigned on each commit, used to detect stale edits.
    pub sequence_number: u64,

    /// Paths of the durable value files, one per slot.
    pub clean_files: Vec<PathBuf>,

    /// Paths of the in-progress value files, one per slot.
    pub dirty_files: Vec<PathBuf>,
}

impl Entry {
    /// Creates the metadata for a new, never-committed entry.
    pub fn new(directory: &Path, key: &str, value_count: usize) -> Self {
        let clean_files = (0..value_count)
            .map(|index| directory.join(format!("{key}.{index}")))
            .collect::<Vec<_>>();
        let dirty_files = (0..value_count)
            .map(|index| directory.join(format!("{key}.{index}.tmp")))
            .collect::<Vec<_>>();

        Self {
            lengths: vec![0; value_count],
            readable: false,
            zombie: false,
            current_editor: None,
            locking_source_count: 0,
            sequence_number: 0,
            clean_files,
            dirty_files,
        }
    }

    /// Gets the total committed size of this entry, in bytes.
    pub fn total_length(&self) -> u64 {
        self.lengths.iter().sum()
    }

    /// Returns `true` if any reader or editor still references this entry's files.
    pub fn is_referenced(&self) -> bool {
        self.locking_source_count > 0 || self.current_editor.is_some()
    }
}
