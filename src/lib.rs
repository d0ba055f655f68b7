//! # Journaled on-disk LRU cache.
//!
//! This crate implements a size-bounded, content-opaque key/value store intended to back an HTTP
//! response cache: callers store byte blobs under short keys and the cache bounds the total byte
//! footprint, survives abrupt termination, and lets readers stream old values while a new value
//! for the same key is being produced.
//!
//! ## Design constraints
//!
//! These constraints, or more often, invariants, are the groundwork for ensuring that the design
//! can stay simple and understandable:
//! - every entry has a fixed number of value slots, set when the cache is built
//! - value bytes are immutable once committed; an update publishes whole new files
//! - all bookkeeping lives in a single append-only text journal, compacted in the background
//! - a reader holds open file handles, so a concurrent update or removal never disturbs it
//! - all state mutations happen under one engine monitor; value I/O happens outside it
//! - a single process owns a cache directory; concurrent external modification is undefined
//!
//! ## On-disk layout
//!
//! A cache directory contains the journal, an occasional transient `journal.bkp` staged during
//! compaction, and two families of value files: `<key>.<i>` holds the committed bytes of slot
//! `i`, and `<key>.<i>.tmp` holds in-progress bytes while an edit is open. Committing an edit
//! renames each written temporary file over its durable counterpart, which is what makes
//! publication atomic per slot and invisible to concurrent readers of the old files.
//!
//! ## The journal
//!
//! The journal is a five-line header followed by one record per line: `DIRTY key` when an edit
//! begins, `CLEAN key len0 len1 …` when it commits, `REMOVE key` when an entry is deleted, and
//! `READ key` when a snapshot is taken. Replaying the records reconstructs both the entry table
//! and its recency order. Records that merely restate the table (`READ`s, superseded `CLEAN`s)
//! accumulate as redundancy; once there are enough of them the journal is rewritten compactly
//! through a staged backup file and an atomic rename, so a crash mid-compaction always leaves a
//! readable journal behind.
//!
//! ## Crash recovery
//!
//! On first use, the cache replays the journal. An entry whose last record is `DIRTY` was
//! mid-edit when the process died: the entry and all of its files are deleted. A malformed or
//! torn final line truncates the journal at that point. A header that does not match the cache's
//! configuration (magic, format version, application version, or slot count) condemns the whole
//! directory: everything is purged and the cache starts fresh.
//!
//! ## Eviction
//!
//! The entry table is kept in recency order: taking a snapshot or committing an edit moves the
//! entry to the tail. Whenever the committed size exceeds the configured maximum, a background
//! task evicts from the head until the cache is back under its limits, skipping entries that are
//! mid-edit.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::type_complexity)] // long-types happen, especially in async code
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

mod cache;
mod common;
mod editor;
mod entry;
pub mod io;
mod journal;
mod scheduler;
mod snapshot;

#[cfg(test)]
mod tests;

pub use self::{
    cache::{Cache, CacheError},
    common::{BuildError, CacheConfig, CacheConfigBuilder},
    editor::{Editor, Sink},
    io::{Filesystem, ProductionFilesystem},
    journal::{JOURNAL_FILE, JOURNAL_FILE_BACKUP},
    scheduler::{Scheduler, TokioScheduler},
    snapshot::{Snapshot, Snapshots},
};
