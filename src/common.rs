use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use once_cell::sync::Lazy;
use regex::Regex;
use snafu::Snafu;

use super::{
    io::{Filesystem, ProductionFilesystem},
    scheduler::Scheduler,
};

/// Keys are constrained so they can appear verbatim in journal lines and file names on every
/// platform the cache runs on. The pattern is part of the on-disk contract and must not be
/// relaxed.
pub(crate) static KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z0-9_-]{1,120}$").expect("key pattern must compile"));

// A journal rebuild is triggered once the journal carries at least this many redundant
// operations, and at least as many redundant operations as there are live entries.
pub(crate) const REDUNDANT_OP_COMPACT_THRESHOLD: u64 = 2000;

/// Returns `true` if `key` is usable as a cache key.
pub(crate) fn is_valid_key(key: &str) -> bool {
    KEY_PATTERN.is_match(key)
}

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Cache configuration.
#[derive(Clone)]
pub struct CacheConfig<FS> {
    /// Directory where this cache stores its journal and value files.
    ///
    /// Must be unique from all other caches, whether within the same process or other processes
    /// on the machine: the cache assumes exclusive ownership of every path under it.
    pub(crate) directory: PathBuf,

    /// Application-defined version number, recorded in the journal header.
    ///
    /// When the on-disk journal was written by a different application version, the cache is
    /// treated as stale and its contents are purged on open.
    pub(crate) app_version: u32,

    /// Number of value slots per entry.
    pub(crate) value_count: usize,

    /// Maximum total size, in bytes, of all committed values.
    ///
    /// The cache trims least-recently-used entries in the background once this is exceeded, so
    /// the on-disk footprint can transiently overshoot it between a commit and the trim.
    pub(crate) max_size: u64,

    /// Maximum number of live entries, if configured.
    pub(crate) max_count: Option<u64>,

    /// Whether the underlying platform forbids reading a file that is concurrently open for
    /// writing.
    ///
    /// When set, edits are refused while snapshot sources are open, snapshots are refused while
    /// an editor is active, and files of removed-but-referenced entries are deleted only when the
    /// last reference closes.
    pub(crate) exclusive_file_access: bool,

    /// Filesystem implementation for journal and value file I/O.
    ///
    /// We allow parameterizing the filesystem implementation for ease of testing.
    pub(crate) filesystem: FS,

    /// Background executor for journal rebuilds and size trims.
    ///
    /// When not supplied, a serial Tokio-backed scheduler is created on open.
    pub(crate) scheduler: Option<Arc<dyn Scheduler>>,
}

impl<FS> CacheConfig<FS> {
    /// Gets the cache directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Builder for [`CacheConfig`].
#[derive(Clone)]
pub struct CacheConfigBuilder<FS = ProductionFilesystem>
where
    FS: Filesystem,
{
    directory: PathBuf,
    app_version: u32,
    value_count: Option<usize>,
    max_size: Option<u64>,
    max_count: Option<u64>,
    exclusive_file_access: bool,
    filesystem: FS,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl CacheConfigBuilder {
    pub fn from_path<P>(directory: P) -> CacheConfigBuilder
    where
        P: AsRef<Path>,
    {
        CacheConfigBuilder {
            directory: directory.as_ref().to_path_buf(),
            app_version: 1,
            value_count: None,
            max_size: None,
            max_count: None,
            exclusive_file_access: false,
            filesystem: ProductionFilesystem,
            scheduler: None,
        }
    }
}

impl<FS> CacheConfigBuilder<FS>
where
    FS: Filesystem,
{
    /// Sets the application version number recorded in the journal header.
    ///
    /// Bump this whenever the meaning of the cached bytes changes: an existing cache directory
    /// written under a different application version is purged on open.
    ///
    /// Defaults to 1.
    pub fn app_version(mut self, app_version: u32) -> Self {
        self.app_version = app_version;
        self
    }

    /// Sets the number of value slots per entry.
    ///
    /// Every entry stores exactly this many byte blobs, and the count is fixed for the lifetime
    /// of the cache directory.
    ///
    /// Defaults to 1. Must be at least 1.
    pub fn value_count(mut self, value_count: usize) -> Self {
        self.value_count = Some(value_count);
        self
    }

    /// Sets the maximum total size, in bytes, of all committed values.
    ///
    /// Must be set, and must be greater than zero.
    pub fn max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Sets the maximum number of live entries.
    ///
    /// Defaults to unlimited.
    pub fn max_count(mut self, max_count: u64) -> Self {
        self.max_count = Some(max_count);
        self
    }

    /// Declares that the underlying platform forbids reading a file that is concurrently open
    /// for writing.
    ///
    /// This gates the deferred-deletion ("zombie") lifecycle for removed entries with live
    /// readers, and makes edits and snapshots mutually exclusive per entry.
    ///
    /// Defaults to `false`.
    pub fn exclusive_file_access(mut self, exclusive_file_access: bool) -> Self {
        self.exclusive_file_access = exclusive_file_access;
        self
    }

    /// Filesystem implementation for journal and value file I/O.
    ///
    /// We allow parameterizing the filesystem implementation for ease of testing.
    ///
    /// Defaults to a Tokio-backed implementation.
    pub fn filesystem<FS2>(self, filesystem: FS2) -> CacheConfigBuilder<FS2>
    where
        FS2: Filesystem,
    {
        CacheConfigBuilder {
            directory: self.directory,
            app_version: self.app_version,
            value_count: self.value_count,
            max_size: self.max_size,
            max_count: self.max_count,
            exclusive_file_access: self.exclusive_file_access,
            filesystem,
            scheduler: self.scheduler,
        }
    }

    /// Background executor for journal rebuilds and size trims.
    ///
    /// Defaults to a serial Tokio-backed scheduler created when the cache is opened.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Consumes this builder and constructs a `CacheConfig`.
    ///
    /// # Errors
    ///
    /// If any parameter is out of range, an error variant will be returned describing the
    /// problem.
    pub fn build(self) -> Result<CacheConfig<FS>, BuildError> {
        let value_count = self.value_count.unwrap_or(1);
        if value_count == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "value_count",
                reason: "cannot be zero".to_string(),
            });
        }

        let max_size = self.max_size.ok_or(BuildError::InvalidParameter {
            param_name: "max_size",
            reason: "must be set".to_string(),
        })?;
        if max_size == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "max_size",
                reason: "cannot be zero".to_string(),
            });
        }

        if let Some(max_count) = self.max_count {
            if max_count == 0 {
                return Err(BuildError::InvalidParameter {
                    param_name: "max_count",
                    reason: "cannot be zero".to_string(),
                });
            }
        }

        Ok(CacheConfig {
            directory: self.directory,
            app_version: self.app_version,
            value_count,
            max_size,
            max_count: self.max_count,
            exclusive_file_access: self.exclusive_file_access,
            filesystem: self.filesystem,
            scheduler: self.scheduler,
        })
    }
}
