use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::{
    fs::OpenOptions,
    io::{AsyncRead, AsyncWrite},
};

#[cfg(unix)]
const FILE_MODE_OWNER_RW_GROUP_RO: u32 = 0o640;

/// File metadata.
pub struct Metadata {
    pub(crate) len: u64,
}

impl Metadata {
    /// Gets the length of the file, in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if the file is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Generalized interface for the filesystem operations the cache depends on.
///
/// Every byte the cache reads or writes goes through this trait, which keeps the engine itself
/// free of direct `tokio::fs` calls and allows tests to substitute an in-memory, fault-injecting
/// implementation.
#[async_trait]
pub trait Filesystem: Send + Sync {
    type File: AsyncFile + Unpin;

    /// Opens a file for reading.
    ///
    /// # Errors
    ///
    /// If the file does not exist, an error with an `ErrorKind` of `NotFound` will be returned.
    /// Otherwise, if an I/O error occurred when attempting to open the file for reading, an error
    /// variant will be returned describing the underlying error.
    async fn open_file_readable(&self, path: &Path) -> io::Result<Self::File>;

    /// Opens a file for writing, creating it if it does not exist and truncating it if it does.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred when attempting to open the file for writing, an error variant
    /// will be returned describing the underlying error.
    async fn open_file_writable(&self, path: &Path) -> io::Result<Self::File>;

    /// Opens a file for appending, creating it if it does not exist.
    ///
    /// The starting position in the file will be set to the end of the file: the file will not be
    /// truncated.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred when attempting to open the file for appending, an error variant
    /// will be returned describing the underlying error.
    async fn open_file_appendable(&self, path: &Path) -> io::Result<Self::File>;

    /// Queries the metadata of a file by path.
    ///
    /// # Errors
    ///
    /// If the file does not exist, an error with an `ErrorKind` of `NotFound` will be returned.
    /// Otherwise, if an I/O error occurred when attempting to query the file metadata, an error
    /// variant will be returned describing the underlying error.
    async fn file_metadata(&self, path: &Path) -> io::Result<Metadata>;

    /// Deletes a file.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred when attempting to delete the file, an error variant will be
    /// returned describing the underlying error.
    async fn delete_file(&self, path: &Path) -> io::Result<()>;

    /// Renames a file, atomically replacing the destination if it exists.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred when attempting to rename the file, an error variant will be
    /// returned describing the underlying error.
    async fn rename_file(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Lists the entries of a directory.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred when attempting to read the directory, an error variant will be
    /// returned describing the underlying error.
    async fn list_directory(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Creates a directory, including any missing parent directories.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred when attempting to create the directory, an error variant will be
    /// returned describing the underlying error.
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Deletes a directory and all of its contents.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred when attempting to delete the directory, an error variant will be
    /// returned describing the underlying error.
    async fn delete_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Returns `true` if a file exists at the given path.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred when attempting to query the path, an error variant will be
    /// returned describing the underlying error.
    async fn file_exists(&self, path: &Path) -> io::Result<bool> {
        match self.file_metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
pub trait AsyncFile: AsyncRead + AsyncWrite + Send + Sync {
    /// Queries metadata about the underlying file.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred when attempting to get the metadata for the file, an error variant
    /// will be returned describing the underlying error.
    async fn metadata(&self) -> io::Result<Metadata>;

    /// Attempts to synchronize all OS-internal data, and metadata, to disk.
    ///
    /// This function will attempt to ensure that all in-memory data reaches the filesystem before
    /// returning.
    ///
    /// # Errors
    ///
    /// If an I/O error occurred when attempting to synchronize the file data and metadata to disk,
    /// an error variant will be returned describing the underlying error.
    async fn sync_all(&self) -> io::Result<()>;
}

/// A normal filesystem used for production operations.
///
/// Uses Tokio's `File` for asynchronous file reading/writing.
#[derive(Clone, Debug, Default)]
pub struct ProductionFilesystem;

#[async_trait]
impl Filesystem for ProductionFilesystem {
    type File = tokio::fs::File;

    async fn open_file_readable(&self, path: &Path) -> io::Result<Self::File> {
        OpenOptions::new().read(true).open(path).await
    }

    async fn open_file_writable(&self, path: &Path) -> io::Result<Self::File> {
        writable_file_options().truncate(true).open(path).await
    }

    async fn open_file_appendable(&self, path: &Path) -> io::Result<Self::File> {
        writable_file_options().append(true).open(path).await
    }

    async fn file_metadata(&self, path: &Path) -> io::Result<Metadata> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(Metadata {
            len: metadata.len(),
        })
    }

    async fn delete_file(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn rename_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn list_directory(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(path).await?;
        while let Some(entry) = reader.next_entry().await? {
            entries.push(entry.path());
        }
        Ok(entries)
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn delete_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_dir_all(path).await
    }
}

/// Builds a set of `OpenOptions` for opening a file as readable/writable, creating it if it does
/// not already exist.
///
/// On Unix platforms, file permissions will be set so that only the owning user of the file can
/// write to it, the owning group can read it, and the file is inaccessible otherwise.
fn writable_file_options() -> OpenOptions {
    let mut open_options = OpenOptions::new();
    open_options.read(true).write(true).create(true);

    #[cfg(unix)]
    {
        open_options.mode(FILE_MODE_OWNER_RW_GROUP_RO);
    }

    open_options
}

#[async_trait]
impl AsyncFile for tokio::fs::File {
    async fn metadata(&self) -> io::Result<Metadata> {
        let metadata = self.metadata().await?;
        Ok(Metadata {
            len: metadata.len(),
        })
    }

    async fn sync_all(&self) -> io::Result<()> {
        self.sync_all().await
    }
}
