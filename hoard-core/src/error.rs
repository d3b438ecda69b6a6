//! Error taxonomy for hoard
//!
//! Every fallible operation in the crate returns [`Result`]. Per-object
//! failures inside batch operations (checkout, transfer) are collected and
//! surfaced as one aggregate value instead of aborting the batch.

use std::io;
use std::path::PathBuf;

/// Result type for hoard operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, diffing, checking out or transferring
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Object format error: {0}")]
    ObjectFormat(String),

    #[error("Cannot modify read-only object database: {0}")]
    ReadOnly(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("No possible cache link types for '{}'", .0.display())]
    Link(PathBuf),

    #[error("Unable to remove '{}' without a confirmation", .0.display())]
    Prompt(PathBuf),

    #[error("Checkout failed for {} path(s)", .0.len())]
    Checkout(Vec<PathBuf>),

    #[error("{ignore_file} file should not be in collected dir path: '{}'", .dir.display())]
    IgnoreInCollectedDir { ignore_file: String, dir: PathBuf },

    #[error("Unable to auto-merge directories: {0}")]
    Merge(String),

    #[error("Too many open files")]
    TooManyOpenFiles(#[source] io::Error),

    #[error("Object database error: {0}")]
    ObjectDb(String),

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid ignore pattern: {0}")]
    Glob(#[from] globset::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if is_too_many_open_files(&err) {
            Error::TooManyOpenFiles(err)
        } else {
            Error::Io(err)
        }
    }
}

impl Error {
    /// Wrap an I/O error that concerns `path`, turning ENOENT into `NotFound`
    pub fn from_io(err: io::Error, path: &std::path::Path) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Error::NotFound(path.display().to_string())
        } else {
            err.into()
        }
    }

    /// Whether this error must abort the whole batch it occurred in
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::TooManyOpenFiles(_))
    }

    /// Whether the underlying cause is a missing file or object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// EMFILE: the process ran out of file descriptors
pub fn is_too_many_open_files(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EMFILE)
}
