//! Filesystem abstraction consumed by the object database
//!
//! The core only talks to storage through [`FileSystem`]. Two backends ship
//! with the crate: [`LocalFileSystem`] (the reference disk backend) and
//! [`MemoryFileSystem`] (staging and serialized trees). Link operations are
//! optional: a backend that cannot link reports `ErrorKind::Unsupported`.

pub mod generic;
pub mod local;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::ignore::Ignore;

pub use local::LocalFileSystem;
pub use memory::MemoryFileSystem;

/// Boxed byte stream returned by [`FileSystem::open`]
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Protocol name of the local disk backend
pub const LOCAL_PROTOCOL: &str = "local";
/// Protocol name of the in-memory backend
pub const MEMORY_PROTOCOL: &str = "memory";

/// Kind of a filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    /// Symlink whose target does not exist
    BrokenLink,
    Other,
}

/// Stat-like information about a path
///
/// For symlinks, everything except `is_symlink` and `destination` describes
/// the link target.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
    pub inode: Option<u64>,
    /// Modification time in nanoseconds since the epoch
    pub mtime_ns: Option<i64>,
    pub nlink: u64,
    pub is_symlink: bool,
    pub destination: Option<PathBuf>,
    /// Backend-native checksum, if the backend reports one
    pub checksum: Option<String>,
    /// Backend-native md5, if the backend reports one
    pub md5: Option<String>,
    pub etag: Option<String>,
    pub version_id: Option<String>,
}

impl FileInfo {
    pub fn file(size: u64) -> Self {
        Self {
            kind: FileKind::File,
            size,
            mode: 0o100644,
            inode: None,
            mtime_ns: None,
            nlink: 1,
            is_symlink: false,
            destination: None,
            checksum: None,
            md5: None,
            etag: None,
            version_id: None,
        }
    }

    pub fn directory() -> Self {
        Self {
            kind: FileKind::Directory,
            mode: 0o040755,
            ..Self::file(0)
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, FileKind::File | FileKind::BrokenLink)
    }
}

/// Files found directly inside one directory during a walk
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub dir: PathBuf,
    pub files: Vec<(String, FileInfo)>,
}

/// Strategy used to materialize a stored object at a workspace path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Reflink,
    Hardlink,
    Symlink,
    Copy,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Reflink => "reflink",
            LinkType::Hardlink => "hardlink",
            LinkType::Symlink => "symlink",
            LinkType::Copy => "copy",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "reflink" => Ok(LinkType::Reflink),
            "hardlink" => Ok(LinkType::Hardlink),
            "symlink" => Ok(LinkType::Symlink),
            "copy" => Ok(LinkType::Copy),
            other => Err(crate::Error::NotSupported(format!("link type '{}'", other))),
        }
    }
}

/// Storage backend interface
#[async_trait]
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Short protocol name (`local`, `memory`, ...)
    fn protocol(&self) -> &'static str;

    /// Stat a path, following symlinks for everything but the link flags
    async fn info(&self, path: &Path) -> io::Result<FileInfo>;

    async fn exists(&self, path: &Path) -> bool {
        self.info(path).await.is_ok()
    }

    async fn is_file(&self, path: &Path) -> bool {
        self.info(path).await.map(|i| i.is_file()).unwrap_or(false)
    }

    async fn is_dir(&self, path: &Path) -> bool {
        self.info(path).await.map(|i| i.is_dir()).unwrap_or(false)
    }

    /// Open a file for streaming reads
    async fn open(&self, path: &Path) -> io::Result<BoxReader>;

    /// Write a stream to `path` atomically, creating parent directories.
    /// Returns the number of bytes written.
    async fn put_file(&self, reader: BoxReader, path: &Path, size: Option<u64>) -> io::Result<u64>;

    async fn read_bytes(&self, path: &Path) -> io::Result<Bytes> {
        let mut reader = self.open(path).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write_bytes(&self, path: &Path, data: Bytes) -> io::Result<()> {
        let size = data.len() as u64;
        self.put_file(Box::new(io::Cursor::new(data)), path, Some(size))
            .await
            .map(|_| ())
    }

    async fn makedirs(&self, path: &Path) -> io::Result<()>;

    /// Remove a file, symlink or whole directory tree
    async fn remove(&self, path: &Path) -> io::Result<()>;

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Direct children of a directory
    async fn ls(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Every file below `path`, recursively
    async fn find(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Files below `path` grouped by containing directory
    async fn walk(&self, path: &Path, ignore: Option<Arc<dyn Ignore>>) -> io::Result<Vec<WalkEntry>>;

    /// Create `to` as a link of kind `kind` pointing at `from`
    async fn link(&self, kind: LinkType, from: &Path, to: &Path) -> io::Result<()> {
        let _ = (from, to);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{} is not supported by {}", kind, self.protocol()),
        ))
    }

    /// Whether `path` really is a link of the given kind
    async fn is_link_of(&self, kind: LinkType, path: &Path) -> io::Result<bool> {
        let _ = (kind, path);
        Ok(true)
    }

    async fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        let _ = (path, mode);
        Ok(())
    }
}

/// Unique temporary file name, optionally derived from `name`
pub fn tmp_fname(name: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    if name.is_empty() {
        format!("{}.tmp", id)
    } else {
        format!("{}.{}.tmp", name, id)
    }
}

/// Join `key` components under `root`
pub fn join_key(root: &Path, key: &[String]) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in key {
        path.push(part);
    }
    path
}
