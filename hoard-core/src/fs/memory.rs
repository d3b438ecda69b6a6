//! In-memory backend used for staging and serialized trees

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::io::AsyncReadExt;

use super::{BoxReader, FileInfo, FileSystem, MEMORY_PROTOCOL, WalkEntry};
use crate::ignore::Ignore;

#[derive(Debug, Default)]
struct Store {
    files: BTreeMap<PathBuf, Bytes>,
    dirs: BTreeSet<PathBuf>,
}

impl Store {
    fn add_dirs(&mut self, path: &Path) {
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            if !self.dirs.insert(ancestor.to_path_buf()) {
                break;
            }
        }
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.dirs.contains(path) || self.files.keys().any(|p| p != path && p.starts_with(path))
    }
}

/// Process-local filesystem holding file contents in a map
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    store: RwLock<Store>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn FileSystem> {
        Arc::new(Self::new())
    }

    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `data` at `path` without going through a reader
    pub fn insert(&self, path: &Path, data: Bytes) {
        let mut store = self.write();
        if let Some(parent) = path.parent() {
            store.add_dirs(parent);
        }
        store.files.insert(path.to_path_buf(), data);
    }

    /// Contents of `path`, if it is a stored file
    pub fn get(&self, path: &Path) -> Option<Bytes> {
        self.read().files.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().files.is_empty()
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("'{}' does not exist", path.display()),
    )
}

fn ignored(ignore: Option<&Arc<dyn Ignore>>, root: &Path, path: &Path) -> bool {
    let Some(ignore) = ignore else {
        return false;
    };
    if ignore.is_ignored(path, false) {
        return true;
    }
    path.ancestors()
        .skip(1)
        .take_while(|a| *a != root && a.starts_with(root))
        .any(|a| ignore.is_ignored(a, true))
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    fn protocol(&self) -> &'static str {
        MEMORY_PROTOCOL
    }

    async fn info(&self, path: &Path) -> io::Result<FileInfo> {
        let store = self.read();
        if let Some(data) = store.files.get(path) {
            return Ok(FileInfo::file(data.len() as u64));
        }
        if store.is_dir(path) {
            return Ok(FileInfo::directory());
        }
        Err(not_found(path))
    }

    async fn open(&self, path: &Path) -> io::Result<BoxReader> {
        let data = self.get(path).ok_or_else(|| not_found(path))?;
        Ok(Box::new(io::Cursor::new(data)))
    }

    async fn put_file(&self, mut reader: BoxReader, path: &Path, size: Option<u64>) -> io::Result<u64> {
        let mut buf = Vec::with_capacity(size.unwrap_or(0) as usize);
        reader.read_to_end(&mut buf).await?;
        let written = buf.len() as u64;
        self.insert(path, Bytes::from(buf));
        Ok(written)
    }

    async fn write_bytes(&self, path: &Path, data: Bytes) -> io::Result<()> {
        self.insert(path, data);
        Ok(())
    }

    async fn makedirs(&self, path: &Path) -> io::Result<()> {
        self.write().add_dirs(path);
        Ok(())
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        let mut store = self.write();
        if store.files.remove(path).is_some() {
            return Ok(());
        }
        if !store.is_dir(path) {
            return Err(not_found(path));
        }
        store.files.retain(|p, _| !p.starts_with(path));
        store.dirs.retain(|p| !p.starts_with(path));
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut store = self.write();
        let data = store.files.remove(from).ok_or_else(|| not_found(from))?;
        if let Some(parent) = to.parent() {
            store.add_dirs(parent);
        }
        store.files.insert(to.to_path_buf(), data);
        Ok(())
    }

    async fn ls(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let store = self.read();
        if !store.is_dir(path) {
            return Err(not_found(path));
        }
        let children: BTreeSet<PathBuf> = store
            .files
            .keys()
            .chain(store.dirs.iter())
            .filter_map(|p| {
                let rel = p.strip_prefix(path).ok()?;
                let first = rel.components().next()?;
                Some(path.join(first))
            })
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn find(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let store = self.read();
        Ok(store
            .files
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect())
    }

    async fn walk(&self, path: &Path, ignore: Option<Arc<dyn Ignore>>) -> io::Result<Vec<WalkEntry>> {
        let store = self.read();
        if !store.is_dir(path) {
            return Err(not_found(path));
        }
        let mut groups: BTreeMap<PathBuf, Vec<(String, FileInfo)>> = BTreeMap::new();
        for (file, data) in store.files.range(path.to_path_buf()..) {
            if !file.starts_with(path) {
                break;
            }
            if ignored(ignore.as_ref(), path, file) {
                continue;
            }
            let (Some(dir), Some(name)) = (file.parent(), file.file_name()) else {
                continue;
            };
            groups
                .entry(dir.to_path_buf())
                .or_default()
                .push((name.to_string_lossy().into_owned(), FileInfo::file(data.len() as u64)));
        }
        Ok(groups
            .into_iter()
            .map(|(dir, files)| WalkEntry { dir, files })
            .collect())
    }
}
