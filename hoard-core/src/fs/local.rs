//! Local disk backend

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use super::{BoxReader, FileInfo, FileKind, FileSystem, LOCAL_PROTOCOL, LinkType, WalkEntry, tmp_fname};
use crate::ignore::Ignore;

/// Process umask, read once
pub fn umask() -> u32 {
    static UMASK: OnceLock<u32> = OnceLock::new();
    *UMASK.get_or_init(|| {
        #[cfg(unix)]
        {
            // SAFETY: umask(2) cannot fail; the original mask is restored immediately.
            let mask = unsafe { libc::umask(0) };
            unsafe { libc::umask(mask) };
            mask as u32
        }
        #[cfg(not(unix))]
        {
            0o022
        }
    })
}

/// Local filesystem
#[derive(Debug, Default, Clone)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }

    /// Shared handle, the usual way callers hold a backend
    pub fn shared() -> Arc<dyn FileSystem> {
        Arc::new(Self)
    }
}

fn file_info(meta: &std::fs::Metadata, is_symlink: bool, destination: Option<PathBuf>) -> FileInfo {
    let kind = if meta.is_dir() {
        FileKind::Directory
    } else if meta.is_file() {
        FileKind::File
    } else {
        FileKind::Other
    };

    #[cfg(unix)]
    let (mode, inode, mtime_ns, nlink) = {
        use std::os::unix::fs::MetadataExt;
        (
            meta.mode(),
            Some(meta.ino()),
            Some(meta.mtime() * 1_000_000_000 + meta.mtime_nsec()),
            meta.nlink(),
        )
    };

    #[cfg(not(unix))]
    let (mode, inode, mtime_ns, nlink) = {
        let mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64);
        (mode, None, mtime_ns, 1)
    };

    FileInfo {
        kind,
        size: meta.len(),
        mode,
        inode,
        mtime_ns,
        nlink,
        is_symlink,
        destination,
        checksum: None,
        md5: None,
        etag: None,
        version_id: None,
    }
}

fn broken_link_info(path: &Path) -> io::Result<FileInfo> {
    let lmeta = std::fs::symlink_metadata(path)?;
    let mut info = file_info(&lmeta, true, std::fs::read_link(path).ok());
    info.kind = FileKind::BrokenLink;
    info.size = 0;
    Ok(info)
}

fn stat(path: &Path) -> io::Result<FileInfo> {
    let lmeta = std::fs::symlink_metadata(path)?;
    if !lmeta.file_type().is_symlink() {
        return Ok(file_info(&lmeta, false, None));
    }
    let meta = std::fs::metadata(path)?;
    Ok(file_info(&meta, true, std::fs::read_link(path).ok()))
}

fn walk_blocking(root: &Path, ignore: Option<Arc<dyn Ignore>>) -> io::Result<Vec<WalkEntry>> {
    let mut groups: BTreeMap<PathBuf, Vec<(String, FileInfo)>> = BTreeMap::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !ignore
                    .as_ref()
                    .is_some_and(|ig| ig.is_ignored(e.path(), e.file_type().is_dir()))
        });

    for entry in walker {
        let entry = entry?;
        if entry.depth() == 0 || entry.file_type().is_dir() {
            continue;
        }
        let info = if entry.file_type().is_symlink() {
            match std::fs::metadata(entry.path()) {
                Ok(meta) if meta.is_dir() => {
                    tracing::debug!("skipping symlinked directory '{}'", entry.path().display());
                    continue;
                }
                Ok(meta) => file_info(&meta, true, std::fs::read_link(entry.path()).ok()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!("broken symlink '{}'", entry.path().display());
                    broken_link_info(entry.path())?
                }
                Err(e) => return Err(e),
            }
        } else {
            let meta = entry.metadata().map_err(io::Error::from)?;
            file_info(&meta, false, None)
        };
        let dir = entry.path().parent().map(Path::to_path_buf).unwrap_or_default();
        groups
            .entry(dir)
            .or_default()
            .push((entry.file_name().to_string_lossy().into_owned(), info));
    }

    Ok(groups
        .into_iter()
        .map(|(dir, files)| WalkEntry { dir, files })
        .collect())
}

fn find_blocking(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

#[cfg(target_os = "linux")]
fn reflink(src: &Path, dst: &Path) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    const FICLONE: libc::c_ulong = 0x40049409;

    let src_file = std::fs::File::open(src)?;
    let dst_file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)?;
    // SAFETY: both descriptors are valid for the duration of the call.
    let ret = unsafe { libc::ioctl(dst_file.as_raw_fd(), FICLONE as _, src_file.as_raw_fd()) };
    if ret == -1 {
        let err = io::Error::last_os_error();
        drop(dst_file);
        let _ = std::fs::remove_file(dst);
        return Err(err);
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn reflink(src: &Path, dst: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let src = CString::new(src.as_os_str().as_bytes())?;
    let dst = CString::new(dst.as_os_str().as_bytes())?;
    // SAFETY: both pointers are valid NUL-terminated strings.
    let ret = unsafe { libc::clonefile(src.as_ptr(), dst.as_ptr(), 0) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn reflink(_src: &Path, _dst: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "reflink is not supported"))
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }
    #[cfg(not(unix))]
    {
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_readonly(mode & 0o200 == 0);
        std::fs::set_permissions(path, perms)
    }
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    fn protocol(&self) -> &'static str {
        LOCAL_PROTOCOL
    }

    async fn info(&self, path: &Path) -> io::Result<FileInfo> {
        let path = path.to_path_buf();
        blocking(move || stat(&path)).await
    }

    async fn open(&self, path: &Path) -> io::Result<BoxReader> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn put_file(&self, mut reader: BoxReader, path: &Path, _size: Option<u64>) -> io::Result<u64> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(tmp_fname(&name));

        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            drop(file);
            tokio::fs::rename(&tmp, path).await?;
            Ok(written)
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    async fn makedirs(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        let meta = tokio::fs::symlink_metadata(path).await?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn ls(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            out.push(entry.path());
        }
        out.sort();
        Ok(out)
    }

    async fn find(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let path = path.to_path_buf();
        blocking(move || find_blocking(&path)).await
    }

    async fn walk(&self, path: &Path, ignore: Option<Arc<dyn Ignore>>) -> io::Result<Vec<WalkEntry>> {
        let path = path.to_path_buf();
        blocking(move || walk_blocking(&path, ignore)).await
    }

    async fn link(&self, kind: LinkType, from: &Path, to: &Path) -> io::Result<()> {
        let from = from.to_path_buf();
        let to = to.to_path_buf();
        match kind {
            LinkType::Hardlink => {
                let meta = tokio::fs::symlink_metadata(&from).await?;
                let src = if meta.file_type().is_symlink() {
                    tokio::fs::canonicalize(&from).await?
                } else {
                    from
                };
                tokio::fs::hard_link(src, to).await
            }
            #[cfg(unix)]
            LinkType::Symlink => tokio::fs::symlink(from, to).await,
            LinkType::Reflink => {
                blocking(move || {
                    reflink(&from, &to)?;
                    // reflink may or may not clone the source permissions
                    set_mode(&to, 0o666 & !umask())
                })
                .await
            }
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} is not a link operation", other),
            )),
        }
    }

    async fn is_link_of(&self, kind: LinkType, path: &Path) -> io::Result<bool> {
        match kind {
            LinkType::Hardlink => Ok(self.info(path).await?.nlink > 1),
            LinkType::Symlink => Ok(tokio::fs::symlink_metadata(path)
                .await?
                .file_type()
                .is_symlink()),
            LinkType::Reflink | LinkType::Copy => Ok(true),
        }
    }

    async fn chmod(&self, path: &Path, mode: u32) -> io::Result<()> {
        let path = path.to_path_buf();
        blocking(move || set_mode(&path, mode)).await
    }
}
