//! Copy and link helpers that work across any two backends

use futures::stream::{self, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{FileSystem, LinkType, tmp_fname};
use crate::error::is_too_many_open_files;

/// One file to move from `from_fs:from` to `to`
#[derive(Debug, Clone)]
pub struct TransferItem {
    pub from_fs: Arc<dyn FileSystem>,
    pub from: PathBuf,
    pub to: PathBuf,
}

/// A single failed item of a batch transfer
#[derive(Debug)]
pub struct TransferFailure {
    pub from: PathBuf,
    pub to: PathBuf,
    pub error: io::Error,
}

/// Stream `from` into `to`, possibly across backends
pub async fn copy(from_fs: &dyn FileSystem, from: &Path, to_fs: &dyn FileSystem, to: &Path) -> io::Result<u64> {
    let size = from_fs.info(from).await.ok().map(|i| i.size);
    let reader = from_fs.open(from).await?;
    to_fs.put_file(reader, to, size).await
}

/// Create a link; both sides must be the same kind of backend
pub async fn link(
    kind: LinkType,
    from_fs: &dyn FileSystem,
    from: &Path,
    to_fs: &dyn FileSystem,
    to: &Path,
) -> io::Result<()> {
    if from_fs.protocol() != to_fs.protocol() {
        return Err(io::Error::from_raw_os_error(libc::EXDEV));
    }
    to_fs.link(kind, from, to).await
}

/// Errors meaning "this link type does not work here, try the next one"
pub fn is_link_unsupported(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::Unsupported {
        return true;
    }
    const CODES: [i32; 7] = [
        libc::EPERM,
        libc::ENOTSUP,
        libc::EOPNOTSUPP,
        libc::EXDEV,
        libc::ENOTTY,
        libc::ENOSYS,
        libc::EINVAL,
    ];
    err.raw_os_error().is_some_and(|code| CODES.contains(&code))
}

/// Try each link type in order, dropping the ones that turn out unsupported.
///
/// `links` is updated in place so later files skip strategies that already
/// failed. `Copy` always ends the search.
pub async fn try_links(
    links: &mut Vec<LinkType>,
    from_fs: &dyn FileSystem,
    from: &Path,
    to_fs: &dyn FileSystem,
    to: &Path,
) -> io::Result<()> {
    let mut last_error = None;
    while let Some(kind) = links.first().copied() {
        if kind == LinkType::Copy {
            return copy(from_fs, from, to_fs, to).await.map(|_| ());
        }
        match link(kind, from_fs, from, to_fs, to).await {
            Ok(()) => return Ok(()),
            Err(e) if is_link_unsupported(&e) => {
                debug!("link type {} failed for '{}': {}", kind, to.display(), e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
        links.remove(0);
    }
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        match last_error {
            Some(e) => format!("no more link types left to try out ({})", e),
            None => "no more link types left to try out".to_string(),
        },
    ))
}

/// Move a batch of files into `to_fs`.
///
/// Links are attempted one file at a time until only `Copy` remains; the rest
/// are then copied over a pool of `jobs` tasks. Existing targets are skipped.
/// Running out of file descriptors aborts the batch; every other failure is
/// returned in the list.
pub async fn transfer(
    items: &[TransferItem],
    to_fs: &Arc<dyn FileSystem>,
    links: &[LinkType],
    jobs: usize,
) -> io::Result<Vec<TransferFailure>> {
    let mut links = links.to_vec();
    if links.is_empty() {
        links.push(LinkType::Copy);
    }
    let mut failures = Vec::new();

    let mut index = 0;
    while index < items.len() && links.first() != Some(&LinkType::Copy) {
        let item = &items[index];
        index += 1;
        match try_links(&mut links, item.from_fs.as_ref(), &item.from, to_fs.as_ref(), &item.to).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("'{}' file already exists, skipping", item.to.display());
            }
            Err(e) if is_too_many_open_files(&e) => return Err(e),
            Err(e) => failures.push(TransferFailure {
                from: item.from.clone(),
                to: item.to.clone(),
                error: e,
            }),
        }
    }

    let remaining = &items[index..];
    let results: Vec<_> = stream::iter(remaining)
        .map(|item| async move {
            let result = copy(item.from_fs.as_ref(), &item.from, to_fs.as_ref(), &item.to).await;
            (item, result)
        })
        .buffer_unordered(jobs.max(1))
        .collect()
        .await;

    for (item, result) in results {
        match result {
            Ok(_) => {}
            Err(e) if is_too_many_open_files(&e) => return Err(e),
            Err(e) => failures.push(TransferFailure {
                from: item.from.clone(),
                to: item.to.clone(),
                error: e,
            }),
        }
    }
    Ok(failures)
}

async fn test_link(
    kind: LinkType,
    from_fs: &dyn FileSystem,
    from: &Path,
    to_fs: &dyn FileSystem,
    to: &Path,
) -> bool {
    let mut links = vec![kind];
    if let Err(e) = try_links(&mut links, from_fs, from, to_fs, to).await {
        debug!("link type {} is not available ({})", kind, e);
        return false;
    }
    to_fs.is_link_of(kind, to).await.unwrap_or(false)
}

/// Find out which of `links` actually work between `from_dir` and the parent
/// of `to_path`, using a throwaway 4-byte file.
pub async fn test_links(
    links: &[LinkType],
    from_fs: &dyn FileSystem,
    from_dir: &Path,
    to_fs: &dyn FileSystem,
    to_path: &Path,
) -> io::Result<Vec<LinkType>> {
    let from_file = from_dir.join(tmp_fname(""));
    let to_file = to_path
        .parent()
        .unwrap_or(to_path)
        .join(tmp_fname(""));

    from_fs.makedirs(from_dir).await?;
    from_fs
        .write_bytes(&from_file, bytes::Bytes::from_static(b"test"))
        .await?;
    if let Some(parent) = to_file.parent() {
        to_fs.makedirs(parent).await?;
    }

    let mut supported = Vec::new();
    for &kind in links {
        if test_link(kind, from_fs, &from_file, to_fs, &to_file).await {
            supported.push(kind);
        }
        if let Err(e) = to_fs.remove(&to_file).await {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("failed to remove link test file '{}': {}", to_file.display(), e);
            }
        }
    }
    from_fs.remove(&from_file).await?;
    Ok(supported)
}
