//! Materializing objects into a workspace

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::build::{BuildOptions, build};
use crate::diff::{Change, DiffResult, diff};
use crate::error::{Error, Result};
use crate::fs::generic::{test_links, try_links};
use crate::fs::{FileSystem, LOCAL_PROTOCOL, LinkType, join_key};
use crate::ignore::Ignore;
use crate::meta::Meta;
use crate::object::Object;
use crate::odb::ObjectDb;
use crate::state::StateCache;

/// Asked before removing data that is not known to be in the cache
pub type Prompt<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

#[derive(Default)]
pub struct CheckoutOptions<'a> {
    /// Remove workspace data without asking
    pub force: bool,
    /// Re-materialize unchanged files whose link type no longer matches
    pub relink: bool,
    pub quiet: bool,
    pub ignore: Option<Arc<dyn Ignore>>,
    pub state: Option<Arc<dyn StateCache>>,
    pub prompt: Option<Prompt<'a>>,
    /// Current workspace contents; built from disk when not given
    pub old: Option<Object>,
}

/// Link strategies that passed the link test, plus directories already created.
/// Lives for one checkout batch.
#[derive(Debug)]
pub struct Linker {
    links: Vec<LinkType>,
    created_dirs: HashSet<PathBuf>,
}

impl Linker {
    /// Test which of the cache's link types work towards `to_path`
    pub async fn detect(cache: &ObjectDb, to_fs: &dyn FileSystem, to_path: &Path) -> Result<Self> {
        let links = test_links(cache.cache_types(), cache.fs().as_ref(), cache.path(), to_fs, to_path).await?;
        if links.is_empty() {
            return Err(Error::Link(to_path.to_path_buf()));
        }
        debug!("usable link types: {:?}", links);
        Ok(Self::new(links))
    }

    pub fn new(links: Vec<LinkType>) -> Self {
        Self {
            links,
            created_dirs: HashSet::new(),
        }
    }

    pub fn links(&self) -> &[LinkType] {
        &self.links
    }

    /// Materialize object `oid` of `cache` at `to`
    pub async fn link(&mut self, cache: &ObjectDb, oid: &str, to_fs: &dyn FileSystem, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            if !self.created_dirs.contains(parent) {
                to_fs.makedirs(parent).await?;
                self.created_dirs.insert(parent.to_path_buf());
            }
        }
        let obj = cache.get(oid);
        match try_links(&mut self.links, obj.fs.as_ref(), &obj.path, to_fs, to).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::Checkout(vec![to.to_path_buf()])),
            Err(e) if crate::error::is_too_many_open_files(&e) => Err(e.into()),
            Err(e) => {
                debug!("linking '{}' failed: {}", to.display(), e);
                Err(Error::Link(to.to_path_buf()))
            }
        }
    }
}

async fn remove(
    path: &Path,
    fs: &dyn FileSystem,
    in_cache: bool,
    force: bool,
    prompt: Option<Prompt<'_>>,
) -> Result<()> {
    if !force && !in_cache {
        if !fs.exists(path).await {
            return Ok(());
        }
        let msg = format!(
            "file/directory '{}' is going to be removed. Are you sure you want to proceed?",
            path.display()
        );
        if !prompt.is_some_and(|ask| ask(&msg)) {
            return Err(Error::Prompt(path.to_path_buf()));
        }
    }
    match fs.remove(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

struct Session<'a> {
    cache: &'a ObjectDb,
    fs: &'a dyn FileSystem,
    linker: Linker,
    force: bool,
    relink: bool,
    prompt: Option<Prompt<'a>>,
}

impl Session<'_> {
    async fn replace(&mut self, oid: &str, path: &Path, in_cache: bool) -> Result<()> {
        remove(path, self.fs, in_cache, self.force, self.prompt).await?;
        self.linker.link(self.cache, oid, self.fs, path).await?;
        // removing a hardlink may have reset the object's mode
        self.cache.protect(&self.cache.oid_to_path(oid)).await;
        Ok(())
    }

    async fn checkout_file(&mut self, path: &Path, change: &Change) -> Result<()> {
        let oid = change
            .new
            .oid
            .as_ref()
            .and_then(|hi| hi.value.clone())
            .ok_or_else(|| Error::NotFound(path.display().to_string()))?;

        if !change.old.is_present() {
            return self.linker.link(self.cache, &oid, self.fs, path).await;
        }
        if !self.relink {
            return self.replace(&oid, path, change.old.in_cache()).await;
        }

        let file_is_copy = match &change.old.meta {
            Some(meta) => !meta.is_link && meta.nlink == 1,
            None => self
                .fs
                .info(path)
                .await
                .map(|info| !info.is_symlink && info.nlink == 1)
                .unwrap_or(false),
        };
        let cache_is_copy = self.cache.cache_types().first() == Some(&LinkType::Copy);
        if file_is_copy && change.new.oid == change.old.oid && cache_is_copy {
            self.cache.unprotect(path).await
        } else {
            self.replace(&oid, path, change.old.in_cache()).await
        }
    }
}

fn needs_relink(cache: &ObjectDb, meta: &Meta, cache_meta: Option<&Meta>, oid: Option<&str>) -> bool {
    let is_symlink = meta.is_link;
    let is_hardlink = meta.nlink > 1;
    let is_copy = !is_symlink && !is_hardlink;

    for link_type in cache.cache_types() {
        match link_type {
            LinkType::Copy | LinkType::Reflink if is_copy => return false,
            LinkType::Hardlink if is_hardlink => {
                if let Some(cache_meta) = cache_meta {
                    return meta.inode != cache_meta.inode;
                }
            }
            LinkType::Symlink if is_symlink => {
                if let (Some(destination), Some(oid)) = (&meta.destination, oid) {
                    return *destination != cache.oid_to_path(oid);
                }
            }
            _ => {}
        }
    }
    true
}

fn determine_files_to_relink(diff: &mut DiffResult, fs: &dyn FileSystem, cache: &ObjectDb) {
    if fs.protocol() != LOCAL_PROTOCOL || cache.fs().protocol() != LOCAL_PROTOCOL {
        diff.modified.extend(diff.unchanged.iter().cloned());
        return;
    }
    let relinked: Vec<Change> = diff
        .unchanged
        .iter()
        .filter(|change| !change.new.is_dir())
        .filter(|change| match &change.old.meta {
            None => true,
            Some(meta) => needs_relink(
                cache,
                meta,
                change.new.cache_meta.as_ref(),
                change.new.oid.as_ref().and_then(|hi| hi.value.as_deref()),
            ),
        })
        .cloned()
        .collect();
    diff.modified.extend(relinked);
}

/// Difference between what is at `path` and `obj`, with unchanged entries
/// that still need work moved into `modified`
pub async fn checkout_diff(
    path: &Path,
    fs: &Arc<dyn FileSystem>,
    obj: Option<&Object>,
    cache: &ObjectDb,
    options: &CheckoutOptions<'_>,
) -> Result<DiffResult> {
    let old = match &options.old {
        Some(old) => Some(old.clone()),
        None => {
            let name = obj
                .and_then(Object::hash_info)
                .map(|hi| hi.name.clone())
                .unwrap_or_else(|| cache.hash_name().to_string());
            let build_options = BuildOptions {
                dry_run: true,
                ignore: options.ignore.clone(),
                ..Default::default()
            };
            match build(cache, path, fs.clone(), &name, &build_options).await {
                Ok(built) => Some(built.object),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            }
        }
    };

    let mut result = diff(old.as_ref(), obj, cache).await?;
    if options.relink {
        determine_files_to_relink(&mut result, fs.as_ref(), cache);
    } else {
        let missing: Vec<Change> = result
            .unchanged
            .iter()
            .filter(|change| !change.new.in_cache() && !change.new.is_dir())
            .cloned()
            .collect();
        result.modified.extend(missing);
    }
    Ok(result)
}

async fn apply(
    result: &DiffResult,
    path: &Path,
    fs: &dyn FileSystem,
    cache: &ObjectDb,
    options: &CheckoutOptions<'_>,
) -> Result<()> {
    if !result.has_changes() {
        return Ok(());
    }
    let linker = Linker::detect(cache, fs, path).await?;
    let mut session = Session {
        cache,
        fs,
        linker,
        force: options.force,
        relink: options.relink,
        prompt: options.prompt,
    };

    let mut failed = Vec::new();
    for change in &result.deleted {
        let entry_path = join_key(path, &change.old.key);
        match remove(&entry_path, fs, change.old.in_cache(), options.force, options.prompt).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                debug!("failed to remove '{}': {}", entry_path.display(), e);
                failed.push(entry_path);
            }
        }
    }

    // parents before children, a parent may swap a file for a directory
    let mut changes: Vec<&Change> = result.added.iter().chain(&result.modified).collect();
    changes.sort_by(|a, b| a.new.key.cmp(&b.new.key));

    let mut to_save = Vec::new();
    for change in changes {
        let entry_path = join_key(path, &change.new.key);
        if change.new.is_dir() {
            if change.old.is_present() && !change.old.is_dir() {
                if let Err(e) = remove(&entry_path, fs, change.old.in_cache(), options.force, options.prompt).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    debug!("failed to remove '{}': {}", entry_path.display(), e);
                    failed.push(entry_path);
                    continue;
                }
            }
            fs.makedirs(&entry_path).await?;
            continue;
        }
        match session.checkout_file(&entry_path, change).await {
            Ok(()) => {}
            Err(Error::Checkout(paths)) => {
                failed.extend(paths);
                continue;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                debug!("failed to check out '{}': {}", entry_path.display(), e);
                failed.push(entry_path);
                continue;
            }
        }

        if change.new.meta.as_ref().is_some_and(|meta| meta.isexec) && fs.protocol() == cache.fs().protocol() {
            cache.set_exec(&entry_path).await;
        }
        if fs.protocol() == LOCAL_PROTOCOL {
            if let (Ok(info), Some(hi)) = (fs.info(&entry_path).await, change.new.oid.clone()) {
                to_save.push((entry_path, hi, info));
            }
        }
    }

    if let Some(state) = &options.state {
        state.save_many(&to_save, fs)?;
    }
    if !failed.is_empty() {
        return Err(Error::Checkout(failed));
    }
    Ok(())
}

/// Make `path` on `fs` match `obj`, reading objects from `cache`.
///
/// Returns `true` if anything was changed (and this was not a relink).
/// Files that could not be materialized are reported together in
/// `Error::Checkout`; everything else is still checked out.
pub async fn checkout(
    path: &Path,
    fs: Arc<dyn FileSystem>,
    obj: Option<&Object>,
    cache: &ObjectDb,
    options: CheckoutOptions<'_>,
) -> Result<bool> {
    let result = checkout_diff(path, &fs, obj, cache, &options).await?;

    let mut failed = Vec::new();
    if obj.is_none() {
        if !options.quiet {
            warn!("No file hash info found for '{}'. It won't be created.", path.display());
        }
        failed.push(path.to_path_buf());
    }

    match apply(&result, path, fs.as_ref(), cache, &options).await {
        Ok(()) => {}
        Err(Error::Checkout(paths)) => failed.extend(paths),
        Err(e) => return Err(e),
    }

    if result.has_changes() || options.relink {
        if let Some(state) = &options.state {
            state.save_link(path, fs.as_ref())?;
        }
    }

    if !failed.is_empty() {
        return Err(Error::Checkout(failed));
    }
    Ok(result.has_changes() && !options.relink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileSystem;
    use crate::hash_info::HashInfo;
    use crate::odb::OdbOptions;
    use crate::tree::{Tree, relpath_to_key};
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn cached_tree(cache: &ObjectDb, files: &[(&str, &[u8])]) -> Object {
        let mut tree = Tree::new();
        for (path, data) in files {
            let oid = crate::hash::hash_bytes(data, crate::hash::Algorithm::Md5);
            cache.add_bytes(&oid, Bytes::copy_from_slice(data)).await.unwrap();
            tree.add(relpath_to_key(path), Some(Meta::with_size(data.len() as u64)), Some(HashInfo::new("md5", oid)));
        }
        tree.digest(false).unwrap();
        Object::Tree(tree)
    }

    #[tokio::test]
    async fn test_checkout_twice_is_noop() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectDb::local(tmp.path().join("cache"), OdbOptions::default());
        let obj = cached_tree(&cache, &[("a.txt", b"hello"), ("sub/b.txt", b"world")]).await;
        let ws = tmp.path().join("ws");
        let fs = LocalFileSystem::shared();

        let changed = checkout(&ws, fs.clone(), Some(&obj), &cache, CheckoutOptions::default()).await.unwrap();
        assert!(changed);
        assert_eq!(std::fs::read(ws.join("sub/b.txt")).unwrap(), b"world");

        let changed = checkout(&ws, fs, Some(&obj), &cache, CheckoutOptions::default()).await.unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn test_removal_requires_confirmation() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectDb::local(tmp.path().join("cache"), OdbOptions::default());
        let obj = cached_tree(&cache, &[("a.txt", b"hello")]).await;
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("a.txt"), b"hello").unwrap();
        std::fs::write(ws.join("mine.txt"), b"only copy").unwrap();
        let fs = LocalFileSystem::shared();

        let err = checkout(&ws, fs.clone(), Some(&obj), &cache, CheckoutOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(&err, Error::Checkout(paths) if paths == &vec![ws.join("mine.txt")]));
        assert!(ws.join("mine.txt").exists());

        let deny = |_: &str| false;
        let options = CheckoutOptions {
            prompt: Some(&deny),
            ..Default::default()
        };
        assert!(checkout(&ws, fs.clone(), Some(&obj), &cache, options).await.is_err());

        let options = CheckoutOptions {
            force: true,
            ..Default::default()
        };
        checkout(&ws, fs, Some(&obj), &cache, options).await.unwrap();
        assert!(!ws.join("mine.txt").exists());
    }

    #[tokio::test]
    async fn test_declined_removal_still_checks_out_the_rest() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectDb::local(tmp.path().join("cache"), OdbOptions::default());
        let obj = cached_tree(&cache, &[("a.txt", b"hello"), ("sub/b.txt", b"world")]).await;
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("mine.txt"), b"only copy").unwrap();

        let deny = |_: &str| false;
        let options = CheckoutOptions {
            prompt: Some(&deny),
            ..Default::default()
        };
        let err = checkout(&ws, LocalFileSystem::shared(), Some(&obj), &cache, options)
            .await
            .unwrap_err();
        match err {
            Error::Checkout(paths) => assert_eq!(paths, vec![ws.join("mine.txt")]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read(ws.join("mine.txt")).unwrap(), b"only copy");
        assert_eq!(std::fs::read(ws.join("a.txt")).unwrap(), b"hello");
        assert_eq!(std::fs::read(ws.join("sub/b.txt")).unwrap(), b"world");
    }

    async fn cached_blob(cache: &ObjectDb, data: &'static [u8]) -> Object {
        use crate::fs::MemoryFileSystem;
        use crate::object::HashFile;

        let oid = crate::hash::hash_bytes(data, crate::hash::Algorithm::Md5);
        cache.add_bytes(&oid, Bytes::from_static(data)).await.unwrap();
        Object::Blob(HashFile::new("/blob", MemoryFileSystem::shared(), HashInfo::new("md5", oid)))
    }

    #[tokio::test]
    async fn test_file_replaces_directory() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectDb::local(tmp.path().join("cache"), OdbOptions::default());
        let obj = cached_blob(&cache, b"hello").await;
        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("x"), b"stale").unwrap();

        let options = CheckoutOptions {
            force: true,
            ..Default::default()
        };
        let changed = checkout(&out, LocalFileSystem::shared(), Some(&obj), &cache, options)
            .await
            .unwrap();
        assert!(changed);
        assert!(out.is_file());
        assert_eq!(std::fs::read(&out).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_directory_replaces_file() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectDb::local(tmp.path().join("cache"), OdbOptions::default());
        let obj = cached_tree(&cache, &[("a.txt", b"hello"), ("sub/b.txt", b"world")]).await;
        let out = tmp.path().join("out");
        std::fs::write(&out, b"stale").unwrap();

        let options = CheckoutOptions {
            force: true,
            ..Default::default()
        };
        checkout(&out, LocalFileSystem::shared(), Some(&obj), &cache, options)
            .await
            .unwrap();
        assert!(out.is_dir());
        assert_eq!(std::fs::read(out.join("a.txt")).unwrap(), b"hello");
        assert_eq!(std::fs::read(out.join("sub/b.txt")).unwrap(), b"world");
    }

    #[tokio::test]
    async fn test_missing_objects_are_aggregated() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectDb::local(tmp.path().join("cache"), OdbOptions::default());
        let mut tree = Tree::new();
        tree.add(relpath_to_key("gone1"), None, Some(HashInfo::new("md5", "00000000000000000000000000000001")));
        tree.add(relpath_to_key("gone2"), None, Some(HashInfo::new("md5", "00000000000000000000000000000002")));
        let hello = crate::hash::hash_bytes(b"hello", crate::hash::Algorithm::Md5);
        cache.add_bytes(&hello, Bytes::from_static(b"hello")).await.unwrap();
        tree.add(relpath_to_key("ok"), None, Some(HashInfo::new("md5", hello)));
        tree.digest(false).unwrap();
        let ws = tmp.path().join("ws");

        let err = checkout(&ws, LocalFileSystem::shared(), Some(&Object::Tree(tree)), &cache, CheckoutOptions::default())
            .await
            .unwrap_err();
        match err {
            Error::Checkout(paths) => assert_eq!(paths.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read(ws.join("ok")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_no_object_fails() {
        let tmp = TempDir::new().unwrap();
        let cache = ObjectDb::local(tmp.path().join("cache"), OdbOptions::default());
        let options = CheckoutOptions {
            quiet: true,
            ..Default::default()
        };
        let err = checkout(&tmp.path().join("ws"), LocalFileSystem::shared(), None, &cache, options)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Checkout(paths) if paths.len() == 1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_relink_switches_to_hardlink() {
        use std::os::unix::fs::MetadataExt;

        let tmp = TempDir::new().unwrap();
        let copy_cache = ObjectDb::local(tmp.path().join("cache"), OdbOptions::default());
        let obj = cached_tree(&copy_cache, &[("a.txt", b"hello")]).await;
        let ws = tmp.path().join("ws");
        let fs = LocalFileSystem::shared();
        checkout(&ws, fs.clone(), Some(&obj), &copy_cache, CheckoutOptions::default()).await.unwrap();
        assert_eq!(std::fs::metadata(ws.join("a.txt")).unwrap().nlink(), 1);

        let hardlink_cache = ObjectDb::local(
            tmp.path().join("cache"),
            OdbOptions {
                cache_types: vec![LinkType::Hardlink],
                ..OdbOptions::default()
            },
        );
        let options = CheckoutOptions {
            relink: true,
            ..Default::default()
        };
        let changed = checkout(&ws, fs, Some(&obj), &hardlink_cache, options).await.unwrap();
        assert!(!changed);
        assert_eq!(std::fs::metadata(ws.join("a.txt")).unwrap().nlink(), 2);
    }

    #[test]
    fn test_needs_relink() {
        let cache = ObjectDb::local(
            "/cache",
            OdbOptions {
                cache_types: vec![LinkType::Hardlink, LinkType::Copy],
                ..OdbOptions::default()
            },
        );
        let mut meta = Meta::with_size(1);
        meta.inode = Some(7);
        // a plain copy satisfies the copy fallback
        assert!(!needs_relink(&cache, &meta, None, Some("ab")));

        meta.nlink = 2;
        let mut cache_meta = Meta::with_size(1);
        cache_meta.inode = Some(7);
        assert!(!needs_relink(&cache, &meta, Some(&cache_meta), Some("ab")));
        cache_meta.inode = Some(8);
        assert!(needs_relink(&cache, &meta, Some(&cache_meta), Some("ab")));
    }
}
