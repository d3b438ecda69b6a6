//! Content-addressed object database
//!
//! Objects live at `<root>/<oid[..2]>/<oid[2..]>`. A database either owns
//! its bytes on a backing filesystem, or, in reference mode, only remembers
//! where each object can be read from (used to stage a build before anything
//! is copied).

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fs::generic::{self, TransferItem};
use crate::fs::{FileSystem, LOCAL_PROTOCOL, LinkType, LocalFileSystem, MemoryFileSystem, local::umask};
use crate::hash::{DEFAULT_ALGORITHM, hash_file};
use crate::hash_info::HashInfo;
use crate::meta::Meta;
use crate::object::HashFile;
use crate::state::{StateCache, StateNoop};
use crate::tree::Tree;

/// Mode of a protected object
pub const CACHE_MODE: u32 = 0o444;

/// Construction options for an [`ObjectDb`]
#[derive(Debug, Clone)]
pub struct OdbOptions {
    pub read_only: bool,
    pub verify: bool,
    pub shared: bool,
    pub hash_name: String,
    pub cache_types: Vec<LinkType>,
    pub jobs: usize,
    pub state: Arc<dyn StateCache>,
}

impl Default for OdbOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            verify: false,
            shared: false,
            hash_name: DEFAULT_ALGORITHM.to_string(),
            cache_types: vec![LinkType::Reflink, LinkType::Copy],
            jobs: 4 * crate::config::cpu_count(),
            state: Arc::new(StateNoop),
        }
    }
}

/// Per-call options for [`ObjectDb::add`]
#[derive(Debug, Clone, Copy)]
pub struct AddOptions {
    /// Allow hardlinks into the database
    pub hardlink: bool,
    /// Skip objects that are already present
    pub check_exists: bool,
    /// Re-hash after adding; `None` uses the database default
    pub verify: Option<bool>,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            hardlink: false,
            check_exists: true,
            verify: None,
        }
    }
}

/// One object to add: read `path` on `fs`, store under `oid`
#[derive(Debug, Clone)]
pub struct AddRequest {
    pub fs: Arc<dyn FileSystem>,
    pub path: PathBuf,
    pub oid: String,
}

impl AddRequest {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>, oid: impl Into<String>) -> Self {
        Self {
            fs,
            path: path.into(),
            oid: oid.into(),
        }
    }
}

/// Result of a batch add
#[derive(Debug, Default)]
pub struct AddOutcome {
    pub transferred: usize,
    pub failed: Vec<(String, io::Error)>,
}

/// Content-addressed store over a [`FileSystem`]
#[derive(Debug)]
pub struct ObjectDb {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    read_only: bool,
    verify: bool,
    hash_name: String,
    cache_types: Vec<LinkType>,
    jobs: usize,
    state: Arc<dyn StateCache>,
    file_mode: u32,
    dir_mode: u32,
    shared: bool,
    /// Shard directories known to exist
    dirs: Mutex<Option<HashSet<String>>>,
    /// Reference mode: oid -> where to read it
    references: Option<RwLock<HashMap<String, HashFile>>>,
}

impl ObjectDb {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>, options: OdbOptions) -> Self {
        let (file_mode, dir_mode) = if options.shared {
            (0o664, 0o2775)
        } else {
            (0o666 & !umask(), 0o777 & !umask())
        };
        Self {
            fs,
            path: path.into(),
            read_only: options.read_only,
            verify: options.verify,
            hash_name: options.hash_name,
            cache_types: options.cache_types,
            jobs: options.jobs.max(1),
            state: options.state,
            file_mode,
            dir_mode,
            shared: options.shared,
            dirs: Mutex::new(None),
            references: None,
        }
    }

    /// Database on local disk
    pub fn local(path: impl Into<PathBuf>, options: OdbOptions) -> Self {
        Self::new(LocalFileSystem::shared(), path, options)
    }

    /// Reference database kept in memory; file objects are recorded by
    /// location, serialized trees are stored in the memory filesystem.
    pub fn reference(path: impl Into<PathBuf>, hash_name: &str, state: Arc<dyn StateCache>) -> Self {
        let options = OdbOptions {
            hash_name: hash_name.to_string(),
            state,
            cache_types: vec![LinkType::Copy],
            ..OdbOptions::default()
        };
        Self {
            references: Some(RwLock::new(HashMap::new())),
            ..Self::new(MemoryFileSystem::shared(), path, options)
        }
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash_name(&self) -> &str {
        &self.hash_name
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn cache_types(&self) -> &[LinkType] {
        &self.cache_types
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    pub fn state(&self) -> &Arc<dyn StateCache> {
        &self.state
    }

    pub fn is_reference(&self) -> bool {
        self.references.is_some()
    }

    fn is_local(&self) -> bool {
        self.fs.protocol() == LOCAL_PROTOCOL
    }

    fn ensure_writable(&self, what: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly(format!("cannot {} '{}'", what, self.path.display())));
        }
        Ok(())
    }

    fn reference_get(&self, oid: &str) -> Option<HashFile> {
        let refs = self.references.as_ref()?;
        refs.read().unwrap_or_else(|e| e.into_inner()).get(oid).cloned()
    }

    fn oid_parts(oid: &str) -> (&str, &str) {
        let split = oid.char_indices().nth(2).map(|(i, _)| i).unwrap_or(oid.len());
        oid.split_at(split)
    }

    pub fn oid_to_path(&self, oid: &str) -> PathBuf {
        let (prefix, rest) = Self::oid_parts(oid);
        self.path.join(prefix).join(rest)
    }

    /// Inverse of [`ObjectDb::oid_to_path`]
    pub fn path_to_oid(&self, path: &Path) -> Result<String> {
        let bad = || Error::ObjectDb(format!("bad cache file path '{}'", path.display()));
        let rel = path.strip_prefix(&self.path).map_err(|_| bad())?;
        let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
        match parts.as_slice() {
            [prefix, rest] if prefix.chars().count() == 2 && !rest.is_empty() => {
                Ok(format!("{}{}", prefix, rest))
            }
            _ => Err(bad()),
        }
    }

    /// Handle to `oid`; existence is not checked
    pub fn get(&self, oid: &str) -> HashFile {
        if let Some(file) = self.reference_get(oid) {
            return file;
        }
        HashFile::new(
            self.oid_to_path(oid),
            self.fs.clone(),
            HashInfo::new(self.hash_name.clone(), oid),
        )
    }

    pub async fn exists(&self, oid: &str) -> bool {
        if let Some(refs) = &self.references {
            return refs.read().unwrap_or_else(|e| e.into_inner()).contains_key(oid);
        }
        self.fs.is_file(&self.oid_to_path(oid)).await
    }

    /// Resolve an abbreviated oid to the single stored oid it prefixes
    pub async fn exists_prefix(&self, short_oid: &str) -> Result<String> {
        if short_oid.chars().count() <= 2 {
            return Err(Error::ObjectDb(format!("oid prefix '{}' is too short", short_oid)));
        }
        if self.exists(short_oid).await {
            return Ok(short_oid.to_string());
        }
        let (prefix, _) = Self::oid_parts(short_oid);
        let mut matches: Vec<String> = self
            .list_oids(Some(prefix))
            .await?
            .into_iter()
            .filter(|oid| oid.starts_with(short_oid))
            .collect();
        match matches.len() {
            0 => Err(Error::NotFound(short_oid.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(Error::ObjectDb(format!(
                "ambiguous oid prefix '{}': {}",
                short_oid,
                matches.join(", ")
            ))),
        }
    }

    async fn init_dir(&self, prefix: &str) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let known = self
            .dirs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|dirs| dirs.contains(prefix));
        match known {
            Some(true) => return Ok(()),
            Some(false) => {}
            None => {
                let listed: HashSet<String> = match self.fs.ls(&self.path).await {
                    Ok(paths) => paths
                        .iter()
                        .filter_map(|p| p.file_name())
                        .map(|n| n.to_string_lossy().into_owned())
                        .collect(),
                    Err(_) => HashSet::new(),
                };
                let present = listed.contains(prefix);
                let mut dirs = self.dirs.lock().unwrap_or_else(|e| e.into_inner());
                dirs.get_or_insert_with(HashSet::new).extend(listed);
                if present {
                    return Ok(());
                }
            }
        }

        self.makedirs(&self.path.join(prefix)).await?;
        self.dirs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert_with(HashSet::new)
            .insert(prefix.to_string());
        Ok(())
    }

    async fn makedirs(&self, path: &Path) -> Result<()> {
        self.fs.makedirs(path).await?;
        if self.shared {
            self.fs.chmod(path, self.dir_mode).await?;
        }
        Ok(())
    }

    /// Store `data` under `oid`
    pub async fn add_bytes(&self, oid: &str, data: Bytes) -> Result<()> {
        self.ensure_writable("add to")?;
        let (prefix, _) = Self::oid_parts(oid);
        self.init_dir(prefix).await?;
        let path = self.oid_to_path(oid);
        self.fs.write_bytes(&path, data).await?;
        if let Some(refs) = &self.references {
            let file = HashFile::new(path, self.fs.clone(), HashInfo::new(self.hash_name.clone(), oid));
            refs.write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(oid.to_string(), file);
        }
        Ok(())
    }

    /// Add one object, failing if it could not be stored
    pub async fn add_file(&self, fs: Arc<dyn FileSystem>, path: &Path, oid: &str, options: AddOptions) -> Result<usize> {
        let outcome = self.add(vec![AddRequest::new(fs, path, oid)], options).await?;
        match outcome.failed.into_iter().next() {
            Some((_, e)) => Err(Error::from_io(e, path)),
            None => Ok(outcome.transferred),
        }
    }

    /// Add a batch of objects.
    ///
    /// Per-object failures are returned in the outcome; running out of file
    /// descriptors fails the whole call.
    pub async fn add(&self, requests: Vec<AddRequest>, options: AddOptions) -> Result<AddOutcome> {
        self.ensure_writable("add to")?;

        if let Some(refs) = &self.references {
            let mut refs = refs.write().unwrap_or_else(|e| e.into_inner());
            for req in &requests {
                let file = HashFile::new(
                    req.path.clone(),
                    req.fs.clone(),
                    HashInfo::new(self.hash_name.clone(), req.oid.clone()),
                );
                refs.insert(req.oid.clone(), file);
            }
            return Ok(AddOutcome {
                transferred: requests.len(),
                failed: Vec::new(),
            });
        }

        let verify = options.verify.unwrap_or(self.verify);
        if verify {
            for req in &requests {
                // drops a corrupt copy so it gets replaced below
                match self.check(&req.oid, true).await {
                    Err(e) if e.is_fatal() => return Err(e),
                    _ => {}
                }
            }
        }

        let mut to_add = Vec::with_capacity(requests.len());
        for req in &requests {
            if options.check_exists && self.exists(&req.oid).await {
                continue;
            }
            to_add.push(req);
        }

        let mut outcome = AddOutcome::default();
        if !to_add.is_empty() {
            let prefixes: HashSet<&str> = to_add.iter().map(|r| Self::oid_parts(&r.oid).0).collect();
            for prefix in prefixes {
                self.init_dir(prefix).await?;
            }

            let items: Vec<TransferItem> = to_add
                .iter()
                .map(|r| TransferItem {
                    from_fs: r.fs.clone(),
                    from: r.path.clone(),
                    to: self.oid_to_path(&r.oid),
                })
                .collect();
            let links = if options.hardlink {
                vec![LinkType::Reflink, LinkType::Hardlink, LinkType::Copy]
            } else {
                vec![LinkType::Reflink, LinkType::Copy]
            };
            let failures = generic::transfer(&items, &self.fs, &links, self.jobs).await?;
            for failure in failures {
                let oid = self
                    .path_to_oid(&failure.to)
                    .unwrap_or_else(|_| failure.to.display().to_string());
                debug!("failed to add '{}' as {}: {}", failure.from.display(), oid, failure.error);
                outcome.failed.push((oid, failure.error));
            }
            outcome.transferred = to_add.len() - outcome.failed.len();
        }

        let failed: HashSet<String> = outcome.failed.iter().map(|(oid, _)| oid.clone()).collect();
        let copied: HashSet<&str> = to_add.iter().map(|r| r.oid.as_str()).collect();
        let mut saved = Vec::new();
        for req in &requests {
            if failed.contains(&req.oid) {
                continue;
            }
            let path = self.oid_to_path(&req.oid);
            if verify {
                if let Err(e) = self.check(&req.oid, true).await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    debug!("verification of {} failed: {}", req.oid, e);
                    if copied.contains(req.oid.as_str()) {
                        outcome.transferred -= 1;
                    }
                    outcome
                        .failed
                        .push((req.oid.clone(), io::Error::new(io::ErrorKind::InvalidData, e.to_string())));
                    continue;
                }
            }
            self.protect(&path).await;
            if let Ok(info) = self.fs.info(&path).await {
                saved.push((path, HashInfo::new(self.hash_name.clone(), req.oid.clone()), info));
            }
        }
        self.state.save_many(&saved, self.fs.as_ref())?;
        Ok(outcome)
    }

    /// Verify a stored object and return its metadata.
    ///
    /// With `check_hash` the bytes are re-hashed (unless the object is already
    /// protected); a mismatch deletes the object and fails with
    /// `ObjectFormat`.
    pub async fn check(&self, oid: &str, check_hash: bool) -> Result<Meta> {
        if let Some(refs) = &self.references {
            return match refs.read().unwrap_or_else(|e| e.into_inner()).contains_key(oid) {
                true => Ok(Meta::default()),
                false => Err(Error::NotFound(oid.to_string())),
            };
        }

        let obj = self.get(oid);
        let info = obj
            .fs
            .info(&obj.path)
            .await
            .map_err(|e| Error::from_io(e, &obj.path))?;
        if !info.is_file() {
            return Err(Error::NotFound(obj.path.display().to_string()));
        }
        if self.is_local() && info.mode & 0o777 == CACHE_MODE {
            return Ok(Meta::from_info(&info));
        }
        if !check_hash {
            return Ok(Meta::from_info(&info));
        }

        let (meta, actual) = hash_file(
            &obj.path,
            obj.fs.as_ref(),
            &self.hash_name,
            Some(self.state.as_ref()),
            Some(info),
        )
        .await?;
        let actual = actual.value.unwrap_or_default();
        let primary = |v: &str| v.split('.').next().unwrap_or_default().to_string();
        if primary(&actual) != primary(oid) {
            debug!("corrupted cache file '{}'", obj.path.display());
            if let Err(e) = self.fs.remove(&obj.path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
            return Err(Error::ObjectFormat(format!("{} is corrupted", oid)));
        }

        self.protect(&obj.path).await;
        Ok(meta)
    }

    pub async fn delete(&self, oid: &str) -> Result<()> {
        self.ensure_writable("delete from")?;
        if let Some(refs) = &self.references {
            refs.write().unwrap_or_else(|e| e.into_inner()).remove(oid);
            return Ok(());
        }
        let path = self.oid_to_path(oid);
        self.fs.remove(&path).await.map_err(|e| Error::from_io(e, &path))
    }

    /// Delete every object
    pub async fn clear(&self) -> Result<()> {
        self.ensure_writable("clear")?;
        for oid in self.all().await? {
            self.delete(&oid).await?;
        }
        Ok(())
    }

    /// Stored oids, optionally limited to one shard prefix
    pub async fn list_oids(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        if let Some(refs) = &self.references {
            let refs = refs.read().unwrap_or_else(|e| e.into_inner());
            return Ok(refs
                .keys()
                .filter(|oid| prefix.is_none_or(|p| oid.starts_with(p)))
                .cloned()
                .collect());
        }

        let root = match prefix {
            Some(p) => self.path.join(Self::oid_parts(p).0),
            None => self.path.clone(),
        };
        let paths = match self.fs.find(&root).await {
            Ok(paths) => paths,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut oids = Vec::with_capacity(paths.len());
        for path in paths {
            match self.path_to_oid(&path) {
                Ok(oid) => oids.push(oid),
                Err(_) => debug!("'{}' doesn't look like a cache file, skipping", path.display()),
            }
        }
        Ok(oids)
    }

    /// Every stored oid. Always a full listing.
    pub async fn all(&self) -> Result<Vec<String>> {
        let oids = self.list_oids(None).await?;
        info!("listed {} objects in '{}'", oids.len(), self.path.display());
        Ok(oids)
    }

    /// Which of `oids` exist, probing each one individually
    pub async fn list_oids_exists(&self, oids: &[String], jobs: Option<usize>) -> Vec<String> {
        debug!("querying {} oids via exists", oids.len());
        let jobs = jobs.unwrap_or(self.jobs).max(1);
        let found: Vec<Option<String>> = stream::iter(oids)
            .map(|oid| async move { self.exists(oid).await.then(|| oid.clone()) })
            .buffered(jobs)
            .collect()
            .await;
        found.into_iter().flatten().collect()
    }

    /// Which of `oids` are present and intact
    pub async fn oids_exist(&self, oids: &[String], jobs: Option<usize>) -> Result<Vec<String>> {
        if !self.is_local() || self.is_reference() {
            return Ok(self.list_oids_exists(oids, jobs).await);
        }
        let jobs = jobs.unwrap_or(self.jobs).max(1);
        let results: Vec<(String, Result<Meta>)> = stream::iter(oids)
            .map(|oid| async move { (oid.clone(), self.check(oid, true).await) })
            .buffered(jobs)
            .collect()
            .await;

        let mut present = Vec::new();
        for (oid, result) in results {
            match result {
                Ok(_) => present.push(oid),
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => {}
            }
        }
        Ok(present)
    }

    /// Mark a stored file read-only. Failure is logged, never fatal.
    pub async fn protect(&self, path: &Path) {
        if !self.is_local() {
            return;
        }
        if let Err(e) = self.fs.chmod(path, CACHE_MODE).await {
            debug!("failed to protect '{}': {}", path.display(), e);
        }
    }

    pub async fn is_protected(&self, path: &Path) -> bool {
        if !self.is_local() {
            return false;
        }
        match self.fs.info(path).await {
            Ok(info) => info.mode & 0o777 == CACHE_MODE,
            Err(_) => false,
        }
    }

    /// Make a workspace file (or every file below a directory) writable
    /// again, breaking any link into the database first.
    pub async fn unprotect(&self, path: &Path) -> Result<()> {
        let info = self
            .fs
            .info(path)
            .await
            .map_err(|_| Error::ObjectDb(format!("can't unprotect non-existing data '{}'", path.display())))?;
        let files = if info.is_dir() {
            self.fs.find(path).await?
        } else {
            vec![path.to_path_buf()]
        };
        for file in files {
            self.unprotect_file(&file).await?;
        }
        Ok(())
    }

    async fn unprotect_file(&self, path: &Path) -> Result<()> {
        let info = self.fs.info(path).await?;
        if info.is_symlink || info.nlink > 1 {
            debug!("unprotecting '{}'", path.display());
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let tmp = path.with_file_name(crate::fs::tmp_fname(&name));
            generic::copy(self.fs.as_ref(), path, self.fs.as_ref(), &tmp).await?;
            self.fs.remove(path).await?;
            self.fs.rename(&tmp, path).await?;
        } else {
            debug!(
                "skipping copying for '{}', since it is not a symlink or a hardlink",
                path.display()
            );
        }
        self.fs.chmod(path, self.file_mode).await?;
        Ok(())
    }

    /// Add the execute bits to a workspace file
    pub async fn set_exec(&self, path: &Path) {
        let Ok(info) = self.fs.info(path).await else {
            return;
        };
        let mode = (info.mode & 0o7777) | 0o111;
        if let Err(e) = self.fs.chmod(path, mode).await {
            debug!("failed to chmod '{:o}' '{}': {}", mode, path.display(), e);
        }
    }
}

/// Store a digested tree in `odb` and repoint it at the stored copy
pub async fn add_update_tree(odb: &ObjectDb, tree: &mut Tree) -> Result<()> {
    let (Some(oid), Some(path), Some(fs)) = (tree.oid().map(str::to_string), tree.path.clone(), tree.fs.clone())
    else {
        return Err(Error::ObjectDb("tree must be digested before it is added".into()));
    };
    odb.add_file(fs, &path, &oid, AddOptions::default()).await?;
    let raw = odb.get(&oid);
    tree.fs = Some(raw.fs);
    tree.path = Some(raw.path);
    Ok(())
}
