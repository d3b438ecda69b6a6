//! Staging objects from a workspace path
//!
//! [`build`] hashes a file or directory and stages the result in a reference
//! object database. Nothing is copied into the target database; callers move
//! the staged objects there with [`crate::transfer::transfer`].

use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::default_checksum_jobs;
use crate::error::{Error, Result};
use crate::fs::{FileInfo, FileKind, FileSystem, LOCAL_PROTOCOL, tmp_fname};
use crate::hash::{Algorithm, HashingReader, hash_file};
use crate::hash_info::HashInfo;
use crate::ignore::{DEFAULT_IGNORE_FILE, Ignore};
use crate::meta::Meta;
use crate::object::{HashFile, Object};
use crate::odb::{AddOptions, AddRequest, ObjectDb, add_update_tree};
use crate::tree::{Key, Tree};

/// Files above this size are hashed on the worker pool
pub const LARGE_FILE_THRESHOLD: u64 = 1 << 21;

const STAGING_PREFIX: &str = "/hoard-staging";

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Write content to a temporary path on the target database's
    /// filesystem and stage references to that copy
    pub upload: bool,
    /// Only compute hashes; file objects are not staged
    pub dry_run: bool,
    pub ignore: Option<Arc<dyn Ignore>>,
    /// Hashing pool size for large files
    pub checksum_jobs: Option<usize>,
    /// Digest the directory is expected to have; if the tree is already
    /// stored the walk is skipped
    pub known: Option<HashInfo>,
}

/// Result of a build
#[derive(Debug)]
pub struct Built {
    /// Reference database holding everything staged by this build
    pub staging: ObjectDb,
    pub meta: Meta,
    pub object: Object,
}

/// Reference database used to stage objects headed for `odb`
pub fn staging_for(odb: &ObjectDb) -> ObjectDb {
    let root = if odb.fs().protocol() == LOCAL_PROTOCOL {
        std::path::absolute(odb.path()).unwrap_or_else(|_| odb.path().to_path_buf())
    } else {
        odb.path().to_path_buf()
    };
    let digest = hex::encode(Sha256::digest(root.to_string_lossy().as_bytes()));
    let path = PathBuf::from(format!("{}-{}", STAGING_PREFIX, odb.hash_name())).join(digest);
    ObjectDb::reference(path, odb.hash_name(), odb.state().clone())
}

/// Hash `path` on `fs` with algorithm `name` and stage the result.
///
/// Fails with `NotFound` if `path` does not exist.
pub async fn build(
    odb: &ObjectDb,
    path: &Path,
    fs: Arc<dyn FileSystem>,
    name: &str,
    options: &BuildOptions,
) -> Result<Built> {
    let details = fs.info(path).await.map_err(|e| Error::from_io(e, path))?;
    let staging = staging_for(odb);
    let upload_odb = options.upload.then_some(odb);

    let (meta, object) = if details.is_dir() {
        let (meta, tree) = build_tree(path, &fs, name, odb, &staging, upload_odb, options).await?;
        debug!("built tree '{}'", tree.hash_info.as_ref().map(|h| h.to_string()).unwrap_or_default());
        (meta, Object::Tree(tree))
    } else {
        let (meta, file) = build_file(path, &fs, details, name, &staging, upload_odb, options).await?;
        (meta, Object::Blob(file))
    };
    Ok(Built { staging, meta, object })
}

async fn build_file(
    path: &Path,
    fs: &Arc<dyn FileSystem>,
    info: FileInfo,
    name: &str,
    staging: &ObjectDb,
    upload_odb: Option<&ObjectDb>,
    options: &BuildOptions,
) -> Result<(Meta, HashFile)> {
    let files = vec![(path.to_path_buf(), info)];
    let mut built = build_files(files, fs, name, staging, upload_odb, options).await?;
    let Some((_, meta, Some(hash_info))) = built.pop() else {
        return Err(Error::NotFound(path.display().to_string()));
    };
    let value = hash_info.value.clone().unwrap_or_default();
    let file = if options.dry_run {
        HashFile::new(path, fs.clone(), hash_info)
    } else {
        staging.get(&value)
    };
    Ok((meta, file))
}

/// Hash a batch of files, consulting the state cache first
async fn get_hashes(
    files: &[(PathBuf, FileInfo)],
    fs: &Arc<dyn FileSystem>,
    name: &str,
    staging: &ObjectDb,
    jobs: Option<usize>,
) -> Result<Vec<(Meta, Option<HashInfo>)>> {
    let state = staging.state();
    let mut hashes: Vec<Option<(Meta, Option<HashInfo>)>> = vec![None; files.len()];
    let mut small = Vec::new();
    let mut large = Vec::new();

    for (index, (path, info)) in files.iter().enumerate() {
        if info.kind == FileKind::BrokenLink {
            debug!("'{}' is a broken symlink", path.display());
            hashes[index] = Some((Meta::from_info(info), None));
            continue;
        }
        match state.get(path, fs.as_ref(), info)? {
            Some((meta, hi)) if hi.name == name => hashes[index] = Some((meta, Some(hi))),
            _ if info.size > LARGE_FILE_THRESHOLD => large.push(index),
            _ => small.push(index),
        }
    }
    if large.len() < 2 {
        small.append(&mut large);
    }

    let hash_one = |index: usize| async move {
        let (path, info) = &files[index];
        let result = hash_file(path, fs.as_ref(), name, None, Some(info.clone())).await;
        (index, result)
    };

    let mut fresh = Vec::with_capacity(small.len() + large.len());
    for index in small {
        fresh.push(hash_one(index).await);
    }
    if !large.is_empty() {
        let jobs = jobs.unwrap_or_else(default_checksum_jobs).max(1);
        debug!("hashing {} large files with {} workers", large.len(), jobs);
        let results: Vec<_> = stream::iter(large).map(hash_one).buffer_unordered(jobs).collect().await;
        fresh.extend(results);
    }

    let mut to_save = Vec::with_capacity(fresh.len());
    for (index, result) in fresh {
        let (meta, hi) = result?;
        to_save.push((files[index].0.clone(), hi.clone(), files[index].1.clone()));
        hashes[index] = Some((meta, Some(hi)));
    }
    state.save_many(&to_save, fs.as_ref())?;

    Ok(hashes.into_iter().map(Option::unwrap_or_default).collect())
}

/// Hash files and stage them; returns `(path, meta, hash)` per input file
async fn build_files(
    files: Vec<(PathBuf, FileInfo)>,
    fs: &Arc<dyn FileSystem>,
    name: &str,
    staging: &ObjectDb,
    upload_odb: Option<&ObjectDb>,
    options: &BuildOptions,
) -> Result<Vec<(PathBuf, Meta, Option<HashInfo>)>> {
    let hashes = get_hashes(&files, fs, name, staging, options.checksum_jobs).await?;

    if options.dry_run {
        return Ok(files
            .into_iter()
            .zip(hashes)
            .map(|((path, _), (meta, hi))| (path, meta, hi))
            .collect());
    }

    if let Some(upload_odb) = upload_odb {
        let mut built = Vec::with_capacity(files.len());
        for ((path, _), (meta, hi)) in files.into_iter().zip(hashes) {
            if hi.is_none() {
                built.push((path, meta, None));
                continue;
            }
            let (meta, hi) = upload_file(&path, fs, name, staging, upload_odb).await?;
            built.push((path, meta, Some(hi)));
        }
        return Ok(built);
    }

    let requests: Vec<AddRequest> = files
        .iter()
        .zip(&hashes)
        .filter_map(|((path, _), (_, hi))| {
            let oid = hi.as_ref()?.value.clone()?;
            Some(AddRequest::new(fs.clone(), path.clone(), oid))
        })
        .collect();
    staging.add(requests, AddOptions::default()).await?;

    Ok(files
        .into_iter()
        .zip(hashes)
        .map(|((path, _), (meta, hi))| (path, meta, hi))
        .collect())
}

/// Stream `path` to a temporary file on the target filesystem, hashing on the
/// way, and stage a reference to the uploaded copy
async fn upload_file(
    path: &Path,
    fs: &Arc<dyn FileSystem>,
    name: &str,
    staging: &ObjectDb,
    upload_odb: &ObjectDb,
) -> Result<(Meta, HashInfo)> {
    let algorithm: Algorithm = name.parse()?;
    let tmp = upload_odb.path().join(tmp_fname(""));
    let size = fs.info(path).await.map_err(|e| Error::from_io(e, path))?.size;
    let reader = fs.open(path).await.map_err(|e| Error::from_io(e, path))?;
    let (reader, handle) = HashingReader::new(reader, algorithm);
    upload_odb.fs().put_file(Box::new(reader), &tmp, Some(size)).await?;

    let oid = handle.hex_digest();
    debug!("uploaded '{}' to '{}' as {}", path.display(), tmp.display(), oid);
    staging
        .add_file(upload_odb.fs().clone(), &tmp, &oid, AddOptions::default())
        .await?;
    Ok((Meta::with_size(size), HashInfo::new(name, oid)))
}

/// Directory meta of a stored tree. The size is only known when every entry
/// was stored with one.
fn stored_tree_meta(tree: &Tree) -> Meta {
    let size: Option<u64> = tree.iter().map(|(_, meta, _)| meta.and_then(|m| m.size)).sum();
    Meta {
        size,
        ..Meta::directory(0, tree.len() as u64)
    }
}

async fn build_tree(
    path: &Path,
    fs: &Arc<dyn FileSystem>,
    name: &str,
    odb: &ObjectDb,
    staging: &ObjectDb,
    upload_odb: Option<&ObjectDb>,
    options: &BuildOptions,
) -> Result<(Meta, Tree)> {
    if let Some(known) = options.known.as_ref().filter(|hi| hi.name == name && hi.is_dir()) {
        for candidate in [staging, odb] {
            match Tree::load(candidate, known).await {
                Ok(tree) => {
                    debug!("reusing stored tree {}", known);
                    return Ok((stored_tree_meta(&tree), tree));
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
    }

    let ignore_file = options
        .ignore
        .as_ref()
        .map(|ignore| ignore.ignore_file().to_string())
        .unwrap_or_else(|| DEFAULT_IGNORE_FILE.to_string());

    let walk = fs
        .walk(path, options.ignore.clone())
        .await
        .map_err(|e| Error::from_io(e, path))?;

    let mut tree = Tree::with_hash_name(name);
    let mut size = 0;
    for entry in walk {
        if entry.files.is_empty() {
            continue;
        }
        if entry.files.iter().any(|(fname, _)| *fname == ignore_file) {
            return Err(Error::IgnoreInCollectedDir {
                ignore_file,
                dir: entry.dir,
            });
        }

        let rel_key: Key = entry
            .dir
            .strip_prefix(path)
            .map(|rel| {
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();

        let files: Vec<(PathBuf, FileInfo)> = entry
            .files
            .into_iter()
            .map(|(fname, info)| (entry.dir.join(fname), info))
            .collect();
        let built = build_files(files, fs, name, staging, upload_odb, options).await?;
        for (file_path, meta, hi) in built {
            let mut key = rel_key.clone();
            if let Some(fname) = file_path.file_name() {
                key.push(fname.to_string_lossy().into_owned());
            }
            size += meta.size.unwrap_or(0);
            tree.add(key, Some(meta), hi);
        }
    }

    let nfiles = tree.len() as u64;
    if nfiles == 0 {
        // an unreadable root should fail rather than build as empty
        fs.ls(path).await.map_err(|e| Error::from_io(e, path))?;
    }

    tree.digest(false)?;
    add_update_tree(staging, &mut tree).await?;
    info!("built {} with {} files", path.display(), nfiles);
    Ok((Meta::directory(size, nfiles), tree))
}
