//! Copying objects between object databases
//!
//! Only the delta is moved. A `.dir` object is written to the destination
//! only once every file it lists is there, so a present tree object is
//! always fully retrievable.

use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error, info};

use crate::error::{Error, Result, is_too_many_open_files};
use crate::hash_info::HashInfo;
use crate::odb::{AddOptions, AddRequest, ObjectDb};
use crate::status::compare_status;
use crate::tree::Tree;

#[derive(Debug, Clone, Copy, Default)]
pub struct TransferOptions {
    /// Existence-check pool size; `None` uses the database default
    pub jobs: Option<usize>,
    pub verify: bool,
    pub hardlink: bool,
    /// Do not expand trees into their entries
    pub shallow: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferResult {
    pub transferred: BTreeSet<HashInfo>,
    pub failed: BTreeSet<HashInfo>,
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

fn same_odb(a: &ObjectDb, b: &ObjectDb) -> bool {
    a.fs().protocol() == b.fs().protocol() && a.path() == b.path()
}

/// Transfer `obj_ids` (and, unless shallow, every entry of the trees among
/// them) from `src` to `dest`.
///
/// Per-object failures are logged and returned in `failed`. Running out of
/// file descriptors aborts the call.
pub async fn transfer(
    src: &ObjectDb,
    dest: &ObjectDb,
    obj_ids: &[HashInfo],
    options: TransferOptions,
) -> Result<TransferResult> {
    if same_odb(src, dest) {
        return Ok(TransferResult::default());
    }

    let status = compare_status(src, dest, obj_ids, false, options.shallow, options.jobs).await?;
    if status.new.is_empty() {
        return Ok(TransferResult::default());
    }

    let (dir_ids, file_ids): (Vec<&HashInfo>, Vec<&HashInfo>) = status.new.iter().partition(|hi| hi.is_dir());
    let mut remaining: BTreeSet<HashInfo> = file_ids.into_iter().cloned().collect();
    let mut failed = BTreeSet::new();

    for dir_hash in dir_ids {
        let tree = Tree::load(src, dir_hash).await?;
        let entry_ids: BTreeSet<HashInfo> = tree.iter().filter_map(|(_, _, oid)| oid.cloned()).collect();
        let bound: Vec<HashInfo> = remaining.intersection(&entry_ids).cloned().collect();
        remaining.retain(|hi| !entry_ids.contains(hi));

        failed.extend(add(src, dest, &bound, options).await?);
        // entries shared with an earlier tree may have failed there
        if entry_ids.iter().any(|hi| failed.contains(hi)) {
            debug!("failed to upload full contents of '{}', aborting .dir file upload", dir_hash);
            error!(
                "failed to upload '{}' to '{}'",
                src.oid_to_path(dir_hash.value.as_deref().unwrap_or_default()).display(),
                dest.oid_to_path(dir_hash.value.as_deref().unwrap_or_default()).display()
            );
            failed.insert(dir_hash.clone());
        } else if entry_ids.iter().any(|hi| status.missing.contains(hi)) {
            // whatever content exists was pushed above; the tree itself would be incomplete
            debug!("directory '{}' contains missing files, skipping .dir file upload", dir_hash);
            failed.insert(dir_hash.clone());
        } else {
            failed.extend(add(src, dest, std::slice::from_ref(dir_hash), options).await?);
        }
    }

    let rest: Vec<HashInfo> = remaining.into_iter().collect();
    failed.extend(add(src, dest, &rest, options).await?);

    let transferred: BTreeSet<HashInfo> = status.new.difference(&failed).cloned().collect();
    info!("transferred {} objects, {} failed", transferred.len(), failed.len());
    Ok(TransferResult { transferred, failed })
}

/// Add `hash_infos` to `dest`; returns the ones that failed
async fn add(
    src: &ObjectDb,
    dest: &ObjectDb,
    hash_infos: &[HashInfo],
    options: TransferOptions,
) -> Result<BTreeSet<HashInfo>> {
    if hash_infos.is_empty() {
        return Ok(BTreeSet::new());
    }

    let mut by_oid: HashMap<String, HashInfo> = HashMap::with_capacity(hash_infos.len());
    let mut requests = Vec::with_capacity(hash_infos.len());
    for hash_info in hash_infos {
        let Some(oid) = hash_info.value.as_deref() else {
            continue;
        };
        let obj = src.get(oid);
        requests.push(AddRequest::new(obj.fs, obj.path, oid));
        by_oid.insert(oid.to_string(), hash_info.clone());
    }

    let outcome = dest
        .add(
            requests,
            AddOptions {
                hardlink: options.hardlink,
                check_exists: false,
                verify: Some(options.verify),
            },
        )
        .await?;

    let mut failed = BTreeSet::new();
    for (oid, err) in outcome.failed {
        if is_too_many_open_files(&err) {
            return Err(Error::TooManyOpenFiles(err));
        }
        error!("failed to transfer '{}': {}", oid, err);
        if let Some(hash_info) = by_oid.remove(&oid) {
            failed.insert(hash_info);
        }
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{Algorithm, hash_bytes};
    use crate::odb::OdbOptions;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        src: ObjectDb,
        dest: ObjectDb,
        files: Vec<HashInfo>,
        dir: HashInfo,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let src = ObjectDb::local(tmp.path().join("src"), OdbOptions::default());
        let dest = ObjectDb::local(tmp.path().join("dest"), OdbOptions::default());

        let mut tree = Tree::new();
        let mut files = Vec::new();
        for (name, data) in [("a", "alpha"), ("b", "beta")] {
            let oid = hash_bytes(data.as_bytes(), Algorithm::Md5);
            src.add_bytes(&oid, Bytes::from(data)).await.unwrap();
            let hi = HashInfo::new("md5", oid);
            tree.add(vec![name.to_string()], None, Some(hi.clone()));
            files.push(hi);
        }
        let dir = tree.digest(false).unwrap();
        src.add_bytes(dir.value.as_deref().unwrap(), Bytes::from(tree.as_bytes(false).unwrap()))
            .await
            .unwrap();
        Fixture {
            _tmp: tmp,
            src,
            dest,
            files,
            dir,
        }
    }

    #[tokio::test]
    async fn test_transfer_tree() {
        let f = fixture().await;
        let result = transfer(&f.src, &f.dest, &[f.dir.clone()], TransferOptions::default())
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.transferred.len(), 3);
        for hi in f.files.iter().chain([&f.dir]) {
            assert!(f.dest.exists(hi.value.as_deref().unwrap()).await);
        }

        // nothing left to move
        let again = transfer(&f.src, &f.dest, &[f.dir.clone()], TransferOptions::default())
            .await
            .unwrap();
        assert!(again.transferred.is_empty() && again.failed.is_empty());
    }

    #[tokio::test]
    async fn test_missing_entry_keeps_tree_out() {
        let f = fixture().await;
        f.src.delete(f.files[1].value.as_deref().unwrap()).await.unwrap();

        let result = transfer(&f.src, &f.dest, &[f.dir.clone()], TransferOptions::default())
            .await
            .unwrap();
        assert!(result.failed.contains(&f.dir));
        assert!(result.transferred.contains(&f.files[0]));
        assert!(!f.dest.exists(f.dir.value.as_deref().unwrap()).await);
        assert!(f.dest.exists(f.files[0].value.as_deref().unwrap()).await);
    }

    async fn put_tree(odb: &ObjectDb, entries: &[(&str, &HashInfo)]) -> HashInfo {
        let mut tree = Tree::new();
        for (name, hi) in entries {
            tree.add(vec![name.to_string()], None, Some((*hi).clone()));
        }
        let dir = tree.digest(false).unwrap();
        odb.add_bytes(dir.value.as_deref().unwrap(), Bytes::from(tree.as_bytes(false).unwrap()))
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_shared_failed_entry_keeps_every_tree_out() {
        use crate::fs::LocalFileSystem;
        use crate::state::StateNoop;
        use std::sync::Arc;

        let tmp = TempDir::new().unwrap();
        let src = ObjectDb::reference("/staging", "md5", Arc::new(StateNoop));
        let dest = ObjectDb::local(tmp.path().join("dest"), OdbOptions::default());

        let mut blobs = Vec::new();
        for data in ["beta", "gamma"] {
            let oid = hash_bytes(data.as_bytes(), Algorithm::Md5);
            src.add_bytes(&oid, Bytes::from(data)).await.unwrap();
            blobs.push(HashInfo::new("md5", oid));
        }
        // staged, but its content is gone by the time it is copied
        let shared = HashInfo::new("md5", hash_bytes(b"alpha", Algorithm::Md5));
        src.add(
            vec![AddRequest::new(
                LocalFileSystem::shared(),
                tmp.path().join("gone"),
                shared.value.clone().unwrap(),
            )],
            AddOptions::default(),
        )
        .await
        .unwrap();

        let first = put_tree(&src, &[("a", &shared), ("b", &blobs[0])]).await;
        let second = put_tree(&src, &[("a", &shared), ("c", &blobs[1])]).await;

        let result = transfer(&src, &dest, &[first.clone(), second.clone()], TransferOptions::default())
            .await
            .unwrap();
        assert!(result.failed.contains(&shared));
        for dir in [&first, &second] {
            assert!(result.failed.contains(dir));
            assert!(!result.transferred.contains(dir));
            assert!(!dest.exists(dir.value.as_deref().unwrap()).await);
        }
        for blob in &blobs {
            assert!(result.transferred.contains(blob));
            assert!(dest.exists(blob.value.as_deref().unwrap()).await);
        }
    }

    #[tokio::test]
    async fn test_read_only_destination() {
        let f = fixture().await;
        let dest = ObjectDb::local(
            f.dest.path(),
            OdbOptions {
                read_only: true,
                ..Default::default()
            },
        );
        let err = transfer(&f.src, &dest, &[f.dir.clone()], TransferOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
    }

    #[tokio::test]
    async fn test_same_database_is_a_noop() {
        let f = fixture().await;
        let result = transfer(&f.src, &f.src, &[f.dir.clone()], TransferOptions::default())
            .await
            .unwrap();
        assert_eq!(result, TransferResult::default());
    }
}
