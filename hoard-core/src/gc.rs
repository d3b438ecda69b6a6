//! Garbage collection of unreferenced objects

use std::collections::HashSet;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hash_info::{HASH_DIR_SUFFIX, HashInfo};
use crate::odb::ObjectDb;
use crate::tree::Tree;

/// Remove every object in `odb` not named by `used`.
///
/// Unless `shallow`, trees in `used` are loaded from `cache_odb` (default
/// `odb`) and their entries are kept as well. Tree objects go before file
/// objects. Returns the number of objects removed, or that would be removed
/// when `dry`.
pub async fn gc(
    odb: &ObjectDb,
    used: &[HashInfo],
    shallow: bool,
    dry: bool,
    cache_odb: Option<&ObjectDb>,
) -> Result<usize> {
    if odb.is_read_only() {
        return Err(Error::ReadOnly(format!("cannot gc read-only ODB '{}'", odb.path().display())));
    }
    let cache_odb = cache_odb.unwrap_or(odb);

    let mut used_oids: HashSet<String> = HashSet::new();
    for hash_info in used {
        if hash_info.name != odb.hash_name() {
            continue;
        }
        let Some(value) = hash_info.value.clone() else {
            continue;
        };
        if hash_info.is_dir() && !shallow {
            let tree = Tree::load(cache_odb, hash_info).await?;
            used_oids.extend(tree.iter().filter_map(|(_, _, oid)| oid.and_then(|hi| hi.value.clone())));
        }
        used_oids.insert(value);
    }

    let (dirs, files): (Vec<String>, Vec<String>) = odb
        .all()
        .await?
        .into_iter()
        .filter(|oid| !used_oids.contains(oid))
        .partition(|oid| oid.ends_with(HASH_DIR_SUFFIX));

    let removed = dirs.len() + files.len();
    if !dry {
        for oid in dirs.iter().chain(&files) {
            debug!("removing '{}'", odb.oid_to_path(oid).display());
            odb.delete(oid).await?;
        }
    }
    info!("{} {} unused objects", if dry { "would remove" } else { "removed" }, removed);
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{Algorithm, hash_bytes};
    use crate::odb::OdbOptions;
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn put(odb: &ObjectDb, data: &'static str) -> HashInfo {
        let oid = hash_bytes(data.as_bytes(), Algorithm::Md5);
        odb.add_bytes(&oid, Bytes::from(data)).await.unwrap();
        HashInfo::new("md5", oid)
    }

    async fn populated(tmp: &TempDir) -> (ObjectDb, HashInfo, HashInfo) {
        let odb = ObjectDb::local(tmp.path().join("cache"), OdbOptions::default());
        let kept = put(&odb, "kept").await;
        put(&odb, "garbage").await;
        let mut tree = Tree::new();
        tree.add(vec!["kept".into()], None, Some(kept.clone()));
        let dir = tree.digest(false).unwrap();
        odb.add_bytes(dir.value.as_deref().unwrap(), Bytes::from(tree.as_bytes(false).unwrap()))
            .await
            .unwrap();
        (odb, kept, dir)
    }

    #[tokio::test]
    async fn test_gc_keeps_tree_entries() {
        let tmp = TempDir::new().unwrap();
        let (odb, kept, dir) = populated(&tmp).await;

        assert_eq!(gc(&odb, &[dir.clone()], false, true, None).await.unwrap(), 1);
        assert_eq!(odb.all().await.unwrap().len(), 3);

        assert_eq!(gc(&odb, &[dir.clone()], false, false, None).await.unwrap(), 1);
        let mut left = odb.all().await.unwrap();
        left.sort();
        let mut expected = vec![kept.value.unwrap(), dir.value.unwrap()];
        expected.sort();
        assert_eq!(left, expected);
    }

    #[tokio::test]
    async fn test_shallow_gc_drops_entries() {
        let tmp = TempDir::new().unwrap();
        let (odb, _, dir) = populated(&tmp).await;
        assert_eq!(gc(&odb, &[dir.clone()], true, false, None).await.unwrap(), 2);
        assert_eq!(odb.all().await.unwrap(), vec![dir.value.unwrap()]);
    }

    #[tokio::test]
    async fn test_gc_refuses_read_only() {
        let tmp = TempDir::new().unwrap();
        let odb = ObjectDb::local(
            tmp.path(),
            OdbOptions {
                read_only: true,
                ..Default::default()
            },
        );
        assert!(matches!(gc(&odb, &[], true, true, None).await, Err(Error::ReadOnly(_))));
    }
}
