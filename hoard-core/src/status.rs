//! Presence of objects in one or two object databases

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::Result;
use crate::fs::MEMORY_PROTOCOL;
use crate::hash_info::HashInfo;
use crate::odb::ObjectDb;
use crate::tree::Tree;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusResult {
    pub exists: BTreeSet<HashInfo>,
    pub missing: BTreeSet<HashInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompareStatusResult {
    /// In both databases
    pub ok: BTreeSet<HashInfo>,
    /// In neither
    pub missing: BTreeSet<HashInfo>,
    /// Only in the source
    pub new: BTreeSet<HashInfo>,
    /// Only in the destination
    pub deleted: BTreeSet<HashInfo>,
}

/// Which of `obj_ids` exist in `odb`.
///
/// Unless `shallow`, trees are loaded from `cache_odb` (default `odb`) and
/// their entries are checked too. Memory-backed databases are staging areas
/// and are assumed to hold everything.
pub async fn status(
    odb: &ObjectDb,
    obj_ids: &[HashInfo],
    cache_odb: Option<&ObjectDb>,
    shallow: bool,
    jobs: Option<usize>,
) -> Result<StatusResult> {
    debug!("preparing to collect status from '{}'", odb.path().display());
    let cache_odb = cache_odb.unwrap_or(odb);

    let mut hash_infos: BTreeMap<String, HashInfo> = BTreeMap::new();
    for hash_info in obj_ids {
        let Some(value) = hash_info.value.clone() else {
            continue;
        };
        if hash_info.is_dir() && !shallow {
            let tree = Tree::load(cache_odb, hash_info).await?;
            for (_, _, oid) in tree.iter() {
                if let Some(oid) = oid.filter(|oid| oid.is_set()) {
                    hash_infos.insert(oid.value.clone().unwrap_or_default(), oid.clone());
                }
            }
        }
        hash_infos.insert(value, hash_info.clone());
    }

    if odb.fs().protocol() == MEMORY_PROTOCOL {
        return Ok(StatusResult {
            exists: hash_infos.into_values().collect(),
            missing: BTreeSet::new(),
        });
    }

    debug!("collecting status from '{}'", odb.path().display());
    let oids: Vec<String> = hash_infos.keys().cloned().collect();
    let exists: BTreeSet<String> = odb.oids_exist(&oids, jobs).await?.into_iter().collect();

    let mut result = StatusResult::default();
    for (oid, hash_info) in hash_infos {
        if exists.contains(&oid) {
            result.exists.insert(hash_info);
        } else {
            result.missing.insert(hash_info);
        }
    }
    Ok(result)
}

/// Compare presence of `obj_ids` between `src` and `dest`.
///
/// With `check_deleted` unset, the source is only queried when something is
/// missing from the destination.
pub async fn compare_status(
    src: &ObjectDb,
    dest: &ObjectDb,
    obj_ids: &[HashInfo],
    check_deleted: bool,
    shallow: bool,
    jobs: Option<usize>,
) -> Result<CompareStatusResult> {
    let dest_status = status(dest, obj_ids, Some(src), shallow, jobs).await?;
    let src_status = if !dest_status.missing.is_empty() || check_deleted {
        status(src, obj_ids, None, shallow, jobs).await?
    } else {
        StatusResult {
            exists: dest_status.exists.clone(),
            missing: BTreeSet::new(),
        }
    };

    Ok(CompareStatusResult {
        ok: src_status.exists.intersection(&dest_status.exists).cloned().collect(),
        missing: src_status.missing.intersection(&dest_status.missing).cloned().collect(),
        new: src_status.exists.difference(&dest_status.exists).cloned().collect(),
        deleted: dest_status.exists.difference(&src_status.exists).cloned().collect(),
    })
}
