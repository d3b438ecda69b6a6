//! Object and tree comparison

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::hash_info::HashInfo;
use crate::meta::Meta;
use crate::object::Object;
use crate::odb::ObjectDb;
use crate::tree::{Key, Tree};

/// Key of the object itself; the root of a tree
pub const ROOT: &[String] = &[];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
    Unchanged,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeType::Add => "add",
            ChangeType::Modify => "modify",
            ChangeType::Delete => "delete",
            ChangeType::Unchanged => "unchanged",
        })
    }
}

/// One side of a change.
///
/// Only `key` and `oid` take part in equality. `cache_meta` is set when the
/// object was verified present in the cache.
#[derive(Debug, Clone, Default)]
pub struct TreeEntry {
    pub cache_meta: Option<Meta>,
    pub key: Key,
    pub meta: Option<Meta>,
    pub oid: Option<HashInfo>,
}

impl TreeEntry {
    pub fn in_cache(&self) -> bool {
        self.cache_meta.is_some()
    }

    /// Whether this side holds an object at all
    pub fn is_present(&self) -> bool {
        self.oid.as_ref().is_some_and(HashInfo::is_set)
    }

    pub fn is_dir(&self) -> bool {
        self.oid.as_ref().is_some_and(HashInfo::is_dir)
    }
}

impl PartialEq for TreeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.oid == other.oid
    }
}

impl Eq for TreeEntry {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub old: TreeEntry,
    pub new: TreeEntry,
}

impl Change {
    pub fn new(old: TreeEntry, new: TreeEntry) -> Self {
        Self { old, new }
    }

    /// Derived from which sides are present and whether they agree
    pub fn typ(&self) -> ChangeType {
        match (self.old.is_present(), self.new.is_present()) {
            (false, false) => ChangeType::Unchanged,
            (true, false) => ChangeType::Delete,
            (false, true) => ChangeType::Add,
            (true, true) if self.old != self.new => ChangeType::Modify,
            (true, true) => ChangeType::Unchanged,
        }
    }

    /// Key of whichever side is present
    pub fn key(&self) -> &Key {
        if self.new.is_present() { &self.new.key } else { &self.old.key }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    pub added: Vec<Change>,
    pub modified: Vec<Change>,
    pub deleted: Vec<Change>,
    pub unchanged: Vec<Change>,
}

impl DiffResult {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty())
    }

    /// Counts of every change kind except `unchanged`
    pub fn stats(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([
            ("added", self.added.len()),
            ("modified", self.modified.len()),
            ("deleted", self.deleted.len()),
        ])
    }

    fn push(&mut self, change: Change) {
        match change.typ() {
            ChangeType::Add => self.added.push(change),
            ChangeType::Modify => self.modified.push(change),
            ChangeType::Delete => self.deleted.push(change),
            ChangeType::Unchanged => self.unchanged.push(change),
        }
    }
}

/// A blob is keyed by the root; a tree by its entries alone
fn keys(obj: Option<&Object>) -> Vec<Key> {
    match obj {
        None => Vec::new(),
        Some(Object::Blob(_)) => vec![ROOT.to_vec()],
        Some(Object::Tree(tree)) => tree.iter_all().map(|(key, _, _)| key.clone()).collect(),
    }
}

fn lookup(obj: Option<&Object>, key: &[String]) -> (Option<Meta>, Option<HashInfo>) {
    match obj {
        None => (None, None),
        Some(Object::Blob(file)) if key.is_empty() => (None, Some(file.hash_info.clone())),
        Some(Object::Blob(_)) => (None, None),
        // only asked for when the other side is a blob
        Some(Object::Tree(tree)) if key.is_empty() => (None, tree.hash_info.clone()),
        Some(Object::Tree(tree)) => tree
            .get(key)
            .map(|(meta, hi)| (meta.clone(), hi.clone()))
            .unwrap_or_default(),
    }
}

/// Per-call memo of cache presence checks
struct CacheCheck<'a> {
    cache: &'a ObjectDb,
    seen: HashMap<String, Option<Meta>>,
}

impl<'a> CacheCheck<'a> {
    fn new(cache: &'a ObjectDb) -> Self {
        Self {
            cache,
            seen: HashMap::new(),
        }
    }

    async fn get(&mut self, oid: Option<&HashInfo>) -> Result<Option<Meta>> {
        let Some(value) = oid.and_then(|hi| hi.value.as_deref()).filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        if let Some(meta) = self.seen.get(value) {
            return Ok(meta.clone());
        }
        let meta = match self.cache.check(value, true).await {
            Ok(meta) => Some(meta),
            Err(e) if e.is_not_found() || matches!(e, Error::ObjectFormat(_)) => None,
            Err(e) => return Err(e),
        };
        self.seen.insert(value.to_string(), meta.clone());
        Ok(meta)
    }
}

fn is_empty_tree(obj: &Object) -> bool {
    obj.as_tree().is_some_and(Tree::is_empty)
}

fn is_blob(obj: Option<&Object>) -> bool {
    obj.is_some_and(|obj| !obj.is_tree())
}

async fn expanded(obj: Option<&Object>, cache: &ObjectDb) -> Result<Option<Object>> {
    match obj {
        Some(Object::Tree(tree)) => {
            let mut tree: Tree = tree.clone();
            tree.expand(&[cache]).await?;
            Ok(Some(Object::Tree(tree)))
        }
        other => Ok(other.cloned()),
    }
}

/// Compare two objects key by key.
///
/// A blob counts as a one-entry tree at the root key; a tree's own hash is
/// not compared, only its entries, unless the other side is a blob. Then the
/// root key carries the swap between file and directory. Nested trees are
/// expanded from `cache` first. Every entry records whether its object is
/// present in `cache`.
pub async fn diff(old: Option<&Object>, new: Option<&Object>, cache: &ObjectDb) -> Result<DiffResult> {
    let mut ret = DiffResult::default();
    if old.is_none() && new.is_none() {
        return Ok(ret);
    }
    // an empty tree compares like no object at all, unless a blob takes its place
    let old = expanded(old, cache)
        .await?
        .filter(|obj| !is_empty_tree(obj) || is_blob(new));
    let new = expanded(new, cache)
        .await?
        .filter(|obj| !is_empty_tree(obj) || is_blob(old.as_ref()));

    let mut all: BTreeSet<Key> = keys(old.as_ref()).into_iter().chain(keys(new.as_ref())).collect();
    if let (Some(a), Some(b)) = (&old, &new) {
        if a.is_tree() != b.is_tree() {
            all.insert(ROOT.to_vec());
        }
    }
    let mut check = CacheCheck::new(cache);
    for key in all {
        let (old_meta, old_oid) = lookup(old.as_ref(), &key);
        let (new_meta, new_oid) = lookup(new.as_ref(), &key);
        let old_cache_meta = check.get(old_oid.as_ref()).await?;
        let new_cache_meta = check.get(new_oid.as_ref()).await?;

        ret.push(Change::new(
            TreeEntry {
                cache_meta: old_cache_meta,
                key: key.clone(),
                meta: old_meta,
                oid: old_oid,
            },
            TreeEntry {
                cache_meta: new_cache_meta,
                key,
                meta: new_meta,
                oid: new_oid,
            },
        ));
    }
    debug!("diff: {:?}", ret.stats());
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::odb::OdbOptions;
    use crate::tree::relpath_to_key;

    fn tree(entries: &[(&str, &str)]) -> Object {
        let mut tree = Tree::new();
        for (path, oid) in entries {
            tree.add(relpath_to_key(path), None, Some(HashInfo::new("md5", *oid)));
        }
        tree.digest(false).unwrap();
        Object::Tree(tree)
    }

    fn keys_of(changes: &[Change]) -> BTreeSet<String> {
        changes.iter().map(|c| c.key().join("/")).collect()
    }

    #[test]
    fn test_change_type_is_derived() {
        let entry = |oid: Option<&str>| TreeEntry {
            key: vec!["a".into()],
            oid: oid.map(|v| HashInfo::new("md5", v)),
            ..Default::default()
        };
        assert_eq!(Change::new(entry(None), entry(Some("1"))).typ(), ChangeType::Add);
        assert_eq!(Change::new(entry(Some("1")), entry(None)).typ(), ChangeType::Delete);
        assert_eq!(Change::new(entry(Some("1")), entry(Some("2"))).typ(), ChangeType::Modify);
        assert_eq!(Change::new(entry(Some("1")), entry(Some("1"))).typ(), ChangeType::Unchanged);
        assert_eq!(Change::new(entry(None), entry(None)).typ(), ChangeType::Unchanged);
    }

    #[tokio::test]
    async fn test_diff_trees() {
        let cache = ObjectDb::local("/nonexistent-cache", OdbOptions::default());
        let a = tree(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let b = tree(&[("a", "1"), ("b", "9"), ("d", "4")]);

        let d = diff(Some(&a), Some(&b), &cache).await.unwrap();
        assert_eq!(keys_of(&d.added), BTreeSet::from(["d".to_string()]));
        assert_eq!(keys_of(&d.deleted), BTreeSet::from(["c".to_string()]));
        assert_eq!(keys_of(&d.modified), BTreeSet::from(["b".to_string()]));
        assert_eq!(keys_of(&d.unchanged), BTreeSet::from(["a".to_string()]));
        assert!(d.added.iter().all(|c| !c.new.in_cache()));

        let r = diff(Some(&b), Some(&a), &cache).await.unwrap();
        assert_eq!(keys_of(&r.added), keys_of(&d.deleted));
        assert_eq!(keys_of(&r.deleted), keys_of(&d.added));
        assert_eq!(r.modified[0].old, d.modified[0].new);
    }

    #[tokio::test]
    async fn test_blob_is_root_entry() {
        use crate::fs::MemoryFileSystem;
        use crate::object::HashFile;

        let cache = ObjectDb::local("/nonexistent-cache", OdbOptions::default());
        let blob = |oid: &str| Object::Blob(HashFile::new("/f", MemoryFileSystem::shared(), HashInfo::new("md5", oid)));
        let d = diff(Some(&blob("1")), Some(&blob("2")), &cache).await.unwrap();
        assert_eq!(d.modified.len(), 1);
        assert!(d.modified[0].key().is_empty());
    }

    #[tokio::test]
    async fn test_kind_change_keeps_root() {
        use crate::fs::MemoryFileSystem;
        use crate::object::HashFile;

        let cache = ObjectDb::local("/nonexistent-cache", OdbOptions::default());
        let blob = Object::Blob(HashFile::new("/f", MemoryFileSystem::shared(), HashInfo::new("md5", "1")));
        let dir = tree(&[("a", "1")]);
        let dir_hash = dir.hash_info().cloned();

        let d = diff(Some(&dir), Some(&blob), &cache).await.unwrap();
        assert_eq!(keys_of(&d.deleted), BTreeSet::from(["a".to_string()]));
        assert_eq!(d.modified.len(), 1);
        let root = &d.modified[0];
        assert!(root.key().is_empty());
        assert_eq!(root.old.oid, dir_hash);
        assert!(root.old.is_dir() && !root.new.is_dir());

        let r = diff(Some(&blob), Some(&dir), &cache).await.unwrap();
        assert_eq!(keys_of(&r.added), BTreeSet::from(["a".to_string()]));
        assert_eq!(r.modified.len(), 1);
        assert!(r.modified[0].key().is_empty() && r.modified[0].new.is_dir());
        assert!(r.deleted.is_empty());

        let mut empty = Tree::new();
        empty.digest(false).unwrap();
        let e = diff(Some(&Object::Tree(empty)), Some(&blob), &cache).await.unwrap();
        assert_eq!(e.modified.len(), 1);
        assert!(e.modified[0].old.is_dir() && e.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_diff_with_self_and_none() {
        let cache = ObjectDb::local("/nonexistent-cache", OdbOptions::default());
        let a = tree(&[("x/y", "1"), ("z", "2")]);
        let same = diff(Some(&a), Some(&a), &cache).await.unwrap();
        assert!(!same.has_changes());
        assert_eq!(same.unchanged.len(), 2);

        let added = diff(None, Some(&a), &cache).await.unwrap();
        assert_eq!(added.added.len(), 2);
        assert_eq!(added.stats()["added"], 2);
        let empty = Object::Tree(Tree::new());
        let against_empty = diff(Some(&empty), Some(&a), &cache).await.unwrap();
        assert_eq!(against_empty.added.len(), 2);
        assert!(against_empty.modified.is_empty() && against_empty.deleted.is_empty());
        assert!(!diff(None, None, &cache).await.unwrap().has_changes());
    }
}
