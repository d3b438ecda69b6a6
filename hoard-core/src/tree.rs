//! Directory trees
//!
//! A [`Tree`] maps path keys (one component per element, the root being the
//! empty key) to `(Meta, HashInfo)` pairs. It digests to a `.dir` hash over a
//! canonical JSON listing, so identical contents always share one object.
//!
//! Entries that point at other trees can be expanded on demand with
//! [`Tree::expand`]. Expanded children are kept apart from the tree's own
//! entries and never take part in its digest.

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fs::{FileSystem, MemoryFileSystem, tmp_fname};
use crate::hash::{Algorithm, DEFAULT_ALGORITHM, hash_bytes};
use crate::hash_info::{HASH_DIR_SUFFIX, HashInfo};
use crate::meta::Meta;
use crate::object::Object;
use crate::odb::ObjectDb;

pub const PARAM_RELPATH: &str = "relpath";

/// Path components of an entry; the root is the empty key
pub type Key = Vec<String>;

/// Value stored for each key
pub type Entry = (Option<Meta>, Option<HashInfo>);

/// Algorithms whose values can appear as entry hashes in a listing
const LISTED_ALGORITHMS: [&str; 3] = ["md5", "sha256", "blake3"];

/// Join a key into a posix-style relative path
pub fn key_to_relpath(key: &[String]) -> String {
    key.join("/")
}

pub fn relpath_to_key(relpath: &str) -> Key {
    relpath.split('/').map(str::to_string).collect()
}

/// State of a nested tree referenced by a `.dir` entry
#[derive(Debug, Clone)]
pub enum Subtree {
    /// Known only by hash; no provider had it
    Unloaded(HashInfo),
    Loaded(Arc<Tree>),
}

#[derive(Debug, Clone)]
pub struct Tree {
    entries: BTreeMap<Key, Entry>,
    /// Children pulled in from loaded subtrees, keyed by full path
    expanded: BTreeMap<Key, Entry>,
    subtrees: BTreeMap<Key, Subtree>,
    hash_name: String,
    pub hash_info: Option<HashInfo>,
    pub fs: Option<Arc<dyn FileSystem>>,
    pub path: Option<PathBuf>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self::with_hash_name(DEFAULT_ALGORITHM)
    }

    /// Empty tree that digests with `hash_name`
    pub fn with_hash_name(hash_name: impl Into<String>) -> Self {
        Self {
            entries: BTreeMap::new(),
            expanded: BTreeMap::new(),
            subtrees: BTreeMap::new(),
            hash_name: hash_name.into(),
            hash_info: None,
            fs: None,
            path: None,
        }
    }

    pub fn hash_name(&self) -> &str {
        &self.hash_name
    }

    pub fn oid(&self) -> Option<&str> {
        self.hash_info.as_ref().and_then(|hi| hi.value.as_deref())
    }

    /// Insert or replace an entry. Invalidates any previous digest.
    pub fn add(&mut self, key: Key, meta: Option<Meta>, hash_info: Option<HashInfo>) {
        self.subtrees.remove(&key);
        self.entries.insert(key, (meta, hash_info));
        self.hash_info = None;
        self.fs = None;
        self.path = None;
    }

    /// Own entry or expanded child at `key`
    pub fn get(&self, key: &[String]) -> Option<&Entry> {
        self.entries.get(key).or_else(|| self.expanded.get(key))
    }

    /// Number of own entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Own entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&Key, Option<&Meta>, Option<&HashInfo>)> {
        self.entries
            .iter()
            .map(|(key, (meta, hi))| (key, meta.as_ref(), hi.as_ref()))
    }

    /// Own entries plus every expanded child, in key order
    pub fn iter_all(&self) -> impl Iterator<Item = (&Key, Option<&Meta>, Option<&HashInfo>)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .chain(self.expanded.iter())
            .map(|(key, (meta, hi))| (key, meta.as_ref(), hi.as_ref()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(b.0));
        all.into_iter()
    }

    pub fn subtree(&self, key: &[String]) -> Option<&Subtree> {
        self.subtrees.get(key)
    }

    /// Load nested trees referenced by `.dir` entries, trying `providers` in
    /// order. Trees nobody has stay unloaded.
    pub async fn expand(&mut self, providers: &[&ObjectDb]) -> Result<()> {
        loop {
            let pending: Vec<(Key, HashInfo)> = self
                .iter_all()
                .filter(|(key, _, _)| !self.subtrees.contains_key(*key))
                .filter_map(|(key, _, hi)| hi.filter(|hi| hi.is_dir()).map(|hi| (key.clone(), hi.clone())))
                .collect();
            if pending.is_empty() {
                return Ok(());
            }

            for (key, hash_info) in pending {
                match try_load(providers, &hash_info).await? {
                    Some(tree) => {
                        for (child, meta, hi) in tree.iter() {
                            let mut full = key.clone();
                            full.extend(child.iter().cloned());
                            if !self.entries.contains_key(&full) {
                                self.expanded.insert(full, (meta.cloned(), hi.cloned()));
                            }
                        }
                        self.subtrees.insert(key, Subtree::Loaded(Arc::new(tree)));
                    }
                    None => {
                        debug!("tree {} is not available, leaving it unexpanded", hash_info);
                        self.subtrees.insert(key, Subtree::Unloaded(hash_info));
                    }
                }
            }
        }
    }

    /// Serializable listing sorted by relative path
    pub fn as_list(&self, with_meta: bool) -> Vec<Value> {
        let mut list: Vec<(String, Map<String, Value>)> = self
            .entries
            .iter()
            .map(|(key, (meta, hi))| {
                let mut map = Map::new();
                if with_meta {
                    if let Some(meta) = meta {
                        map.extend(meta.to_dict());
                    }
                }
                if let Some(hi) = hi {
                    map.extend(listed_hash(hi));
                }
                let relpath = key_to_relpath(key);
                map.insert(PARAM_RELPATH.to_string(), Value::String(relpath.clone()));
                (relpath, map)
            })
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list.into_iter().map(|(_, map)| Value::Object(map)).collect()
    }

    /// Canonical JSON bytes of the listing
    pub fn as_bytes(&self, with_meta: bool) -> Result<Vec<u8>> {
        to_canonical_json(&Value::Array(self.as_list(with_meta)))
    }

    /// Hash the canonical listing and remember the result.
    ///
    /// The hash uses the tree's own algorithm, the one its entries were built
    /// with, rather than the default one.
    ///
    /// The serialized bytes are kept in a private memory filesystem so the
    /// tree can be added to an object database like any other file.
    pub fn digest(&mut self, with_meta: bool) -> Result<HashInfo> {
        let data = self.as_bytes(with_meta)?;
        let algorithm: Algorithm = self.hash_name.parse()?;
        let value = hash_bytes(&data, algorithm);

        let memfs = Arc::new(MemoryFileSystem::new());
        let path = PathBuf::from("/").join(tmp_fname(""));
        memfs.insert(&path, Bytes::from(data));

        let hash_info = HashInfo::new(self.hash_name.clone(), format!("{}{}", value, HASH_DIR_SUFFIX));
        let fs: Arc<dyn FileSystem> = memfs;
        self.fs = Some(fs);
        self.path = Some(path);
        self.hash_info = Some(hash_info.clone());
        Ok(hash_info)
    }

    /// Rebuild a tree from a deserialized listing.
    ///
    /// With `hash_name`, each entry's hash is read from that algorithm's key
    /// (`md5` for `md5-dos2unix`); otherwise from the first known algorithm
    /// key present.
    pub fn from_list(list: &[Value], hash_name: Option<&str>) -> Result<Self> {
        let mut tree = Tree::new();
        let mut detected: Option<String> = None;
        for item in list {
            let Some(entry) = item.as_object() else {
                return Err(Error::ObjectFormat("tree entry is not an object".into()));
            };
            let Some(relpath) = entry.get(PARAM_RELPATH).and_then(Value::as_str) else {
                return Err(Error::ObjectFormat("tree entry has no relpath".into()));
            };
            let key = relpath_to_key(relpath);
            let mut fields = entry.clone();
            fields.remove(PARAM_RELPATH);
            let meta = Meta::from_dict(&fields);

            let hash_info = match hash_name {
                Some(name) => {
                    let field = if name == "md5-dos2unix" { "md5" } else { name };
                    fields
                        .get(field)
                        .and_then(Value::as_str)
                        .map(|value| HashInfo::new(name, value))
                }
                None => LISTED_ALGORITHMS.iter().find_map(|name| {
                    fields
                        .get(*name)
                        .and_then(Value::as_str)
                        .map(|value| HashInfo::new(*name, value))
                }),
            };
            if detected.is_none() {
                detected = hash_info.as_ref().map(|hi| hi.name.clone());
            }
            tree.add(key, Some(meta), hash_info);
        }
        if let Some(name) = hash_name.map(str::to_string).or(detected) {
            tree.hash_name = name;
        }
        Ok(tree)
    }

    /// Read the tree stored in `odb` under `hash_info`.
    ///
    /// A blob that is not a JSON array fails with `ObjectFormat`; it is left
    /// in place for the caller to deal with.
    pub async fn load(odb: &ObjectDb, hash_info: &HashInfo) -> Result<Self> {
        let oid = hash_info
            .value
            .as_deref()
            .ok_or_else(|| Error::ObjectFormat("tree hash has no value".into()))?;
        let obj = odb.get(oid);
        let data = obj.read_bytes().await?;

        let raw: Value = serde_json::from_slice(&data)
            .map_err(|e| Error::ObjectFormat(format!("'{}' is corrupted: {}", obj.path.display(), e)))?;
        let Value::Array(list) = raw else {
            debug!("dir cache file format error '{}' [skipping the file]", obj.path.display());
            return Err(Error::ObjectFormat(format!("'{}' is corrupted", obj.path.display())));
        };

        let hash_name = (odb.hash_name() == "md5-dos2unix").then_some("md5-dos2unix");
        let mut tree = Self::from_list(&list, hash_name)?;
        if tree.is_empty() {
            tree.hash_name = hash_info.name.clone();
        }
        tree.path = Some(obj.path);
        tree.fs = Some(obj.fs);
        tree.hash_info = Some(hash_info.clone());
        Ok(tree)
    }

    /// Copy holding only the entries at or below `prefix`, keeping this
    /// tree's own identity (it is not re-digested)
    pub fn filter(&self, prefix: &[String]) -> Self {
        let mut tree = Tree::with_hash_name(self.hash_name.clone());
        for (key, meta, hi) in self.iter_all() {
            if key.starts_with(prefix) {
                tree.entries.insert(key.clone(), (meta.cloned(), hi.cloned()));
            }
        }
        tree.hash_info = self.hash_info.clone();
        tree.fs = self.fs.clone();
        tree.path = self.path.clone();
        tree
    }

    /// Object at `prefix`: the stored blob if the prefix is an entry, or a
    /// freshly digested tree of everything below it. `None` if nothing is
    /// there.
    pub fn get_obj(&self, odb: &ObjectDb, prefix: &[String]) -> Result<Option<Object>> {
        if let Some((_, Some(hi))) = self.get(prefix) {
            if let Some(value) = hi.value.as_deref() {
                return Ok(Some(Object::Blob(odb.get(value))));
            }
        }

        let mut tree = Tree::with_hash_name(self.hash_name.clone());
        for (key, meta, hi) in self.iter_all() {
            if key.len() > prefix.len() && key.starts_with(prefix) {
                tree.add(key[prefix.len()..].to_vec(), meta.cloned(), hi.cloned());
            }
        }
        if tree.is_empty() {
            return Ok(None);
        }
        tree.digest(false)?;
        Ok(Some(Object::Tree(tree)))
    }

    /// Names directly below `prefix`
    pub fn ls(&self, prefix: &[String]) -> Result<Vec<String>> {
        if let Some((_, Some(hi))) = self.get(prefix) {
            if hi.is_dir() && !matches!(self.subtrees.get(prefix), Some(Subtree::Loaded(_))) {
                return Err(Error::ObjectDb(format!(
                    "'{}' is a tree that has not been loaded",
                    key_to_relpath(prefix)
                )));
            }
        }
        let names: BTreeSet<String> = self
            .iter_all()
            .filter(|(key, _, _)| key.len() > prefix.len() && key.starts_with(prefix))
            .map(|(key, _, _)| key[prefix.len()].clone())
            .collect();
        Ok(names.into_iter().collect())
    }
}

/// Hash fields written for one entry; `md5-dos2unix` is listed as `md5`
fn listed_hash(hi: &HashInfo) -> Map<String, Value> {
    if hi.name == "md5-dos2unix" {
        let mut map = Map::new();
        if let Some(value) = hi.value.as_deref() {
            map.insert("md5".to_string(), Value::String(value.to_string()));
        }
        return map;
    }
    hi.to_dict()
}

async fn try_load(providers: &[&ObjectDb], hash_info: &HashInfo) -> Result<Option<Tree>> {
    for odb in providers {
        match Tree::load(odb, hash_info).await {
            Ok(tree) => return Ok(Some(tree)),
            Err(e) if e.is_not_found() || matches!(e, Error::ObjectFormat(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Sum of stored sizes of every entry, or `None` if any is missing
pub async fn du(odb: &ObjectDb, tree: &Tree) -> Option<u64> {
    let mut total = 0;
    for (_, _, hi) in tree.iter() {
        let value = hi?.value.as_deref()?;
        let obj = odb.get(value);
        total += obj.fs.info(&obj.path).await.ok()?.size;
    }
    Some(total)
}

/// Copy of `ours` taking each entry's meta from `theirs` where both trees
/// agree on the hash
pub fn update_meta(ours: &Tree, theirs: &Tree) -> Tree {
    let mut updated = Tree::with_hash_name(ours.hash_name.clone());
    for (key, meta, hi) in ours.iter() {
        let meta = match (hi, theirs.get(key)) {
            (Some(hi), Some((their_meta, Some(their_hi)))) if hi == their_hi => their_meta.clone(),
            _ => meta.cloned(),
        };
        updated.entries.insert(key.clone(), (meta, hi.cloned()));
    }
    updated.hash_info = ours.hash_info.clone();
    updated.fs = ours.fs.clone();
    updated.path = ours.path.clone();
    updated
}

/// Entries added on top of `ancestor`; anything else is a merge error
fn additions(ancestor: &Tree, other: &Tree) -> Result<BTreeMap<Key, Entry>> {
    for (key, _, hi) in ancestor.iter() {
        match other.entries.get(key) {
            None => {
                return Err(Error::Merge(format!(
                    "diff contains removed file '{}'",
                    key_to_relpath(key)
                )));
            }
            Some((_, other_hi)) if other_hi.as_ref() != hi => {
                return Err(Error::Merge(format!(
                    "diff contains changed file '{}'",
                    key_to_relpath(key)
                )));
            }
            Some(_) => {}
        }
    }
    Ok(other
        .entries
        .iter()
        .filter(|(key, _)| !ancestor.entries.contains_key(*key))
        .map(|(key, entry)| (key.clone(), entry.clone()))
        .collect())
}

/// Three-way merge of two trees that only add files relative to `ancestor`
pub async fn merge(
    odb: &ObjectDb,
    ancestor: Option<&HashInfo>,
    ours: &HashInfo,
    theirs: &HashInfo,
) -> Result<Tree> {
    let ancestor = match ancestor {
        Some(hi) => Tree::load(odb, hi).await?,
        None => Tree::with_hash_name(ours.name.clone()),
    };
    let ours = Tree::load(odb, ours).await?;
    let theirs = Tree::load(odb, theirs).await?;

    let our_adds = additions(&ancestor, &ours)?;
    if our_adds.is_empty() {
        return Ok(theirs);
    }
    let their_adds = additions(&ancestor, &theirs)?;
    if their_adds.is_empty() {
        return Ok(ours);
    }

    let conflicts: Vec<String> = our_adds
        .iter()
        .filter(|(key, (_, hi))| their_adds.get(*key).is_some_and(|(_, other)| other != hi))
        .map(|(key, _)| key_to_relpath(key))
        .collect();
    if !conflicts.is_empty() {
        return Err(Error::Merge(format!(
            "unable to auto-merge the following paths:\n{}",
            conflicts.join("\n")
        )));
    }

    let mut merged = Tree::with_hash_name(ours.hash_name.clone());
    for (key, (meta, hi)) in ancestor.entries.into_iter().chain(our_adds).chain(their_adds) {
        merged.add(key, meta, hi);
    }
    merged.digest(false)?;
    Ok(merged)
}

/// `serde_json` formatter for the canonical listing: `", "` and `": "`
/// separators, with non-ASCII escaped as `\u` sequences
struct CanonicalFormatter;

impl serde_json::ser::Formatter for CanonicalFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if ch.is_ascii() && ch != '\x7f' {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

/// Serialize with sorted keys, `", "`/`": "` separators and ASCII-only output
pub fn to_canonical_json(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter);
    value.serialize(&mut ser)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::odb::OdbOptions;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn key(s: &str) -> Key {
        relpath_to_key(s)
    }

    fn md5(v: &str) -> Option<HashInfo> {
        Some(HashInfo::new("md5", v))
    }

    fn sample() -> Tree {
        let mut tree = Tree::new();
        tree.add(key("sub/b.txt"), Some(Meta::with_size(5)), md5("7d793037a0760186574b0282f2f435e7"));
        tree.add(key("a.txt"), Some(Meta::with_size(5)), md5("5d41402abc4b2a76b9719d911017c592"));
        tree
    }

    #[test]
    fn test_canonical_json_format() {
        let value = json!([{"relpath": "caf\u{e9}", "md5": "x", "size": 3}]);
        let bytes = to_canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"[{"md5": "x", "relpath": "caf\u00e9", "size": 3}]"#
        );
        let bytes = to_canonical_json(&json!(["\u{1f600}\u{7f}"])).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"["\ud83d\ude00\u007f"]"#);
    }

    #[test]
    fn test_as_list_sorted_by_relpath() {
        let mut tree = sample();
        tree.add(key("a-b"), None, md5("00"));
        let relpaths: Vec<_> = tree
            .as_list(false)
            .iter()
            .map(|v| v[PARAM_RELPATH].as_str().unwrap().to_string())
            .collect();
        // string order, not component order
        assert_eq!(relpaths, vec!["a-b", "a.txt", "sub/b.txt"]);
        assert!(tree.as_list(false)[1].get("size").is_none());
        assert_eq!(tree.as_list(true)[1]["size"], json!(5));
    }

    #[test]
    fn test_digest_dir_suffix_and_dos2unix_listing() {
        let mut tree = sample();
        let hi = tree.digest(false).unwrap();
        assert!(hi.is_dir());
        assert_eq!(tree.hash_info.as_ref(), Some(&hi));
        assert!(tree.path.is_some());

        let mut dos = Tree::with_hash_name("md5-dos2unix");
        dos.add(key("f"), None, Some(HashInfo::new("md5-dos2unix", "abc")));
        assert_eq!(dos.as_list(false), vec![json!({"md5": "abc", "relpath": "f"})]);
    }

    #[test]
    fn test_digest_uses_tree_algorithm() {
        let mut tree = Tree::with_hash_name("sha256");
        tree.add(key("f"), None, Some(HashInfo::new("sha256", "ab")));
        let hi = tree.digest(false).unwrap();
        let expected = hash_bytes(&tree.as_bytes(false).unwrap(), Algorithm::Sha256);
        assert_eq!(hi.name, "sha256");
        assert_eq!(hi.value.as_deref(), Some(format!("{expected}.dir").as_str()));
    }

    #[test]
    fn test_add_invalidates_digest() {
        let mut tree = sample();
        let first = tree.digest(false).unwrap();
        tree.add(key("c"), None, md5("cc"));
        assert!(tree.hash_info.is_none());
        assert_ne!(tree.digest(false).unwrap(), first);
    }

    #[test]
    fn test_with_meta_digest_differs() {
        let mut tree = sample();
        let plain = tree.digest(false).unwrap();
        let with_meta = tree.digest(true).unwrap();
        assert_ne!(plain, with_meta);
        assert!(with_meta.is_dir());
    }

    #[test]
    fn test_from_list() {
        let list = vec![
            json!({"md5": "aa", "relpath": "x/y", "size": 2, "isexec": true}),
            json!({"relpath": "z"}),
        ];
        let tree = Tree::from_list(&list, None).unwrap();
        let (meta, hi) = tree.get(&key("x/y")).unwrap();
        assert_eq!(hi.as_ref(), Some(&HashInfo::new("md5", "aa")));
        assert!(meta.as_ref().unwrap().isexec);
        assert_eq!(tree.get(&key("z")).unwrap().1, None);

        let dos = Tree::from_list(&list, Some("md5-dos2unix")).unwrap();
        assert_eq!(dos.hash_name(), "md5-dos2unix");
        assert_eq!(dos.get(&key("x/y")).unwrap().1.as_ref().unwrap().name, "md5-dos2unix");

        assert!(Tree::from_list(&[json!({"md5": "aa"})], None).is_err());
    }

    #[tokio::test]
    async fn test_load_roundtrip_and_corruption() {
        let tmp = TempDir::new().unwrap();
        let odb = ObjectDb::local(tmp.path(), OdbOptions::default());
        let mut tree = sample();
        let hi = tree.digest(false).unwrap();
        let data = tree.as_bytes(false).unwrap();
        odb.add_bytes(hi.value.as_deref().unwrap(), Bytes::from(data)).await.unwrap();

        let loaded = Tree::load(&odb, &hi).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(&key("a.txt")).unwrap().1, tree.get(&key("a.txt")).unwrap().1);
        assert_eq!(loaded.hash_info, Some(hi));

        odb.add_bytes("ffff.dir", Bytes::from_static(b"{\"not\": \"a list\"}")).await.unwrap();
        let err = Tree::load(&odb, &HashInfo::new("md5", "ffff.dir")).await.unwrap_err();
        assert!(matches!(err, Error::ObjectFormat(_)));
        assert!(odb.exists("ffff.dir").await);
    }

    #[tokio::test]
    async fn test_expand_and_ls() {
        let tmp = TempDir::new().unwrap();
        let odb = ObjectDb::local(tmp.path(), OdbOptions::default());
        let mut inner = Tree::new();
        inner.add(key("b.txt"), None, md5("bb"));
        let inner_hi = inner.digest(false).unwrap();
        odb.add_bytes(inner_hi.value.as_deref().unwrap(), Bytes::from(inner.as_bytes(false).unwrap()))
            .await
            .unwrap();

        let mut outer = Tree::new();
        outer.add(key("a.txt"), None, md5("aa"));
        outer.add(key("sub"), None, Some(inner_hi.clone()));
        outer.add(key("gone"), None, Some(HashInfo::new("md5", "0000.dir")));
        let digest = outer.digest(false).unwrap();

        assert!(outer.ls(&key("sub")).is_err());
        outer.expand(&[&odb]).await.unwrap();
        assert_eq!(outer.ls(&key("sub")).unwrap(), vec!["b.txt"]);
        assert_eq!(outer.ls(&[]).unwrap(), vec!["a.txt", "gone", "sub"]);
        assert!(matches!(outer.subtree(&key("gone")), Some(Subtree::Unloaded(_))));
        assert!(outer.get(&key("sub/b.txt")).is_some());
        assert_eq!(outer.len(), 3);
        // expansion does not change identity
        assert_eq!(outer.digest(false).unwrap(), digest);
    }

    #[test]
    fn test_filter_keeps_identity() {
        let mut tree = sample();
        let hi = tree.digest(false).unwrap();
        let filtered = tree.filter(&key("sub"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.hash_info, Some(hi));
        assert!(tree.filter(&key("nope")).is_empty());
    }

    #[test]
    fn test_get_obj() {
        let odb = ObjectDb::local("/cache", OdbOptions::default());
        let tree = sample();
        let blob = tree.get_obj(&odb, &key("a.txt")).unwrap().unwrap();
        assert_eq!(blob.oid(), Some("5d41402abc4b2a76b9719d911017c592"));

        let sub = tree.get_obj(&odb, &key("sub")).unwrap().unwrap();
        let sub = sub.as_tree().unwrap();
        assert_eq!(sub.len(), 1);
        assert!(sub.get(&key("b.txt")).is_some());
        assert!(tree.get_obj(&odb, &key("missing")).unwrap().is_none());
    }

    #[test]
    fn test_update_meta() {
        let ours = sample();
        let mut theirs = Tree::new();
        let mut meta = Meta::with_size(5);
        meta.isexec = true;
        theirs.add(key("a.txt"), Some(meta), md5("5d41402abc4b2a76b9719d911017c592"));
        theirs.add(key("sub/b.txt"), Some(Meta::with_size(9)), md5("different"));

        let updated = update_meta(&ours, &theirs);
        assert!(updated.get(&key("a.txt")).unwrap().0.as_ref().unwrap().isexec);
        assert_eq!(updated.get(&key("sub/b.txt")).unwrap().0.as_ref().unwrap().size, Some(5));
    }

    async fn store(odb: &ObjectDb, entries: &[(&str, &str)]) -> HashInfo {
        let mut tree = Tree::new();
        for (k, v) in entries {
            tree.add(key(k), None, md5(v));
        }
        let hi = tree.digest(false).unwrap();
        odb.add_bytes(hi.value.as_deref().unwrap(), Bytes::from(tree.as_bytes(false).unwrap()))
            .await
            .unwrap();
        hi
    }

    #[tokio::test]
    async fn test_merge_additions() {
        let tmp = TempDir::new().unwrap();
        let odb = ObjectDb::local(tmp.path(), OdbOptions::default());
        let base = store(&odb, &[("a", "1")]).await;
        let ours = store(&odb, &[("a", "1"), ("b", "2")]).await;
        let theirs = store(&odb, &[("a", "1"), ("c", "3")]).await;

        let merged = merge(&odb, Some(&base), &ours, &theirs).await.unwrap();
        assert_eq!(merged.ls(&[]).unwrap(), vec!["a", "b", "c"]);
        assert!(merged.hash_info.as_ref().unwrap().is_dir());

        let same = merge(&odb, Some(&base), &base, &theirs).await.unwrap();
        assert_eq!(same.hash_info, Some(theirs.clone()));
    }

    #[tokio::test]
    async fn test_merge_conflicts() {
        let tmp = TempDir::new().unwrap();
        let odb = ObjectDb::local(tmp.path(), OdbOptions::default());
        let base = store(&odb, &[("a", "1")]).await;
        let removed = store(&odb, &[("b", "2")]).await;
        let ours = store(&odb, &[("a", "1"), ("b", "2")]).await;
        let theirs = store(&odb, &[("a", "1"), ("b", "3")]).await;

        assert!(matches!(merge(&odb, Some(&base), &removed, &ours).await, Err(Error::Merge(_))));
        assert!(matches!(merge(&odb, Some(&base), &ours, &theirs).await, Err(Error::Merge(_))));
    }

    fn entries_strategy() -> impl Strategy<Value = (Vec<(String, String)>, Vec<(String, String)>)> {
        prop::collection::btree_map("[a-z]{1,6}(/[a-z]{1,6})?", "[0-9a-f]{32}", 1..24).prop_flat_map(|map| {
            let entries: Vec<_> = map.into_iter().collect();
            (Just(entries.clone()), Just(entries).prop_shuffle())
        })
    }

    proptest! {
        #[test]
        fn prop_digest_ignores_insertion_order((ordered, shuffled) in entries_strategy()) {
            let build = |entries: &[(String, String)]| {
                let mut tree = Tree::new();
                for (path, oid) in entries {
                    tree.add(relpath_to_key(path), Some(Meta::with_size(1)), md5(oid));
                }
                tree.digest(false).unwrap()
            };
            prop_assert_eq!(build(&ordered), build(&shuffled));
        }
    }
}
