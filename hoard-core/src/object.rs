//! Object handles
//!
//! A stored object is either a plain file (`Blob`) or a serialized directory
//! listing (`Tree`). Handles are cheap to clone and never own the bytes.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::hash_info::HashInfo;
use crate::tree::Tree;

/// Handle to one stored file
#[derive(Debug, Clone)]
pub struct HashFile {
    pub path: PathBuf,
    pub fs: Arc<dyn FileSystem>,
    pub hash_info: HashInfo,
}

impl HashFile {
    pub fn new(path: impl Into<PathBuf>, fs: Arc<dyn FileSystem>, hash_info: HashInfo) -> Self {
        Self {
            path: path.into(),
            fs,
            hash_info,
        }
    }

    pub fn oid(&self) -> &str {
        self.hash_info.value.as_deref().unwrap_or_default()
    }

    pub async fn read_bytes(&self) -> Result<Bytes> {
        self.fs
            .read_bytes(&self.path)
            .await
            .map_err(|e| Error::from_io(e, &self.path))
    }
}

/// Either kind of stored object
#[derive(Debug, Clone)]
pub enum Object {
    Blob(HashFile),
    Tree(Tree),
}

impl Object {
    pub fn hash_info(&self) -> Option<&HashInfo> {
        match self {
            Object::Blob(file) => Some(&file.hash_info),
            Object::Tree(tree) => tree.hash_info.as_ref(),
        }
    }

    pub fn oid(&self) -> Option<&str> {
        self.hash_info().and_then(|hi| hi.value.as_deref())
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Object::Blob(file) => Some(&file.path),
            Object::Tree(tree) => tree.path.as_deref(),
        }
    }

    pub fn fs(&self) -> Option<&Arc<dyn FileSystem>> {
        match self {
            Object::Blob(file) => Some(&file.fs),
            Object::Tree(tree) => tree.fs.as_ref(),
        }
    }

    pub fn as_tree(&self) -> Option<&Tree> {
        match self {
            Object::Tree(tree) => Some(tree),
            Object::Blob(_) => None,
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, Object::Tree(_))
    }

    /// Handle to the raw serialized bytes of this object
    pub fn as_hash_file(&self) -> Option<HashFile> {
        match self {
            Object::Blob(file) => Some(file.clone()),
            Object::Tree(tree) => Some(HashFile::new(
                tree.path.clone()?,
                tree.fs.clone()?,
                tree.hash_info.clone()?,
            )),
        }
    }
}

impl From<HashFile> for Object {
    fn from(file: HashFile) -> Self {
        Object::Blob(file)
    }
}

impl From<Tree> for Object {
    fn from(tree: Tree) -> Self {
        Object::Tree(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use crate::meta::Meta;

    #[tokio::test]
    async fn test_blob_accessors() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.insert(Path::new("/5d/41402abc4b2a76b9719d911017c592"), Bytes::from_static(b"hello"));
        let file = HashFile::new(
            "/5d/41402abc4b2a76b9719d911017c592",
            fs,
            HashInfo::new("md5", "5d41402abc4b2a76b9719d911017c592"),
        );
        assert_eq!(file.read_bytes().await.unwrap().as_ref(), b"hello");

        let obj = Object::from(file);
        assert_eq!(obj.oid(), Some("5d41402abc4b2a76b9719d911017c592"));
        assert!(!obj.is_tree());
    }

    #[test]
    fn test_tree_accessors_after_digest() {
        let mut tree = Tree::new();
        assert!(Object::from(tree.clone()).oid().is_none());
        tree.add(vec!["a".into()], Some(Meta::with_size(1)), Some(HashInfo::new("md5", "aa")));
        tree.digest(false).unwrap();
        let obj = Object::from(tree);
        assert!(obj.oid().unwrap().ends_with(".dir"));
        assert!(obj.as_hash_file().is_some());
    }
}
