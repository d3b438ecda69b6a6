//! Per-entry metadata

use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::fs::FileInfo;

/// Whether any execute bit is set in `mode`
pub fn is_exec(mode: u32) -> bool {
    mode & 0o111 != 0
}

/// Metadata attached to a tree entry or a built object.
///
/// Link details (`is_link`, `destination`, `nlink`) describe how the entry
/// happened to be stored and do not take part in equality.
#[derive(Debug, Clone, Default)]
pub struct Meta {
    pub isdir: bool,
    pub size: Option<u64>,
    pub nfiles: Option<u64>,
    pub isexec: bool,
    pub version_id: Option<String>,
    pub etag: Option<String>,
    pub checksum: Option<String>,
    pub md5: Option<String>,
    pub inode: Option<u64>,
    pub mtime_ns: Option<i64>,
    pub is_link: bool,
    pub destination: Option<PathBuf>,
    pub nlink: u64,
}

impl Meta {
    pub const PARAM_ISDIR: &'static str = "isdir";
    pub const PARAM_SIZE: &'static str = "size";
    pub const PARAM_NFILES: &'static str = "nfiles";
    pub const PARAM_ISEXEC: &'static str = "isexec";
    pub const PARAM_VERSION_ID: &'static str = "version_id";
    pub const PARAM_ETAG: &'static str = "etag";
    pub const PARAM_CHECKSUM: &'static str = "checksum";
    pub const PARAM_MD5: &'static str = "md5";

    pub fn with_size(size: u64) -> Self {
        Self {
            size: Some(size),
            nlink: 1,
            ..Default::default()
        }
    }

    /// Metadata of a built directory
    pub fn directory(size: u64, nfiles: u64) -> Self {
        Self {
            isdir: true,
            nfiles: Some(nfiles),
            ..Self::with_size(size)
        }
    }

    pub fn from_info(info: &FileInfo) -> Self {
        Self {
            isdir: info.is_dir(),
            size: Some(info.size),
            nfiles: None,
            isexec: is_exec(info.mode),
            version_id: info.version_id.clone(),
            etag: info.etag.clone(),
            checksum: info.checksum.clone(),
            md5: info.md5.clone(),
            inode: info.inode,
            mtime_ns: info.mtime_ns,
            is_link: info.is_symlink,
            destination: info.destination.clone(),
            nlink: info.nlink,
        }
    }

    /// Serialized fields, only those that are set
    pub fn to_dict(&self) -> Map<String, Value> {
        let mut ret = Map::new();
        if self.isdir {
            ret.insert(Self::PARAM_ISDIR.into(), Value::Bool(true));
        }
        if let Some(size) = self.size {
            ret.insert(Self::PARAM_SIZE.into(), size.into());
        }
        if let Some(nfiles) = self.nfiles {
            ret.insert(Self::PARAM_NFILES.into(), nfiles.into());
        }
        if self.isexec {
            ret.insert(Self::PARAM_ISEXEC.into(), Value::Bool(true));
        }
        let strings = [
            (Self::PARAM_VERSION_ID, &self.version_id),
            (Self::PARAM_ETAG, &self.etag),
            (Self::PARAM_CHECKSUM, &self.checksum),
            (Self::PARAM_MD5, &self.md5),
        ];
        for (key, value) in strings {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                ret.insert(key.into(), Value::String(v.to_string()));
            }
        }
        ret
    }

    /// Read the known fields of `dict`, ignoring everything else
    pub fn from_dict(dict: &Map<String, Value>) -> Self {
        let string = |key: &str| dict.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            isdir: dict.get(Self::PARAM_ISDIR).and_then(Value::as_bool).unwrap_or(false),
            size: dict.get(Self::PARAM_SIZE).and_then(Value::as_u64),
            nfiles: dict.get(Self::PARAM_NFILES).and_then(Value::as_u64),
            isexec: dict.get(Self::PARAM_ISEXEC).and_then(Value::as_bool).unwrap_or(false),
            version_id: string(Self::PARAM_VERSION_ID),
            etag: string(Self::PARAM_ETAG),
            checksum: string(Self::PARAM_CHECKSUM),
            md5: string(Self::PARAM_MD5),
            nlink: 1,
            ..Default::default()
        }
    }

    #[allow(clippy::type_complexity)]
    fn key(
        &self,
    ) -> (
        bool,
        Option<u64>,
        Option<u64>,
        bool,
        &Option<String>,
        &Option<String>,
        &Option<String>,
        &Option<String>,
        Option<u64>,
        Option<i64>,
    ) {
        (
            self.isdir,
            self.size,
            self.nfiles,
            self.isexec,
            &self.version_id,
            &self.etag,
            &self.checksum,
            &self.md5,
            self.inode,
            self.mtime_ns,
        )
    }
}

impl PartialEq for Meta {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Meta {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_dict_only_set_fields() {
        let meta = Meta::with_size(5);
        let dict = meta.to_dict();
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get("size"), Some(&Value::from(5)));

        let dir = Meta::directory(10, 2);
        let dict = dir.to_dict();
        assert_eq!(dict.get("isdir"), Some(&Value::Bool(true)));
        assert_eq!(dict.get("nfiles"), Some(&Value::from(2)));
        assert_eq!(Meta::from_dict(&dict), dir);
    }

    #[test]
    fn test_link_fields_ignored_by_equality() {
        let a = Meta::with_size(3);
        let b = Meta {
            is_link: true,
            destination: Some(PathBuf::from("/elsewhere")),
            nlink: 4,
            ..Meta::with_size(3)
        };
        assert_eq!(a, b);
        assert_ne!(a, Meta::with_size(4));
    }

    #[test]
    fn test_from_info_exec_bit() {
        let mut info = FileInfo::file(7);
        info.mode = 0o100755;
        let meta = Meta::from_info(&info);
        assert!(meta.isexec);
        assert_eq!(meta.size, Some(7));
        assert!(!meta.isdir);
    }
}
