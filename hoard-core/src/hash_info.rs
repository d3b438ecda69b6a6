//! Hash identifiers
//!
//! A [`HashInfo`] names the algorithm and the hex value of a content hash.
//! Values ending in [`HASH_DIR_SUFFIX`] identify serialized trees.

use serde_json::{Map, Value};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Suffix appended to the digest of a serialized tree
pub const HASH_DIR_SUFFIX: &str = ".dir";

/// Algorithm name plus hash value
///
/// Equality and hashing only consider `(name, value)`. The `native` flag marks
/// values taken from a backend-provided checksum instead of being computed
/// here, so callers can tell the two apart when they differ semantically.
#[derive(Debug, Clone, Default)]
pub struct HashInfo {
    pub name: String,
    pub value: Option<String>,
    pub native: bool,
}

impl HashInfo {
    /// Create a computed hash info
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            native: false,
        }
    }

    /// Create a hash info taken from backend metadata
    pub fn native(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            native: true,
            ..Self::new(name, value)
        }
    }

    /// A hash info with no value
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            native: false,
        }
    }

    /// Whether a value is present
    pub fn is_set(&self) -> bool {
        self.value.as_deref().is_some_and(|v| !v.is_empty())
    }

    /// Whether this identifies a serialized tree
    pub fn is_dir(&self) -> bool {
        self.value
            .as_deref()
            .is_some_and(|v| v.ends_with(HASH_DIR_SUFFIX))
    }

    /// The value without the `.dir` suffix
    pub fn as_raw(&self) -> Self {
        let value = self.value.as_deref().map(|v| {
            v.rsplit_once(HASH_DIR_SUFFIX)
                .map(|(raw, _)| raw)
                .unwrap_or(v)
                .to_string()
        });
        Self {
            name: self.name.clone(),
            value,
            native: self.native,
        }
    }

    /// `{"<name>": "<value>"}`, or an empty map when unset
    pub fn to_dict(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(value) = self.value.as_deref().filter(|v| !v.is_empty()) {
            if !self.name.is_empty() {
                map.insert(self.name.clone(), Value::String(value.to_string()));
            }
        }
        map
    }

    /// Inverse of [`HashInfo::to_dict`]; expects at most one entry
    pub fn from_dict(map: &Map<String, Value>) -> Option<Self> {
        let mut iter = map.iter();
        let (name, value) = iter.next()?;
        if iter.next().is_some() {
            return None;
        }
        Some(Self::new(name.clone(), value.as_str()?))
    }
}

impl PartialEq for HashInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}

impl Eq for HashInfo {}

impl Hash for HashInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.value.hash(state);
    }
}

impl PartialOrd for HashInfo {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HashInfo {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.name, &self.value).cmp(&(&other.name, &other.value))
    }
}

impl fmt::Display for HashInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value.as_deref().unwrap_or(""))
    }
}
