//! Ignore rules applied while walking a directory

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fmt::Debug;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Name of the per-directory ignore file
pub const DEFAULT_IGNORE_FILE: &str = ".hoardignore";

/// Decides which paths a walk skips
pub trait Ignore: Send + Sync + Debug {
    /// Whether `path` (absolute, below the walked root) is excluded
    fn is_ignored(&self, path: &Path, is_dir: bool) -> bool;

    /// File name holding the rules
    fn ignore_file(&self) -> &str {
        DEFAULT_IGNORE_FILE
    }
}

/// Gitignore-flavoured glob rules rooted at one directory.
///
/// Blank lines and `#` comments are skipped. A pattern without `/` matches a
/// name at any depth, a leading `/` anchors it to the root, and a trailing
/// `/` restricts it to directories. Negation is not supported.
#[derive(Debug, Clone)]
pub struct GlobIgnore {
    root: PathBuf,
    patterns: Vec<String>,
    any: GlobSet,
    dirs_only: GlobSet,
}

impl GlobIgnore {
    pub fn new(root: impl Into<PathBuf>, patterns: impl IntoIterator<Item = impl AsRef<str>>) -> Result<Self> {
        let mut any = GlobSetBuilder::new();
        let mut dirs_only = GlobSetBuilder::new();
        let mut kept = Vec::new();

        for line in patterns {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('!') {
                tracing::warn!("negated ignore pattern '{}' is not supported, skipping", line);
                continue;
            }
            let (pattern, dir_only) = match line.strip_suffix('/') {
                Some(p) => (p, true),
                None => (line, false),
            };
            let glob = match pattern.strip_prefix('/') {
                Some(anchored) => anchored.to_string(),
                None if pattern.contains('/') => pattern.to_string(),
                None => format!("**/{}", pattern),
            };
            let glob = Glob::new(&glob)?;
            // a matched directory hides everything below it
            if dir_only {
                dirs_only.add(glob);
            } else {
                any.add(glob);
            }
            kept.push(line.to_string());
        }

        Ok(Self {
            root: root.into(),
            patterns: kept,
            any: any.build()?,
            dirs_only: dirs_only.build()?,
        })
    }

    /// Read `<root>/.hoardignore`, if present
    pub async fn load(root: &Path) -> Result<Option<Self>> {
        let path = root.join(DEFAULT_IGNORE_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(Self::new(root, content.lines())?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Ignore for GlobIgnore {
    fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return false;
        };
        if rel.as_os_str().is_empty() {
            return false;
        }
        self.any.is_match(rel) || (is_dir && self.dirs_only.is_match(rel))
    }
}
