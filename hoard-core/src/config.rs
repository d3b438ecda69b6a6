//! Hoard directory configuration
//!
//! A hoard directory (default `.hoard/`) holds `config.json`, the object
//! cache under `cache/` and the state database under `tmp/state.db`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::fs::LinkType;
use crate::hash::DEFAULT_ALGORITHM;

/// Default name of the hoard directory inside a workspace
pub const DEFAULT_DIR: &str = ".hoard";
pub const CONFIG_FILE: &str = "config.json";
pub const CACHE_DIR: &str = "cache";
pub const TMP_DIR: &str = "tmp";
pub const STATE_DB: &str = "state.db";

fn default_link_types() -> Vec<LinkType> {
    vec![LinkType::Reflink, LinkType::Copy]
}

fn default_hash() -> String {
    DEFAULT_ALGORITHM.to_string()
}

fn default_true() -> bool {
    true
}

/// Object cache settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Link strategies tried in order during checkout
    #[serde(rename = "type", default = "default_link_types")]
    pub link_types: Vec<LinkType>,
    /// Hash algorithm name for new objects
    #[serde(default = "default_hash")]
    pub hash: String,
    /// Re-hash objects when they are added
    #[serde(default)]
    pub verify: bool,
    /// Group-writable object modes
    #[serde(default)]
    pub shared: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            link_types: default_link_types(),
            hash: default_hash(),
            verify: false,
            shared: false,
        }
    }
}

/// Contents of `config.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    /// Transfer pool size; defaults to a multiple of the CPU count
    #[serde(default)]
    pub jobs: Option<usize>,
    /// Hashing pool size
    #[serde(default)]
    pub checksum_jobs: Option<usize>,
    /// Keep the checksum state database
    #[serde(default = "default_true")]
    pub state: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            jobs: None,
            checksum_jobs: None,
            state: true,
        }
    }
}

impl Config {
    /// Load `<root>/config.json`, falling back to defaults when it is missing
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Write `<root>/config.json` atomically
    pub fn save(&self, root: &Path) -> Result<()> {
        std::fs::create_dir_all(root)?;
        let path = root.join(CONFIG_FILE);
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Transfer pool size
    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or_else(|| 4 * cpu_count())
    }

    /// Hashing pool size
    pub fn checksum_jobs(&self) -> usize {
        self.checksum_jobs.unwrap_or_else(default_checksum_jobs)
    }
}

pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// `min(16, cpus + 4)`
pub fn default_checksum_jobs() -> usize {
    (cpu_count() + 4).min(16)
}

pub fn cache_dir(root: &Path) -> PathBuf {
    root.join(CACHE_DIR)
}

pub fn state_db_path(root: &Path) -> PathBuf {
    root.join(TMP_DIR).join(STATE_DB)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(tmp.path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.cache.link_types, vec![LinkType::Reflink, LinkType::Copy]);
        assert_eq!(config.cache.hash, "md5");
        assert!(config.state);
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.cache.link_types = vec![LinkType::Hardlink, LinkType::Copy];
        config.cache.shared = true;
        config.jobs = Some(3);
        config.save(tmp.path()).unwrap();

        let loaded = Config::load(tmp.path()).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.jobs(), 3);
        assert!(!tmp.path().join("config.tmp").exists());
    }

    #[test]
    fn test_partial_config() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), r#"{"cache": {"type": ["symlink"]}}"#).unwrap();
        let config = Config::load(tmp.path()).unwrap();
        assert_eq!(config.cache.link_types, vec![LinkType::Symlink]);
        assert_eq!(config.cache.hash, "md5");
        assert!(config.checksum_jobs() <= 16);
    }
}
