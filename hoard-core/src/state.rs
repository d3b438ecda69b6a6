//! Persistent checksum cache
//!
//! Maps an absolute local path plus its (inode, mtime, size) fingerprint to
//! the hash computed last time, so unchanged files are not re-read. Also
//! tracks which workspace files were created by checkout.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::Result;
use crate::fs::{FileInfo, FileSystem, LOCAL_PROTOCOL};
use crate::hash::{Algorithm, hash_bytes};
use crate::hash_info::HashInfo;
use crate::meta::Meta;

/// Format version of stored rows
pub const HASH_VERSION: u32 = 1;

/// Checksum side-table consulted by hashing, building and checkout
pub trait StateCache: Send + Sync + Debug {
    fn get(&self, path: &Path, fs: &dyn FileSystem, info: &FileInfo) -> Result<Option<(Meta, HashInfo)>>;

    fn save(&self, path: &Path, fs: &dyn FileSystem, hash_info: &HashInfo, info: &FileInfo) -> Result<()>;

    fn save_many(&self, items: &[(PathBuf, HashInfo, FileInfo)], fs: &dyn FileSystem) -> Result<()> {
        for (path, hash_info, info) in items {
            self.save(path, fs, hash_info, info)?;
        }
        Ok(())
    }

    /// Record `path` as a file materialized by checkout
    fn save_link(&self, path: &Path, fs: &dyn FileSystem) -> Result<()>;

    /// Recorded links not in `used` that are still untouched on disk
    fn get_unused_links(&self, used: &[PathBuf], fs: &dyn FileSystem) -> Result<Vec<PathBuf>>;

    /// Delete the given links from disk and from the table
    fn remove_links(&self, unused: &[PathBuf], fs: &dyn FileSystem) -> Result<()>;
}

/// State cache that remembers nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct StateNoop;

impl StateCache for StateNoop {
    fn get(&self, _path: &Path, _fs: &dyn FileSystem, _info: &FileInfo) -> Result<Option<(Meta, HashInfo)>> {
        Ok(None)
    }

    fn save(&self, _path: &Path, _fs: &dyn FileSystem, _hash_info: &HashInfo, _info: &FileInfo) -> Result<()> {
        Ok(())
    }

    fn save_link(&self, _path: &Path, _fs: &dyn FileSystem) -> Result<()> {
        Ok(())
    }

    fn get_unused_links(&self, _used: &[PathBuf], _fs: &dyn FileSystem) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    fn remove_links(&self, _unused: &[PathBuf], _fs: &dyn FileSystem) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    version: Option<u32>,
    checksum: String,
    size: u64,
    hash_info: serde_json::Map<String, serde_json::Value>,
}

/// Fingerprint derived from inode, mtime and size
pub fn fingerprint(info: &FileInfo) -> String {
    let token = format!(
        "[{}, {}, {}]",
        info.inode.unwrap_or(0),
        info.mtime_ns.unwrap_or(0),
        info.size
    );
    let digest = hash_bytes(token.as_bytes(), Algorithm::Md5);
    u128::from_str_radix(&digest, 16)
        .map(|v| v.to_string())
        .unwrap_or(digest)
}

fn local_info(path: &Path) -> std::io::Result<(u64, i64)> {
    let meta = std::fs::symlink_metadata(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Ok((meta.ino(), meta.mtime() * 1_000_000_000 + meta.mtime_nsec()))
    }
    #[cfg(not(unix))]
    {
        let mtime = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Ok((0, mtime))
    }
}

fn open_state_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS hashes (
            path TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS links (
            path TEXT PRIMARY KEY,
            inode INTEGER NOT NULL,
            mtime INTEGER NOT NULL
        );",
    )?;
    Ok(conn)
}

/// sqlite-backed state cache for local files
#[derive(Debug)]
pub struct SqliteState {
    root_dir: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteState {
    /// Open (or create) the database at `db_path`. Link paths are stored
    /// relative to `root_dir`.
    pub fn open(root_dir: impl Into<PathBuf>, db_path: &Path) -> Result<Self> {
        let conn = open_state_db(db_path)?;
        Ok(Self {
            root_dir: root_dir.into(),
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key(path: &Path) -> String {
        std::path::absolute(path)
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned()
    }

    fn encode(hash_info: &HashInfo, info: &FileInfo) -> Result<String> {
        let entry = Entry {
            version: Some(HASH_VERSION),
            checksum: fingerprint(info),
            size: info.size,
            hash_info: hash_info.to_dict(),
        };
        Ok(serde_json::to_string(&entry)?)
    }

    fn decode(raw: &str, info: &FileInfo) -> Option<(Meta, HashInfo)> {
        let entry: Entry = serde_json::from_str(raw).ok()?;
        if entry.checksum != fingerprint(info) {
            return None;
        }
        if entry.version.is_some_and(|v| v > HASH_VERSION) {
            return None;
        }
        let meta = Meta::from_info(info);
        let mut hash_info = HashInfo::from_dict(&entry.hash_info)?;
        // rows without a version predate the md5/md5-dos2unix split
        if entry.version.is_none() && hash_info.name == "md5" {
            hash_info.name = "md5-dos2unix".to_string();
        }
        Some((meta, hash_info))
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

impl StateCache for SqliteState {
    fn get(&self, path: &Path, fs: &dyn FileSystem, info: &FileInfo) -> Result<Option<(Meta, HashInfo)>> {
        if fs.protocol() != LOCAL_PROTOCOL {
            return Ok(None);
        }
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM hashes WHERE path = ?1",
                params![Self::key(path)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|raw| Self::decode(&raw, info)))
    }

    fn save(&self, path: &Path, fs: &dyn FileSystem, hash_info: &HashInfo, info: &FileInfo) -> Result<()> {
        if fs.protocol() != LOCAL_PROTOCOL {
            return Ok(());
        }
        let value = Self::encode(hash_info, info)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO hashes (path, value) VALUES (?1, ?2)",
            params![Self::key(path), value],
        )?;
        Ok(())
    }

    fn save_many(&self, items: &[(PathBuf, HashInfo, FileInfo)], fs: &dyn FileSystem) -> Result<()> {
        if fs.protocol() != LOCAL_PROTOCOL || items.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT OR REPLACE INTO hashes (path, value) VALUES (?1, ?2)")?;
            for (path, hash_info, info) in items {
                stmt.execute(params![Self::key(path), Self::encode(hash_info, info)?])?;
            }
        }
        tx.commit()?;
        debug!("saved {} state entries", items.len());
        Ok(())
    }

    fn save_link(&self, path: &Path, fs: &dyn FileSystem) -> Result<()> {
        if fs.protocol() != LOCAL_PROTOCOL {
            return Ok(());
        }
        let (inode, mtime) = match local_info(path) {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.conn().execute(
            "INSERT OR REPLACE INTO links (path, inode, mtime) VALUES (?1, ?2, ?3)",
            params![self.relative(path), inode as i64, mtime],
        )?;
        Ok(())
    }

    fn get_unused_links(&self, used: &[PathBuf], fs: &dyn FileSystem) -> Result<Vec<PathBuf>> {
        if fs.protocol() != LOCAL_PROTOCOL {
            return Ok(Vec::new());
        }
        let rows: Vec<(String, i64, i64)> = {
            let conn = self.conn();
            let mut stmt = conn.prepare("SELECT path, inode, mtime FROM links")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let mut unused = Vec::new();
        for (relative, inode, mtime) in rows {
            let path = self.root_dir.join(&relative);
            if used.contains(&path) {
                continue;
            }
            let Ok((cur_inode, cur_mtime)) = local_info(&path) else {
                continue;
            };
            if cur_inode as i64 == inode && cur_mtime == mtime {
                debug!("removing '{}' as unused link", path.display());
                unused.push(PathBuf::from(relative));
            }
        }
        Ok(unused)
    }

    fn remove_links(&self, unused: &[PathBuf], fs: &dyn FileSystem) -> Result<()> {
        if fs.protocol() != LOCAL_PROTOCOL {
            return Ok(());
        }
        for relative in unused {
            let path = self.root_dir.join(relative);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for relative in unused {
            tx.execute(
                "DELETE FROM links WHERE path = ?1",
                params![relative.to_string_lossy()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{LocalFileSystem, MemoryFileSystem};
    use tempfile::TempDir;

    async fn stat(path: &Path) -> FileInfo {
        LocalFileSystem::new().info(path).await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_and_invalidation() {
        let tmp = TempDir::new().unwrap();
        let state = SqliteState::open(tmp.path(), &tmp.path().join("tmp").join("state.db")).unwrap();
        let fs = LocalFileSystem::new();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"hello").unwrap();
        let info = stat(&file).await;
        let hi = HashInfo::new("md5", "5d41402abc4b2a76b9719d911017c592");

        assert!(state.get(&file, &fs, &info).unwrap().is_none());
        state.save(&file, &fs, &hi, &info).unwrap();
        let (meta, cached) = state.get(&file, &fs, &info).unwrap().unwrap();
        assert_eq!(cached, hi);
        assert_eq!(meta.size, Some(5));

        let mut changed = info.clone();
        changed.size = 6;
        assert!(state.get(&file, &fs, &changed).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ignores_non_local_backends() {
        let tmp = TempDir::new().unwrap();
        let state = SqliteState::open(tmp.path(), &tmp.path().join("state.db")).unwrap();
        let fs = MemoryFileSystem::new();
        let info = FileInfo::file(1);
        let path = Path::new("/m");
        state.save(path, &fs, &HashInfo::new("md5", "x"), &info).unwrap();
        assert!(state.get(path, &fs, &info).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_many_is_persistent() {
        let tmp = TempDir::new().unwrap();
        let db = tmp.path().join("state.db");
        let fs = LocalFileSystem::new();
        let file = tmp.path().join("a");
        std::fs::write(&file, b"a").unwrap();
        let info = stat(&file).await;
        {
            let state = SqliteState::open(tmp.path(), &db).unwrap();
            state
                .save_many(&[(file.clone(), HashInfo::new("md5", "abc"), info.clone())], &fs)
                .unwrap();
        }
        let state = SqliteState::open(tmp.path(), &db).unwrap();
        let (_, hi) = state.get(&file, &fs, &info).unwrap().unwrap();
        assert_eq!(hi.value.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_unused_links() {
        let tmp = TempDir::new().unwrap();
        let state = SqliteState::open(tmp.path(), &tmp.path().join("state.db")).unwrap();
        let fs = LocalFileSystem::new();
        let kept = tmp.path().join("kept");
        let stale = tmp.path().join("stale");
        std::fs::write(&kept, b"k").unwrap();
        std::fs::write(&stale, b"s").unwrap();
        state.save_link(&kept, &fs).unwrap();
        state.save_link(&stale, &fs).unwrap();

        let unused = state.get_unused_links(&[kept.clone()], &fs).unwrap();
        assert_eq!(unused, vec![PathBuf::from("stale")]);
        state.remove_links(&unused, &fs).unwrap();
        assert!(!stale.exists());
        assert!(kept.exists());
        assert_eq!(state.get_unused_links(&[], &fs).unwrap(), vec![PathBuf::from("kept")]);
    }

    #[test]
    fn test_noop() {
        let fs = MemoryFileSystem::new();
        let info = FileInfo::file(0);
        assert!(StateNoop.get(Path::new("/x"), &fs, &info).unwrap().is_none());
    }
}
