//! JSON state file with write-ahead protection.

use super::PersistenceAdapter;
use crate::error::{Result, StoreError};
use crate::types::{StateTree, StateVersion};
use crate::wal::{WalOperation, WriteAheadLog};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persists the tree as a pretty-printed JSON document.
///
/// Every save goes WAL entry -> temp file -> fsync -> rename -> WAL commit.
/// The state file is therefore always either the previous or the new
/// document, and a crash before the rename is recovered from the WAL.
/// `<file>.wal` and `<file>.lock` live next to the state file; the lock is
/// held exclusively for the adapter's lifetime.
pub struct JsonFileAdapter {
    path: PathBuf,
    wal: WriteAheadLog,
    /// Root key holding the version token, recorded in WAL entries. Set by
    /// the store that opens over this adapter.
    version_key: RwLock<String>,
    /// Serializes saves.
    write_lock: Mutex<()>,
    _lock_file: File,
}

impl JsonFileAdapter {
    /// Open (or prepare) the state file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = Self::acquire_lock(&sibling(&path, "lock"))?;
        let wal = WriteAheadLog::open(sibling(&path, "wal"))?;

        Ok(Self {
            path,
            wal,
            version_key: RwLock::new(crate::store::DEFAULT_VERSION_KEY.to_string()),
            write_lock: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay a pending WAL snapshot into the state file, if one exists.
    fn recover(&self) -> Result<Option<StateTree>> {
        let Some(entry) = self.wal.latest_pending()? else {
            return Ok(None);
        };
        let WalOperation::SaveSnapshot { version, document } = entry.operation else {
            return Ok(None);
        };

        let tree: StateTree = match serde_json::from_slice(&document) {
            Ok(tree) => tree,
            Err(e) => {
                tracing::warn!(seq = entry.seq, error = %e, "discarding unreadable WAL snapshot");
                self.wal.clear()?;
                return Ok(None);
            }
        };

        tracing::info!(seq = entry.seq, version = ?version, "recovering state from write-ahead log");
        self.write_document(&document)?;
        self.wal.commit(entry.seq)?;
        self.wal.clear()?;
        Ok(Some(tree))
    }

    fn version_of(&self, tree: &StateTree) -> Option<String> {
        StateVersion::read(tree, &self.version_key.read()).map(|v| v.0)
    }

    fn write_document(&self, document: &[u8]) -> Result<()> {
        let tmp_path = sibling(&self.path, "tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(document)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn acquire_lock(lock_path: &Path) -> Result<File> {
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl PersistenceAdapter for JsonFileAdapter {
    fn load(&self) -> Result<Option<StateTree>> {
        let _lock = self.write_lock.lock();

        if let Some(tree) = self.recover()? {
            return Ok(Some(tree));
        }

        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&self.path)?;
        let tree = serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::Deserialization(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Some(tree))
    }

    fn save(&self, tree: &StateTree) -> Result<()> {
        let _lock = self.write_lock.lock();

        let document = serde_json::to_vec_pretty(tree)?;

        let seq = self.wal.log(WalOperation::SaveSnapshot {
            version: self.version_of(tree),
            document: document.clone(),
        })?;
        self.write_document(&document)?;
        self.wal.commit(seq)?;
        self.wal.clear()?;

        tracing::debug!(path = %self.path.display(), bytes = document.len(), "state file written");
        Ok(())
    }

    fn set_version_key(&self, key: &str) {
        *self.version_key.write() = key.to_string();
    }
}

/// `state.json` -> `state.json.<suffix>`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("state"));
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn tree(value: Value) -> StateTree {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_missing_file_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let adapter = JsonFileAdapter::open(dir.path().join("state.json")).unwrap();
        assert!(adapter.load().unwrap().is_none());
    }

    #[test]
    fn test_save_writes_two_space_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let adapter = JsonFileAdapter::open(&path).unwrap();

        adapter.save(&tree(json!({"a": {"b": 1}}))).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "{\n  \"a\": {\n    \"b\": 1\n  }\n}");
        assert_eq!(
            adapter.load().unwrap().map(Value::Object),
            Some(json!({"a": {"b": 1}}))
        );
    }

    #[test]
    fn test_second_adapter_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let _first = JsonFileAdapter::open(&path).unwrap();
        let second = JsonFileAdapter::open(&path);
        assert!(matches!(second, Err(StoreError::Locked)));
    }

    #[test]
    fn test_pending_wal_snapshot_is_recovered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        {
            let adapter = JsonFileAdapter::open(&path).unwrap();
            adapter.save(&tree(json!({"n": 1}))).unwrap();
        }

        // Simulate a crash after the WAL append but before the rename.
        {
            let wal = WriteAheadLog::open(sibling(&path, "wal")).unwrap();
            wal.log(WalOperation::SaveSnapshot {
                version: None,
                document: br#"{"n": 2}"#.to_vec(),
            })
            .unwrap();
        }

        let adapter = JsonFileAdapter::open(&path).unwrap();
        assert_eq!(adapter.load().unwrap().map(Value::Object), Some(json!({"n": 2})));

        let on_disk: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, json!({"n": 2}));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{ not json").unwrap();

        let adapter = JsonFileAdapter::open(&path).unwrap();
        assert!(matches!(adapter.load(), Err(StoreError::Deserialization(_))));
    }

    #[test]
    fn test_wal_version_uses_configured_key() {
        let dir = TempDir::new().unwrap();
        let adapter = JsonFileAdapter::open(dir.path().join("state.json")).unwrap();
        let document = tree(json!({"a": 1, "rev": "k9-1"}));

        assert_eq!(adapter.version_of(&document), None);

        adapter.set_version_key("rev");
        assert_eq!(adapter.version_of(&document).as_deref(), Some("k9-1"));
    }

    #[test]
    fn test_empty_wal_does_not_block_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, br#"{"n": 3}"#).unwrap();
        fs::write(sibling(&path, "wal"), b"").unwrap();

        let adapter = JsonFileAdapter::open(&path).unwrap();
        assert_eq!(adapter.load().unwrap().map(Value::Object), Some(json!({"n": 3})));

        adapter.save(&tree(json!({"n": 4}))).unwrap();
        assert_eq!(adapter.load().unwrap().map(Value::Object), Some(json!({"n": 4})));
    }
}
