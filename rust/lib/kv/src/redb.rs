use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

use redb::backends::InMemoryBackend;
use redb::{Database, TableDefinition};
use tracing::debug;

use crate::error::KVError;
use crate::traits::KVStore;

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

fn storage(e: impl Display) -> KVError {
    KVError::Storage(e.to_string())
}

/// RedbStore is a KVStore implementation backed by redb, a pure-Rust embedded
/// key-value database with single-writer, fully durable commits.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a redb database at the given path.
    pub fn open(path: &Path) -> Result<Self, KVError> {
        let db = Database::create(path).map_err(storage)?;
        debug!("opened redb store at {}", path.display());
        Self::init(db)
    }

    /// Create a database that lives only in memory (useful for tests).
    pub fn open_in_memory() -> Result<Self, KVError> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(storage)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, KVError> {
        // Ensure the table exists so read transactions can open it.
        let write_txn = db.begin_write().map_err(storage)?;
        {
            let _table = write_txn.open_table(TABLE).map_err(storage)?;
        }
        write_txn.commit().map_err(storage)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl KVStore for RedbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KVError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(TABLE).map_err(storage)?;

        match table.get(key) {
            Ok(Some(val)) => Ok(Some(val.value().to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(storage(e)),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), KVError> {
        let write_txn = self.db.begin_write().map_err(storage)?;
        {
            let mut table = write_txn.open_table(TABLE).map_err(storage)?;
            table.insert(key, value).map_err(storage)?;
        }
        write_txn.commit().map_err(storage)
    }

    fn delete(&self, key: &str) -> Result<(), KVError> {
        self.batch_delete(&[key])
    }

    fn batch_delete(&self, keys: &[&str]) -> Result<(), KVError> {
        let write_txn = self.db.begin_write().map_err(storage)?;
        {
            let mut table = write_txn.open_table(TABLE).map_err(storage)?;
            for key in keys {
                table.remove(*key).map_err(storage)?;
            }
        }
        write_txn.commit().map_err(storage)
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KVError> {
        let read_txn = self.db.begin_read().map_err(storage)?;
        let table = read_txn.open_table(TABLE).map_err(storage)?;

        let mut results = Vec::new();
        for entry in table.range(prefix..).map_err(storage)? {
            let (key, value) = entry.map_err(storage)?;
            let key = key.value().to_string();
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key, value.value().to_vec()));
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let store = RedbStore::open_in_memory().unwrap();
        assert_eq!(store.get("native_seq:a").unwrap(), None);

        store.set("native_seq:a", b"1").unwrap();
        assert_eq!(store.get("native_seq:a").unwrap(), Some(b"1".to_vec()));

        store.delete("native_seq:a").unwrap();
        assert_eq!(store.get("native_seq:a").unwrap(), None);
        // Deleting twice is fine.
        store.delete("native_seq:a").unwrap();
    }

    #[test]
    fn scan_respects_prefix() {
        let store = RedbStore::open_in_memory().unwrap();
        store.set("native_seq:ir_sequence_001", b"a").unwrap();
        store.set("native_seq:ir_sequence_002", b"b").unwrap();
        store.set("other:x", b"c").unwrap();

        let keys: Vec<String> = store
            .scan("native_seq:")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["native_seq:ir_sequence_001", "native_seq:ir_sequence_002"]);
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.set("native_seq:x", b"42").unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get("native_seq:x").unwrap(), Some(b"42".to_vec()));
    }

    #[test]
    fn batch_delete_removes_all() {
        let store = RedbStore::open_in_memory().unwrap();
        store.set("a", b"1").unwrap();
        store.set("b", b"2").unwrap();
        store.batch_delete(&["a", "b", "missing"]).unwrap();
        assert!(store.scan("").unwrap().is_empty());
    }
}
