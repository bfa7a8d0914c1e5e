//! StateStore: redb-backed key-value store for the broker.
//!
//! A flat string-keyed store with get/set/delete and recursive prefix
//! listing. Keys are `/`-separated paths; a listing of `/state/` returns
//! every key below it. There are no multi-key transactions: each call
//! commits on its own and the last write to a key wins.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::KV;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(KV).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read the value at `key`. A missing key is `StateError::NotFound`.
    pub fn get(&self, key: &str) -> StateResult<String> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => String::from_utf8(guard.value().to_vec()).map_err(map_err!(Deserialize)),
            None => Err(StateError::NotFound(key.to_string())),
        }
    }

    /// Insert or overwrite the value at `key`.
    pub fn set(&self, key: &str, value: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_bytes())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "key stored");
        Ok(())
    }

    /// Delete `key`. Returns true if it existed.
    pub fn delete(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "key deleted");
        Ok(existed)
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    pub fn list_recursive(&self, prefix: &str) -> StateResult<Vec<(String, String)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range::<&str>(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            let value = String::from_utf8(value.value().to_vec()).map_err(map_err!(Deserialize))?;
            results.push((key.to_string(), value));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        store.set("/spec/a", "{}").unwrap();
        assert_eq!(store.get("/spec/a").unwrap(), "{}");
    }

    #[test]
    fn missing_key_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.get("/spec/nope").unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("/spec/nope"));
    }

    #[test]
    fn overwrite_is_last_write_wins() {
        let store = StateStore::open_in_memory().unwrap();
        store.set("/k", "1").unwrap();
        store.set("/k", "2").unwrap();
        assert_eq!(store.get("/k").unwrap(), "2");
    }

    #[test]
    fn delete_reports_existence() {
        let store = StateStore::open_in_memory().unwrap();
        store.set("/k", "v").unwrap();
        assert!(store.delete("/k").unwrap());
        assert!(!store.delete("/k").unwrap());
        assert!(store.get("/k").unwrap_err().is_not_found());
    }

    #[test]
    fn list_recursive_stays_inside_prefix() {
        let store = StateStore::open_in_memory().unwrap();
        store.set("/state/a/job/1", "x").unwrap();
        store.set("/state/a/job/2", "y").unwrap();
        store.set("/state/b/job/1", "z").unwrap();
        store.set("/spec/a", "s").unwrap();
        store.set("/statez", "nope").unwrap();

        let all = store.list_recursive("/state/").unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].0, "/state/a/job/1");

        let a = store.list_recursive("/state/a/job/").unwrap();
        assert_eq!(a.len(), 2);

        assert!(store.list_recursive("/bind_instance/").unwrap().is_empty());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.set("/spec/a", "kept").unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get("/spec/a").unwrap(), "kept");
    }
}
