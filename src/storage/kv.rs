//! Transactional key/value store on the local flash tier.
//!
//! A single redb table of UTF-8 keys to opaque blobs. Writers that need
//! "erase everything under this prefix, then repopulate" semantics get
//! it atomically through [`KvStore::replace_prefix`]; readers never see
//! a half-written generation.

use std::path::Path;

use log::debug;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{Error, Result};

const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

fn backend_err(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Io(std::io::Error::other(format!("{context}: {err}")))
}

/// Local key/value store.
pub struct KvStore {
    db: Database,
}

impl KvStore {
    /// Opens (creating if absent) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref()).map_err(|e| backend_err("kv open", e))?;
        let store = Self { db };
        store.ensure_table()?;
        Ok(store)
    }

    /// Opens an in-memory store. Used by tests and bring-up without flash.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| backend_err("kv open (memory)", e))?;
        let store = Self { db };
        store.ensure_table()?;
        Ok(store)
    }

    // First read would otherwise fail with "table does not exist".
    fn ensure_table(&self) -> Result<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| backend_err("kv init", e))?;
        txn.open_table(KV_TABLE)
            .map_err(|e| backend_err("kv init", e))?;
        txn.commit().map_err(|e| backend_err("kv init", e))
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| backend_err("kv write", e))?;
        {
            let mut table = txn
                .open_table(KV_TABLE)
                .map_err(|e| backend_err("kv write", e))?;
            table
                .insert(key, value)
                .map_err(|e| backend_err("kv put", e))?;
        }
        txn.commit().map_err(|e| backend_err("kv commit", e))
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| backend_err("kv read", e))?;
        let table = txn
            .open_table(KV_TABLE)
            .map_err(|e| backend_err("kv read", e))?;
        let value = table
            .get(key)
            .map_err(|e| backend_err("kv get", e))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Removes `key`. Returns true when an entry was removed.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| backend_err("kv write", e))?;
        let removed;
        {
            let mut table = txn
                .open_table(KV_TABLE)
                .map_err(|e| backend_err("kv write", e))?;
            removed = table
                .remove(key)
                .map_err(|e| backend_err("kv delete", e))?
                .is_some();
        }
        txn.commit().map_err(|e| backend_err("kv commit", e))?;
        Ok(removed)
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, sorted by key.
    pub fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| backend_err("kv read", e))?;
        let table = txn
            .open_table(KV_TABLE)
            .map_err(|e| backend_err("kv read", e))?;
        let mut out = Vec::new();
        for item in table
            .range(prefix..)
            .map_err(|e| backend_err("kv range", e))?
        {
            let (key, value) = item.map_err(|e| backend_err("kv range", e))?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_string(), value.value().to_vec()));
        }
        Ok(out)
    }

    pub fn count_prefix(&self, prefix: &str) -> Result<usize> {
        Ok(self.list_prefix(prefix)?.len())
    }

    /// Atomically deletes every key under `prefix` and inserts `entries`
    /// in the same transaction.
    pub fn replace_prefix(&self, prefix: &str, entries: Vec<(String, Vec<u8>)>) -> Result<()> {
        let stale: Vec<String> = self
            .list_prefix(prefix)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let txn = self
            .db
            .begin_write()
            .map_err(|e| backend_err("kv write", e))?;
        {
            let mut table = txn
                .open_table(KV_TABLE)
                .map_err(|e| backend_err("kv write", e))?;
            for key in &stale {
                table
                    .remove(key.as_str())
                    .map_err(|e| backend_err("kv replace", e))?;
            }
            for (key, value) in &entries {
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(|e| backend_err("kv replace", e))?;
            }
        }
        txn.commit().map_err(|e| backend_err("kv commit", e))?;
        debug!(
            "kv prefix '{prefix}' replaced: {} stale removed, {} written",
            stale.len(),
            entries.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let kv = KvStore::in_memory().expect("open");
        assert_eq!(kv.get("a").expect("get"), None);
        kv.put("a", b"1").expect("put");
        assert_eq!(kv.get("a").expect("get"), Some(b"1".to_vec()));
        assert!(kv.delete("a").expect("delete"));
        assert!(!kv.delete("a").expect("delete idempotent"));
        assert_eq!(kv.get("a").expect("get"), None);
    }

    #[test]
    fn list_prefix_is_bounded_and_sorted() {
        let kv = KvStore::in_memory().expect("open");
        kv.put("rule.0", b"r0").expect("put");
        kv.put("rule.1", b"r1").expect("put");
        kv.put("rulez", b"not ours").expect("put");
        kv.put("var.x", b"v").expect("put");

        let entries = kv.list_prefix("rule.").expect("list");
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["rule.0", "rule.1"]);
    }

    #[test]
    fn replace_prefix_is_a_single_generation_swap() {
        let kv = KvStore::in_memory().expect("open");
        kv.put("rule.0", b"old0").expect("put");
        kv.put("rule.1", b"old1").expect("put");
        kv.put("rule.2", b"old2").expect("put");

        kv.replace_prefix("rule.", vec![("rule.0".to_string(), b"new0".to_vec())])
            .expect("replace");

        let entries = kv.list_prefix("rule.").expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, b"new0".to_vec());
    }

    #[test]
    fn save_twice_is_byte_identical() {
        let kv = KvStore::in_memory().expect("open");
        let entries = vec![
            ("rule.0".to_string(), b"a".to_vec()),
            ("rule.1".to_string(), b"b".to_vec()),
        ];
        kv.replace_prefix("rule.", entries.clone()).expect("first");
        let first = kv.list_prefix("rule.").expect("list");
        kv.replace_prefix("rule.", entries).expect("second");
        let second = kv.list_prefix("rule.").expect("list");
        assert_eq!(first, second);
    }

    #[test]
    fn on_disk_store_survives_reopen() {
        let tmp = tempfile::tempdir().expect("tmpdir");
        let path = tmp.path().join("kv.redb");
        {
            let kv = KvStore::open(&path).expect("open");
            kv.put("h_0000abcd", b"{}").expect("put");
        }
        let kv = KvStore::open(&path).expect("reopen");
        assert_eq!(kv.get("h_0000abcd").expect("get"), Some(b"{}".to_vec()));
    }
}
