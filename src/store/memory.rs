//! In-memory [`KvStore`] backend.
//!
//! The default backend for the server and the only one used in tests.
//! A `BTreeMap` keyed by `(namespace, key)` gives the ordered-scan
//! guarantee the contract requires for free.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::Value;

use super::{KvStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<(String, String), Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_poisoned() -> StoreError {
        StoreError::Backend("memory store lock poisoned".to_string())
    }
}

impl KvStore for MemoryStore {
    fn put(&self, ns: &str, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| Self::lock_poisoned())?;
        entries.insert((ns.to_string(), key.to_string()), value);
        Ok(())
    }

    fn get(&self, ns: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.read().map_err(|_| Self::lock_poisoned())?;
        Ok(entries.get(&(ns.to_string(), key.to_string())).cloned())
    }

    fn delete(&self, ns: &str, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| Self::lock_poisoned())?;
        entries.remove(&(ns.to_string(), key.to_string()));
        Ok(())
    }

    fn list(&self, ns: &str) -> Result<Vec<Value>, StoreError> {
        let entries = self.entries.read().map_err(|_| Self::lock_poisoned())?;
        Ok(entries
            .range((ns.to_string(), String::new())..(format!("{ns}\u{1}"), String::new()))
            .map(|(_, v)| v.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_is_scoped_to_namespace_and_key_ordered() {
        let store = MemoryStore::new();
        store.put("b", "2", json!(2)).unwrap();
        store.put("a", "2", json!("a2")).unwrap();
        store.put("a", "1", json!("a1")).unwrap();
        store.put("aa", "1", json!("aa1")).unwrap();

        let values = store.list("a").unwrap();
        assert_eq!(values, vec![json!("a1"), json!("a2")]);
    }

    #[test]
    fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store.put("ns", "k", json!(1)).unwrap();
        store.delete("ns", "k").unwrap();
        store.delete("ns", "k").unwrap();
        assert!(store.get("ns", "k").unwrap().is_none());
    }
}
