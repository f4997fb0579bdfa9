// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process KV backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DbError, KeyMap, KvRecord, KvStore, canonical_key, is_exact, removal_targets, select};

/// KV backend holding every record in memory.
///
/// Same matching semantics as [`super::SqliteKvStore`]; nothing survives a
/// restart.
#[derive(Default)]
pub struct MemoryKvStore {
    // store name -> record identity -> record
    stores: RwLock<BTreeMap<String, BTreeMap<String, KvRecord>>>,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn insert(
        &self,
        store: &str,
        key: &KeyMap,
        query: Option<&KeyMap>,
        tag: &str,
        value: &[u8],
    ) -> Result<(), DbError> {
        if !is_exact(key) {
            return Err(DbError::InvalidKey(format!(
                "insert needs a complete key: {}",
                canonical_key(key)
            )));
        }
        let mut stores = self.stores.write().await;
        let record = stores
            .entry(store.to_string())
            .or_default()
            .entry(canonical_key(key))
            .or_insert_with(|| KvRecord {
                key: key.clone(),
                attrs: key.clone(),
                tags: BTreeMap::new(),
            });
        if let Some(query) = query {
            record
                .attrs
                .extend(query.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        record.tags.insert(tag.to_string(), value.to_vec());
        Ok(())
    }

    async fn find(&self, store: &str, key: &KeyMap, tag: &str) -> Result<Vec<Vec<u8>>, DbError> {
        let stores = self.stores.read().await;
        let Some(records) = stores.get(store) else {
            return Ok(Vec::new());
        };
        let records: Vec<KvRecord> = records.values().cloned().collect();
        select(&records, key, tag)
    }

    async fn remove(&self, store: &str, key: &KeyMap) -> Result<(), DbError> {
        let mut stores = self.stores.write().await;
        let Some(records) = stores.get_mut(store) else {
            return Err(DbError::NotFound(canonical_key(key)));
        };
        let snapshot: Vec<KvRecord> = records.values().cloned().collect();
        for id in removal_targets(&snapshot, key)? {
            records.remove(&id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn km(v: Value) -> KeyMap {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_insert_find_replace() {
        let db = MemoryKvStore::new();
        let key = km(json!({"controller": "rsync"}));

        db.insert("controller", &key, None, "meta", b"1").await.unwrap();
        db.insert("controller", &key, None, "meta", b"2").await.unwrap();

        let found = db.find("controller", &key, "meta").await.unwrap();
        assert_eq!(found, vec![b"2".to_vec()]);
        assert!(db.find("other", &key, "meta").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_rejects_partial_key() {
        let db = MemoryKvStore::new();
        let key = km(json!({"clusterProvider": "p1", "cluster": ""}));
        let err = db.insert("cluster", &key, None, "m", b"{}").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_remove_parent_with_child_conflicts() {
        let db = MemoryKvStore::new();
        let provider = km(json!({"clusterProvider": "p1"}));
        let cluster = km(json!({"clusterProvider": "p1", "cluster": "c1"}));
        db.insert("cluster", &provider, None, "m", b"{}").await.unwrap();
        db.insert("cluster", &cluster, None, "m", b"{}").await.unwrap();

        let err = db.remove("cluster", &provider).await.unwrap_err();
        assert!(matches!(err, DbError::ParentHasChild));

        db.remove("cluster", &cluster).await.unwrap();
        db.remove("cluster", &provider).await.unwrap();

        let err = db.remove("cluster", &provider).await.unwrap_err();
        assert!(err.to_string().starts_with("Error finding:"));
    }
}
