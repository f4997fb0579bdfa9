// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistent KV store adapter.
//!
//! Records live in named stores and are addressed by typed keys. A key is any
//! `Serialize` struct whose fields serialize to strings; the serialized JSON
//! object (attribute order is stable because `serde_json::Map` is sorted) is
//! the record identity. Each record holds one value per *tag*.
//!
//! # Matching
//!
//! | Key shape | Matches |
//! |-----------|---------|
//! | every attribute non-empty | the one record with that key |
//! | some attributes empty | every record with the same attribute names whose non-empty attributes are equal |
//!
//! Key attributes (and the optional query attributes given at insert time)
//! are readable as tags, so `find(store, LabelKey{cluster: "", ..}, "cluster")`
//! yields the cluster names of all matching label records.
//!
//! # Removal
//!
//! A record is a *child* of a key when its attribute names strictly include
//! the key's names and it agrees on every attribute of the key. Removing a
//! key with children fails with [`DbError::ParentHasChild`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::ErrorKind;

mod memory;
mod sqlite;

pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;

/// Attribute map of a serialized key.
pub type KeyMap = Map<String, Value>;

/// KV store errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DbError {
    /// No record matched the key.
    #[error("Error finding: {0}")]
    NotFound(String),

    /// The key has child records.
    #[error("Can't delete parent without deleting child")]
    ParentHasChild,

    /// The key does not serialize to a flat object of strings.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Backend failure.
    #[error("database error: {0}")]
    Backend(String),

    /// Stored bytes could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl DbError {
    /// Error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ParentHasChild => ErrorKind::Conflict,
            Self::InvalidKey(_) => ErrorKind::InvalidInput,
            Self::Backend(_) | Self::Serde(_) => ErrorKind::Upstream,
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        DbError::Backend(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::Backend(format!("migration failed: {}", err))
    }
}

/// A record as seen by the matching rules.
#[derive(Debug, Clone, Default)]
pub struct KvRecord {
    /// Key attributes.
    pub key: KeyMap,
    /// Key attributes merged with query attributes.
    pub attrs: KeyMap,
    /// Serialized value per tag.
    pub tags: BTreeMap<String, Vec<u8>>,
}

/// Backend contract for the KV adapter.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Insert or replace the value of `tag` for an exact key.
    async fn insert(
        &self,
        store: &str,
        key: &KeyMap,
        query: Option<&KeyMap>,
        tag: &str,
        value: &[u8],
    ) -> Result<(), DbError>;

    /// Values of `tag` for every record matching `key`.
    async fn find(&self, store: &str, key: &KeyMap, tag: &str) -> Result<Vec<Vec<u8>>, DbError>;

    /// Remove every record matching `key`, unless one of them has children.
    async fn remove(&self, store: &str, key: &KeyMap) -> Result<(), DbError>;
}

/// Decode a stored value.
pub fn unmarshal<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DbError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Serialize a typed key into its attribute map.
pub fn key_map<K: Serialize + ?Sized>(key: &K) -> Result<KeyMap, DbError> {
    match serde_json::to_value(key)? {
        Value::Object(map) => {
            if let Some((name, _)) = map.iter().find(|(_, v)| !v.is_string()) {
                return Err(DbError::InvalidKey(format!(
                    "attribute {} is not a string",
                    name
                )));
            }
            Ok(map)
        }
        other => Err(DbError::InvalidKey(other.to_string())),
    }
}

/// Canonical record identity for a key.
pub fn canonical_key(key: &KeyMap) -> String {
    Value::Object(key.clone()).to_string()
}

fn is_wildcard(v: &Value) -> bool {
    v.as_str().is_some_and(str::is_empty)
}

/// True when no attribute of `key` is empty.
pub fn is_exact(key: &KeyMap) -> bool {
    !key.values().any(is_wildcard)
}

/// True when `candidate` is selected by `pattern`.
pub fn key_matches(pattern: &KeyMap, candidate: &KeyMap) -> bool {
    pattern.len() == candidate.len()
        && pattern
            .iter()
            .all(|(k, v)| candidate.get(k).is_some_and(|cv| is_wildcard(v) || cv == v))
}

/// True when `candidate` is a child record of `parent`.
pub fn is_child(parent: &KeyMap, candidate: &KeyMap) -> bool {
    candidate.len() > parent.len()
        && parent
            .iter()
            .all(|(k, v)| candidate.get(k).is_some_and(|cv| is_wildcard(v) || cv == v))
}

/// Apply the find rules over a set of records sorted by identity.
pub(crate) fn select(records: &[KvRecord], key: &KeyMap, tag: &str) -> Result<Vec<Vec<u8>>, DbError> {
    let mut out = Vec::new();
    for record in records.iter().filter(|r| key_matches(key, &r.key)) {
        if let Some(value) = record.tags.get(tag) {
            out.push(value.clone());
        } else if let Some(attr) = record.attrs.get(tag) {
            out.push(serde_json::to_vec(attr)?);
        }
    }
    Ok(out)
}

/// Identities of the records a removal deletes.
pub(crate) fn removal_targets(records: &[KvRecord], key: &KeyMap) -> Result<Vec<String>, DbError> {
    let targets: Vec<String> = records
        .iter()
        .filter(|r| key_matches(key, &r.key))
        .map(|r| canonical_key(&r.key))
        .collect();
    if targets.is_empty() {
        return Err(DbError::NotFound(canonical_key(key)));
    }
    if records.iter().any(|r| is_child(key, &r.key)) {
        return Err(DbError::ParentHasChild);
    }
    Ok(targets)
}

/// Typed front-end over a [`KvStore`] backend.
#[derive(Clone)]
pub struct Db {
    backend: Arc<dyn KvStore>,
}

impl Db {
    /// Wrap a backend.
    pub fn new(backend: Arc<dyn KvStore>) -> Self {
        Self { backend }
    }

    /// In-process store, used by tests and single-node deployments.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryKvStore::new()))
    }

    /// Insert `value` under `tag`.
    pub async fn insert<K, V>(&self, store: &str, key: &K, tag: &str, value: &V) -> Result<(), DbError>
    where
        K: Serialize + Sync + ?Sized,
        V: Serialize + Sync + ?Sized,
    {
        let key = key_map(key)?;
        let bytes = serde_json::to_vec(value)?;
        self.backend.insert(store, &key, None, tag, &bytes).await
    }

    /// Insert `value` under `tag`, attaching extra readable attributes.
    pub async fn insert_with_query<K, Q, V>(
        &self,
        store: &str,
        key: &K,
        query: &Q,
        tag: &str,
        value: &V,
    ) -> Result<(), DbError>
    where
        K: Serialize + Sync + ?Sized,
        Q: Serialize + Sync + ?Sized,
        V: Serialize + Sync + ?Sized,
    {
        let key = key_map(key)?;
        let query = key_map(query)?;
        let bytes = serde_json::to_vec(value)?;
        self.backend
            .insert(store, &key, Some(&query), tag, &bytes)
            .await
    }

    /// Raw values of `tag` for every matching record.
    pub async fn find<K>(&self, store: &str, key: &K, tag: &str) -> Result<Vec<Vec<u8>>, DbError>
    where
        K: Serialize + Sync + ?Sized,
    {
        let key = key_map(key)?;
        self.backend.find(store, &key, tag).await
    }

    /// Decoded values of `tag` for every matching record.
    pub async fn find_as<K, T>(&self, store: &str, key: &K, tag: &str) -> Result<Vec<T>, DbError>
    where
        K: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        self.find(store, key, tag)
            .await?
            .iter()
            .map(|b| unmarshal(b))
            .collect()
    }

    /// First decoded value of `tag`, if any.
    pub async fn find_one<K, T>(&self, store: &str, key: &K, tag: &str) -> Result<Option<T>, DbError>
    where
        K: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        match self.find(store, key, tag).await?.first() {
            Some(bytes) => Ok(Some(unmarshal(bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove the matching records.
    pub async fn remove<K>(&self, store: &str, key: &K) -> Result<(), DbError>
    where
        K: Serialize + Sync + ?Sized,
    {
        let key = key_map(key)?;
        self.backend.remove(store, &key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn km(v: Value) -> KeyMap {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_key_matches_exact_and_wildcard() {
        let rec = km(json!({"clusterProvider": "p1", "cluster": "c1"}));
        assert!(key_matches(&rec, &rec));
        assert!(key_matches(
            &km(json!({"clusterProvider": "p1", "cluster": ""})),
            &rec
        ));
        assert!(!key_matches(
            &km(json!({"clusterProvider": "p2", "cluster": ""})),
            &rec
        ));
        // different attribute sets never match
        assert!(!key_matches(&km(json!({"clusterProvider": "p1"})), &rec));
    }

    #[test]
    fn test_is_child() {
        let provider = km(json!({"clusterProvider": "p1"}));
        let cluster = km(json!({"clusterProvider": "p1", "cluster": "c1"}));
        let other = km(json!({"clusterProvider": "p2", "cluster": "c1"}));
        assert!(is_child(&provider, &cluster));
        assert!(!is_child(&provider, &other));
        assert!(!is_child(&cluster, &cluster));
    }

    #[test]
    fn test_key_map_rejects_non_string_attributes() {
        #[derive(Serialize)]
        struct Bad {
            n: u32,
        }
        assert!(matches!(key_map(&Bad { n: 1 }), Err(DbError::InvalidKey(_))));
        assert!(matches!(key_map(&"plain"), Err(DbError::InvalidKey(_))));
    }

    #[test]
    fn test_canonical_key_is_attribute_order_stable() {
        let a = km(json!({"b": "2", "a": "1"}));
        let b = km(json!({"a": "1", "b": "2"}));
        assert_eq!(canonical_key(&a), canonical_key(&b));
        assert_eq!(canonical_key(&a), r#"{"a":"1","b":"2"}"#);
    }

    #[test]
    fn test_select_reads_attributes_as_tags() {
        let mut attrs = km(json!({"clusterProvider": "p1", "cluster": "c1", "clusterLabel": "edge"}));
        let key = attrs.clone();
        attrs.insert("extra".into(), json!("q"));
        let record = KvRecord {
            key,
            attrs,
            tags: BTreeMap::from([("labelmetadata".to_string(), b"{}".to_vec())]),
        };
        let pattern = km(json!({"clusterProvider": "p1", "cluster": "", "clusterLabel": "edge"}));

        let clusters = select(std::slice::from_ref(&record), &pattern, "cluster").unwrap();
        assert_eq!(clusters, vec![b"\"c1\"".to_vec()]);
        let extra = select(std::slice::from_ref(&record), &pattern, "extra").unwrap();
        assert_eq!(extra, vec![b"\"q\"".to_vec()]);
        assert!(select(&[record], &pattern, "missing").unwrap().is_empty());
    }
}
