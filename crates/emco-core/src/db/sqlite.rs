// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed KV store.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Executor, Sqlite, SqlitePool};
use tracing::debug;

use super::{
    DbError, KeyMap, KvRecord, KvStore, canonical_key, is_exact, removal_targets, select,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed KV store.
#[derive(Clone)]
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    /// Create a store from an existing pool. Migrations must already be applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// ```ignore
    /// let kv = SqliteKvStore::from_path(".data/emco.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbError::Backend(format!("Failed to create directory {:?}: {}", parent, e))
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load(&self, store: &str) -> Result<Vec<KvRecord>, DbError> {
        load_records(&self.pool, store).await
    }
}

async fn load_records<'e, E>(executor: E, store: &str) -> Result<Vec<KvRecord>, DbError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, (String, String, String, Vec<u8>)>(
        r#"
        SELECT record_key, attrs, tag, value
        FROM kv_records
        WHERE store = ?
        ORDER BY record_key, tag
        "#,
    )
    .bind(store)
    .fetch_all(executor)
    .await?;

    let mut records: BTreeMap<String, KvRecord> = BTreeMap::new();
    for (record_key, attrs, tag, value) in rows {
        if !records.contains_key(&record_key) {
            let key: KeyMap = serde_json::from_str(&record_key)?;
            let attrs: KeyMap = serde_json::from_str(&attrs)?;
            records.insert(
                record_key.clone(),
                KvRecord {
                    key,
                    attrs,
                    tags: BTreeMap::new(),
                },
            );
        }
        if let Some(record) = records.get_mut(&record_key) {
            record.tags.insert(tag, value);
        }
    }
    Ok(records.into_values().collect())
}

#[async_trait]
impl KvStore for SqliteKvStore {
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
        let record_key = canonical_key(key);
        let mut tx = self.pool.begin().await?;

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT attrs FROM kv_records WHERE store = ? AND record_key = ? LIMIT 1",
        )
        .bind(store)
        .bind(&record_key)
        .fetch_optional(&mut *tx)
        .await?;

        let mut attrs = match existing {
            Some((a,)) => serde_json::from_str::<KeyMap>(&a)?,
            None => key.clone(),
        };
        if let Some(query) = query {
            attrs.extend(query.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let attrs = serde_json::to_string(&attrs)?;

        sqlx::query(
            r#"
            INSERT INTO kv_records (store, record_key, attrs, tag, value, updated_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (store, record_key, tag)
            DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(store)
        .bind(&record_key)
        .bind(&attrs)
        .bind(tag)
        .bind(value)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE kv_records SET attrs = ? WHERE store = ? AND record_key = ?")
            .bind(&attrs)
            .bind(store)
            .bind(&record_key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(store, key = %record_key, tag, "kv insert");
        Ok(())
    }

    async fn find(&self, store: &str, key: &KeyMap, tag: &str) -> Result<Vec<Vec<u8>>, DbError> {
        if is_exact(key) {
            let record_key = canonical_key(key);
            let row: Option<(Vec<u8>,)> = sqlx::query_as(
                "SELECT value FROM kv_records WHERE store = ? AND record_key = ? AND tag = ?",
            )
            .bind(store)
            .bind(&record_key)
            .bind(tag)
            .fetch_optional(&self.pool)
            .await?;
            if let Some((value,)) = row {
                return Ok(vec![value]);
            }
        }
        let records = self.load(store).await?;
        select(&records, key, tag)
    }

    async fn remove(&self, store: &str, key: &KeyMap) -> Result<(), DbError> {
        // Children are checked in the same transaction that deletes.
        let mut tx = self.pool.begin().await?;
        let records = load_records(&mut *tx, store).await?;
        let targets = removal_targets(&records, key)?;

        for record_key in &targets {
            sqlx::query("DELETE FROM kv_records WHERE store = ? AND record_key = ?")
                .bind(store)
                .bind(record_key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(store, removed = targets.len(), "kv remove");
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

    async fn store() -> (SqliteKvStore, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let kv = SqliteKvStore::from_path(dir.path().join("nested/emco.db"))
            .await
            .unwrap();
        (kv, dir)
    }

    #[tokio::test]
    async fn test_from_path_creates_directories() {
        let (_kv, dir) = store().await;
        assert!(dir.path().join("nested/emco.db").exists());
    }

    #[tokio::test]
    async fn test_query_attributes_are_readable() {
        let (kv, _dir) = store().await;
        let key = km(json!({"clusterProvider": "p1", "cluster": "c1", "clusterLabel": "edge"}));
        let query = km(json!({"zone": "eu"}));
        kv.insert("cluster", &key, Some(&query), "labelmetadata", b"{\"clusterLabel\":\"edge\"}")
            .await
            .unwrap();

        let pattern = km(json!({"clusterProvider": "p1", "cluster": "", "clusterLabel": "edge"}));
        assert_eq!(
            kv.find("cluster", &pattern, "cluster").await.unwrap(),
            vec![b"\"c1\"".to_vec()]
        );
        assert_eq!(
            kv.find("cluster", &pattern, "zone").await.unwrap(),
            vec![b"\"eu\"".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_remove_removes_all_tags() {
        let (kv, _dir) = store().await;
        let key = km(json!({"clusterProvider": "p1", "cluster": "c1"}));
        kv.insert("cluster", &key, None, "clustermetadata", b"{}").await.unwrap();
        kv.insert("cluster", &key, None, "stateInfo", b"{}").await.unwrap();

        kv.remove("cluster", &key).await.unwrap();
        assert!(kv.find("cluster", &key, "stateInfo").await.unwrap().is_empty());
        assert!(kv.find("cluster", &key, "clustermetadata").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_with_child_keeps_everything() {
        let (kv, _dir) = store().await;
        let parent = km(json!({"clusterProvider": "p1", "cluster": "c1"}));
        let child = km(json!({"clusterProvider": "p1", "cluster": "c1", "clusterLabel": "edge"}));
        kv.insert("cluster", &parent, None, "clustermetadata", b"{}").await.unwrap();
        kv.insert("cluster", &child, None, "labelmetadata", b"{}").await.unwrap();

        let err = kv.remove("cluster", &parent).await.unwrap_err();
        assert!(matches!(err, DbError::ParentHasChild));
        assert_eq!(kv.find("cluster", &parent, "clustermetadata").await.unwrap().len(), 1);
        assert_eq!(kv.find("cluster", &child, "labelmetadata").await.unwrap().len(), 1);

        // the pool is usable after the rolled back transaction
        kv.remove("cluster", &child).await.unwrap();
        kv.remove("cluster", &parent).await.unwrap();
        assert!(kv.find("cluster", &parent, "clustermetadata").await.unwrap().is_empty());
    }
}
