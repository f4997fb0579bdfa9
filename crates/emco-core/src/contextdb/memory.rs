// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process context store.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::{ContextDbError, ContextStore, ModifyFn};

type Cell = Arc<RwLock<Value>>;

/// Context store keeping the handle index in memory.
///
/// The index sits behind one reader/writer lock and every node has its own
/// value lock. Point writes only take the index read lock, so writers on
/// different handles run in parallel; inserting a node or removing a subtree
/// takes the index write lock.
#[derive(Default)]
pub struct MemoryContextStore {
    index: RwLock<BTreeMap<String, Cell>>,
}

impl MemoryContextStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, handle: &str) -> Result<Cell, ContextDbError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index
            .get(handle)
            .cloned()
            .ok_or_else(|| ContextDbError::NotFound(handle.to_string()))
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn put(&self, handle: &str, value: Value) -> Result<(), ContextDbError> {
        if let Ok(cell) = self.cell(handle) {
            *cell.write().unwrap_or_else(PoisonError::into_inner) = value;
            return Ok(());
        }
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        match index.get(handle) {
            Some(cell) => *cell.write().unwrap_or_else(PoisonError::into_inner) = value,
            None => {
                index.insert(handle.to_string(), Arc::new(RwLock::new(value)));
            }
        }
        Ok(())
    }

    async fn get(&self, handle: &str) -> Result<Value, ContextDbError> {
        let cell = self.cell(handle)?;
        let value = cell.read().unwrap_or_else(PoisonError::into_inner).clone();
        Ok(value)
    }

    async fn update(&self, handle: &str, value: Value) -> Result<(), ContextDbError> {
        let cell = self.cell(handle)?;
        *cell.write().unwrap_or_else(PoisonError::into_inner) = value;
        Ok(())
    }

    async fn modify(&self, handle: &str, f: ModifyFn) -> Result<Value, ContextDbError> {
        let cell = self.cell(handle)?;
        let mut guard = cell.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.clone();
        f(&mut next)?;
        *guard = next.clone();
        Ok(next)
    }

    async fn exists(&self, handle: &str) -> Result<bool, ContextDbError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.contains_key(handle))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, ContextDbError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, handle: &str) -> Result<(), ContextDbError> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        index
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| ContextDbError::NotFound(handle.to_string()))
    }

    async fn delete_all(&self, prefix: &str) -> Result<(), ContextDbError> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let doomed: Vec<String> = index
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        if doomed.is_empty() {
            return Err(ContextDbError::NotFound(prefix.to_string()));
        }
        for key in doomed {
            index.remove(&key);
        }
        Ok(())
    }
}
