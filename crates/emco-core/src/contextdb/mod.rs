// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ephemeral context store adapter.
//!
//! A tree of JSON values addressed by string handles. Handles are
//! slash-terminated paths under `/context/<id>/`; composing a child handle is
//! pure string concatenation, so the same inputs always give the same handle.
//!
//! ```text
//! /context/<id>/                          <- root, value = id
//! /context/<id>/meta/                     <- add_level_value(root, "meta", ..)
//! /context/<id>/app/<a>/                  <- add_level(root, "app", a)
//! /context/<id>/app/<a>/cluster/<c>/      <- add_level(app, "cluster", c)
//! /context/<id>/app/<a>/cluster/<c>/resource/<n+k>/
//! /context/<id>/app/<a>/cluster/<c>/instruction/resource/order/
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ErrorKind;

mod memory;

pub use memory::MemoryContextStore;

/// Prefix of every handle.
pub const CONTEXT_PREFIX: &str = "/context/";

/// Context store errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ContextDbError {
    /// Handle absent.
    #[error("Error finding handle: {0}")]
    NotFound(String),

    /// Handle or handle component is malformed.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Stored value could not be decoded.
    #[error("context value error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Backend failure.
    #[error("context store error: {0}")]
    Backend(String),
}

impl ContextDbError {
    /// Error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidHandle(_) => ErrorKind::InvalidInput,
            Self::Serde(_) | Self::Backend(_) => ErrorKind::Upstream,
        }
    }
}

/// Read-modify-write closure applied under the node's lock.
pub type ModifyFn = Box<dyn FnOnce(&mut Value) -> Result<(), ContextDbError> + Send>;

/// Backend contract for the context store.
///
/// Writes to distinct handles must not serialize against each other and
/// [`ContextStore::delete_all`] must be atomic for readers.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Create or replace the value at `handle`.
    async fn put(&self, handle: &str, value: Value) -> Result<(), ContextDbError>;

    /// Value at `handle`.
    async fn get(&self, handle: &str) -> Result<Value, ContextDbError>;

    /// Replace the value of an existing handle.
    async fn update(&self, handle: &str, value: Value) -> Result<(), ContextDbError>;

    /// Atomically rewrite the value of an existing handle; returns the new value.
    async fn modify(&self, handle: &str, f: ModifyFn) -> Result<Value, ContextDbError>;

    /// Whether `handle` exists.
    async fn exists(&self, handle: &str) -> Result<bool, ContextDbError>;

    /// Every handle starting with `prefix` (including `prefix` itself).
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, ContextDbError>;

    /// Delete exactly one handle.
    async fn delete(&self, handle: &str) -> Result<(), ContextDbError>;

    /// Delete `prefix` and all its descendants.
    async fn delete_all(&self, prefix: &str) -> Result<(), ContextDbError>;
}

fn check_component(part: &str) -> Result<(), ContextDbError> {
    if part.is_empty() || part.contains('/') {
        return Err(ContextDbError::InvalidHandle(format!(
            "bad handle component {:?}",
            part
        )));
    }
    Ok(())
}

fn check_handle(handle: &str) -> Result<(), ContextDbError> {
    if !handle.starts_with(CONTEXT_PREFIX) || !handle.ends_with('/') {
        return Err(ContextDbError::InvalidHandle(handle.to_string()));
    }
    Ok(())
}

/// Root handle of context `id`.
pub fn root_handle(id: &str) -> String {
    format!("{CONTEXT_PREFIX}{id}/")
}

/// Handle-composing operations over a [`ContextStore`].
#[derive(Clone)]
pub struct ContextTree {
    store: Arc<dyn ContextStore>,
}

impl ContextTree {
    /// Wrap a backend.
    pub fn new(store: Arc<dyn ContextStore>) -> Self {
        Self { store }
    }

    /// In-process backend.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryContextStore::new()))
    }

    /// Backend handle.
    pub fn store(&self) -> &Arc<dyn ContextStore> {
        &self.store
    }

    /// Mint an unused numeric context id.
    pub async fn new_id(&self) -> Result<String, ContextDbError> {
        loop {
            let (hi, _) = uuid::Uuid::new_v4().as_u64_pair();
            let id = (hi >> 1).to_string();
            if hi >> 1 != 0 && !self.store.exists(&root_handle(&id)).await? {
                return Ok(id);
            }
        }
    }

    /// Write the root node of context `id`; returns its handle.
    pub async fn create(&self, id: &str) -> Result<String, ContextDbError> {
        check_component(id)?;
        let handle = root_handle(id);
        self.store.put(&handle, Value::String(id.to_string())).await?;
        Ok(handle)
    }

    /// Add `<handle><level>/<name>/` whose value is `name`.
    pub async fn add_level(
        &self,
        handle: &str,
        level: &str,
        name: &str,
    ) -> Result<String, ContextDbError> {
        check_handle(handle)?;
        check_component(level)?;
        check_component(name)?;
        let child = format!("{handle}{level}/{name}/");
        self.store.put(&child, Value::String(name.to_string())).await?;
        Ok(child)
    }

    /// Add `<handle><level>/` holding `value`.
    pub async fn add_level_value(
        &self,
        handle: &str,
        level: &str,
        value: Value,
    ) -> Result<String, ContextDbError> {
        check_handle(handle)?;
        check_component(level)?;
        let child = format!("{handle}{level}/");
        self.store.put(&child, value).await?;
        Ok(child)
    }

    /// Add `<handle>resource/<name>/` holding `value`.
    pub async fn add_resource(
        &self,
        handle: &str,
        name: &str,
        value: Value,
    ) -> Result<String, ContextDbError> {
        check_handle(handle)?;
        check_component(name)?;
        let child = format!("{handle}resource/{name}/");
        self.store.put(&child, value).await?;
        Ok(child)
    }

    /// Add `<handle>instruction/<level>/<insttype>/` holding `value`.
    pub async fn add_instruction(
        &self,
        handle: &str,
        level: &str,
        insttype: &str,
        value: Value,
    ) -> Result<String, ContextDbError> {
        check_handle(handle)?;
        check_component(level)?;
        check_component(insttype)?;
        let child = format!("{handle}instruction/{level}/{insttype}/");
        self.store.put(&child, value).await?;
        Ok(child)
    }

    /// `<handle><level>/`, if it exists.
    pub async fn get_level_handle(&self, handle: &str, level: &str) -> Result<String, ContextDbError> {
        check_handle(handle)?;
        check_component(level)?;
        let child = format!("{handle}{level}/");
        if self.store.exists(&child).await? {
            Ok(child)
        } else {
            Err(ContextDbError::NotFound(child))
        }
    }

    /// Every handle at or below `prefix`.
    pub async fn get_all_handles(&self, prefix: &str) -> Result<Vec<String>, ContextDbError> {
        check_handle(prefix)?;
        self.store.keys(prefix).await
    }

    /// Ids of every context in the store.
    pub async fn context_ids(&self) -> Result<Vec<String>, ContextDbError> {
        Ok(self
            .get_all_handles(CONTEXT_PREFIX)
            .await?
            .into_iter()
            .filter_map(|h| {
                let id = h.strip_prefix(CONTEXT_PREFIX)?.strip_suffix('/')?;
                (!id.is_empty() && !id.contains('/')).then(|| id.to_string())
            })
            .collect())
    }

    /// Value at `handle`.
    pub async fn get_value(&self, handle: &str) -> Result<Value, ContextDbError> {
        check_handle(handle)?;
        self.store.get(handle).await
    }

    /// Whether `handle` exists.
    pub async fn exists(&self, handle: &str) -> Result<bool, ContextDbError> {
        check_handle(handle)?;
        self.store.exists(handle).await
    }

    /// Replace the value of an existing handle.
    pub async fn update_value(&self, handle: &str, value: Value) -> Result<(), ContextDbError> {
        check_handle(handle)?;
        self.store.update(handle, value).await
    }

    /// Atomic read-modify-write of an existing handle.
    pub async fn modify_value(&self, handle: &str, f: ModifyFn) -> Result<Value, ContextDbError> {
        check_handle(handle)?;
        self.store.modify(handle, f).await
    }

    /// Delete one handle, leaving descendants alone.
    pub async fn delete_pair(&self, handle: &str) -> Result<(), ContextDbError> {
        check_handle(handle)?;
        self.store.delete(handle).await
    }

    /// Delete a handle and its whole subtree.
    pub async fn delete_prefix(&self, handle: &str) -> Result<(), ContextDbError> {
        check_handle(handle)?;
        self.store.delete_all(handle).await
    }
}
