// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State-info ledger.
//!
//! Each managed entity carries a [`StateInfo`]: an append-only list of
//! actions plus the id of the context whose status answers status queries.
//! Revisions increase by one per appended action, starting at 1.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::{Db, canonical_key, key_map};
use crate::error::{EmcoError, Result};

/// Tag under which ledgers are stored.
pub const TAG_STATE: &str = "stateInfo";

/// Lifecycle states of a managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateValue {
    /// Never written.
    Undefined,
    /// Entity exists, nothing applied.
    Created,
    /// Approved for instantiation.
    Approved,
    /// Intents applied to the cluster.
    Applied,
    /// Deployment intent group instantiated.
    Instantiated,
    /// Applied intents removed.
    Terminated,
    /// Stopped while instantiating.
    InstantiateStopped,
    /// Stopped while terminating.
    TerminateStopped,
    /// Instantiated group updated in place.
    Updated,
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEntry {
    /// State entered.
    pub state: StateValue,
    /// Context id minted by the action, empty when none.
    #[serde(rename = "instance")]
    pub context_id: String,
    /// When the action was recorded.
    pub time: DateTime<Utc>,
    /// Monotonic revision.
    pub revision: i64,
}

/// Ledger of one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateInfo {
    /// Context id whose status represents the entity.
    #[serde(rename = "statusctxid", default)]
    pub status_context_id: String,
    /// Ordered actions.
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
}

impl StateInfo {
    /// Ledger holding a single `Created` entry.
    pub fn created() -> Self {
        let mut info = Self::default();
        info.append_action(StateValue::Created, "");
        info
    }

    /// Append an action; returns its revision.
    pub fn append_action(&mut self, state: StateValue, context_id: &str) -> i64 {
        let revision = self.latest_revision() + 1;
        self.actions.push(ActionEntry {
            state,
            context_id: context_id.to_string(),
            time: Utc::now(),
            revision,
        });
        revision
    }

    /// State of the last entry.
    pub fn current_state(&self) -> Result<StateValue> {
        self.actions
            .last()
            .map(|a| a.state)
            .ok_or_else(|| EmcoError::NotFound("No state information".to_string()))
    }

    /// Context id of the last entry (possibly empty).
    pub fn last_context_id(&self) -> Result<String> {
        self.actions
            .last()
            .map(|a| a.context_id.clone())
            .ok_or_else(|| EmcoError::NotFound("No state information".to_string()))
    }

    /// Context id for status queries.
    pub fn status_context_id(&self) -> &str {
        &self.status_context_id
    }

    /// Highest revision, 0 when empty.
    pub fn latest_revision(&self) -> i64 {
        self.actions.last().map(|a| a.revision).unwrap_or(0)
    }

    /// Context id recorded for `revision`.
    pub fn context_id_for_revision(&self, revision: i64) -> Result<String> {
        self.actions
            .iter()
            .rev()
            .find(|a| a.revision == revision && !a.context_id.is_empty())
            .map(|a| a.context_id.clone())
            .ok_or_else(|| {
                EmcoError::NotFound(format!("No context for revision {}", revision))
            })
    }

    /// Distinct non-empty context ids in first-seen order.
    pub fn all_context_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for a in &self.actions {
            if !a.context_id.is_empty() && !ids.contains(&a.context_id) {
                ids.push(a.context_id.clone());
            }
        }
        ids
    }
}

/// User actions driving cluster network intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Build and install the intents context.
    Apply,
    /// Uninstall the last context.
    Terminate,
    /// Stop an in-flight install or uninstall.
    Stop,
}

/// Outcome of a legal transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Perform the action; the ledger ends in this state.
    Proceed(StateValue),
    /// Already in the requested state; leave the ledger alone.
    NoOp,
}

/// Legality table for cluster network intents.
pub fn cluster_intents_guard(current: StateValue, action: LifecycleAction) -> Result<Transition> {
    use LifecycleAction::*;
    use StateValue::*;

    match (action, current) {
        (Apply, Created | Terminated | TerminateStopped) => Ok(Transition::Proceed(Applied)),
        (Apply, Applied | InstantiateStopped) => Ok(Transition::NoOp),
        (Apply, Approved) => Err(EmcoError::Conflict(
            "Cluster is in an invalid state".to_string(),
        )),

        (Terminate, Applied | InstantiateStopped) => Ok(Transition::Proceed(Terminated)),
        (Terminate, Terminated | TerminateStopped) => Ok(Transition::NoOp),
        (Terminate, Created) => Err(EmcoError::Conflict(
            "Cluster network intents have not been applied".to_string(),
        )),

        (Stop, Applied) => Ok(Transition::Proceed(InstantiateStopped)),
        (Stop, Terminated) => Ok(Transition::Proceed(TerminateStopped)),
        (Stop, InstantiateStopped | TerminateStopped) => Err(EmcoError::Conflict(
            "Cluster network intents are already stopped".to_string(),
        )),
        (Stop, Created) => Err(EmcoError::Conflict(
            "Cluster network intents have not been applied".to_string(),
        )),

        (_, state) => Err(EmcoError::Conflict(format!(
            "Cluster is in an invalid state: {}",
            state
        ))),
    }
}

/// Guard for creating or deleting network intents under a cluster.
///
/// `verb` is `creating` or `deleting`.
pub fn intents_modifiable(current: StateValue, verb: &str) -> Result<()> {
    match current {
        StateValue::Applied | StateValue::InstantiateStopped => Err(EmcoError::Conflict(format!(
            "Cluster network intents must be terminated before {}",
            verb
        ))),
        StateValue::Approved | StateValue::Instantiated => Err(EmcoError::Conflict(format!(
            "Cluster is in an invalid state: {}",
            current
        ))),
        _ => Ok(()),
    }
}

/// Persisted ledgers with per-entity serialization.
///
/// [`StateLedger::lock`] hands out one async mutex per entity key; holders
/// may read, decide and append without another task interleaving.
#[derive(Clone)]
pub struct StateLedger {
    db: Db,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl StateLedger {
    /// Ledger persisted through `db`.
    pub fn new(db: Db) -> Self {
        Self {
            db,
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Serialize work on one entity.
    pub async fn lock<K: Serialize + Sync + ?Sized>(
        &self,
        store: &str,
        key: &K,
    ) -> Result<OwnedMutexGuard<()>> {
        let id = format!("{}/{}", store, canonical_key(&key_map(key)?));
        let lock = self.locks.entry(id).or_default().clone();
        Ok(lock.lock_owned().await)
    }

    /// Ledger of an entity, if present.
    pub async fn load<K: Serialize + Sync + ?Sized>(
        &self,
        store: &str,
        key: &K,
    ) -> Result<Option<StateInfo>> {
        Ok(self.db.find_one(store, key, TAG_STATE).await?)
    }

    /// Ledger of an entity; NotFound when missing.
    pub async fn get<K: Serialize + Sync + ?Sized>(&self, store: &str, key: &K) -> Result<StateInfo> {
        self.load(store, key)
            .await?
            .ok_or_else(|| EmcoError::NotFound("Cluster StateInfo not found".to_string()))
    }

    /// Persist a ledger.
    pub async fn save<K: Serialize + Sync + ?Sized>(
        &self,
        store: &str,
        key: &K,
        info: &StateInfo,
    ) -> Result<()> {
        Ok(self.db.insert(store, key, TAG_STATE, info).await?)
    }

    /// Load, append and persist. Callers that also inspect the current state
    /// must hold [`StateLedger::lock`].
    pub async fn append_action<K: Serialize + Sync + ?Sized>(
        &self,
        store: &str,
        key: &K,
        state: StateValue,
        context_id: &str,
        set_status_context: bool,
    ) -> Result<StateInfo> {
        let mut info = self.get(store, key).await?;
        info.append_action(state, context_id);
        if set_status_context {
            info.status_context_id = context_id.to_string();
        }
        self.save(store, key, &info).await?;
        Ok(info)
    }

    /// Point status queries at another context without appending an action.
    pub async fn update_status_context_id<K: Serialize + Sync + ?Sized>(
        &self,
        store: &str,
        key: &K,
        context_id: &str,
    ) -> Result<()> {
        let mut info = self.get(store, key).await?;
        info.status_context_id = context_id.to_string();
        self.save(store, key, &info).await
    }
}
