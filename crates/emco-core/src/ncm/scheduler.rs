// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Apply/Terminate/Stop lifecycle of a cluster's network intents.
//!
//! Every transition runs under the cluster's ledger lock: read the current
//! state, consult [`cluster_intents_guard`], act, append. The append is the
//! commit point; a failed install discards the fresh context and leaves the
//! ledger untouched.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, instrument, warn};

use super::{CONTEXT_CLUSTER_APP, NetworkClient, ProviderNetClient, SEPARATOR, cni};
use crate::appcontext::{AppContext, INST_DEPENDENCY, INST_ORDER, LEVEL_APP, StatusValue};
use crate::cluster::{CLUSTER_STORE, ClusterKey};
use crate::contextdb::ContextTree;
use crate::controller::Synchronizer;
use crate::error::{EmcoError, Result};
use crate::state::{LifecycleAction, StateInfo, StateLedger, StateValue, Transition, cluster_intents_guard};
use crate::status::{ClusterStatusResult, StatusQuery, prepare_cluster_status_result};

/// Drives cluster network intents through the synchronizer.
#[derive(Clone)]
pub struct SchedulerClient {
    ledger: StateLedger,
    tree: ContextTree,
    networks: NetworkClient,
    provider_nets: ProviderNetClient,
    synchronizer: Arc<dyn Synchronizer>,
}

async fn discard(ac: &AppContext) {
    if let Err(e) = ac.delete_composite_app().await {
        warn!(app_context = %ac.id(), error = %e, "Error deleting AppContext");
    }
}

impl SchedulerClient {
    /// Scheduler over the given stores and synchronizer.
    pub fn new(
        ledger: StateLedger,
        tree: ContextTree,
        networks: NetworkClient,
        provider_nets: ProviderNetClient,
        synchronizer: Arc<dyn Synchronizer>,
    ) -> Self {
        Self {
            ledger,
            tree,
            networks,
            provider_nets,
            synchronizer,
        }
    }

    async fn cluster_state(&self, key: &ClusterKey) -> Result<(StateInfo, StateValue)> {
        let info = self.ledger.load(CLUSTER_STORE, key).await?.ok_or_else(|| {
            EmcoError::NotFound(format!(
                "Error finding cluster: {} {}",
                key.provider, key.cluster
            ))
        })?;
        let current = info.current_state()?;
        Ok((info, current))
    }

    async fn build_context(&self, ac: &AppContext, provider: &str, cluster: &str) -> Result<()> {
        let root = ac.composite_app_handle();
        let app = ac.add_app(CONTEXT_CLUSTER_APP).await?;
        ac.add_instruction(&root, LEVEL_APP, INST_ORDER, json!({ "apporder": [CONTEXT_CLUSTER_APP] }))
            .await?;
        ac.add_instruction(
            &root,
            LEVEL_APP,
            INST_DEPENDENCY,
            json!({ "appdependency": { CONTEXT_CLUSTER_APP: "go" } }),
        )
        .await?;
        ac.add_cluster(&app, &format!("{provider}{SEPARATOR}{cluster}"))
            .await?;
        cni::apply(ac, &self.networks, &self.provider_nets, provider, cluster).await?;
        Ok(())
    }

    /// Render the cluster's intents into a new context and install it.
    #[instrument(skip(self))]
    pub async fn apply_network_intents(&self, provider: &str, cluster: &str) -> Result<()> {
        let key = ClusterKey::new(provider, cluster);
        let _guard = self.ledger.lock(CLUSTER_STORE, &key).await?;
        let (_, current) = self.cluster_state(&key).await?;
        if cluster_intents_guard(current, LifecycleAction::Apply)? == Transition::NoOp {
            info!(provider, cluster, state = %current, "Network intents already applied");
            return Ok(());
        }

        let ac = AppContext::init(&self.tree).await?;
        if let Err(e) = self.build_context(&ac, provider, cluster).await {
            error!(app_context = %ac.id(), provider, cluster, error = %e, "Error building network intents context");
            discard(&ac).await;
            return Err(e);
        }
        if let Err(e) = self.synchronizer.install_app(ac.id()).await {
            error!(app_context = %ac.id(), provider, cluster, error = %e, "InstallApp failed");
            discard(&ac).await;
            return Err(e);
        }

        self.ledger
            .append_action(CLUSTER_STORE, &key, StateValue::Applied, ac.id(), true)
            .await
            .inspect_err(|e| {
                warn!(app_context = %ac.id(), provider, cluster, error = %e, "Error updating cluster state");
            })?;
        info!(app_context = %ac.id(), provider, cluster, "Network intents applied");
        Ok(())
    }

    /// Uninstall the last applied context.
    #[instrument(skip(self))]
    pub async fn terminate_network_intents(&self, provider: &str, cluster: &str) -> Result<()> {
        let key = ClusterKey::new(provider, cluster);
        let _guard = self.ledger.lock(CLUSTER_STORE, &key).await?;
        let (info, current) = self.cluster_state(&key).await?;
        if cluster_intents_guard(current, LifecycleAction::Terminate)? == Transition::NoOp {
            info!(provider, cluster, state = %current, "Network intents already terminated");
            return Ok(());
        }

        let context_id = info.last_context_id()?;
        self.synchronizer.uninstall_app(&context_id).await?;
        self.ledger
            .append_action(CLUSTER_STORE, &key, StateValue::Terminated, &context_id, false)
            .await?;
        info!(app_context = %context_id, provider, cluster, "Network intents terminated");
        Ok(())
    }

    /// Raise the stop flag of an in-flight install or uninstall.
    #[instrument(skip(self))]
    pub async fn stop_network_intents(&self, provider: &str, cluster: &str) -> Result<()> {
        let key = ClusterKey::new(provider, cluster);
        let _guard = self.ledger.lock(CLUSTER_STORE, &key).await?;
        let (info, current) = self.cluster_state(&key).await?;
        let Transition::Proceed(stop_state) = cluster_intents_guard(current, LifecycleAction::Stop)? else {
            return Ok(());
        };

        let context_id = info.last_context_id()?;
        let ac = AppContext::load(&self.tree, &context_id).await?;
        let status = ac.get_app_context_status().await?.status;
        if !matches!(status, StatusValue::Instantiating | StatusValue::Terminating) {
            return Err(EmcoError::Conflict(format!(
                "Cluster network intents are not instantiating or terminating: {}",
                cluster
            )));
        }
        ac.update_stop_flag(true).await?;
        self.ledger
            .append_action(CLUSTER_STORE, &key, stop_state, &context_id, false)
            .await?;
        info!(app_context = %context_id, provider, cluster, state = %stop_state, "Network intents stopped");
        Ok(())
    }

    /// Status of the cluster's network intents.
    pub async fn network_intents_status(
        &self,
        provider: &str,
        cluster: &str,
        query: &StatusQuery,
    ) -> Result<ClusterStatusResult> {
        let info = self
            .ledger
            .load(CLUSTER_STORE, &ClusterKey::new(provider, cluster))
            .await?
            .ok_or_else(|| EmcoError::NotFound("cluster state not found".to_string()))?;
        let mut result = prepare_cluster_status_result(&self.tree, &info, query).await?;
        result.name = format!("{provider}{SEPARATOR}{cluster}");
        Ok(result)
    }
}
