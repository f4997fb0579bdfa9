// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gRPC listener for the action controllers hosted in this process.
//!
//! One `Contextupdate` endpoint serves both the generic-action controller and
//! the traffic controller. The request names an intent only, so the owner is
//! found by looking the intent up under the context's project and composite
//! app: a generic k8s intent goes to the generic-action controller, a traffic
//! group to the traffic controller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};

use emco_protocol::contextupdate::contextupdate_server::{Contextupdate, ContextupdateServer};
use emco_protocol::contextupdate::{ContextUpdateRequest, ContextUpdateResponse};

use crate::appcontext::AppContext;
use crate::config::TlsConfig;
use crate::contextdb::ContextTree;
use crate::db::Db;
use crate::dtc::{TrafficController, TrafficGroupIntentClient};
use crate::error::{EmcoError, ErrorKind, Result};
use crate::gac::{GenericActionController, GenericK8sIntentClient};
use crate::types::IntentScope;

/// Which hosted controller owns an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentOwner {
    /// A generic k8s intent.
    GenericAction,
    /// A traffic group intent.
    Traffic,
}

/// `Contextupdate` implementation routing to the hosted controllers.
#[derive(Clone)]
pub struct ContextUpdateService {
    tree: ContextTree,
    generic_intents: GenericK8sIntentClient,
    traffic_groups: TrafficGroupIntentClient,
    generic: GenericActionController,
    traffic: TrafficController,
    tasks: Arc<Mutex<Vec<JoinHandle<Result<()>>>>>,
}

impl ContextUpdateService {
    /// Service over the intents in `db` and contexts in `tree`.
    pub fn new(db: Db, tree: ContextTree, generic: GenericActionController, traffic: TrafficController) -> Self {
        Self {
            tree,
            generic_intents: GenericK8sIntentClient::new(db.clone()),
            traffic_groups: TrafficGroupIntentClient::new(db),
            generic,
            traffic,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Find the controller owning `intent` in the scope of `app_context`.
    pub async fn owner(&self, intent: &str, app_context: &str) -> Result<IntentOwner> {
        let ac = AppContext::load(&self.tree, app_context).await?;
        let scope = IntentScope::from(&ac.get_composite_app_meta().await?);
        if self.generic_intents.get_generic_k8s_intent(intent, &scope).await.is_ok() {
            return Ok(IntentOwner::GenericAction);
        }
        match self.traffic_groups.get_traffic_group_intent(intent, &scope).await {
            Ok(_) => Ok(IntentOwner::Traffic),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(EmcoError::NotFound(format!("No controller owns intent {}", intent)))
            }
            Err(e) => Err(e),
        }
    }

    /// Apply `intent` to `app_context` through its owner.
    ///
    /// Service discovery tasks started by the traffic controller are kept
    /// until [`ContextUpdateService::drain`].
    #[instrument(skip(self), fields(app_context = %app_context, intent = %intent))]
    pub async fn update(&self, intent: &str, app_context: &str) -> Result<()> {
        match self.owner(intent, app_context).await? {
            IntentOwner::GenericAction => self.generic.update_app_context(intent, app_context).await,
            IntentOwner::Traffic => {
                let started = self.traffic.update_app_context(intent, app_context).await?;
                let mut tasks = self.tasks.lock().await;
                tasks.retain(|t| !t.is_finished());
                debug!(started = started.len(), running = tasks.len(), "Service discovery tasks started");
                tasks.extend(started);
                Ok(())
            }
        }
    }

    /// Wait up to `grace` for background tasks, then abort the rest.
    pub async fn drain(&self, grace: Duration) {
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        info!(tasks = tasks.len(), "Waiting for service discovery tasks");
        let deadline = tokio::time::Instant::now() + grace;
        for mut task in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(error = %e, "Service discovery task failed"),
                Ok(Err(e)) => error!(error = %e, "Service discovery task panicked"),
                Err(_) => {
                    debug!("Aborting service discovery task");
                    task.abort();
                }
            }
        }
    }
}

#[tonic::async_trait]
impl Contextupdate for ContextUpdateService {
    async fn update_app_context(
        &self,
        request: Request<ContextUpdateRequest>,
    ) -> std::result::Result<Response<ContextUpdateResponse>, Status> {
        let req = request.into_inner();
        if req.app_context.is_empty() || req.intent_name.is_empty() {
            return Err(Status::invalid_argument("appContext and intentName are required"));
        }
        let resp = match self.update(&req.intent_name, &req.app_context).await {
            Ok(()) => ContextUpdateResponse {
                app_context_updated: true,
                app_context_update_message: format!(
                    "Successful application of intent {} to {}",
                    req.intent_name, req.app_context
                ),
            },
            Err(e) => {
                error!(app_context = %req.app_context, intent = %req.intent_name, error = %e, "Context update failed");
                ContextUpdateResponse {
                    app_context_updated: false,
                    app_context_update_message: e.to_string(),
                }
            }
        };
        Ok(Response::new(resp))
    }
}

/// Read the PEM pair into a tonic TLS config.
pub async fn tls_config(tls: &TlsConfig) -> Result<ServerTlsConfig> {
    let read = |path: std::path::PathBuf| async move {
        tokio::fs::read(&path)
            .await
            .map_err(|e| EmcoError::InvalidInput(format!("Unable to read {}: {}", path.display(), e)))
    };
    let cert = read(tls.cert_path.clone()).await?;
    let key = read(tls.key_path.clone()).await?;
    Ok(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
}

/// Serve `service` on `addr` until `shutdown_rx` turns true.
pub async fn run_server(
    addr: SocketAddr,
    service: ContextUpdateService,
    tls: Option<TlsConfig>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut builder = Server::builder();
    if let Some(tls) = &tls {
        builder = builder.tls_config(tls_config(tls).await?)?;
    }
    info!(addr = %addr, tls = tls.is_some(), "Contextupdate server starting");

    builder
        .add_service(ContextupdateServer::new(service))
        .serve_with_shutdown(addr, async move {
            while shutdown_rx.changed().await.is_ok() {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            info!("Contextupdate server received shutdown signal");
        })
        .await?;

    info!("Contextupdate server stopped");
    Ok(())
}
