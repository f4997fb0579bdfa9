// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable control plane.
//!
//! [`ControlPlane`] wires the catalogs, the network-intent scheduler and the
//! action controllers over one KV store and one context store.
//! [`ControlPlane::start`] spawns the `Contextupdate` listener and the context
//! janitor and returns an [`EmcoRuntime`] for graceful shutdown.
//!
//! ```rust,ignore
//! let db = Db::new(Arc::new(SqliteKvStore::connect(&config.database_url).await?));
//! let plane = ControlPlane::from_config(db, ContextTree::memory(), &config);
//! plane.registry.init_controllers().await?;
//! let runtime = plane.start(&config).await?;
//! tokio::signal::ctrl_c().await?;
//! runtime.shutdown().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cluster::ClusterClient;
use crate::config::Config;
use crate::contextdb::ContextTree;
use crate::controller::{
    ClusterEventPublisher, ControllerGroup, ControllerRegistry, GrpcClusterEventPublisher, GrpcReadyNotifier,
    GrpcSynchronizer, ReadyNotifier, RpcTimeouts, Synchronizer,
};
use crate::db::Db;
use crate::dtc::{ContextJanitor, TrafficController};
use crate::error::{EmcoError, Result};
use crate::gac::GenericActionController;
use crate::ncm::{NetworkClient, ProviderNetClient, SchedulerClient};
use crate::server::{ContextUpdateService, run_server};
use crate::state::StateLedger;

/// Grace period for service discovery tasks on shutdown.
pub const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Every component of the control plane over shared stores.
#[derive(Clone)]
pub struct ControlPlane {
    /// KV store.
    pub db: Db,
    /// Context store.
    pub tree: ContextTree,
    /// Placement/action controllers and the synchronizer.
    pub registry: ControllerRegistry,
    /// Cluster-lifecycle controllers.
    pub clm_registry: ControllerRegistry,
    /// Cluster and provider catalog.
    pub clusters: ClusterClient,
    /// Networks.
    pub networks: NetworkClient,
    /// Provider networks.
    pub provider_nets: ProviderNetClient,
    /// Network-intent scheduler.
    pub scheduler: SchedulerClient,
    /// Generic-action controller.
    pub generic: GenericActionController,
    /// Network policy and service discovery.
    pub traffic: TrafficController,
    janitor_interval: Duration,
}

impl ControlPlane {
    /// Wire the components with gRPC collaborators resolved through the
    /// controller registries.
    pub fn from_config(db: Db, tree: ContextTree, config: &Config) -> Self {
        let timeouts = RpcTimeouts {
            publish: config.publish_timeout,
            lookup: config.lookup_timeout,
        };
        let registry = ControllerRegistry::new(db.clone(), ControllerGroup::Orchestrator, timeouts);
        let clm_registry = ControllerRegistry::new(db.clone(), ControllerGroup::Clm, timeouts);
        let mut plane = Self::with_collaborators(
            db,
            tree,
            Arc::new(GrpcSynchronizer::new(registry.clone())),
            Arc::new(GrpcReadyNotifier::new(registry.clone())),
            Arc::new(GrpcClusterEventPublisher::new(clm_registry.clone())),
            config.alert_retry,
        );
        plane.registry = registry;
        plane.clm_registry = clm_registry;
        plane.janitor_interval = config.janitor_interval;
        plane
    }

    /// Wire the components around the given collaborators.
    pub fn with_collaborators(
        db: Db,
        tree: ContextTree,
        synchronizer: Arc<dyn Synchronizer>,
        notifier: Arc<dyn ReadyNotifier>,
        publisher: Arc<dyn ClusterEventPublisher>,
        alert_retry: Duration,
    ) -> Self {
        let ledger = StateLedger::new(db.clone());
        let clusters = ClusterClient::new(db.clone(), ledger.clone(), tree.clone(), publisher);
        let networks = NetworkClient::new(db.clone(), ledger.clone());
        let provider_nets = ProviderNetClient::new(db.clone(), ledger.clone());
        let scheduler = SchedulerClient::new(
            ledger,
            tree.clone(),
            networks.clone(),
            provider_nets.clone(),
            synchronizer.clone(),
        );
        let generic = GenericActionController::new(db.clone(), tree.clone(), clusters.clone());
        let traffic = TrafficController::new(
            db.clone(),
            tree.clone(),
            clusters.clone(),
            notifier,
            synchronizer,
            alert_retry,
        );
        Self {
            registry: ControllerRegistry::new(db.clone(), ControllerGroup::Orchestrator, RpcTimeouts::default()),
            clm_registry: ControllerRegistry::new(db.clone(), ControllerGroup::Clm, RpcTimeouts::default()),
            db,
            tree,
            clusters,
            networks,
            provider_nets,
            scheduler,
            generic,
            traffic,
            janitor_interval: Config::default().janitor_interval,
        }
    }

    /// The `Contextupdate` service over these components.
    pub fn context_update_service(&self) -> ContextUpdateService {
        ContextUpdateService::new(
            self.db.clone(),
            self.tree.clone(),
            self.generic.clone(),
            self.traffic.clone(),
        )
    }

    /// Spawn the listener and the janitor.
    pub async fn start(&self, config: &Config) -> Result<EmcoRuntime> {
        let service = self.context_update_service();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let addr = config.grpc_addr;
        let server_handle = tokio::spawn(run_server(addr, service.clone(), config.tls.clone(), shutdown_rx));

        let janitor = Arc::new(ContextJanitor::new(self.tree.clone(), self.janitor_interval));
        let janitor_shutdown = janitor.shutdown_handle();
        let janitor_handle = tokio::spawn(async move { janitor.run().await });

        info!(addr = %addr, "EMCO runtime started");
        Ok(EmcoRuntime {
            addr,
            service,
            shutdown_tx,
            server_handle,
            janitor_shutdown,
            janitor_handle,
        })
    }
}

/// A started control plane.
pub struct EmcoRuntime {
    addr: SocketAddr,
    service: ContextUpdateService,
    shutdown_tx: watch::Sender<bool>,
    server_handle: JoinHandle<Result<()>>,
    janitor_shutdown: Arc<Notify>,
    janitor_handle: JoinHandle<()>,
}

impl EmcoRuntime {
    /// Listen address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the listener is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }

    /// Stop accepting requests, then drain background work.
    pub async fn shutdown(self) -> Result<()> {
        info!("EMCO runtime shutting down...");
        let _ = self.shutdown_tx.send(true);
        let served = match self.server_handle.await {
            Ok(r) => r,
            Err(e) => Err(EmcoError::Upstream(format!("server task panicked: {}", e))),
        };

        self.janitor_shutdown.notify_one();
        if let Err(e) = self.janitor_handle.await {
            error!(error = %e, "Context janitor task panicked");
        }
        self.service.drain(DRAIN_GRACE).await;

        match &served {
            Ok(()) => info!("EMCO runtime shutdown complete"),
            Err(e) => error!(error = %e, "Server error during shutdown"),
        }
        served
    }
}
