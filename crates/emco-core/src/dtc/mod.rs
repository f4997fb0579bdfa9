// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Traffic groups: inbound server and client intents, and the two actions
//! run for them when a composite app is instantiated.
//!
//! The network policy action writes resources straight into the context.
//! Service discovery runs as background tasks and deploys child contexts of
//! its own, which [`janitor::ContextJanitor`] keeps consistent with their
//! parents.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::instrument;

use crate::cluster::ClusterClient;
use crate::contextdb::ContextTree;
use crate::controller::{ReadyNotifier, Synchronizer};
use crate::db::Db;
use crate::error::Result;

pub mod intent;
pub mod janitor;
pub mod networkpolicy;
pub mod servicediscovery;

pub use intent::{
    InboundClientsIntent, InboundClientsIntentClient, InboundClientsIntentSpec, InboundServerIntent,
    InboundServerIntentClient, InboundServerIntentSpec, TrafficGroupIntent, TrafficGroupIntentClient,
};
pub use janitor::{ContextJanitor, SweepReport};
pub use networkpolicy::NetworkPolicyAction;
pub use servicediscovery::{KvNodeAddressResolver, NodeAddressResolver, ServiceDiscovery};

/// Store of traffic group intents.
pub const DTC_STORE: &str = "orchestrator";
/// Traffic group record tag.
pub const TAG_TRAFFIC_GROUP: &str = "trafficgroupintentmetadata";
/// Inbound server intent record tag.
pub const TAG_SERVER_INTENT: &str = "inboundserverintentmetadata";
/// Inbound clients intent record tag.
pub const TAG_CLIENTS_INTENT: &str = "inboundclientsintentmetadata";
/// Cluster label marking clusters that enforce network policies.
pub const NETWORK_POLICY_LABEL: &str = "networkpolicy-supported";
/// Composite app name of service discovery child contexts.
pub const SERVICE_DISCOVERY_APP: &str = "service-discovery";
/// Client name used when subscribing to readiness alerts.
pub const READY_CLIENT: &str = "dtc";

/// Both traffic actions behind one entry point.
#[derive(Clone)]
pub struct TrafficController {
    network_policy: NetworkPolicyAction,
    service_discovery: ServiceDiscovery,
}

impl TrafficController {
    /// Controller over the intents in `db` and the contexts in `tree`.
    pub fn new(
        db: Db,
        tree: ContextTree,
        clusters: ClusterClient,
        notifier: Arc<dyn ReadyNotifier>,
        synchronizer: Arc<dyn Synchronizer>,
        retry: Duration,
    ) -> Self {
        let resolver = Arc::new(KvNodeAddressResolver::new(clusters.clone()));
        Self {
            network_policy: NetworkPolicyAction::new(db.clone(), tree.clone(), clusters),
            service_discovery: ServiceDiscovery::new(db, tree, notifier, synchronizer, resolver, retry),
        }
    }

    /// Replace the service discovery action, e.g. to use another resolver.
    pub fn with_service_discovery(mut self, service_discovery: ServiceDiscovery) -> Self {
        self.service_discovery = service_discovery;
        self
    }

    /// Apply `traffic_group` to `app_context`.
    ///
    /// Policies are attached before returning. Service discovery continues in
    /// the returned tasks.
    #[instrument(skip(self), fields(app_context = %app_context, intent = %traffic_group))]
    pub async fn update_app_context(
        &self,
        traffic_group: &str,
        app_context: &str,
    ) -> Result<Vec<JoinHandle<Result<()>>>> {
        self.network_policy.update_app_context(traffic_group, app_context).await?;
        self.service_discovery.update_app_context(traffic_group, app_context).await
    }
}
