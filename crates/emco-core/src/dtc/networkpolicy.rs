// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ingress `NetworkPolicy` for every server intent of a traffic group.

use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use super::NETWORK_POLICY_LABEL;
use super::intent::{InboundClientsIntent, InboundClientsIntentClient, InboundServerIntent, InboundServerIntentClient};
use crate::appcontext::AppContext;
use crate::cluster::ClusterClient;
use crate::contextdb::ContextTree;
use crate::db::Db;
use crate::error::{EmcoError, ErrorKind, Result};
use crate::ncm::SEPARATOR;
use crate::types::IntentScope;

const ANY_ADDRESS: &str = "0.0.0.0/0";

/// Render the policy admitting `clients` to the pods of `server`.
///
/// Each client app is admitted by pod label. With `externalSupport` the
/// clients' CIDRs are admitted as well; without it any address is.
pub fn policy_manifest(name: &str, server: &InboundServerIntent, clients: &[InboundClientsIntent]) -> Result<String> {
    let mut from: Vec<Value> = Vec::new();
    for client in clients {
        if !client.spec.app_name.is_empty() {
            from.push(json!({ "podSelector": { "matchLabels": { "app": client.spec.app_name } } }));
        }
        if server.spec.external_support {
            from.extend(
                client
                    .spec
                    .ip_range
                    .iter()
                    .map(|cidr| json!({ "ipBlock": { "cidr": cidr } })),
            );
        }
    }
    if !server.spec.external_support {
        from.push(json!({ "ipBlock": { "cidr": ANY_ADDRESS } }));
    }

    let policy = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": { "name": name },
        "spec": {
            "podSelector": { "matchLabels": { "app": server.spec.app_name } },
            "policyTypes": ["Ingress"],
            "ingress": [{
                "from": from,
                "ports": [{ "protocol": server.spec.protocol, "port": server.spec.port }],
            }],
        },
    });
    Ok(serde_yaml::to_string(&policy)?)
}

/// Emits network policies into a context.
#[derive(Clone)]
pub struct NetworkPolicyAction {
    tree: ContextTree,
    servers: InboundServerIntentClient,
    clients: InboundClientsIntentClient,
    clusters: ClusterClient,
}

impl NetworkPolicyAction {
    /// Action over the intents in `db` and contexts in `tree`.
    pub fn new(db: Db, tree: ContextTree, clusters: ClusterClient) -> Self {
        Self {
            tree,
            servers: InboundServerIntentClient::new(db.clone()),
            clients: InboundClientsIntentClient::new(db),
            clusters,
        }
    }

    async fn supports_policies(&self, cluster: &str) -> Result<bool> {
        let (provider, name) = cluster
            .split_once(SEPARATOR)
            .ok_or_else(|| EmcoError::InvalidInput(format!("Not a valid cluster name: {}", cluster)))?;
        match self.clusters.get_cluster_label(provider, name, NETWORK_POLICY_LABEL).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Attach a policy for every server intent of `traffic_group` to the
    /// server app's clusters that support network policies.
    #[instrument(skip(self), fields(app_context = %app_context, intent = %traffic_group))]
    pub async fn update_app_context(&self, traffic_group: &str, app_context: &str) -> Result<()> {
        let ac = AppContext::load(&self.tree, app_context).await?;
        let meta = ac.get_composite_app_meta().await?;
        let scope = IntentScope::from(&meta);

        for server in self.servers.get_server_inbound_intents(&scope, traffic_group).await? {
            let clients = self
                .clients
                .get_clients_inbound_intents(&scope, traffic_group, &server.metadata.name)
                .await?;
            let name = format!("{}-{}", traffic_group, server.metadata.name);
            let manifest = policy_manifest(&name, &server, &clients)?;
            let resource = format!("{}+NetworkPolicy", name);
            let app = &server.spec.app_name;

            for cluster in ac.get_cluster_names(app).await? {
                if !self.supports_policies(&cluster).await? {
                    debug!(app, cluster, "Cluster does not support network policies");
                    continue;
                }
                ac.attach_resource(app, &cluster, &resource, &manifest).await?;
                info!(app, cluster, resource = %resource, "Network policy added");
            }
        }
        Ok(())
    }
}
