// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-cluster service discovery.
//!
//! For every server intent with a service, a task waits on the
//! synchronizer's readiness alerts until the server app is deployed and its
//! service has a reachable address. Every client cluster that does not host
//! the service then gets a child context holding a headless `Service` and an
//! `Endpoints` pointing at that address.
//!
//! Tasks only talk back through the contexts: the parent's stop flag ends a
//! task early, and each child is linked into the parent meta before it is
//! installed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, instrument, warn};

use super::intent::{InboundClientsIntentClient, InboundServerIntent, InboundServerIntentClient};
use super::{READY_CLIENT, SERVICE_DISCOVERY_APP};
use crate::appcontext::{
    AppContext, CompositeAppMeta, INST_DEPENDENCY, INST_ORDER, LEVEL_APP, LEVEL_RESOURCE, StatusValue,
};
use crate::cluster::ClusterClient;
use crate::contextdb::ContextTree;
use crate::controller::{AlertStream, ReadyNotifier, Synchronizer};
use crate::db::Db;
use crate::error::{EmcoError, ErrorKind, Result};
use crate::ncm::SEPARATOR;
use crate::status::ResourceBundleStatus;
use crate::types::IntentScope;

/// Cluster kv-pairs object holding the master node address.
pub const MASTER_NODE_KV: &str = "master-node";
/// Key of the address inside [`MASTER_NODE_KV`].
pub const MASTER_NODE_IP: &str = "ip";

/// Finds the address of a cluster's master node, used for `NodePort`
/// services.
#[async_trait]
pub trait NodeAddressResolver: Send + Sync {
    /// Address of the master node of `cluster` (`<provider>+<cluster>`).
    async fn master_node_ip(&self, cluster: &str) -> Result<String>;
}

/// Reads the address from the cluster kv-pair `master-node`, key `ip`.
#[derive(Clone)]
pub struct KvNodeAddressResolver {
    clusters: ClusterClient,
}

impl KvNodeAddressResolver {
    /// Resolver over the cluster catalog.
    pub fn new(clusters: ClusterClient) -> Self {
        Self { clusters }
    }
}

#[async_trait]
impl NodeAddressResolver for KvNodeAddressResolver {
    async fn master_node_ip(&self, cluster: &str) -> Result<String> {
        let (provider, name) = cluster
            .split_once(SEPARATOR)
            .ok_or_else(|| EmcoError::InvalidInput(format!("Not a valid cluster name: {}", cluster)))?;
        let v = self
            .clusters
            .get_cluster_kv_pairs_value(provider, name, MASTER_NODE_KV, MASTER_NODE_IP)
            .await?;
        v.get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EmcoError::InvalidInput(format!("Master node ip of {} is not a string", cluster)))
    }
}

/// A port of the server's service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Port.
    pub port: u32,
    /// Protocol, `TCP` when absent.
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// Where the server's service was found reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Cluster hosting the service.
    pub cluster: String,
    /// Reachable address.
    pub ip: String,
    /// Ports of the service.
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceView {
    metadata: NameView,
    spec: ServiceSpecView,
    status: ServiceStatusView,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NameView {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceSpecView {
    #[serde(rename = "type")]
    service_type: String,
    ports: Vec<ServicePort>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceStatusView {
    #[serde(rename = "loadBalancer")]
    load_balancer: LoadBalancerView,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoadBalancerView {
    ingress: Vec<IngressView>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct IngressView {
    ip: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeploymentView {
    metadata: NameView,
    status: DeploymentStatusView,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeploymentStatusView {
    conditions: Vec<ConditionView>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConditionView {
    #[serde(rename = "type")]
    condition_type: String,
    status: String,
}

/// What a status document says about the server's service.
#[derive(Debug, PartialEq, Eq)]
enum Lookup {
    NodePort(Vec<ServicePort>),
    LoadBalancer(String, Vec<ServicePort>),
    Pending,
    Unsupported(String),
}

/// Whether deployment `name` reports `Available` or `Progressing`.
fn deployment_ready(bundle: &ResourceBundleStatus, name: &str) -> bool {
    bundle
        .deployment_statuses
        .iter()
        .filter_map(|d| serde_json::from_value::<DeploymentView>(d.clone()).ok())
        .filter(|d| d.metadata.name == name)
        .any(|d| {
            d.status.conditions.iter().any(|c| {
                matches!(c.condition_type.as_str(), "Available" | "Progressing") && c.status == "True"
            })
        })
}

fn lookup_service(bundle: &ResourceBundleStatus, name: &str) -> Lookup {
    let Some(svc) = bundle
        .service_statuses
        .iter()
        .filter_map(|s| serde_json::from_value::<ServiceView>(s.clone()).ok())
        .find(|s| s.metadata.name == name)
    else {
        return Lookup::Pending;
    };
    match svc.spec.service_type.as_str() {
        "NodePort" => Lookup::NodePort(svc.spec.ports),
        "LoadBalancer" => match svc.status.load_balancer.ingress.iter().find(|i| !i.ip.is_empty()) {
            Some(ingress) => Lookup::LoadBalancer(ingress.ip.clone(), svc.spec.ports),
            None => Lookup::Pending,
        },
        other => Lookup::Unsupported(other.to_string()),
    }
}

/// Outcome of a resolution pass over the server's clusters.
#[derive(Debug)]
enum Resolution {
    Ready(ServiceEndpoint),
    Pending,
    Unsupported,
}

fn port_name(p: &ServicePort) -> String {
    p.port.to_string()
}

fn object_meta(name: &str, namespace: &str) -> Value {
    if namespace.is_empty() {
        json!({ "name": name })
    } else {
        json!({ "name": name, "namespace": namespace })
    }
}

/// Headless service standing in for the remote server.
pub fn service_manifest(name: &str, namespace: &str, ports: &[ServicePort]) -> Result<String> {
    let ports: Vec<Value> = ports
        .iter()
        .map(|p| {
            json!({
                "name": port_name(p),
                "protocol": p.protocol,
                "port": p.port,
                "targetPort": p.port,
            })
        })
        .collect();
    let svc = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": object_meta(name, namespace),
        "spec": {
            "ports": ports,
            "clusterIP": "None",
            "sessionAffinity": "None",
            "type": "ClusterIP",
        },
    });
    Ok(serde_yaml::to_string(&svc)?)
}

/// Endpoints of the headless service, pointing at `ip`.
pub fn endpoints_manifest(name: &str, namespace: &str, ip: &str, ports: &[ServicePort]) -> Result<String> {
    let ports: Vec<Value> = ports
        .iter()
        .map(|p| json!({ "name": port_name(p), "port": p.port }))
        .collect();
    let ep = json!({
        "apiVersion": "v1",
        "kind": "Endpoints",
        "metadata": object_meta(name, namespace),
        "subsets": [{
            "addresses": [{ "ip": ip }],
            "ports": ports,
        }],
    });
    Ok(serde_yaml::to_string(&ep)?)
}

/// One server intent being watched.
#[derive(Debug, Clone)]
struct Watch {
    app_context: String,
    server_app: String,
    service: String,
    // client app -> service name
    clients: BTreeMap<String, String>,
}

/// The service-discovery action.
#[derive(Clone)]
pub struct ServiceDiscovery {
    tree: ContextTree,
    servers: InboundServerIntentClient,
    clients: InboundClientsIntentClient,
    notifier: Arc<dyn ReadyNotifier>,
    synchronizer: Arc<dyn Synchronizer>,
    resolver: Arc<dyn NodeAddressResolver>,
    retry: Duration,
}

impl ServiceDiscovery {
    /// Action over the intents in `db` and contexts in `tree`; `retry` is the
    /// back-off after a transient alert-stream failure.
    pub fn new(
        db: Db,
        tree: ContextTree,
        notifier: Arc<dyn ReadyNotifier>,
        synchronizer: Arc<dyn Synchronizer>,
        resolver: Arc<dyn NodeAddressResolver>,
        retry: Duration,
    ) -> Self {
        Self {
            tree,
            servers: InboundServerIntentClient::new(db.clone()),
            clients: InboundClientsIntentClient::new(db),
            notifier,
            synchronizer,
            resolver,
            retry,
        }
    }

    /// Subscribe to readiness alerts of `app_context` and start one watch
    /// task per server intent of `traffic_group` that exposes a service.
    #[instrument(skip(self), fields(app_context = %app_context, intent = %traffic_group))]
    pub async fn update_app_context(
        &self,
        traffic_group: &str,
        app_context: &str,
    ) -> Result<Vec<JoinHandle<Result<()>>>> {
        let ac = AppContext::load(&self.tree, app_context).await?;
        let scope = IntentScope::from(&ac.get_composite_app_meta().await?);

        let mut tasks = Vec::new();
        for server in self.servers.get_server_inbound_intents(&scope, traffic_group).await? {
            let Some(watch) = self.watch_for(&scope, traffic_group, app_context, &server).await? else {
                continue;
            };
            let stream = self.notifier.alert(READY_CLIENT, app_context).await?;
            info!(server = %watch.server_app, service = %watch.service, "Watching server app");
            let this = self.clone();
            tasks.push(tokio::spawn(async move { this.run(watch, stream).await }));
        }
        Ok(tasks)
    }

    async fn watch_for(
        &self,
        scope: &IntentScope,
        traffic_group: &str,
        app_context: &str,
        server: &InboundServerIntent,
    ) -> Result<Option<Watch>> {
        if server.spec.service_name.is_empty() {
            debug!(server = %server.metadata.name, "Server intent has no service");
            return Ok(None);
        }
        let mut clients = BTreeMap::new();
        for ci in self
            .clients
            .get_clients_inbound_intents(scope, traffic_group, &server.metadata.name)
            .await?
        {
            if ci.spec.app_name.is_empty() {
                debug!(clients = %ci.metadata.name, "Clients intent has no app");
                continue;
            }
            clients.insert(ci.spec.app_name, server.spec.service_name.clone());
        }
        if clients.is_empty() {
            debug!(server = %server.metadata.name, "Server intent has no client apps");
            return Ok(None);
        }
        Ok(Some(Watch {
            app_context: app_context.to_string(),
            server_app: server.spec.app_name.clone(),
            service: server.spec.service_name.clone(),
            clients,
        }))
    }

    async fn run(self, watch: Watch, stream: AlertStream) -> Result<()> {
        let ac = AppContext::load(&self.tree, &watch.app_context).await?;
        let outcome = self.await_endpoint(&ac, &watch, stream).await;
        if let Err(e) = self.notifier.unsubscribe(READY_CLIENT, &watch.app_context).await {
            warn!(app_context = %watch.app_context, error = %e, "Failed to unsubscribe from alerts");
        }
        let endpoint = match outcome {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => return Ok(()),
            Err(e) => {
                error!(app_context = %watch.app_context, app = %watch.server_app, error = %e, "Service discovery failed");
                return Err(e);
            }
        };

        if ac.get_app_context_status().await?.status != StatusValue::Instantiated
            || ac.get_stop_flag().await?
        {
            info!(app_context = %watch.app_context, "Parent no longer instantiated, skipping service entries");
            return Ok(());
        }
        for (client, service) in &watch.clients {
            self.deploy_service_entry(&ac, &endpoint, client, service)
                .await
                .inspect_err(|e| {
                    error!(app_context = %watch.app_context, app = %client, error = %e, "Unable to deploy the service entry");
                })?;
        }
        Ok(())
    }

    /// Loop until the server's service is reachable; `None` when stopped or
    /// when the service type cannot be proxied.
    async fn await_endpoint(
        &self,
        ac: &AppContext,
        watch: &Watch,
        stream: AlertStream,
    ) -> Result<Option<ServiceEndpoint>> {
        let mut stream = Some(stream);
        loop {
            match ac.get_stop_flag().await {
                Ok(true) => {
                    info!(app_context = %watch.app_context, "Stop flag set, ending service discovery");
                    return Ok(None);
                }
                Ok(false) => {}
                Err(e) => warn!(app_context = %watch.app_context, error = %e, "Unable to read the stop flag"),
            }

            match ac.get_app_context_status().await.map(|s| s.status) {
                Ok(StatusValue::Instantiated) => {
                    if self.server_ready(ac, &watch.server_app).await? {
                        match self.resolve(ac, watch).await? {
                            Resolution::Ready(endpoint) => return Ok(Some(endpoint)),
                            Resolution::Unsupported => return Ok(None),
                            Resolution::Pending => {
                                debug!(service = %watch.service, "Service address not assigned yet");
                            }
                        }
                    } else {
                        debug!(app = %watch.server_app, "Server app not deployed yet");
                    }
                }
                Ok(StatusValue::Instantiating) => {
                    debug!(app_context = %watch.app_context, "Parent still instantiating");
                }
                Ok(other) => {
                    return Err(EmcoError::Conflict(format!(
                        "Parent AppContext {} is {}",
                        watch.app_context, other
                    )));
                }
                Err(e) => {
                    warn!(app_context = %watch.app_context, error = %e, "Unable to read the AppContext status");
                }
            }

            if stream.is_none() {
                tokio::time::sleep(self.retry).await;
                stream = self
                    .notifier
                    .alert(READY_CLIENT, &watch.app_context)
                    .await
                    .inspect_err(|e| warn!(error = %e, "Unable to resubscribe to alerts"))
                    .ok();
                continue;
            }
            let Some(alerts) = stream.as_mut() else {
                continue;
            };
            match alerts.next().await {
                Some(Ok(n)) => debug!(app_context = %n.app_context, message = %n.message, "Received alert"),
                Some(Err(status)) => {
                    let err = EmcoError::from(status);
                    if !err.is_transient() {
                        return Err(err);
                    }
                    warn!(app_context = %watch.app_context, error = %err, "Alert stream interrupted, retrying");
                    tokio::time::sleep(self.retry).await;
                }
                None => {
                    warn!(app_context = %watch.app_context, "Alert stream ended");
                    stream = None;
                }
            }
        }
    }

    /// Status document of `cluster`, if one has been reported and decodes.
    async fn cluster_status(&self, ac: &AppContext, app: &str, cluster: &str) -> Result<Option<ResourceBundleStatus>> {
        let handle = match ac.get_cluster_status_handle(app, cluster).await {
            Ok(h) => h,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match ResourceBundleStatus::from_value(&ac.get_value(&handle).await?) {
            Ok(bundle) => Ok(Some(bundle)),
            Err(e) => {
                warn!(app, cluster, error = %e, "Unable to decode the cluster status");
                Ok(None)
            }
        }
    }

    /// Whether the server deployment is up in every cluster of the app.
    async fn server_ready(&self, ac: &AppContext, app: &str) -> Result<bool> {
        let release = ac.get_composite_app_meta().await?.release;
        let deployment = if release.is_empty() {
            app.to_string()
        } else {
            format!("{}-{}", release, app)
        };
        let clusters = ac.get_cluster_names(app).await?;
        if clusters.is_empty() {
            return Ok(false);
        }
        for cluster in clusters {
            match self.cluster_status(ac, app, &cluster).await? {
                Some(bundle) if deployment_ready(&bundle, &deployment) => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    async fn resolve(&self, ac: &AppContext, watch: &Watch) -> Result<Resolution> {
        for cluster in ac.get_cluster_names(&watch.server_app).await? {
            let Some(bundle) = self.cluster_status(ac, &watch.server_app, &cluster).await? else {
                continue;
            };
            let (ip, ports) = match lookup_service(&bundle, &watch.service) {
                Lookup::NodePort(ports) => (self.resolver.master_node_ip(&cluster).await?, ports),
                Lookup::LoadBalancer(ip, ports) => (ip, ports),
                Lookup::Pending => continue,
                Lookup::Unsupported(kind) => {
                    info!(service = %watch.service, kind = %kind, "Service type cannot be proxied");
                    return Ok(Resolution::Unsupported);
                }
            };
            info!(service = %watch.service, cluster = %cluster, ip = %ip, "Service address found");
            return Ok(Resolution::Ready(ServiceEndpoint { cluster, ip, ports }));
        }
        Ok(Resolution::Pending)
    }

    /// One child context per cluster of `client` other than the one hosting
    /// the service.
    async fn deploy_service_entry(
        &self,
        parent: &AppContext,
        endpoint: &ServiceEndpoint,
        client: &str,
        service: &str,
    ) -> Result<()> {
        let meta = parent.get_composite_app_meta().await?;
        let service_yaml = service_manifest(service, &meta.namespace, &endpoint.ports)?;
        let endpoints_yaml = endpoints_manifest(service, &meta.namespace, &endpoint.ip, &endpoint.ports)?;
        for cluster in parent.get_cluster_names(client).await? {
            if cluster == endpoint.cluster {
                debug!(app = client, cluster, "Client shares the server cluster");
                continue;
            }
            let child = AppContext::init(&self.tree).await?;
            let deployed = self
                .deploy_child(parent, &child, &meta, &cluster, service, &service_yaml, &endpoints_yaml)
                .await;
            if let Err(e) = deployed {
                error!(app_context = %parent.id(), app = client, cluster, error = %e, "Error deploying child context");
                if let Err(e) = parent.remove_child_context_id(child.id()).await {
                    warn!(app_context = %parent.id(), error = %e, "Error unlinking child context");
                }
                if let Err(e) = child.delete_composite_app().await {
                    warn!(app_context = %child.id(), error = %e, "Error deleting child context");
                }
                return Err(e);
            }
            info!(app_context = %parent.id(), child = %child.id(), app = client, cluster, "Service entry deployed");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn deploy_child(
        &self,
        parent: &AppContext,
        child: &AppContext,
        meta: &CompositeAppMeta,
        cluster: &str,
        service: &str,
        service_yaml: &str,
        endpoints_yaml: &str,
    ) -> Result<()> {
        let root = child.composite_app_handle();
        let svc_name = format!("{}+Service", service);
        let ep_name = format!("{}+Endpoint", service);

        let app = child.add_app(SERVICE_DISCOVERY_APP).await?;
        let ch = child.add_cluster(&app, cluster).await?;
        child.add_resource(&ch, &svc_name, service_yaml).await?;
        child.add_resource(&ch, &ep_name, endpoints_yaml).await?;
        child
            .add_instruction(&ch, LEVEL_RESOURCE, INST_ORDER, json!({ "resorder": [ep_name, svc_name] }))
            .await?;
        child
            .add_instruction(
                &ch,
                LEVEL_RESOURCE,
                INST_DEPENDENCY,
                json!({ "resdependency": { &svc_name: "go", &ep_name: "go" } }),
            )
            .await?;
        child
            .add_instruction(&root, LEVEL_APP, INST_ORDER, json!({ "apporder": [SERVICE_DISCOVERY_APP] }))
            .await?;
        child
            .add_instruction(
                &root,
                LEVEL_APP,
                INST_DEPENDENCY,
                json!({ "appdependency": { SERVICE_DISCOVERY_APP: "go" } }),
            )
            .await?;
        child
            .add_composite_app_meta(&CompositeAppMeta {
                composite_app: SERVICE_DISCOVERY_APP.to_string(),
                child_context_ids: Vec::new(),
                ..meta.clone()
            })
            .await?;

        parent.add_child_context_id(child.id()).await?;
        self.synchronizer.install_app(child.id()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(v: Value) -> ResourceBundleStatus {
        ResourceBundleStatus::from_value(&v).unwrap()
    }

    #[test]
    fn test_deployment_ready_needs_true_condition() {
        let b = bundle(json!({
            "deploymentStatuses": [
                {"metadata": {"name": "r1-server"}, "status": {"conditions": [
                    {"type": "ReplicaFailure", "status": "True"},
                    {"type": "Available", "status": "True"}
                ]}},
                {"metadata": {"name": "r1-other"}, "status": {"conditions": [
                    {"type": "Available", "status": "False"}
                ]}}
            ]
        }));
        assert!(deployment_ready(&b, "r1-server"));
        assert!(!deployment_ready(&b, "r1-other"));
        assert!(!deployment_ready(&b, "missing"));
    }

    #[test]
    fn test_lookup_service_by_type() {
        let b = bundle(json!({
            "serviceStatuses": [
                {"metadata": {"name": "np"}, "spec": {"type": "NodePort", "ports": [{"port": 30080}]}},
                {"metadata": {"name": "lb"}, "spec": {"type": "LoadBalancer", "ports": [{"port": 443, "protocol": "TCP"}]},
                 "status": {"loadBalancer": {"ingress": [{"ip": "10.10.10.10"}]}}},
                {"metadata": {"name": "lb-pending"}, "spec": {"type": "LoadBalancer", "ports": [{"port": 443}]}},
                {"metadata": {"name": "internal"}, "spec": {"type": "ClusterIP", "ports": [{"port": 80}]}}
            ]
        }));
        let tcp = |port| ServicePort { port, protocol: "TCP".into() };

        assert_eq!(lookup_service(&b, "np"), Lookup::NodePort(vec![tcp(30080)]));
        assert_eq!(
            lookup_service(&b, "lb"),
            Lookup::LoadBalancer("10.10.10.10".into(), vec![tcp(443)])
        );
        assert_eq!(lookup_service(&b, "lb-pending"), Lookup::Pending);
        assert_eq!(lookup_service(&b, "internal"), Lookup::Unsupported("ClusterIP".into()));
        assert_eq!(lookup_service(&b, "missing"), Lookup::Pending);
    }

    #[test]
    fn test_service_and_endpoints_manifests() {
        let ports = vec![ServicePort { port: 8080, protocol: "TCP".into() }];

        let svc: Value = serde_yaml::from_str(&service_manifest("svc1", "ns1", &ports).unwrap()).unwrap();
        assert_eq!(svc["kind"], "Service");
        assert_eq!(svc["metadata"], json!({"name": "svc1", "namespace": "ns1"}));
        assert_eq!(svc["spec"]["clusterIP"], "None");
        assert_eq!(svc["spec"]["type"], "ClusterIP");
        assert_eq!(
            svc["spec"]["ports"],
            json!([{"name": "8080", "protocol": "TCP", "port": 8080, "targetPort": 8080}])
        );

        let ep: Value =
            serde_yaml::from_str(&endpoints_manifest("svc1", "", "10.0.0.5", &ports).unwrap()).unwrap();
        assert_eq!(ep["kind"], "Endpoints");
        assert_eq!(ep["metadata"], json!({"name": "svc1"}));
        assert_eq!(
            ep["subsets"],
            json!([{"addresses": [{"ip": "10.0.0.5"}], "ports": [{"name": "8080", "port": 8080}]}])
        );
    }
}
