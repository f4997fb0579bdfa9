// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status aggregation over the contexts recorded in a [`StateInfo`].
//!
//! Two sources feed a status query:
//!
//! | `type`    | per-resource data                                   | histogram        |
//! |-----------|-----------------------------------------------------|------------------|
//! | `rsync`   | status overlay under each resource handle            | `rsync-status`   |
//! | `cluster` | `ResourceBundleStatus` document under each cluster   | `cluster-status` |
//!
//! The composite-level `status` always comes from the last context in the
//! ledger; apps, clusters and resources come from the ledger's status
//! context. Filters apply app first, then cluster, then resource.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::appcontext::{AppContext, ClusterReadyStatus, RsyncStatus, StatusValue, is_resource_handle};
use crate::contextdb::ContextTree;
use crate::error::{EmcoError, Result};
use crate::state::StateInfo;

/// Bucket used by the cluster-status histogram.
pub const PRESENT: &str = "Present";

/// Source of per-resource status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusType {
    /// Synchronizer overlay in the context.
    #[default]
    Rsync,
    /// Status CR reported by the cluster.
    Cluster,
}

impl FromStr for StatusType {
    type Err = EmcoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "rsync" => Ok(Self::Rsync),
            "cluster" => Ok(Self::Cluster),
            other => Err(EmcoError::InvalidInput(format!("Invalid query type: {}", other))),
        }
    }
}

/// Amount of per-resource output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Histograms only.
    Summary,
    /// Names, GVKs and statuses.
    #[default]
    All,
    /// Like `All` plus the decoded resource.
    Detail,
}

impl FromStr for OutputMode {
    type Err = EmcoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "summary" => Ok(Self::Summary),
            "" | "all" => Ok(Self::All),
            "detail" => Ok(Self::Detail),
            other => Err(EmcoError::InvalidInput(format!("Invalid query output: {}", other))),
        }
    }
}

/// Parameters of a status query.
#[derive(Debug, Clone, Default)]
pub struct StatusQuery {
    /// Context id to report on instead of the ledger's.
    pub instance: String,
    /// Source of per-resource status.
    pub status_type: StatusType,
    /// Output detail.
    pub output: OutputMode,
    /// App filter.
    pub apps: Vec<String>,
    /// Cluster filter (`<provider>+<cluster>`).
    pub clusters: Vec<String>,
    /// Resource-name filter.
    pub resources: Vec<String>,
}

/// Kubernetes group/version/kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionKind {
    /// API group, empty for core.
    #[serde(rename = "Group", default)]
    pub group: String,
    /// API version.
    #[serde(rename = "Version", default)]
    pub version: String,
    /// Kind.
    #[serde(rename = "Kind", default)]
    pub kind: String,
}

impl GroupVersionKind {
    /// Split `apiVersion` into group and version.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// GVK and `metadata.name` of a Kubernetes object.
    pub fn of_object(obj: &Value) -> (Self, String) {
        let s = |v: Option<&Value>| v.and_then(Value::as_str).unwrap_or_default().to_string();
        let gvk = Self::from_api_version(&s(obj.get("apiVersion")), &s(obj.get("kind")));
        let name = s(obj.get("metadata").and_then(|m| m.get("name")));
        (gvk, name)
    }
}

/// Status of one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceStatus {
    /// Kind of the resource.
    #[serde(rename = "GVK")]
    pub gvk: GroupVersionKind,
    /// Resource name.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Decoded object, only with `output=detail`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    /// Synchronizer status.
    #[serde(rename = "rsync-status", skip_serializing_if = "String::is_empty")]
    pub rsync_status: String,
    /// Cluster-reported status.
    #[serde(rename = "cluster-status", skip_serializing_if = "String::is_empty")]
    pub cluster_status: String,
}

/// Status of one cluster of an app.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterStatus {
    /// Provider.
    #[serde(rename = "cluster-provider", skip_serializing_if = "String::is_empty")]
    pub cluster_provider: String,
    /// Cluster.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    /// Ready status of the cluster connection.
    #[serde(rename = "readystatus", skip_serializing_if = "String::is_empty")]
    pub ready_status: String,
    /// Resources.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
}

/// Status of one app.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppStatus {
    /// App.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Clusters.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterStatus>,
}

/// Full status of a ledgered entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusResult {
    /// Entity name.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Ledger.
    #[serde(rename = "states")]
    pub state: StateInfo,
    /// Status of the current context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusValue>,
    /// Histogram of synchronizer statuses.
    #[serde(rename = "rsync-status", skip_serializing_if = "BTreeMap::is_empty")]
    pub rsync_status: BTreeMap<String, usize>,
    /// Histogram of cluster-reported statuses.
    #[serde(rename = "cluster-status", skip_serializing_if = "BTreeMap::is_empty")]
    pub cluster_status: BTreeMap<String, usize>,
    /// Per-app detail.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<AppStatus>,
    /// Child contexts of the status context.
    #[serde(rename = "ChildContextIDs", skip_serializing_if = "Vec::is_empty")]
    pub child_context_ids: Vec<String>,
}

/// Status of a single-cluster entity such as cluster network intents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterStatusResult {
    /// `<provider>+<cluster>`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Ledger.
    #[serde(rename = "states")]
    pub state: StateInfo,
    /// Status of the current context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusValue>,
    /// Histogram of synchronizer statuses.
    #[serde(rename = "rsync-status", skip_serializing_if = "BTreeMap::is_empty")]
    pub rsync_status: BTreeMap<String, usize>,
    /// Histogram of cluster-reported statuses.
    #[serde(rename = "cluster-status", skip_serializing_if = "BTreeMap::is_empty")]
    pub cluster_status: BTreeMap<String, usize>,
    /// The cluster's detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterStatus>,
}

/// Apps of a context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppsListResult {
    /// Entity name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Apps.
    pub apps: Vec<String>,
}

/// Clusters of each app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClustersByAppResult {
    /// Entity name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// One entry per app.
    #[serde(rename = "clusters-by-app")]
    pub clusters_by_app: Vec<ClustersByAppEntry>,
}

/// Clusters of one app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClustersByAppEntry {
    /// App.
    pub app: String,
    /// Clusters.
    pub clusters: Vec<ClusterEntry>,
}

/// A `<provider>+<cluster>` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEntry {
    /// Provider.
    #[serde(rename = "cluster-provider")]
    pub cluster_provider: String,
    /// Cluster.
    pub cluster: String,
}

/// Resources of each app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesByAppResult {
    /// Entity name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Entries.
    #[serde(rename = "resources-by-app")]
    pub resources_by_app: Vec<ResourcesByAppEntry>,
}

/// Resources of one app, per cluster for `type=cluster`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesByAppEntry {
    /// App.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub app: String,
    /// Provider.
    #[serde(rename = "cluster-provider", skip_serializing_if = "String::is_empty")]
    pub cluster_provider: String,
    /// Cluster.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    /// Resources.
    pub resources: Vec<ResourceEntry>,
}

/// Name and kind of a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    /// Name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Kind.
    #[serde(rename = "GVK", default)]
    pub gvk: GroupVersionKind,
}

/// Status CR document the monitor writes under each cluster handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceBundleStatus {
    /// Every resource of the bundle is ready.
    pub ready: bool,
    /// Number of resources in the bundle.
    pub resource_count: i64,
    /// Pods.
    pub pod_statuses: Vec<Value>,
    /// Services.
    pub service_statuses: Vec<Value>,
    /// Deployments.
    pub deployment_statuses: Vec<Value>,
    /// ConfigMaps.
    pub config_map_statuses: Vec<Value>,
    /// Secrets.
    pub secret_statuses: Vec<Value>,
    /// DaemonSets.
    pub daemon_set_statuses: Vec<Value>,
    /// Ingresses.
    pub ingress_statuses: Vec<Value>,
    /// Jobs.
    pub job_statuses: Vec<Value>,
    /// StatefulSets.
    pub stateful_set_statuses: Vec<Value>,
}

impl ResourceBundleStatus {
    /// Decode a status value, stored either as JSON text or as an object.
    pub fn from_value(v: &Value) -> Result<Self> {
        match v {
            Value::String(s) => Ok(serde_json::from_str(s)?),
            other => Ok(serde_json::from_value(other.clone())?),
        }
    }

    /// Every collection with the GVK to assume when an entry lacks type meta.
    fn collections(&self) -> [(&[Value], GroupVersionKind); 9] {
        let gvk = |g: &str, v: &str, k: &str| GroupVersionKind {
            group: g.to_string(),
            version: v.to_string(),
            kind: k.to_string(),
        };
        [
            (self.pod_statuses.as_slice(), gvk("", "v1", "Pod")),
            (self.service_statuses.as_slice(), gvk("", "v1", "Service")),
            (self.deployment_statuses.as_slice(), gvk("apps", "v1", "Deployment")),
            (self.config_map_statuses.as_slice(), gvk("", "v1", "ConfigMap")),
            (self.secret_statuses.as_slice(), gvk("", "v1", "Secret")),
            (self.daemon_set_statuses.as_slice(), gvk("apps", "v1", "DaemonSet")),
            (self.ingress_statuses.as_slice(), gvk("networking.k8s.io", "v1", "Ingress")),
            (self.job_statuses.as_slice(), gvk("batch", "v1", "Job")),
            (self.stateful_set_statuses.as_slice(), gvk("apps", "v1", "StatefulSet")),
        ]
    }
}

fn keep(name: &str, filter: &[String]) -> bool {
    filter.is_empty() || filter.iter().any(|f| f == name)
}

fn split_cluster(name: &str) -> (String, String) {
    match name.split_once('+') {
        Some((p, c)) => (p.to_string(), c.to_string()),
        None => (String::new(), name.to_string()),
    }
}

/// Collect the resources of a cluster status document; returns how many
/// were kept.
pub fn cluster_resources(
    bundle: &ResourceBundleStatus,
    output: OutputMode,
    filter: &[String],
    out: &mut Vec<ResourceStatus>,
    counts: &mut BTreeMap<String, usize>,
) -> usize {
    let mut count = 0;
    for (items, default_gvk) in bundle.collections() {
        for item in items {
            let (mut gvk, name) = GroupVersionKind::of_object(item);
            if !keep(&name, filter) {
                continue;
            }
            if gvk.kind.is_empty() {
                gvk = default_gvk.clone();
            }
            out.push(ResourceStatus {
                gvk,
                name,
                detail: (output == OutputMode::Detail).then(|| item.clone()),
                cluster_status: PRESENT.to_string(),
                ..Default::default()
            });
            *counts.entry(PRESENT.to_string()).or_default() += 1;
            count += 1;
        }
    }
    count
}

/// Collect the resources under a cluster handle with their synchronizer
/// status; returns how many were kept.
pub async fn context_resources(
    ac: &AppContext,
    cluster_handle: &str,
    output: OutputMode,
    filter: &[String],
    out: &mut Vec<ResourceStatus>,
    counts: &mut BTreeMap<String, usize>,
) -> Result<usize> {
    let mut count = 0;
    for h in ac.get_all_handles(cluster_handle).await? {
        if !is_resource_handle(cluster_handle, &h) {
            continue;
        }
        let manifest = match ac.get_resource_value(&h).await {
            Ok(m) => m,
            Err(e) => {
                debug!(handle = %h, error = %e, "Skipping unreadable resource");
                continue;
            }
        };
        let obj: Value = match serde_yaml::from_str(&manifest) {
            Ok(v) => v,
            Err(e) => {
                debug!(handle = %h, error = %e, "Skipping undecodable resource");
                continue;
            }
        };
        let (gvk, name) = GroupVersionKind::of_object(&obj);
        if !keep(&name, filter) {
            continue;
        }

        let status = match ac.get_value(&format!("{h}status/")).await {
            Ok(v) => serde_json::from_value::<crate::appcontext::ResourceStatus>(v)
                .map(|s| s.status)
                .unwrap_or(RsyncStatus::Pending),
            Err(_) => RsyncStatus::Pending,
        };

        out.push(ResourceStatus {
            gvk,
            name,
            detail: (output == OutputMode::Detail).then_some(obj),
            rsync_status: status.to_string(),
            ..Default::default()
        });
        *counts.entry(status.to_string()).or_default() += 1;
        count += 1;
    }
    Ok(count)
}

async fn ready_status(ac: &AppContext, app: &str, cluster: &str) -> String {
    let unknown = ClusterReadyStatus::Unknown.to_string();
    let Ok(ch) = ac.get_cluster_handle(app, cluster).await else {
        return unknown;
    };
    match ac.get_value(&format!("{ch}readystatus/")).await {
        Ok(Value::String(s)) => s,
        _ => unknown,
    }
}

async fn cluster_bundle(ac: &AppContext, app: &str, cluster: &str) -> Option<ResourceBundleStatus> {
    let handle = match ac.get_cluster_status_handle(app, cluster).await {
        Ok(h) => h,
        Err(e) => {
            info!(app, cluster, error = %e, "No cluster status handle");
            return None;
        }
    };
    let value = ac.get_value(&handle).await.ok()?;
    match ResourceBundleStatus::from_value(&value) {
        Ok(b) => Some(b),
        Err(e) => {
            info!(app, cluster, error = %e, "Undecodable cluster status");
            None
        }
    }
}

/// Which context ids a query reports on: `(current, status)`.
fn query_contexts(info: &StateInfo, instance: &str) -> (String, String) {
    if !instance.is_empty() {
        return (instance.to_string(), instance.to_string());
    }
    let current = info.last_context_id().unwrap_or_default();
    (current, info.status_context_id().to_string())
}

fn status_context(info: &StateInfo, instance: &str) -> String {
    if instance.is_empty() {
        info.status_context_id().to_string()
    } else {
        instance.to_string()
    }
}

async fn prepare(
    tree: &ContextTree,
    info: &StateInfo,
    query: &StatusQuery,
    with_children: bool,
) -> Result<StatusResult> {
    let mut result = StatusResult {
        state: info.clone(),
        ..Default::default()
    };

    let (current_id, status_id) = query_contexts(info, &query.instance);
    if current_id.is_empty() {
        return Ok(result);
    }

    let current = AppContext::load(tree, &current_id).await?;
    result.status = Some(current.get_app_context_status().await?.status);

    let ac = AppContext::load(tree, &status_id).await?;
    if with_children {
        result.child_context_ids = ac.get_composite_app_meta().await?.child_context_ids;
    }

    let apps = ac.get_app_names().await?;
    for f in &query.apps {
        if !apps.contains(f) {
            return Err(EmcoError::InvalidInput(format!(
                "Filter app {} not in list of apps for context {}",
                f, status_id
            )));
        }
    }

    for app in apps {
        if !keep(&app, &query.apps) {
            continue;
        }
        let Ok(clusters) = ac.get_cluster_names(&app).await else {
            continue;
        };
        let mut app_status = AppStatus {
            name: app.clone(),
            clusters: Vec::new(),
        };
        let mut app_count = 0;

        for cluster in clusters {
            if !keep(&cluster, &query.clusters) {
                continue;
            }
            let (provider, name) = split_cluster(&cluster);
            let mut cs = ClusterStatus {
                cluster_provider: provider,
                cluster: name,
                ready_status: ready_status(&ac, &app, &cluster).await,
                resources: Vec::new(),
            };

            let count = match query.status_type {
                StatusType::Cluster => {
                    let Some(bundle) = cluster_bundle(&ac, &app, &cluster).await else {
                        continue;
                    };
                    cluster_resources(
                        &bundle,
                        query.output,
                        &query.resources,
                        &mut cs.resources,
                        &mut result.cluster_status,
                    )
                }
                StatusType::Rsync => {
                    let Ok(ch) = ac.get_cluster_handle(&app, &cluster).await else {
                        continue;
                    };
                    context_resources(
                        &ac,
                        &ch,
                        query.output,
                        &query.resources,
                        &mut cs.resources,
                        &mut result.rsync_status,
                    )
                    .await?
                }
            };

            if count > 0 {
                app_count += count;
                app_status.clusters.push(cs);
            }
        }

        if app_count > 0 && query.output != OutputMode::Summary {
            result.apps.push(app_status);
        }
    }
    Ok(result)
}

/// Status of a ledgered composite entity.
pub async fn prepare_status_result(
    tree: &ContextTree,
    info: &StateInfo,
    query: &StatusQuery,
) -> Result<StatusResult> {
    prepare(tree, info, query, true).await
}

/// Status of a single-cluster entity; the first app's first cluster
/// becomes `cluster`.
pub async fn prepare_cluster_status_result(
    tree: &ContextTree,
    info: &StateInfo,
    query: &StatusQuery,
) -> Result<ClusterStatusResult> {
    let r = prepare(tree, info, query, false).await?;
    let cluster = r.apps.first().and_then(|a| a.clusters.first()).cloned();
    Ok(ClusterStatusResult {
        name: r.name,
        state: r.state,
        status: r.status,
        rsync_status: r.rsync_status,
        cluster_status: r.cluster_status,
        cluster,
    })
}

/// Apps of the status context.
pub async fn prepare_apps_list_status_result(
    tree: &ContextTree,
    info: &StateInfo,
    instance: &str,
) -> Result<AppsListResult> {
    let id = status_context(info, instance);
    if id.is_empty() {
        return Ok(AppsListResult::default());
    }
    let ac = AppContext::load(tree, &id).await?;
    Ok(AppsListResult {
        name: String::new(),
        apps: ac.get_app_names().await?,
    })
}

/// Clusters of each (filtered) app of the status context.
pub async fn prepare_clusters_by_app_status_result(
    tree: &ContextTree,
    info: &StateInfo,
    instance: &str,
    apps: &[String],
) -> Result<ClustersByAppResult> {
    let mut result = ClustersByAppResult::default();
    let id = status_context(info, instance);
    if id.is_empty() {
        return Ok(result);
    }
    let ac = AppContext::load(tree, &id).await?;
    for app in ac.get_app_names().await? {
        if !keep(&app, apps) {
            continue;
        }
        let clusters = ac
            .get_cluster_names(&app)
            .await
            .unwrap_or_default()
            .iter()
            .map(|c| {
                let (cluster_provider, cluster) = split_cluster(c);
                ClusterEntry {
                    cluster_provider,
                    cluster,
                }
            })
            .collect();
        result.clusters_by_app.push(ClustersByAppEntry { app, clusters });
    }
    Ok(result)
}

/// Resources of each (filtered) app. With `type=rsync` one cluster per app
/// is listed since every cluster carries the same manifests; with
/// `type=cluster` every (filtered) cluster is listed.
pub async fn prepare_resources_by_app_status_result(
    tree: &ContextTree,
    info: &StateInfo,
    instance: &str,
    status_type: StatusType,
    apps: &[String],
    clusters: &[String],
) -> Result<ResourcesByAppResult> {
    let mut result = ResourcesByAppResult::default();
    let id = status_context(info, instance);
    if id.is_empty() {
        return Ok(result);
    }
    let ac = AppContext::load(tree, &id).await?;

    for app in ac.get_app_names().await? {
        if !keep(&app, apps) {
            continue;
        }
        let Ok(names) = ac.get_cluster_names(&app).await else {
            continue;
        };
        for cluster in names {
            let mut resources = Vec::new();
            let mut counts = BTreeMap::new();
            let mut entry = ResourcesByAppEntry {
                app: app.clone(),
                ..Default::default()
            };
            match status_type {
                StatusType::Cluster => {
                    if !keep(&cluster, clusters) {
                        continue;
                    }
                    let (p, c) = split_cluster(&cluster);
                    entry.cluster_provider = p;
                    entry.cluster = c;
                    let Some(bundle) = cluster_bundle(&ac, &app, &cluster).await else {
                        continue;
                    };
                    cluster_resources(&bundle, OutputMode::All, &[], &mut resources, &mut counts);
                }
                StatusType::Rsync => {
                    let Ok(ch) = ac.get_cluster_handle(&app, &cluster).await else {
                        continue;
                    };
                    context_resources(&ac, &ch, OutputMode::All, &[], &mut resources, &mut counts)
                        .await?;
                }
            }
            entry.resources = resources
                .into_iter()
                .map(|r| ResourceEntry {
                    name: r.name,
                    gvk: r.gvk,
                })
                .collect();
            result.resources_by_app.push(entry);
            if status_type == StatusType::Rsync {
                break;
            }
        }
    }
    Ok(result)
}
