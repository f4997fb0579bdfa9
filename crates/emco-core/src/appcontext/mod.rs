// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AppContext engine.
//!
//! An [`AppContext`] is the execution record of one composite-app
//! instantiation, stored as a subtree of the context store:
//!
//! ```text
//! /context/<id>/
//!   meta/                       CompositeAppMeta
//!   status/                     {"status": Instantiating|...}
//!   stopflag/                   bool
//!   instruction/app/order/      {"apporder": [...]}
//!   instruction/app/dependency/ {"appdependency": {app: mode}}
//!   app/<name>/
//!     cluster/<provider+cluster>/
//!       readystatus/
//!       status/                 cluster status document
//!       resource/<name+kind>/   manifest text
//!         status/               {"status": Pending|Applied|...}
//!       instruction/resource/order/       {"resorder": [...]}
//!       instruction/resource/dependency/  {"resdependency": {res: mode}}
//! ```
//!
//! Parent contexts refer to child contexts only by id (`ChildContextIDs` in
//! the meta). Children are created independently; deleting a parent deletes
//! the children it still lists.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::contextdb::{ContextDbError, ContextTree, root_handle};
use tracing::debug;

use crate::error::{EmcoError, ErrorKind, Result};

/// Instruction level for app ordering.
pub const LEVEL_APP: &str = "app";
/// Instruction level for resource ordering.
pub const LEVEL_RESOURCE: &str = "resource";
/// Instruction type holding an ordering.
pub const INST_ORDER: &str = "order";
/// Instruction type holding dependencies.
pub const INST_DEPENDENCY: &str = "dependency";

/// Composite-app metadata stored at `meta/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeAppMeta {
    /// Project.
    #[serde(rename = "Project", default)]
    pub project: String,
    /// Composite app.
    #[serde(rename = "CompositeApp", default)]
    pub composite_app: String,
    /// Composite app version.
    #[serde(rename = "Version", default)]
    pub version: String,
    /// Release name.
    #[serde(rename = "Release", default)]
    pub release: String,
    /// Deployment intent group.
    #[serde(rename = "DeploymentIntentGroup", default)]
    pub deployment_intent_group: String,
    /// Target namespace.
    #[serde(rename = "Namespace", default)]
    pub namespace: String,
    /// Logical cloud level.
    #[serde(rename = "Level", default)]
    pub level: String,
    /// Ids of dependent child contexts.
    #[serde(rename = "ChildContextIDs", default)]
    pub child_context_ids: Vec<String>,
}

/// Overall context status reported by the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusValue {
    /// Install in progress.
    Instantiating,
    /// Install complete.
    Instantiated,
    /// Uninstall in progress.
    Terminating,
    /// Uninstall complete.
    Terminated,
    /// Install failed.
    InstantiateFailed,
    /// Uninstall failed.
    TerminateFailed,
}

impl std::fmt::Display for StatusValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Value stored at `status/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppContextStatus {
    /// Current status.
    pub status: StatusValue,
}

/// Per-resource synchronizer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RsyncStatus {
    /// Not yet handled.
    Pending,
    /// Applied to the cluster.
    Applied,
    /// Apply failed.
    Failed,
    /// Being retried.
    Retrying,
    /// Removed from the cluster.
    Deleted,
}

impl std::fmt::Display for RsyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Value stored at a resource's `status/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    /// Current status.
    pub status: RsyncStatus,
}

/// Cluster connectivity as seen by the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterReadyStatus {
    /// No report yet.
    Unknown,
    /// Reachable.
    Available,
    /// Unreachable, being retried.
    Retrying,
}

impl std::fmt::Display for ClusterReadyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// True when `handle` is a resource directly under `cluster_handle`.
///
/// The remainder after the cluster handle must be `resource/<name>+<kind>/`
/// with exactly one `+`.
pub fn is_resource_handle(cluster_handle: &str, handle: &str) -> bool {
    let Some(rest) = handle.strip_prefix(cluster_handle) else {
        return false;
    };
    let parts: Vec<&str> = rest.split('/').collect();
    parts.len() == 3
        && parts[0] == "resource"
        && parts[2].is_empty()
        && parts[1].matches('+').count() == 1
        && !parts[1].starts_with('+')
        && !parts[1].ends_with('+')
}

/// Split `<name>+<kind>` into its parts.
pub fn split_resource_name(name: &str) -> Option<(&str, &str)> {
    let (n, k) = name.split_once('+')?;
    if n.is_empty() || k.is_empty() || k.contains('+') {
        return None;
    }
    Some((n, k))
}

/// Handle on one context.
#[derive(Clone)]
pub struct AppContext {
    tree: ContextTree,
    id: String,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext").field("id", &self.id).finish()
    }
}

impl AppContext {
    /// Mint a fresh context and write its root.
    pub async fn init(tree: &ContextTree) -> Result<Self> {
        let id = tree.new_id().await?;
        let ctx = Self {
            tree: tree.clone(),
            id,
        };
        ctx.create_composite_app().await?;
        Ok(ctx)
    }

    /// Open an existing context.
    pub async fn load(tree: &ContextTree, id: &str) -> Result<Self> {
        if id.is_empty() || id.contains('/') {
            return Err(EmcoError::InvalidInput(format!("Invalid context id {:?}", id)));
        }
        if !tree.exists(&root_handle(id)).await? {
            return Err(EmcoError::NotFound(format!("Error finding context {}", id)));
        }
        Ok(Self {
            tree: tree.clone(),
            id: id.to_string(),
        })
    }

    /// Context id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Underlying tree.
    pub fn tree(&self) -> &ContextTree {
        &self.tree
    }

    /// (Re)write the root node; returns the composite-app handle.
    pub async fn create_composite_app(&self) -> Result<String> {
        Ok(self.tree.create(&self.id).await?)
    }

    /// Root handle.
    pub fn composite_app_handle(&self) -> String {
        root_handle(&self.id)
    }

    /// Root handle, verified to exist.
    pub async fn get_composite_app_handle(&self) -> Result<String> {
        let h = self.composite_app_handle();
        if self.tree.exists(&h).await? {
            Ok(h)
        } else {
            Err(EmcoError::NotFound(format!("Error finding context {}", self.id)))
        }
    }

    /// Remove the whole context, child contexts first.
    ///
    /// Each child id is unlinked from the meta before the child's subtree is
    /// deleted; children that no longer exist are skipped.
    pub async fn delete_composite_app(&self) -> Result<()> {
        let children = match self.get_composite_app_meta().await {
            Ok(meta) => meta.child_context_ids,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        for child in children {
            self.remove_child_context_id(&child).await?;
            match AppContext::load(&self.tree, &child).await {
                Ok(ac) => Box::pin(ac.delete_composite_app()).await?,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(app_context = %self.id, child = %child, "Child context already gone");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(self.tree.delete_prefix(&self.composite_app_handle()).await?)
    }

    /// Write the meta once; later calls only merge new child ids.
    pub async fn add_composite_app_meta(&self, meta: &CompositeAppMeta) -> Result<String> {
        let root = self.composite_app_handle();
        let handle = format!("{root}meta/");
        if !self.tree.exists(&handle).await? {
            return Ok(self
                .tree
                .add_level_value(&root, "meta", serde_json::to_value(meta)?)
                .await?);
        }
        let incoming = meta.child_context_ids.clone();
        self.modify_meta(move |cur| {
            for id in incoming {
                if !cur.child_context_ids.contains(&id) {
                    cur.child_context_ids.push(id);
                }
            }
        })
        .await?;
        Ok(handle)
    }

    /// Current meta.
    pub async fn get_composite_app_meta(&self) -> Result<CompositeAppMeta> {
        let v = self
            .tree
            .get_value(&format!("{}meta/", self.composite_app_handle()))
            .await?;
        Ok(serde_json::from_value(v)?)
    }

    /// Record a child context id (no duplicates).
    pub async fn add_child_context_id(&self, child: &str) -> Result<CompositeAppMeta> {
        let child = child.to_string();
        self.modify_meta(move |m| {
            if !m.child_context_ids.contains(&child) {
                m.child_context_ids.push(child);
            }
        })
        .await
    }

    /// Drop a child context id.
    pub async fn remove_child_context_id(&self, child: &str) -> Result<CompositeAppMeta> {
        let child = child.to_string();
        self.modify_meta(move |m| m.child_context_ids.retain(|c| *c != child))
            .await
    }

    async fn modify_meta<F>(&self, f: F) -> Result<CompositeAppMeta>
    where
        F: FnOnce(&mut CompositeAppMeta) + Send + 'static,
    {
        let handle = format!("{}meta/", self.composite_app_handle());
        let v = self
            .tree
            .modify_value(
                &handle,
                Box::new(move |v: &mut Value| {
                    let mut meta: CompositeAppMeta = serde_json::from_value(v.clone())?;
                    f(&mut meta);
                    *v = serde_json::to_value(meta)?;
                    Ok::<(), ContextDbError>(())
                }),
            )
            .await?;
        Ok(serde_json::from_value(v)?)
    }

    /// Add `<handle><level>/` holding `value`.
    pub async fn add_level_value(&self, handle: &str, level: &str, value: Value) -> Result<String> {
        Ok(self.tree.add_level_value(handle, level, value).await?)
    }

    /// `<handle><level>/`, verified to exist.
    pub async fn get_level_handle(&self, handle: &str, level: &str) -> Result<String> {
        Ok(self.tree.get_level_handle(handle, level).await?)
    }

    /// Value at `handle`.
    pub async fn get_value(&self, handle: &str) -> Result<Value> {
        Ok(self.tree.get_value(handle).await?)
    }

    /// Replace the value at an existing `handle`.
    pub async fn update_value(&self, handle: &str, value: Value) -> Result<()> {
        Ok(self.tree.update_value(handle, value).await?)
    }

    /// Every handle at or below `prefix`.
    pub async fn get_all_handles(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.tree.get_all_handles(prefix).await?)
    }

    /// Add app `name`.
    pub async fn add_app(&self, name: &str) -> Result<String> {
        Ok(self
            .tree
            .add_level(&self.composite_app_handle(), "app", name)
            .await?)
    }

    /// Handle of app `name`.
    pub async fn get_app_handle(&self, name: &str) -> Result<String> {
        let h = format!("{}app/{}/", self.composite_app_handle(), name);
        if self.tree.exists(&h).await? {
            Ok(h)
        } else {
            Err(EmcoError::NotFound(format!("Error finding app {}", name)))
        }
    }

    /// Remove an app subtree.
    pub async fn delete_app(&self, handle: &str) -> Result<()> {
        Ok(self.tree.delete_prefix(handle).await?)
    }

    /// Names of every app in the context.
    pub async fn get_app_names(&self) -> Result<Vec<String>> {
        let prefix = format!("{}app/", self.composite_app_handle());
        let mut names = Vec::new();
        for h in self.tree.get_all_handles(&prefix).await? {
            let rest = &h[prefix.len()..];
            let parts: Vec<&str> = rest.split('/').collect();
            if parts.len() == 2 && parts[1].is_empty() && !parts[0].is_empty() {
                names.push(parts[0].to_string());
            }
        }
        Ok(names)
    }

    /// Add `cluster` under the app at `app_handle`.
    pub async fn add_cluster(&self, app_handle: &str, cluster: &str) -> Result<String> {
        Ok(self.tree.add_level(app_handle, "cluster", cluster).await?)
    }

    /// Remove a cluster subtree.
    pub async fn delete_cluster(&self, handle: &str) -> Result<()> {
        Ok(self.tree.delete_prefix(handle).await?)
    }

    /// Handle of `cluster` under `app`.
    pub async fn get_cluster_handle(&self, app: &str, cluster: &str) -> Result<String> {
        let h = format!("{}app/{}/cluster/{}/", self.composite_app_handle(), app, cluster);
        if self.tree.exists(&h).await? {
            Ok(h)
        } else {
            Err(EmcoError::NotFound(format!(
                "Error finding cluster {} of app {}",
                cluster, app
            )))
        }
    }

    /// Names (`<provider>+<cluster>`) of every cluster bound to `app`.
    pub async fn get_cluster_names(&self, app: &str) -> Result<Vec<String>> {
        let app_handle = self.get_app_handle(app).await?;
        let prefix = format!("{app_handle}cluster/");
        let mut names = Vec::new();
        for h in self.tree.get_all_handles(&prefix).await? {
            let rest = &h[prefix.len()..];
            let parts: Vec<&str> = rest.split('/').collect();
            if parts.len() == 2 && parts[1].is_empty() {
                match self.tree.get_value(&h).await? {
                    Value::String(name) => names.push(name),
                    _ => names.push(parts[0].to_string()),
                }
            }
        }
        Ok(names)
    }

    /// Handle of the cluster status document.
    pub async fn get_cluster_status_handle(&self, app: &str, cluster: &str) -> Result<String> {
        let ch = self.get_cluster_handle(app, cluster).await?;
        Ok(self.tree.get_level_handle(&ch, "status").await?)
    }

    /// Attach a manifest; `name` is `<name>+<kind>`.
    pub async fn add_resource(&self, cluster_handle: &str, name: &str, manifest: &str) -> Result<String> {
        if split_resource_name(name).is_none() {
            return Err(EmcoError::InvalidInput(format!(
                "Resource name must be <name>+<kind>: {}",
                name
            )));
        }
        Ok(self
            .tree
            .add_resource(cluster_handle, name, Value::String(manifest.to_string()))
            .await?)
    }

    /// Handle of resource `name` (`<name>+<kind>`).
    pub async fn get_resource_handle(&self, app: &str, cluster: &str, name: &str) -> Result<String> {
        let h = format!(
            "{}app/{}/cluster/{}/resource/{}/",
            self.composite_app_handle(),
            app,
            cluster,
            name
        );
        if self.tree.exists(&h).await? {
            Ok(h)
        } else {
            Err(EmcoError::NotFound(format!("Error finding resource {}", name)))
        }
    }

    /// Names of the resources under a cluster.
    pub async fn get_resource_names(&self, app: &str, cluster: &str) -> Result<Vec<String>> {
        let ch = self.get_cluster_handle(app, cluster).await?;
        Ok(self
            .tree
            .get_all_handles(&ch)
            .await?
            .into_iter()
            .filter(|h| is_resource_handle(&ch, h))
            .map(|h| h[ch.len() + "resource/".len()..h.len() - 1].to_string())
            .collect())
    }

    /// Manifest text of a resource.
    pub async fn get_resource_value(&self, handle: &str) -> Result<String> {
        match self.tree.get_value(handle).await? {
            Value::String(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }

    /// Replace a resource manifest.
    pub async fn update_resource_value(&self, handle: &str, manifest: &str) -> Result<()> {
        Ok(self
            .tree
            .update_value(handle, Value::String(manifest.to_string()))
            .await?)
    }

    /// Handle of a resource status overlay.
    pub async fn get_resource_status_handle(
        &self,
        app: &str,
        cluster: &str,
        name: &str,
    ) -> Result<String> {
        let rh = self.get_resource_handle(app, cluster, name).await?;
        Ok(self.tree.get_level_handle(&rh, "status").await?)
    }

    /// Write or replace `<handle>status/`.
    pub async fn update_status_value(&self, handle: &str, value: Value) -> Result<String> {
        Ok(self.tree.add_level_value(handle, "status", value).await?)
    }

    /// Add an instruction (`level` is `app` or `resource`).
    pub async fn add_instruction(
        &self,
        handle: &str,
        level: &str,
        insttype: &str,
        value: Value,
    ) -> Result<String> {
        Ok(self.tree.add_instruction(handle, level, insttype, value).await?)
    }

    /// App-level instruction of the composite app.
    pub async fn get_app_instruction(&self, insttype: &str) -> Result<Value> {
        let h = format!(
            "{}instruction/{}/{}/",
            self.composite_app_handle(),
            LEVEL_APP,
            insttype
        );
        Ok(self.tree.get_value(&h).await?)
    }

    /// Handle of a cluster's resource instruction.
    pub async fn get_resource_instruction_handle(
        &self,
        app: &str,
        cluster: &str,
        insttype: &str,
    ) -> Result<String> {
        let ch = self.get_cluster_handle(app, cluster).await?;
        let h = format!("{ch}instruction/{LEVEL_RESOURCE}/{insttype}/");
        if self.tree.exists(&h).await? {
            Ok(h)
        } else {
            Err(EmcoError::NotFound(format!(
                "Error finding {} instruction for {}",
                insttype, cluster
            )))
        }
    }

    /// A cluster's resource instruction.
    pub async fn get_resource_instruction(
        &self,
        app: &str,
        cluster: &str,
        insttype: &str,
    ) -> Result<Value> {
        let h = self
            .get_resource_instruction_handle(app, cluster, insttype)
            .await?;
        Ok(self.tree.get_value(&h).await?)
    }

    /// Append `resource` to the cluster's `resorder`, creating the order if absent.
    pub async fn append_resource_order(&self, app: &str, cluster: &str, resource: &str) -> Result<()> {
        match self
            .get_resource_instruction_handle(app, cluster, INST_ORDER)
            .await
        {
            Ok(h) => {
                let resource = resource.to_string();
                self.tree
                    .modify_value(
                        &h,
                        Box::new(move |v: &mut Value| {
                            let mut order = resource_order(v);
                            order.push(resource);
                            *v = json!({ "resorder": order });
                            Ok::<(), ContextDbError>(())
                        }),
                    )
                    .await?;
            }
            Err(e) if e.kind() == crate::error::ErrorKind::NotFound => {
                let ch = self.get_cluster_handle(app, cluster).await?;
                self.tree
                    .add_instruction(&ch, LEVEL_RESOURCE, INST_ORDER, json!({ "resorder": [resource] }))
                    .await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Add or replace resource `name` under `cluster` of `app`; a new
    /// resource is also appended to the cluster's `resorder`.
    pub async fn attach_resource(&self, app: &str, cluster: &str, name: &str, manifest: &str) -> Result<()> {
        let ch = self.get_cluster_handle(app, cluster).await?;
        let existed = self.get_resource_handle(app, cluster, name).await.is_ok();
        self.add_resource(&ch, name, manifest).await?;
        if !existed {
            self.append_resource_order(app, cluster, name).await?;
        }
        Ok(())
    }

    /// Overall status.
    pub async fn get_app_context_status(&self) -> Result<AppContextStatus> {
        let h = format!("{}status/", self.composite_app_handle());
        let v = self.tree.get_value(&h).await?;
        Ok(serde_json::from_value(v)?)
    }

    /// Write the overall status.
    pub async fn update_app_context_status(&self, status: StatusValue) -> Result<()> {
        self.tree
            .add_level_value(
                &self.composite_app_handle(),
                "status",
                serde_json::to_value(AppContextStatus { status })?,
            )
            .await?;
        Ok(())
    }

    /// Set the stop flag, adding it when absent.
    pub async fn update_stop_flag(&self, stop: bool) -> Result<()> {
        let root = self.composite_app_handle();
        match self.tree.get_level_handle(&root, "stopflag").await {
            Ok(h) => self.tree.update_value(&h, Value::Bool(stop)).await?,
            Err(ContextDbError::NotFound(_)) => {
                self.tree
                    .add_level_value(&root, "stopflag", Value::Bool(stop))
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Stop flag; false when never set.
    pub async fn get_stop_flag(&self) -> Result<bool> {
        let h = format!("{}stopflag/", self.composite_app_handle());
        match self.tree.get_value(&h).await {
            Ok(v) => Ok(v.as_bool().unwrap_or(false)),
            Err(ContextDbError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Entries of a `{"resorder": [...]}` value.
pub fn resource_order(v: &Value) -> Vec<String> {
    v.get("resorder")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ctx() -> AppContext {
        AppContext::init(&ContextTree::memory()).await.unwrap()
    }

    #[test]
    fn test_is_resource_handle() {
        let ch = "/context/1/app/a/cluster/p+c/";
        assert!(is_resource_handle(ch, "/context/1/app/a/cluster/p+c/resource/x+Service/"));
        assert!(!is_resource_handle(ch, "/context/1/app/a/cluster/p+c/resource/x+Service/status/"));
        assert!(!is_resource_handle(ch, "/context/1/app/a/cluster/p+c/resource/x/"));
        assert!(!is_resource_handle(ch, "/context/1/app/a/cluster/p+c/resource/a+b+c/"));
        assert!(!is_resource_handle(ch, "/context/1/app/a/cluster/p+c/instruction/resource/order/"));
        assert!(!is_resource_handle(ch, "/context/2/app/a/cluster/p+c/resource/x+Service/"));
    }

    #[tokio::test]
    async fn test_meta_is_write_once_then_merge() {
        let ac = ctx().await;
        let meta = CompositeAppMeta {
            project: "p".into(),
            composite_app: "ca".into(),
            child_context_ids: vec!["1".into()],
            ..Default::default()
        };
        ac.add_composite_app_meta(&meta).await.unwrap();

        let second = CompositeAppMeta {
            project: "other".into(),
            child_context_ids: vec!["1".into(), "2".into()],
            ..Default::default()
        };
        ac.add_composite_app_meta(&second).await.unwrap();

        let got = ac.get_composite_app_meta().await.unwrap();
        assert_eq!(got.project, "p");
        assert_eq!(got.composite_app, "ca");
        assert_eq!(got.child_context_ids, vec!["1", "2"]);

        let got = ac.remove_child_context_id("1").await.unwrap();
        assert_eq!(got.child_context_ids, vec!["2"]);
    }

    #[tokio::test]
    async fn test_cluster_and_resource_navigation() {
        let ac = ctx().await;
        let app = ac.add_app("web").await.unwrap();
        let c1 = ac.add_cluster(&app, "p1+c1").await.unwrap();
        ac.add_cluster(&app, "p1+c2").await.unwrap();

        let mut names = ac.get_cluster_names("web").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["p1+c1", "p1+c2"]);

        let manifest = "kind: Service\nmetadata:\n  name: s\n";
        let rh = ac.add_resource(&c1, "s+Service", manifest).await.unwrap();
        assert_eq!(ac.get_resource_handle("web", "p1+c1", "s+Service").await.unwrap(), rh);
        assert_eq!(ac.get_resource_value(&rh).await.unwrap(), manifest);
        assert_eq!(
            ac.get_resource_names("web", "p1+c1").await.unwrap(),
            vec!["s+Service"]
        );
        assert!(ac.add_resource(&c1, "noplus", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_append_resource_order_creates_then_appends() {
        let ac = ctx().await;
        let app = ac.add_app("web").await.unwrap();
        ac.add_cluster(&app, "p1+c1").await.unwrap();

        ac.append_resource_order("web", "p1+c1", "a+ConfigMap").await.unwrap();
        ac.append_resource_order("web", "p1+c1", "b+Secret").await.unwrap();

        let order = ac
            .get_resource_instruction("web", "p1+c1", INST_ORDER)
            .await
            .unwrap();
        assert_eq!(resource_order(&order), vec!["a+ConfigMap", "b+Secret"]);
    }

    #[tokio::test]
    async fn test_attach_resource_orders_once() {
        let ac = ctx().await;
        let app = ac.add_app("web").await.unwrap();
        ac.add_cluster(&app, "p1+c1").await.unwrap();

        ac.attach_resource("web", "p1+c1", "cm1+ConfigMap", "v1").await.unwrap();
        ac.attach_resource("web", "p1+c1", "cm1+ConfigMap", "v2").await.unwrap();

        let rh = ac.get_resource_handle("web", "p1+c1", "cm1+ConfigMap").await.unwrap();
        assert_eq!(ac.get_resource_value(&rh).await.unwrap(), "v2");
        let order = ac
            .get_resource_instruction("web", "p1+c1", INST_ORDER)
            .await
            .unwrap();
        assert_eq!(resource_order(&order), vec!["cm1+ConfigMap"]);
        assert!(ac.attach_resource("web", "p1+c9", "cm1+ConfigMap", "v1").await.is_err());
    }

    #[tokio::test]
    async fn test_stop_flag_and_status() {
        let ac = ctx().await;
        assert!(!ac.get_stop_flag().await.unwrap());
        ac.update_stop_flag(true).await.unwrap();
        assert!(ac.get_stop_flag().await.unwrap());
        ac.update_stop_flag(false).await.unwrap();
        assert!(!ac.get_stop_flag().await.unwrap());

        assert!(ac.get_app_context_status().await.is_err());
        ac.update_app_context_status(StatusValue::Instantiating).await.unwrap();
        assert_eq!(
            ac.get_app_context_status().await.unwrap().status,
            StatusValue::Instantiating
        );
    }

    #[tokio::test]
    async fn test_delete_composite_app_and_load() {
        let tree = ContextTree::memory();
        let ac = AppContext::init(&tree).await.unwrap();
        ac.add_app("a").await.unwrap();

        let again = AppContext::load(&tree, ac.id()).await.unwrap();
        assert_eq!(again.get_app_names().await.unwrap(), vec!["a"]);

        ac.delete_composite_app().await.unwrap();
        assert!(tree.get_all_handles(&ac.composite_app_handle()).await.unwrap().is_empty());
        assert!(AppContext::load(&tree, ac.id()).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_parent_cascades_to_children() {
        let tree = ContextTree::memory();
        let parent = AppContext::init(&tree).await.unwrap();
        parent
            .add_composite_app_meta(&CompositeAppMeta::default())
            .await
            .unwrap();
        let child = AppContext::init(&tree).await.unwrap();
        child
            .add_composite_app_meta(&CompositeAppMeta::default())
            .await
            .unwrap();
        let grandchild = AppContext::init(&tree).await.unwrap();
        child.add_child_context_id(grandchild.id()).await.unwrap();
        parent.add_child_context_id(child.id()).await.unwrap();
        // listed but already deleted
        parent.add_child_context_id("424242").await.unwrap();
        let unrelated = AppContext::init(&tree).await.unwrap();

        parent.delete_composite_app().await.unwrap();
        assert!(AppContext::load(&tree, parent.id()).await.is_err());
        assert_eq!(
            AppContext::load(&tree, child.id()).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert!(AppContext::load(&tree, grandchild.id()).await.is_err());
        AppContext::load(&tree, unrelated.id()).await.unwrap();
    }
}
