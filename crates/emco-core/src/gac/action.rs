// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `UpdateAppContext` of the generic-action controller.
//!
//! Every customization of every resource of the intent is materialised into
//! the context along one of three paths:
//!
//! * a new object other than a ConfigMap or Secret is injected from its
//!   uploaded manifest;
//! * an existing object with a `json` customization is patched in place;
//! * a ConfigMap or Secret is synthesized from the customization's files.
//!
//! Only clusters selected by the customization receive the result.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use json_patch::Patch;
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use super::customization::{Customization, CustomizationClient, SpecFileContent, decode_patch};
use super::resource::{Resource, ResourceClient, ResourceGvk};
use crate::appcontext::AppContext;
use crate::cluster::ClusterClient;
use crate::contextdb::ContextTree;
use crate::db::Db;
use crate::error::{EmcoError, Result};
use crate::ncm::SEPARATOR;
use crate::types::IntentScope;

/// Placeholder written into synthesized data keys before they are patched.
const DATA_PLACEHOLDER: &str = "1";
const SECRET_TYPE: &str = "kubernetes.io/ssh-auth";

/// Clusters a customization applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ClusterSelector {
    All,
    Label { provider: String, label: String, allow: bool },
    Name { provider: String, name: String, allow: bool },
}

impl ClusterSelector {
    fn of(cz: &Customization) -> Self {
        let info = &cz.spec.cluster_info;
        if !cz.spec.cluster_specific {
            return Self::All;
        }
        let allow = info.mode.eq_ignore_ascii_case("allow");
        if info.scope.eq_ignore_ascii_case("label") {
            Self::Label {
                provider: info.cluster_provider.clone(),
                label: info.cluster_label.clone(),
                allow,
            }
        } else {
            Self::Name {
                provider: info.cluster_provider.clone(),
                name: info.cluster_name.clone(),
                allow,
            }
        }
    }
}

/// `<provider>+<cluster>` without the provider.
fn bare_cluster_name(cluster: &str) -> &str {
    cluster
        .split_once(SEPARATOR)
        .map_or(cluster, |(_, name)| name)
}

fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Apply `p` to `doc`; `doc` is left unchanged on error.
pub fn apply_patch(doc: &mut Value, p: &Patch) -> Result<()> {
    json_patch::patch(doc, &p.0).map_err(|e| EmcoError::InvalidInput(format!("Error applying patch: {}", e)))
}

fn decode_text(content: &str) -> Result<String> {
    let bytes = STANDARD.decode(content)?;
    String::from_utf8(bytes).map_err(|e| EmcoError::InvalidInput(format!("file is not UTF-8: {}", e)))
}

/// Render a ConfigMap or Secret whose `data` holds `files` under `file_names`.
pub fn data_object_manifest(gvk: &ResourceGvk, file_names: &[String], files: &[String]) -> Result<String> {
    let data: Map<String, Value> = file_names
        .iter()
        .map(|n| (n.clone(), Value::String(DATA_PLACEHOLDER.to_string())))
        .collect();
    let mut base = if gvk.is_secret() {
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": gvk.name },
            "type": SECRET_TYPE,
            "data": data,
        })
    } else {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": gvk.name },
            "data": data,
        })
    };
    let ops: Vec<Value> = file_names
        .iter()
        .zip(files)
        .map(|(name, content)| {
            json!({
                "op": "replace",
                "path": format!("/data/{}", escape_pointer(name)),
                "value": content,
            })
        })
        .collect();
    apply_patch(&mut base, &decode_patch(&ops)?)?;
    Ok(serde_yaml::to_string(&base)?)
}

/// The generic-action controller.
#[derive(Clone)]
pub struct GenericActionController {
    tree: ContextTree,
    resources: ResourceClient,
    customizations: CustomizationClient,
    clusters: ClusterClient,
}

impl GenericActionController {
    /// Controller over the intent records in `db` and contexts in `tree`.
    pub fn new(db: Db, tree: ContextTree, clusters: ClusterClient) -> Self {
        Self {
            tree,
            resources: ResourceClient::new(db.clone()),
            customizations: CustomizationClient::new(db),
            clusters,
        }
    }

    /// Materialise the generic intent `intent` into context `app_context`.
    #[instrument(skip(self), fields(app_context = %app_context, intent = %intent))]
    pub async fn update_app_context(&self, intent: &str, app_context: &str) -> Result<()> {
        let ac = AppContext::load(&self.tree, app_context).await?;
        let meta = ac.get_composite_app_meta().await?;
        let scope = IntentScope::from(&meta);

        for rs in self.resources.get_all_resources(&scope, intent).await? {
            let czs = self
                .customizations
                .get_all_customization(&scope, intent, &rs.metadata.name)
                .await?;
            for cz in czs {
                let selector = ClusterSelector::of(&cz);
                if rs.needs_file() {
                    self.inject(&ac, &scope, intent, &rs, &selector).await?;
                } else if cz.is_json_patch() && !rs.spec.new_object {
                    self.patch_existing(&ac, &rs, &cz, &selector).await?;
                } else {
                    self.render_data_object(&ac, &scope, intent, &rs, &cz, &selector)
                        .await?;
                }
            }
        }
        info!("Generic intent applied");
        Ok(())
    }

    async fn eligible_clusters(&self, ac: &AppContext, app: &str, selector: &ClusterSelector) -> Result<Vec<String>> {
        let clusters = ac.get_cluster_names(app).await?;
        let keep: Box<dyn Fn(&str) -> bool + Send> = match selector {
            ClusterSelector::All => Box::new(|_: &str| true),
            ClusterSelector::Label { allow: false, .. } | ClusterSelector::Name { allow: false, .. } => {
                Box::new(|_: &str| false)
            }
            ClusterSelector::Label { provider, label, .. } => {
                let labelled = self.clusters.get_clusters_with_label(provider, label).await?;
                Box::new(move |c: &str| labelled.iter().any(|l| l == bare_cluster_name(c)))
            }
            ClusterSelector::Name { provider, name, .. } => {
                let known = self.clusters.get_cluster(provider, name).await.is_ok();
                let name = name.clone();
                Box::new(move |c: &str| known && bare_cluster_name(c) == name)
            }
        };
        let selected: Vec<String> = clusters.into_iter().filter(|c| keep(c.as_str())).collect();
        debug!(app, clusters = ?selected, "Eligible clusters");
        Ok(selected)
    }

    async fn inject(
        &self,
        ac: &AppContext,
        scope: &IntentScope,
        intent: &str,
        rs: &Resource,
        selector: &ClusterSelector,
    ) -> Result<()> {
        let content = self
            .resources
            .get_resource_content(&rs.metadata.name, scope, intent)
            .await?;
        let manifest = decode_text(&content.file_content)?;
        let name = rs.spec.resource_gvk.resource_name();
        let app = &rs.spec.app_name;
        for cluster in self.eligible_clusters(ac, app, selector).await? {
            ac.attach_resource(app, &cluster, &name, &manifest).await?;
            info!(app, cluster, resource = %name, "Resource added");
        }
        Ok(())
    }

    async fn patch_existing(
        &self,
        ac: &AppContext,
        rs: &Resource,
        cz: &Customization,
        selector: &ClusterSelector,
    ) -> Result<()> {
        let ops = cz.json_patch()?;
        let name = rs.spec.resource_gvk.resource_name();
        let app = &rs.spec.app_name;
        for cluster in self.eligible_clusters(ac, app, selector).await? {
            let rh = match ac.get_resource_handle(app, &cluster, &name).await {
                Ok(rh) => rh,
                Err(e) => {
                    warn!(app, cluster, resource = %name, error = %e, "Resource to patch not found");
                    continue;
                }
            };
            let mut doc: Value = match serde_yaml::from_str(&ac.get_resource_value(&rh).await?) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(app, cluster, resource = %name, error = %e, "Resource is not valid YAML");
                    continue;
                }
            };
            if let Err(e) = apply_patch(&mut doc, &ops) {
                warn!(app, cluster, resource = %name, error = %e, "Error applying patch");
                continue;
            }
            ac.update_resource_value(&rh, &serde_yaml::to_string(&doc)?)
                .await?;
            info!(app, cluster, resource = %name, "Resource patched");
        }
        Ok(())
    }

    async fn render_data_object(
        &self,
        ac: &AppContext,
        scope: &IntentScope,
        intent: &str,
        rs: &Resource,
        cz: &Customization,
        selector: &ClusterSelector,
    ) -> Result<()> {
        let SpecFileContent {
            file_contents,
            file_names,
        } = self
            .customizations
            .get_customization_content(&cz.metadata.name, scope, intent, &rs.metadata.name)
            .await?;
        let gvk = &rs.spec.resource_gvk;
        let files = file_contents
            .iter()
            .map(|c| if gvk.is_secret() { Ok(c.clone()) } else { decode_text(c) })
            .collect::<Result<Vec<_>>>()?;
        let manifest = data_object_manifest(gvk, &file_names, &files)?;

        let name = gvk.resource_name();
        let app = &rs.spec.app_name;
        for cluster in self.eligible_clusters(ac, app, selector).await? {
            ac.attach_resource(app, &cluster, &name, &manifest).await?;
            info!(app, cluster, resource = %name, "Resource added");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn ops(v: Value) -> Patch {
        decode_patch(v.as_array().unwrap()).unwrap()
    }

    fn gvk(kind: &str) -> ResourceGvk {
        ResourceGvk {
            api_version: "v1".into(),
            kind: kind.into(),
            name: "cm1".into(),
        }
    }

    #[test]
    fn test_bare_cluster_name() {
        assert_eq!(bare_cluster_name("prov1+cluster1"), "cluster1");
        assert_eq!(bare_cluster_name("cluster1"), "cluster1");
    }

    #[test]
    fn test_config_map_manifest() {
        let m = data_object_manifest(
            &gvk("ConfigMap"),
            &["config1.json".into(), "config2.json".into()],
            &["{\"a\":1}".into(), "{\"b\":2}".into()],
        )
        .unwrap();
        let v: Value = serde_yaml::from_str(&m).unwrap();
        assert_eq!(v["kind"], "ConfigMap");
        assert_eq!(v["metadata"]["name"], "cm1");
        assert_eq!(v["data"]["config1.json"], "{\"a\":1}");
        assert_eq!(v["data"]["config2.json"], "{\"b\":2}");
    }

    #[test]
    fn test_secret_manifest_kind() {
        let m = data_object_manifest(&gvk("secret"), &["id_rsa".into()], &["c2VjcmV0".into()]).unwrap();
        let v: Value = serde_yaml::from_str(&m).unwrap();
        assert_eq!(v["kind"], "Secret");
        assert_eq!(v["type"], SECRET_TYPE);
        assert_eq!(v["data"]["id_rsa"], "c2VjcmV0");
    }

    #[test]
    fn test_selector_of_customization() {
        let mut cz: Customization = serde_json::from_value(json!({
            "metadata": {"name": "cz1"},
            "spec": {"clusterSpecific": "false"}
        }))
        .unwrap();
        assert_eq!(ClusterSelector::of(&cz), ClusterSelector::All);

        cz.spec.cluster_specific = true;
        cz.spec.cluster_info.scope = "Label".into();
        cz.spec.cluster_info.cluster_provider = "p1".into();
        cz.spec.cluster_info.cluster_label = "edge".into();
        cz.spec.cluster_info.mode = "ALLOW".into();
        assert_eq!(
            ClusterSelector::of(&cz),
            ClusterSelector::Label {
                provider: "p1".into(),
                label: "edge".into(),
                allow: true
            }
        );
    }

    #[test]
    fn test_patch_escaped_pointer_and_append() {
        let mut doc = json!({"metadata": {"annotations": {}}, "spec": {"ports": [80]}});
        apply_patch(
            &mut doc,
            &ops(json!([
                {"op": "add", "path": "/metadata/annotations/k8s.io~1name", "value": "v"},
                {"op": "add", "path": "/spec/ports/-", "value": 443},
                {"op": "replace", "path": "/spec/ports/0", "value": 8080}
            ])),
        )
        .unwrap();
        assert_eq!(doc["metadata"]["annotations"]["k8s.io/name"], "v");
        assert_eq!(doc["spec"]["ports"], json!([8080, 443]));
    }

    #[test]
    fn test_failed_patch_leaves_document() {
        let mut doc = json!({"a": 1});
        let p = ops(json!([
            {"op": "replace", "path": "/a", "value": 2},
            {"op": "test", "path": "/a", "value": 3}
        ]));
        let err = apply_patch(&mut doc, &p).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(doc, json!({"a": 1}));

        let missing = ops(json!([{"op": "replace", "path": "/data/a", "value": 1}]));
        assert!(apply_patch(&mut json!({"data": {}}), &missing).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_op() {
        assert!(decode_patch(&[json!({"op": "merge", "path": "/a"})]).is_err());
        assert!(decode_patch(&[json!({"op": "remove", "path": "/a"})]).is_ok());
    }
}
