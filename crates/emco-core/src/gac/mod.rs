// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generic Kubernetes intents and the action controller that applies them.
//!
//! Intents, their resources and the resources' customizations live in one KV
//! store, keyed so that each level is a child of the one above: an intent
//! cannot be deleted while it has resources, nor a resource while it has
//! customizations.

pub mod action;
pub mod customization;
pub mod intent;
pub mod resource;

pub use action::GenericActionController;
pub use customization::{ClusterInfo, Customization, CustomizationClient, CustomizeSpec, SpecFileContent};
pub use intent::{GenericK8sIntent, GenericK8sIntentClient};
pub use resource::{Resource, ResourceClient, ResourceFileContent, ResourceGvk, ResourceSpec};

/// Store of generic intents, resources and customizations.
pub const GAC_STORE: &str = "orchestrator";
/// Intent record tag.
pub const TAG_INTENT: &str = "generick8sintentmetadata";
/// Resource record tag.
pub const TAG_RESOURCE: &str = "resourcemetadata";
/// Uploaded manifest tag.
pub const TAG_RESOURCE_CONTENT: &str = "resourcecontent";
/// Customization record tag.
pub const TAG_CUSTOMIZATION: &str = "customizationmetadata";
/// Customization files tag.
pub const TAG_CUSTOMIZATION_CONTENT: &str = "customizationcontent";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::db::Db;
    use crate::types::{IntentScope, Metadata};
    use serde_json::json;

    fn scope() -> IntentScope {
        IntentScope::new("proj1", "capp", "v1", "dig1")
    }

    fn config_map() -> Resource {
        serde_json::from_value(json!({
            "metadata": {"name": "cm1"},
            "spec": {
                "appName": "app1",
                "newObject": "true",
                "resourceGVK": {"apiVersion": "v1", "kind": "ConfigMap", "name": "cm1"}
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_hierarchy_blocks_parent_delete() {
        let db = Db::memory();
        let intents = GenericK8sIntentClient::new(db.clone());
        let resources = ResourceClient::new(db.clone());
        let czs = CustomizationClient::new(db);

        let err = resources
            .create_resource(&config_map(), None, &scope(), "gki", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        intents
            .create_generic_k8s_intent(&GenericK8sIntent { metadata: Metadata::named("gki") }, &scope(), false)
            .await
            .unwrap();
        resources
            .create_resource(&config_map(), None, &scope(), "gki", false)
            .await
            .unwrap();
        let cz = Customization {
            metadata: Metadata::named("cz1"),
            spec: CustomizeSpec::default(),
        };
        czs.create_customization(&cz, &SpecFileContent::default(), &scope(), "gki", "cm1", false)
            .await
            .unwrap();

        let err = intents.delete_generic_k8s_intent("gki", &scope()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = resources.delete_resource("cm1", &scope(), "gki").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        czs.delete_customization("cz1", &scope(), "gki", "cm1").await.unwrap();
        resources.delete_resource("cm1", &scope(), "gki").await.unwrap();
        intents.delete_generic_k8s_intent("gki", &scope()).await.unwrap();
        assert!(intents.get_all_generic_k8s_intents(&scope()).await.unwrap().is_empty());
    }

    #[test]
    fn test_resource_file_rules() {
        let cm = config_map();
        assert!(cm.validate(None).is_ok());
        let file = ResourceFileContent {
            file_content: "YQ==".into(),
        };
        assert!(cm.validate(Some(&file)).is_err());

        let mut deploy = config_map();
        deploy.spec.resource_gvk.kind = "Deployment".into();
        assert!(deploy.needs_file());
        assert!(deploy.validate(None).is_err());
        assert!(deploy.validate(Some(&file)).is_ok());

        deploy.spec.new_object = false;
        assert!(deploy.validate(None).is_ok());
    }

    #[test]
    fn test_customization_rules() {
        let mut cz: Customization = serde_json::from_value(json!({
            "metadata": {"name": "cz1"},
            "spec": {
                "clusterSpecific": "true",
                "clusterInfo": {
                    "scope": "label",
                    "clusterProvider": "p1",
                    "clusterName": "",
                    "clusterLabel": "edge",
                    "mode": "allow"
                }
            }
        }))
        .unwrap();
        let files = SpecFileContent::default();
        assert!(cz.validate(&files).is_ok());

        cz.spec.cluster_info.cluster_name = "c1".into();
        assert!(cz.validate(&files).is_err());
        cz.spec.cluster_info.scope = "name".into();
        cz.spec.cluster_info.cluster_label.clear();
        assert!(cz.validate(&files).is_ok());

        cz.spec.cluster_info = ClusterInfo::default();
        assert!(cz.validate(&files).is_err());

        let cz = Customization {
            metadata: Metadata::named("cz2"),
            spec: CustomizeSpec::default(),
        };
        let uneven = SpecFileContent {
            file_contents: vec!["YQ==".into()],
            file_names: vec![],
        };
        assert!(cz.validate(&uneven).is_err());
    }
}
