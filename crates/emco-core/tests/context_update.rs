// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action controllers reached through the `Contextupdate` service.

mod common;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use tonic::Request;

use emco_core::appcontext::{AppContext, resource_order};
use emco_core::dtc::{
    InboundClientsIntent, InboundClientsIntentClient, InboundClientsIntentSpec, InboundServerIntent,
    InboundServerIntentClient, InboundServerIntentSpec, NETWORK_POLICY_LABEL, TrafficGroupIntent,
    TrafficGroupIntentClient,
};
use emco_core::error::ErrorKind;
use emco_core::gac::{
    Customization, CustomizationClient, GenericK8sIntent, GenericK8sIntentClient, Resource, ResourceClient,
    SpecFileContent,
};
use emco_core::server::IntentOwner;
use emco_core::types::Metadata;
use emco_protocol::contextupdate::ContextUpdateRequest;
use emco_protocol::contextupdate::contextupdate_server::Contextupdate;

use common::{TestPlane, deployed_context, scope};

async fn generic_config_map(tp: &TestPlane) {
    let db = tp.plane.db.clone();
    GenericK8sIntentClient::new(db.clone())
        .create_generic_k8s_intent(
            &GenericK8sIntent {
                metadata: Metadata::named("gki1"),
            },
            &scope(),
            false,
        )
        .await
        .unwrap();
    let cm: Resource = serde_json::from_value(json!({
        "metadata": {"name": "cm1"},
        "spec": {
            "appName": "app1",
            "newObject": "true",
            "resourceGVK": {"apiVersion": "v1", "kind": "ConfigMap", "name": "settings"}
        }
    }))
    .unwrap();
    ResourceClient::new(db.clone())
        .create_resource(&cm, None, &scope(), "gki1", false)
        .await
        .unwrap();
    let cz: Customization = serde_json::from_value(json!({
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
    let files = SpecFileContent {
        file_contents: vec![STANDARD.encode("{\"level\":\"debug\"}")],
        file_names: vec!["app.json".into()],
    };
    CustomizationClient::new(db)
        .create_customization(&cz, &files, &scope(), "gki1", "cm1", false)
        .await
        .unwrap();
}

async fn policy_group(tp: &TestPlane) {
    let db = tp.plane.db.clone();
    TrafficGroupIntentClient::new(db.clone())
        .create_traffic_group_intent(
            &TrafficGroupIntent {
                metadata: Metadata::named("tg1"),
            },
            &scope(),
            false,
        )
        .await
        .unwrap();
    InboundServerIntentClient::new(db.clone())
        .create_server_inbound_intent(
            &InboundServerIntent {
                metadata: Metadata::named("isi1"),
                spec: InboundServerIntentSpec {
                    app_name: "server".into(),
                    port: 9443,
                    protocol: "TCP".into(),
                    ..Default::default()
                },
            },
            &scope(),
            "tg1",
            false,
        )
        .await
        .unwrap();
    InboundClientsIntentClient::new(db)
        .create_clients_inbound_intent(
            &InboundClientsIntent {
                metadata: Metadata::named("ici1"),
                spec: InboundClientsIntentSpec {
                    app_name: "client".into(),
                    ..Default::default()
                },
            },
            &scope(),
            "tg1",
            "isi1",
            false,
        )
        .await
        .unwrap();
}

async fn update(tp: &TestPlane, intent: &str, ac: &AppContext) -> (bool, String) {
    let resp = tp
        .plane
        .context_update_service()
        .update_app_context(Request::new(ContextUpdateRequest {
            app_context: ac.id().to_string(),
            intent_name: intent.to_string(),
        }))
        .await
        .unwrap()
        .into_inner();
    (resp.app_context_updated, resp.app_context_update_message)
}

#[tokio::test]
async fn test_generic_config_map_lands_on_labelled_clusters() {
    let tp = TestPlane::new();
    tp.add_cluster("p1", "c1", &["edge"]).await;
    tp.add_cluster("p1", "c2", &[]).await;
    generic_config_map(&tp).await;
    let ac = deployed_context(tp.tree(), &[("app1", &["p1+c1", "p1+c2"])]).await;

    let svc = tp.plane.context_update_service();
    assert_eq!(svc.owner("gki1", ac.id()).await.unwrap(), IntentOwner::GenericAction);
    let (updated, message) = update(&tp, "gki1", &ac).await;
    assert!(updated, "{message}");

    let h = ac.get_resource_handle("app1", "p1+c1", "settings+ConfigMap").await.unwrap();
    let cm: Value = serde_yaml::from_str(&ac.get_resource_value(&h).await.unwrap()).unwrap();
    assert_eq!(cm["kind"], "ConfigMap");
    assert_eq!(cm["data"]["app.json"], "{\"level\":\"debug\"}");
    let order = ac.get_resource_instruction("app1", "p1+c1", "order").await.unwrap();
    assert_eq!(resource_order(&order), vec!["settings+ConfigMap".to_string()]);

    assert!(ac.get_resource_names("app1", "p1+c2").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_json_customization_patches_existing_object() {
    let tp = TestPlane::new();
    tp.add_cluster("p1", "c1", &[]).await;
    let db = tp.plane.db.clone();
    GenericK8sIntentClient::new(db.clone())
        .create_generic_k8s_intent(
            &GenericK8sIntent {
                metadata: Metadata::named("gki1"),
            },
            &scope(),
            false,
        )
        .await
        .unwrap();
    let deploy: Resource = serde_json::from_value(json!({
        "metadata": {"name": "r1"},
        "spec": {
            "appName": "app1",
            "newObject": "false",
            "resourceGVK": {"apiVersion": "apps/v1", "kind": "Deployment", "name": "web"}
        }
    }))
    .unwrap();
    ResourceClient::new(db.clone())
        .create_resource(&deploy, None, &scope(), "gki1", false)
        .await
        .unwrap();
    let cz: Customization = serde_json::from_value(json!({
        "metadata": {"name": "cz1"},
        "spec": {
            "clusterSpecific": "false",
            "patchType": "json",
            "patchJson": [
                {"op": "replace", "path": "/spec/replicas", "value": 3},
                {"op": "add", "path": "/metadata/labels/tier", "value": "edge"}
            ]
        }
    }))
    .unwrap();
    CustomizationClient::new(db)
        .create_customization(&cz, &SpecFileContent::default(), &scope(), "gki1", "r1", false)
        .await
        .unwrap();

    let ac = deployed_context(tp.tree(), &[("app1", &["p1+c1"])]).await;
    let ch = ac.get_cluster_handle("app1", "p1+c1").await.unwrap();
    let original = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  labels: {}\nspec:\n  replicas: 1\n";
    ac.add_resource(&ch, "web+Deployment", original).await.unwrap();

    let (updated, message) = update(&tp, "gki1", &ac).await;
    assert!(updated, "{message}");
    let h = ac.get_resource_handle("app1", "p1+c1", "web+Deployment").await.unwrap();
    let doc: Value = serde_yaml::from_str(&ac.get_resource_value(&h).await.unwrap()).unwrap();
    assert_eq!(doc["spec"]["replicas"], 3);
    assert_eq!(doc["metadata"]["labels"]["tier"], "edge");
}

#[tokio::test]
async fn test_network_policy_only_on_supporting_clusters() {
    let tp = TestPlane::new();
    tp.add_cluster("p1", "c1", &[NETWORK_POLICY_LABEL]).await;
    tp.add_cluster("p1", "c2", &[]).await;
    policy_group(&tp).await;
    let ac = deployed_context(tp.tree(), &[("server", &["p1+c1", "p1+c2"]), ("client", &["p1+c2"])]).await;

    assert_eq!(
        tp.plane.context_update_service().owner("tg1", ac.id()).await.unwrap(),
        IntentOwner::Traffic
    );
    let (updated, message) = update(&tp, "tg1", &ac).await;
    assert!(updated, "{message}");

    let h = ac
        .get_resource_handle("server", "p1+c1", "tg1-isi1+NetworkPolicy")
        .await
        .unwrap();
    let policy: Value = serde_yaml::from_str(&ac.get_resource_value(&h).await.unwrap()).unwrap();
    assert_eq!(policy["spec"]["podSelector"]["matchLabels"]["app"], "server");
    assert_eq!(
        policy["spec"]["ingress"][0]["from"][0],
        json!({"podSelector": {"matchLabels": {"app": "client"}}})
    );
    assert_eq!(policy["spec"]["ingress"][0]["ports"][0]["port"], 9443);

    assert!(ac.get_resource_names("server", "p1+c2").await.unwrap().is_empty());
    // no service, so nothing to discover
    assert!(tp.notifier.subscriptions().await.is_empty());

    // applying again keeps a single order entry
    update(&tp, "tg1", &ac).await;
    let order = ac.get_resource_instruction("server", "p1+c1", "order").await.unwrap();
    assert_eq!(resource_order(&order), vec!["tg1-isi1+NetworkPolicy".to_string()]);
}

#[tokio::test]
async fn test_unknown_intent_is_reported_not_updated() {
    let tp = TestPlane::new();
    let ac = deployed_context(tp.tree(), &[("app1", &["p1+c1"])]).await;

    let err = tp.plane.context_update_service().owner("nope", ac.id()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let (updated, message) = update(&tp, "nope", &ac).await;
    assert!(!updated);
    assert!(message.contains("nope"));
}

#[tokio::test]
async fn test_request_requires_context_and_intent() {
    let tp = TestPlane::new();
    let status = tp
        .plane
        .context_update_service()
        .update_app_context(Request::new(ContextUpdateRequest {
            app_context: String::new(),
            intent_name: "gki1".into(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}
