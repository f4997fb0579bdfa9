// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster network intents through the scheduler and the cluster catalog.

mod common;

use serde_json::json;

use emco_core::appcontext::{AppContext, INST_DEPENDENCY, INST_ORDER, StatusValue};
use emco_core::error::ErrorKind;
use emco_core::ncm::{CONTEXT_CLUSTER_APP, Ipv4Subnet, Network, NetworkSpec, ProviderNet, ProviderNetSpec, Vlan};
use emco_core::state::StateValue;
use emco_core::status::{OutputMode, StatusQuery, StatusType};
use emco_core::types::Metadata;

use common::{TestPlane, report_cluster_status};

fn network(name: &str) -> Network {
    Network {
        metadata: Metadata::named(name),
        spec: NetworkSpec {
            cni_type: "ovn4nfv".into(),
            ipv4_subnets: vec![Ipv4Subnet {
                subnet: "10.1.0.0/16".into(),
                name: "s1".into(),
                ..Default::default()
            }],
        },
    }
}

fn provider_net(name: &str) -> ProviderNet {
    ProviderNet {
        metadata: Metadata::named(name),
        spec: ProviderNetSpec {
            cni_type: "ovn4nfv".into(),
            ipv4_subnets: vec![Ipv4Subnet {
                subnet: "10.10.10.0/24".into(),
                name: "subnet1".into(),
                ..Default::default()
            }],
            provider_net_type: "VLAN".into(),
            vlan: Vlan {
                vlan_id: "102".into(),
                provider_interface_name: "eth1".into(),
                vlan_node_selector: "any".into(),
                ..Default::default()
            },
        },
    }
}

async fn cluster_with_network() -> TestPlane {
    let tp = TestPlane::new();
    tp.add_cluster("p1", "c1", &[]).await;
    tp.plane
        .networks
        .create_network(&network("ovn-net"), "p1", "c1", false)
        .await
        .unwrap();
    tp
}

async fn applied_context(tp: &TestPlane) -> AppContext {
    let info = tp.plane.clusters.get_cluster_state("p1", "c1").await.unwrap();
    AppContext::load(tp.tree(), &info.status_context_id).await.unwrap()
}

#[tokio::test]
async fn test_apply_installs_one_context_per_cluster() {
    let tp = cluster_with_network().await;
    tp.plane.scheduler.apply_network_intents("p1", "c1").await.unwrap();

    let installed = tp.sync.installed().await;
    assert_eq!(installed.len(), 1);
    let ac = applied_context(&tp).await;
    assert_eq!(ac.id(), installed[0]);
    assert_eq!(
        ac.get_resource_names(CONTEXT_CLUSTER_APP, "p1+c1").await.unwrap().len(),
        2
    );
    ac.get_resource_handle(CONTEXT_CLUSTER_APP, "p1+c1", "ovn-net+Network")
        .await
        .unwrap();

    let info = tp.plane.clusters.get_cluster_state("p1", "c1").await.unwrap();
    assert_eq!(info.current_state().unwrap(), StateValue::Applied);

    // applying again is a no-op
    tp.plane.scheduler.apply_network_intents("p1", "c1").await.unwrap();
    assert_eq!(tp.sync.installed().await.len(), 1);
}

#[tokio::test]
async fn test_network_and_provider_net_render_four_resources() {
    let tp = cluster_with_network().await;
    tp.plane
        .provider_nets
        .create_provider_net(&provider_net("pnet"), "p1", "c1", false)
        .await
        .unwrap();
    tp.plane.scheduler.apply_network_intents("p1", "c1").await.unwrap();

    let ac = applied_context(&tp).await;
    let expected = [
        "ovn-net+Network",
        "ovn-net+NetworkAttachmentDefinition",
        "pnet+ProviderNetwork",
        "pnet+NetworkAttachmentDefinition",
    ];
    let mut names = ac.get_resource_names(CONTEXT_CLUSTER_APP, "p1+c1").await.unwrap();
    names.sort();
    let mut sorted = expected.map(String::from).to_vec();
    sorted.sort();
    assert_eq!(names, sorted);

    let order = ac
        .get_resource_instruction(CONTEXT_CLUSTER_APP, "p1+c1", INST_ORDER)
        .await
        .unwrap();
    assert_eq!(order, json!({ "resorder": expected }));
    let deps = ac
        .get_resource_instruction(CONTEXT_CLUSTER_APP, "p1+c1", INST_DEPENDENCY)
        .await
        .unwrap();
    for name in expected {
        assert_eq!(deps["resdependency"][name], "go");
    }

    let h = ac
        .get_resource_handle(CONTEXT_CLUSTER_APP, "p1+c1", "pnet+ProviderNetwork")
        .await
        .unwrap();
    let cr: serde_json::Value = serde_yaml::from_str(&ac.get_resource_value(&h).await.unwrap()).unwrap();
    assert_eq!(cr["kind"], "ProviderNetwork");
    assert_eq!(cr["spec"]["vlan"]["vlanID"], "102");
}

#[tokio::test]
async fn test_shared_network_name_fails_apply() {
    let tp = cluster_with_network().await;
    tp.plane
        .provider_nets
        .create_provider_net(&provider_net("ovn-net"), "p1", "c1", false)
        .await
        .unwrap();
    let err = tp.plane.scheduler.apply_network_intents("p1", "c1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(tp.sync.installed().await.is_empty());
    let info = tp.plane.clusters.get_cluster_state("p1", "c1").await.unwrap();
    assert_eq!(info.current_state().unwrap(), StateValue::Created);
}

#[tokio::test]
async fn test_intents_locked_while_applied() {
    let tp = cluster_with_network().await;
    tp.plane.scheduler.apply_network_intents("p1", "c1").await.unwrap();

    let err = tp
        .plane
        .networks
        .create_network(&network("second"), "p1", "c1", false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = tp.plane.clusters.delete_cluster("p1", "c1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    tp.plane.scheduler.terminate_network_intents("p1", "c1").await.unwrap();
    assert_eq!(tp.sync.uninstalled().await, tp.sync.installed().await);
    tp.plane
        .networks
        .create_network(&network("second"), "p1", "c1", false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_after_terminate_removes_contexts() {
    let tp = cluster_with_network().await;
    tp.plane.scheduler.apply_network_intents("p1", "c1").await.unwrap();
    tp.plane.scheduler.terminate_network_intents("p1", "c1").await.unwrap();

    let ac = applied_context(&tp).await;
    // the synchronizer has not finished yet
    ac.update_app_context_status(StatusValue::Terminating).await.unwrap();
    let err = tp.plane.clusters.delete_cluster("p1", "c1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    ac.update_app_context_status(StatusValue::Terminated).await.unwrap();
    tp.plane.networks.delete_network("ovn-net", "p1", "c1").await.unwrap();
    tp.plane.clusters.delete_cluster("p1", "c1").await.unwrap();
    assert!(AppContext::load(tp.tree(), ac.id()).await.is_err());
    assert_eq!(
        tp.plane.clusters.get_cluster("p1", "c1").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_cluster_reported_status_with_resource_filter() {
    let tp = cluster_with_network().await;
    tp.plane.scheduler.apply_network_intents("p1", "c1").await.unwrap();
    let ac = applied_context(&tp).await;
    report_cluster_status(
        &ac,
        CONTEXT_CLUSTER_APP,
        "p1+c1",
        json!({
            "ready": true,
            "resourceCount": 2,
            "configMapStatuses": [
                {"metadata": {"name": "ovn-cfg"}},
                {"metadata": {"name": "other"}}
            ]
        }),
    )
    .await;

    let query = StatusQuery {
        status_type: StatusType::Cluster,
        output: OutputMode::All,
        resources: vec!["ovn-cfg".into()],
        ..Default::default()
    };
    let r = tp
        .plane
        .scheduler
        .network_intents_status("p1", "c1", &query)
        .await
        .unwrap();
    assert_eq!(r.name, "p1+c1");
    assert_eq!(r.cluster_status.get("Present"), Some(&1));
    let cluster = r.cluster.unwrap();
    assert_eq!(cluster.resources.len(), 1);
    assert_eq!(cluster.resources[0].name, "ovn-cfg");
    assert_eq!(cluster.resources[0].gvk.kind, "ConfigMap");
    assert!(cluster.resources[0].detail.is_none());
}

#[tokio::test]
async fn test_status_of_unknown_cluster_is_not_found() {
    let tp = TestPlane::new();
    let err = tp
        .plane
        .scheduler
        .network_intents_status("p1", "missing", &StatusQuery::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
