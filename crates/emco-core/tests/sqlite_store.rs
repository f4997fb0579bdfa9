// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The cluster catalog over the SQLite store.

mod common;

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use emco_core::cluster::ClusterKvPairs;
use emco_core::contextdb::ContextTree;
use emco_core::controller::ClusterEvent;
use emco_core::controller::mock::MockSynchronizer;
use emco_core::db::{Db, SqliteKvStore};
use emco_core::error::ErrorKind;
use emco_core::state::StateValue;

use common::TestPlane;

async fn plane_at(path: &Path) -> TestPlane {
    let kv = SqliteKvStore::from_path(path).await.unwrap();
    TestPlane::over(Db::new(Arc::new(kv)), ContextTree::memory(), MockSynchronizer::new())
}

#[tokio::test]
async fn test_catalog_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("emco.db");
    {
        let tp = plane_at(&path).await;
        tp.add_cluster("p1", "c1", &["edge"]).await;
        tp.add_cluster("p1", "c2", &["edge", "gpu"]).await;
        assert_eq!(
            tp.publisher.events().await,
            vec![
                ("p1".to_string(), "c1".to_string(), ClusterEvent::ClusterCreated),
                ("p1".to_string(), "c2".to_string(), ClusterEvent::ClusterCreated),
            ]
        );
    }

    let tp = plane_at(&path).await;
    let clusters = &tp.plane.clusters;
    assert_eq!(clusters.get_clusters("p1").await.unwrap().len(), 2);
    let mut edge = clusters.get_clusters_with_label("p1", "edge").await.unwrap();
    edge.sort();
    assert_eq!(edge, vec!["c1".to_string(), "c2".to_string()]);
    assert_eq!(
        clusters.get_clusters_with_label("p1", "gpu").await.unwrap(),
        vec!["c2".to_string()]
    );
    let info = clusters.get_cluster_state("p1", "c1").await.unwrap();
    assert_eq!(info.current_state().unwrap(), StateValue::Created);
}

#[tokio::test]
async fn test_children_block_removal() {
    let dir = TempDir::new().unwrap();
    let tp = plane_at(&dir.path().join("emco.db")).await;
    tp.add_cluster("p1", "c1", &["edge"]).await;
    let clusters = &tp.plane.clusters;

    let err = clusters.delete_cluster_provider("p1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = clusters.delete_cluster("p1", "c1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    clusters.delete_cluster_label("p1", "c1", "edge").await.unwrap();
    clusters.delete_cluster("p1", "c1").await.unwrap();
    clusters.delete_cluster_provider("p1").await.unwrap();
    assert_eq!(
        clusters.get_cluster_provider("p1").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_kv_pairs_lookup() {
    let dir = TempDir::new().unwrap();
    let tp = plane_at(&dir.path().join("emco.db")).await;
    tp.add_cluster("p1", "c1", &[]).await;

    let kvp: ClusterKvPairs = serde_json::from_value(serde_json::json!({
        "metadata": {"name": "master-node"},
        "spec": {"kv": [{"ip": "192.168.1.1"}, {"zone": "eu"}]}
    }))
    .unwrap();
    tp.plane
        .clusters
        .create_cluster_kv_pairs("p1", "c1", &kvp, false)
        .await
        .unwrap();

    let v = tp
        .plane
        .clusters
        .get_cluster_kv_pairs_value("p1", "c1", "master-node", "zone")
        .await
        .unwrap();
    assert_eq!(v["value"], "eu");
    let err = tp
        .plane
        .clusters
        .get_cluster_kv_pairs_value("p1", "c1", "master-node", "rack")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
