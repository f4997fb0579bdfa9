// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use emco_core::appcontext::{AppContext, CompositeAppMeta, StatusValue};
use emco_core::cluster::{Cluster, ClusterContent, ClusterLabel, ClusterProvider};
use emco_core::contextdb::ContextTree;
use emco_core::controller::mock::{MockClusterEventPublisher, MockReadyNotifier, MockSynchronizer};
use emco_core::db::Db;
use emco_core::runtime::ControlPlane;
use emco_core::types::{IntentScope, Metadata};

/// Back-off used by service discovery in tests.
pub const RETRY: Duration = Duration::from_millis(10);

/// A control plane over in-memory stores with mock collaborators.
pub struct TestPlane {
    pub plane: ControlPlane,
    pub sync: MockSynchronizer,
    pub notifier: MockReadyNotifier,
    pub publisher: MockClusterEventPublisher,
}

impl TestPlane {
    pub fn new() -> Self {
        Self::with_sync(MockSynchronizer::new())
    }

    pub fn with_sync(sync: MockSynchronizer) -> Self {
        Self::over(Db::memory(), ContextTree::memory(), sync)
    }

    pub fn over(db: Db, tree: ContextTree, sync: MockSynchronizer) -> Self {
        let notifier = MockReadyNotifier::new();
        let publisher = MockClusterEventPublisher::new();
        let plane = ControlPlane::with_collaborators(
            db,
            tree,
            Arc::new(sync.clone()),
            Arc::new(notifier.clone()),
            Arc::new(publisher.clone()),
            RETRY,
        );
        Self {
            plane,
            sync,
            notifier,
            publisher,
        }
    }

    pub fn tree(&self) -> &ContextTree {
        &self.plane.tree
    }

    /// Register `provider/cluster`, creating the provider when needed.
    pub async fn add_cluster(&self, provider: &str, cluster: &str, labels: &[&str]) {
        let clusters = &self.plane.clusters;
        clusters
            .create_cluster_provider(
                &ClusterProvider {
                    metadata: Metadata::named(provider),
                },
                true,
            )
            .await
            .unwrap();
        clusters
            .create_cluster(
                provider,
                &Cluster {
                    metadata: Metadata::named(cluster),
                },
                &ClusterContent::default(),
            )
            .await
            .unwrap();
        for label in labels {
            clusters
                .create_cluster_label(
                    provider,
                    cluster,
                    &ClusterLabel {
                        label_name: label.to_string(),
                    },
                    false,
                )
                .await
                .unwrap();
        }
    }
}

pub fn scope() -> IntentScope {
    IntentScope::new("proj1", "capp1", "v1", "dig1")
}

pub fn meta() -> CompositeAppMeta {
    CompositeAppMeta {
        project: "proj1".into(),
        composite_app: "capp1".into(),
        version: "v1".into(),
        release: "r1".into(),
        deployment_intent_group: "dig1".into(),
        namespace: "ns1".into(),
        ..Default::default()
    }
}

/// A deployed composite app: `apps` maps each app to its clusters.
pub async fn deployed_context(tree: &ContextTree, apps: &[(&str, &[&str])]) -> AppContext {
    let ac = AppContext::init(tree).await.unwrap();
    ac.add_composite_app_meta(&meta()).await.unwrap();
    for (app, clusters) in apps {
        let ah = ac.add_app(app).await.unwrap();
        for cluster in *clusters {
            ac.add_cluster(&ah, cluster).await.unwrap();
        }
    }
    ac.update_app_context_status(StatusValue::Instantiated)
        .await
        .unwrap();
    ac
}

/// Write the status document the cluster monitor reports for `app` on `cluster`.
pub async fn report_cluster_status(ac: &AppContext, app: &str, cluster: &str, bundle: Value) {
    let ch = ac.get_cluster_handle(app, cluster).await.unwrap();
    ac.update_status_value(&ch, bundle).await.unwrap();
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
