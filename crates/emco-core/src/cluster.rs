// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster/provider catalog.
//!
//! Providers namespace clusters. A cluster stores its metadata, its
//! kubeconfig (base64) and its state ledger in store `cluster`; labels and
//! kv-pairs are child records of the cluster key, so a cluster carrying
//! either cannot be deleted until they are removed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, instrument, warn};

use crate::appcontext::{AppContext, StatusValue};
use crate::contextdb::ContextTree;
use crate::controller::{ClusterEvent, ClusterEventPublisher};
use crate::db::Db;
use crate::error::{EmcoError, ErrorKind, Result};
use crate::state::{StateInfo, StateLedger, StateValue};
use crate::types::{Metadata, validate_name};

/// Store of providers, clusters, labels and kv-pairs.
pub const CLUSTER_STORE: &str = "cluster";
/// Metadata tag.
pub const TAG_META: &str = "clustermetadata";
/// Kubeconfig tag.
pub const TAG_CONTENT: &str = "clustercontent";

/// Namespace of clusters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterProvider {
    /// Name and annotations.
    pub metadata: Metadata,
}

/// A managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Name and annotations.
    pub metadata: Metadata,
}

/// Kubeconfig of a cluster, base64 encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterContent {
    /// Encoded kubeconfig.
    pub kubeconfig: String,
}

/// A label on a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLabel {
    /// Label.
    #[serde(rename = "clusterLabel")]
    pub label_name: String,
}

/// Opaque per-cluster configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterKvPairs {
    /// Name and annotations.
    pub metadata: Metadata,
    /// Pairs.
    pub spec: ClusterKvSpec,
}

/// Ordered key/value maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterKvSpec {
    /// Pairs.
    #[serde(default)]
    pub kv: Vec<Map<String, Value>>,
}

/// A cluster with its labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterWithLabels {
    /// Provider.
    #[serde(rename = "clusterProvider")]
    pub provider_name: String,
    /// Cluster.
    #[serde(rename = "cluster")]
    pub cluster_name: String,
    /// Labels.
    pub labels: Vec<ClusterLabel>,
}

/// Provider key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterProviderKey {
    /// Provider.
    #[serde(rename = "clusterProvider")]
    pub provider: String,
}

/// Cluster key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterKey {
    /// Provider.
    #[serde(rename = "clusterProvider")]
    pub provider: String,
    /// Cluster.
    #[serde(rename = "cluster")]
    pub cluster: String,
}

impl ClusterKey {
    /// Key of `provider`/`cluster`.
    pub fn new(provider: &str, cluster: &str) -> Self {
        Self {
            provider: provider.to_string(),
            cluster: cluster.to_string(),
        }
    }
}

/// Label key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterLabelKey {
    /// Provider.
    #[serde(rename = "clusterProvider")]
    pub provider: String,
    /// Cluster, empty to match any.
    #[serde(rename = "cluster")]
    pub cluster: String,
    /// Label, empty to match any.
    #[serde(rename = "clusterLabel")]
    pub label: String,
}

/// Kv-pairs key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterKvPairsKey {
    /// Provider.
    #[serde(rename = "clusterProvider")]
    pub provider: String,
    /// Cluster.
    #[serde(rename = "cluster")]
    pub cluster: String,
    /// Kv-pairs object, empty to match any.
    #[serde(rename = "clusterKv")]
    pub kv_name: String,
}

/// Catalog operations.
#[derive(Clone)]
pub struct ClusterClient {
    db: Db,
    ledger: StateLedger,
    tree: ContextTree,
    publisher: Arc<dyn ClusterEventPublisher>,
}

impl ClusterClient {
    /// Catalog over `db`, deleting terminated contexts from `tree` and
    /// publishing lifecycle events through `publisher`.
    pub fn new(
        db: Db,
        ledger: StateLedger,
        tree: ContextTree,
        publisher: Arc<dyn ClusterEventPublisher>,
    ) -> Self {
        Self {
            db,
            ledger,
            tree,
            publisher,
        }
    }

    /// Create a provider; with `exists` an existing one is replaced.
    pub async fn create_cluster_provider(
        &self,
        p: &ClusterProvider,
        exists: bool,
    ) -> Result<ClusterProvider> {
        p.metadata.validate()?;
        let key = ClusterProviderKey {
            provider: p.metadata.name.clone(),
        };
        if !exists && self.get_cluster_provider(&p.metadata.name).await.is_ok() {
            return Err(EmcoError::Conflict("Cluster Provider already exists".to_string()));
        }
        self.db.insert(CLUSTER_STORE, &key, TAG_META, p).await?;
        Ok(p.clone())
    }

    /// Provider by name.
    pub async fn get_cluster_provider(&self, name: &str) -> Result<ClusterProvider> {
        let key = ClusterProviderKey {
            provider: name.to_string(),
        };
        self.db
            .find_one(CLUSTER_STORE, &key, TAG_META)
            .await?
            .ok_or_else(|| EmcoError::NotFound("Cluster provider not found".to_string()))
    }

    /// Every provider.
    pub async fn get_cluster_providers(&self) -> Result<Vec<ClusterProvider>> {
        let key = ClusterProviderKey {
            provider: String::new(),
        };
        Ok(self.db.find_as(CLUSTER_STORE, &key, TAG_META).await?)
    }

    /// Delete a provider; fails with a conflict while clusters exist.
    pub async fn delete_cluster_provider(&self, name: &str) -> Result<()> {
        let key = ClusterProviderKey {
            provider: name.to_string(),
        };
        self.db.remove(CLUSTER_STORE, &key).await?;
        Ok(())
    }

    /// Create a cluster in state `Created` and announce it to CLM controllers.
    #[instrument(skip(self, c, content), fields(cluster = %c.metadata.name))]
    pub async fn create_cluster(
        &self,
        provider: &str,
        c: &Cluster,
        content: &ClusterContent,
    ) -> Result<Cluster> {
        c.metadata.validate()?;
        self.get_cluster_provider(provider)
            .await
            .map_err(|_| EmcoError::NotFound("Cluster Provider does not exist".to_string()))?;

        let name = &c.metadata.name;
        let key = ClusterKey::new(provider, name);
        let _guard = self.ledger.lock(CLUSTER_STORE, &key).await?;
        if self.get_cluster(provider, name).await.is_ok() {
            return Err(EmcoError::Conflict("Cluster already exists".to_string()));
        }

        self.db.insert(CLUSTER_STORE, &key, TAG_META, c).await?;
        self.db.insert(CLUSTER_STORE, &key, TAG_CONTENT, content).await?;
        self.ledger
            .save(CLUSTER_STORE, &key, &StateInfo::created())
            .await?;

        if let Err(e) = self
            .publisher
            .publish(provider, name, ClusterEvent::ClusterCreated)
            .await
        {
            warn!(provider, cluster = %name, error = %e, "Rolling back cluster after failed publish");
            if let Err(re) = self.db.remove(CLUSTER_STORE, &key).await {
                warn!(provider, cluster = %name, error = %re, "Rollback of cluster failed");
            }
            return Err(e);
        }

        info!(provider, cluster = %name, "Cluster created");
        Ok(c.clone())
    }

    /// Cluster metadata.
    pub async fn get_cluster(&self, provider: &str, name: &str) -> Result<Cluster> {
        self.db
            .find_one(CLUSTER_STORE, &ClusterKey::new(provider, name), TAG_META)
            .await?
            .ok_or_else(|| EmcoError::NotFound("Cluster not found".to_string()))
    }

    /// Cluster kubeconfig.
    pub async fn get_cluster_content(&self, provider: &str, name: &str) -> Result<ClusterContent> {
        self.db
            .find_one(CLUSTER_STORE, &ClusterKey::new(provider, name), TAG_CONTENT)
            .await?
            .ok_or_else(|| EmcoError::NotFound("Cluster content not found".to_string()))
    }

    /// Cluster state ledger.
    pub async fn get_cluster_state(&self, provider: &str, name: &str) -> Result<StateInfo> {
        self.ledger
            .load(CLUSTER_STORE, &ClusterKey::new(provider, name))
            .await?
            .ok_or_else(|| EmcoError::NotFound("Cluster StateInfo not found".to_string()))
    }

    /// Every cluster of a provider.
    pub async fn get_clusters(&self, provider: &str) -> Result<Vec<Cluster>> {
        Ok(self
            .db
            .find_as(CLUSTER_STORE, &ClusterKey::new(provider, ""), TAG_META)
            .await?)
    }

    /// Every cluster of a provider with its labels.
    pub async fn get_all_clusters_and_labels(&self, provider: &str) -> Result<Vec<ClusterWithLabels>> {
        let mut out = Vec::new();
        for c in self.get_clusters(provider).await? {
            let labels = self
                .get_cluster_labels(provider, &c.metadata.name)
                .await?;
            out.push(ClusterWithLabels {
                provider_name: provider.to_string(),
                cluster_name: c.metadata.name,
                labels,
            });
        }
        Ok(out)
    }

    /// Names of the provider's clusters carrying `label`.
    pub async fn get_clusters_with_label(&self, provider: &str, label: &str) -> Result<Vec<String>> {
        let key = ClusterLabelKey {
            provider: provider.to_string(),
            cluster: String::new(),
            label: label.to_string(),
        };
        Ok(self.db.find_as(CLUSTER_STORE, &key, "cluster").await?)
    }

    /// Delete a cluster once its network intents are terminated.
    #[instrument(skip(self))]
    pub async fn delete_cluster(&self, provider: &str, name: &str) -> Result<()> {
        let key = ClusterKey::new(provider, name);
        let _guard = self.ledger.lock(CLUSTER_STORE, &key).await?;

        if let Some(info) = self.ledger.load(CLUSTER_STORE, &key).await? {
            match info.current_state() {
                Ok(StateValue::Applied | StateValue::InstantiateStopped) => {
                    return Err(EmcoError::Conflict(
                        "Cluster network intents must be terminated first".to_string(),
                    ));
                }
                Ok(StateValue::Terminated | StateValue::TerminateStopped) => {
                    self.delete_terminated_contexts(&info).await?;
                }
                _ => {}
            }
        }

        self.db.remove(CLUSTER_STORE, &key).await?;

        if let Err(e) = self
            .publisher
            .publish(provider, name, ClusterEvent::ClusterDeleted)
            .await
        {
            warn!(provider, cluster = name, error = %e, "Cluster deleted but publish failed");
        }
        info!(provider, cluster = name, "Cluster deleted");
        Ok(())
    }

    async fn delete_terminated_contexts(&self, info: &StateInfo) -> Result<()> {
        let mut contexts = Vec::new();
        for id in info.all_context_ids() {
            let ac = match AppContext::load(&self.tree, &id).await {
                Ok(ac) => ac,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            let status = ac.get_app_context_status().await?.status;
            if !matches!(status, StatusValue::Terminated | StatusValue::TerminateFailed) {
                return Err(EmcoError::Conflict(format!(
                    "Network intents for cluster have not completed terminating: context {} is {}",
                    id, status
                )));
            }
            contexts.push(ac);
        }
        for ac in contexts {
            ac.delete_composite_app().await?;
        }
        Ok(())
    }

    /// Add a label; with `exists` an existing one is accepted.
    pub async fn create_cluster_label(
        &self,
        provider: &str,
        cluster: &str,
        label: &ClusterLabel,
        exists: bool,
    ) -> Result<ClusterLabel> {
        validate_name(&label.label_name)?;
        self.get_cluster(provider, cluster).await?;
        let key = ClusterLabelKey {
            provider: provider.to_string(),
            cluster: cluster.to_string(),
            label: label.label_name.clone(),
        };
        if !exists
            && self
                .get_cluster_label(provider, cluster, &label.label_name)
                .await
                .is_ok()
        {
            return Err(EmcoError::Conflict("Cluster Label already exists".to_string()));
        }
        self.db.insert(CLUSTER_STORE, &key, TAG_META, label).await?;
        Ok(label.clone())
    }

    /// A label of a cluster.
    pub async fn get_cluster_label(&self, provider: &str, cluster: &str, label: &str) -> Result<ClusterLabel> {
        let key = ClusterLabelKey {
            provider: provider.to_string(),
            cluster: cluster.to_string(),
            label: label.to_string(),
        };
        self.db
            .find_one(CLUSTER_STORE, &key, TAG_META)
            .await?
            .ok_or_else(|| EmcoError::NotFound("Cluster label not found".to_string()))
    }

    /// Every label of a cluster.
    pub async fn get_cluster_labels(&self, provider: &str, cluster: &str) -> Result<Vec<ClusterLabel>> {
        let key = ClusterLabelKey {
            provider: provider.to_string(),
            cluster: cluster.to_string(),
            label: String::new(),
        };
        Ok(self.db.find_as(CLUSTER_STORE, &key, TAG_META).await?)
    }

    /// Remove a label.
    pub async fn delete_cluster_label(&self, provider: &str, cluster: &str, label: &str) -> Result<()> {
        let key = ClusterLabelKey {
            provider: provider.to_string(),
            cluster: cluster.to_string(),
            label: label.to_string(),
        };
        self.db.remove(CLUSTER_STORE, &key).await?;
        Ok(())
    }

    /// Add a kv-pairs object; with `exists` an existing one is replaced.
    pub async fn create_cluster_kv_pairs(
        &self,
        provider: &str,
        cluster: &str,
        kv: &ClusterKvPairs,
        exists: bool,
    ) -> Result<ClusterKvPairs> {
        kv.metadata.validate()?;
        self.get_cluster(provider, cluster).await?;
        let key = ClusterKvPairsKey {
            provider: provider.to_string(),
            cluster: cluster.to_string(),
            kv_name: kv.metadata.name.clone(),
        };
        if !exists
            && self
                .get_cluster_kv_pairs(provider, cluster, &kv.metadata.name)
                .await
                .is_ok()
        {
            return Err(EmcoError::Conflict("Cluster KV Pair already exists".to_string()));
        }
        self.db.insert(CLUSTER_STORE, &key, TAG_META, kv).await?;
        Ok(kv.clone())
    }

    /// A kv-pairs object.
    pub async fn get_cluster_kv_pairs(&self, provider: &str, cluster: &str, kv_name: &str) -> Result<ClusterKvPairs> {
        let key = ClusterKvPairsKey {
            provider: provider.to_string(),
            cluster: cluster.to_string(),
            kv_name: kv_name.to_string(),
        };
        self.db
            .find_one(CLUSTER_STORE, &key, TAG_META)
            .await?
            .ok_or_else(|| EmcoError::NotFound("Cluster KV pair not found".to_string()))
    }

    /// Value of `kv_key` inside a kv-pairs object, as `{"value": ...}`.
    pub async fn get_cluster_kv_pairs_value(
        &self,
        provider: &str,
        cluster: &str,
        kv_name: &str,
        kv_key: &str,
    ) -> Result<Value> {
        let kv = self.get_cluster_kv_pairs(provider, cluster, kv_name).await?;
        kv.spec
            .kv
            .iter()
            .find_map(|m| m.get(kv_key))
            .map(|v| json!({ "value": v }))
            .ok_or_else(|| EmcoError::NotFound("Cluster KV pair key value not found".to_string()))
    }

    /// Every kv-pairs object of a cluster.
    pub async fn get_all_cluster_kv_pairs(&self, provider: &str, cluster: &str) -> Result<Vec<ClusterKvPairs>> {
        let key = ClusterKvPairsKey {
            provider: provider.to_string(),
            cluster: cluster.to_string(),
            kv_name: String::new(),
        };
        Ok(self.db.find_as(CLUSTER_STORE, &key, TAG_META).await?)
    }

    /// Remove a kv-pairs object.
    pub async fn delete_cluster_kv_pairs(&self, provider: &str, cluster: &str, kv_name: &str) -> Result<()> {
        let key = ClusterKvPairsKey {
            provider: provider.to_string(),
            cluster: cluster.to_string(),
            kv_name: kv_name.to_string(),
        };
        self.db.remove(CLUSTER_STORE, &key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::mock::MockClusterEventPublisher;

    fn client(publisher: MockClusterEventPublisher) -> ClusterClient {
        let db = Db::memory();
        ClusterClient::new(
            db.clone(),
            StateLedger::new(db),
            ContextTree::memory(),
            Arc::new(publisher),
        )
    }

    fn provider(name: &str) -> ClusterProvider {
        ClusterProvider {
            metadata: Metadata::named(name),
        }
    }

    fn cluster(name: &str) -> Cluster {
        Cluster {
            metadata: Metadata::named(name),
        }
    }

    #[tokio::test]
    async fn test_provider_conflicts() {
        let cc = client(MockClusterEventPublisher::new());
        cc.create_cluster_provider(&provider("p1"), false).await.unwrap();
        let err = cc.create_cluster_provider(&provider("p1"), false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        cc.create_cluster_provider(&provider("p1"), true).await.unwrap();
        assert_eq!(cc.get_cluster_providers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_cluster_requires_provider() {
        let cc = client(MockClusterEventPublisher::new());
        let err = cc
            .create_cluster("nope", &cluster("c1"), &ClusterContent::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_create_cluster_rolls_back_when_publish_fails() {
        let publisher = MockClusterEventPublisher::failing();
        let cc = client(publisher.clone());
        cc.create_cluster_provider(&provider("p1"), false).await.unwrap();
        assert!(
            cc.create_cluster("p1", &cluster("c1"), &ClusterContent::default())
                .await
                .is_err()
        );
        assert_eq!(publisher.events().await.len(), 1);
        assert!(cc.get_cluster("p1", "c1").await.is_err());
    }

    #[tokio::test]
    async fn test_kv_pairs_value() {
        let cc = client(MockClusterEventPublisher::new());
        cc.create_cluster_provider(&provider("p1"), false).await.unwrap();
        cc.create_cluster("p1", &cluster("c1"), &ClusterContent::default())
            .await
            .unwrap();

        let mut pair = Map::new();
        pair.insert("ip".to_string(), json!("10.0.0.1"));
        let kv = ClusterKvPairs {
            metadata: Metadata::named("master-node"),
            spec: ClusterKvSpec { kv: vec![pair] },
        };
        cc.create_cluster_kv_pairs("p1", "c1", &kv, false).await.unwrap();

        let v = cc
            .get_cluster_kv_pairs_value("p1", "c1", "master-node", "ip")
            .await
            .unwrap();
        assert_eq!(v, json!({"value": "10.0.0.1"}));
        assert!(
            cc.get_cluster_kv_pairs_value("p1", "c1", "master-node", "nope")
                .await
                .is_err()
        );
        assert_eq!(cc.get_all_cluster_kv_pairs("p1", "c1").await.unwrap().len(), 1);
    }
}
