// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Virtual network intents.

use serde::{Deserialize, Serialize};

use super::{Ipv4Subnet, TAG_NETWORK, ensure_modifiable, validate_subnets};
use crate::cluster::{CLUSTER_STORE, ClusterKey};
use crate::db::Db;
use crate::error::{EmcoError, Result};
use crate::state::StateLedger;
use crate::types::Metadata;

/// A virtual network on a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Name and annotations.
    pub metadata: Metadata,
    /// Network definition.
    pub spec: NetworkSpec,
}

/// Network definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// CNI plugin.
    #[serde(rename = "cniType")]
    pub cni_type: String,
    /// Subnets.
    #[serde(rename = "ipv4Subnets", default)]
    pub ipv4_subnets: Vec<Ipv4Subnet>,
}

/// Network key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkKey {
    /// Provider.
    #[serde(rename = "clusterProvider")]
    pub provider: String,
    /// Cluster.
    pub cluster: String,
    /// Network, empty to match any.
    pub network: String,
}

impl NetworkKey {
    fn new(provider: &str, cluster: &str, network: &str) -> Self {
        Self {
            provider: provider.to_string(),
            cluster: cluster.to_string(),
            network: network.to_string(),
        }
    }
}

impl Network {
    /// Validate metadata and subnets.
    pub fn validate(&self) -> Result<()> {
        self.metadata.validate()?;
        validate_subnets(&self.spec.cni_type, &self.spec.ipv4_subnets)
    }
}

/// Network CRUD.
#[derive(Clone)]
pub struct NetworkClient {
    db: Db,
    ledger: StateLedger,
}

impl NetworkClient {
    /// Client over `db`, guarded by the cluster ledgers in `ledger`.
    pub fn new(db: Db, ledger: StateLedger) -> Self {
        Self { db, ledger }
    }

    /// Create a network; with `exists` an existing one is replaced.
    pub async fn create_network(
        &self,
        n: &Network,
        provider: &str,
        cluster: &str,
        exists: bool,
    ) -> Result<Network> {
        n.validate()?;
        let _guard = self
            .ledger
            .lock(CLUSTER_STORE, &ClusterKey::new(provider, cluster))
            .await?;
        ensure_modifiable(&self.ledger, provider, cluster, "creating").await?;

        if !exists && self.get_network(&n.metadata.name, provider, cluster).await.is_ok() {
            return Err(EmcoError::Conflict("Network already exists".to_string()));
        }
        let key = NetworkKey::new(provider, cluster, &n.metadata.name);
        self.db.insert(CLUSTER_STORE, &key, TAG_NETWORK, n).await?;
        Ok(n.clone())
    }

    /// A network.
    pub async fn get_network(&self, name: &str, provider: &str, cluster: &str) -> Result<Network> {
        self.db
            .find_one(CLUSTER_STORE, &NetworkKey::new(provider, cluster, name), TAG_NETWORK)
            .await?
            .ok_or_else(|| EmcoError::NotFound("Network not found".to_string()))
    }

    /// Every network of a cluster.
    pub async fn get_networks(&self, provider: &str, cluster: &str) -> Result<Vec<Network>> {
        Ok(self
            .db
            .find_as(CLUSTER_STORE, &NetworkKey::new(provider, cluster, ""), TAG_NETWORK)
            .await?)
    }

    /// Delete a network while the cluster's intents are not applied.
    pub async fn delete_network(&self, name: &str, provider: &str, cluster: &str) -> Result<()> {
        let _guard = self
            .ledger
            .lock(CLUSTER_STORE, &ClusterKey::new(provider, cluster))
            .await?;
        ensure_modifiable(&self.ledger, provider, cluster, "deleting").await?;
        self.db
            .remove(CLUSTER_STORE, &NetworkKey::new(provider, cluster, name))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::state::{StateInfo, StateValue};

    fn ovn() -> Network {
        Network {
            metadata: Metadata::named("ovn"),
            spec: NetworkSpec {
                cni_type: "ovn4nfv".into(),
                ipv4_subnets: vec![Ipv4Subnet {
                    subnet: "172.16.30.0/24".into(),
                    name: "subnet1".into(),
                    gateway: "172.16.30.1/24".into(),
                    exclude_ips: String::new(),
                }],
            },
        }
    }

    async fn setup(state: Option<StateValue>) -> NetworkClient {
        let db = Db::memory();
        let ledger = StateLedger::new(db.clone());
        if let Some(s) = state {
            let mut info = StateInfo::created();
            if s != StateValue::Created {
                info.append_action(s, "1");
            }
            ledger
                .save(CLUSTER_STORE, &ClusterKey::new("p1", "c1"), &info)
                .await
                .unwrap();
        }
        NetworkClient::new(db, ledger)
    }

    #[tokio::test]
    async fn test_create_requires_cluster() {
        let nc = setup(None).await;
        let err = nc.create_network(&ovn(), "p1", "c1", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_crud_in_created_state() {
        let nc = setup(Some(StateValue::Created)).await;
        nc.create_network(&ovn(), "p1", "c1", false).await.unwrap();
        let err = nc.create_network(&ovn(), "p1", "c1", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(nc.get_networks("p1", "c1").await.unwrap(), vec![ovn()]);
        nc.delete_network("ovn", "p1", "c1").await.unwrap();
        assert!(nc.get_network("ovn", "p1", "c1").await.is_err());
    }

    #[tokio::test]
    async fn test_applied_cluster_rejects_changes() {
        let nc = setup(Some(StateValue::Applied)).await;
        let err = nc.create_network(&ovn(), "p1", "c1", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("terminated before creating"));
    }

    #[tokio::test]
    async fn test_validation() {
        let nc = setup(Some(StateValue::Created)).await;
        let mut n = ovn();
        n.spec.cni_type.clear();
        let err = nc.create_network(&n, "p1", "c1", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
