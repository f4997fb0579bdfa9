// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider network intents (VLAN or direct).

use serde::{Deserialize, Serialize};

use super::{Ipv4Subnet, TAG_NETWORK, ensure_modifiable, validate_subnets};
use crate::cluster::{CLUSTER_STORE, ClusterKey};
use crate::db::Db;
use crate::error::{EmcoError, Result};
use crate::state::StateLedger;
use crate::types::Metadata;

const MAX_VLAN_ID: u16 = 4095;
const NET_TYPES: [&str; 2] = ["VLAN", "DIRECT"];
const NODE_SELECTORS: [&str; 3] = ["any", "specific", "all"];

/// A provider network on a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderNet {
    /// Name and annotations.
    pub metadata: Metadata,
    /// Provider network definition.
    pub spec: ProviderNetSpec,
}

/// Provider network definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderNetSpec {
    /// CNI plugin.
    #[serde(rename = "cniType")]
    pub cni_type: String,
    /// Subnets.
    #[serde(rename = "ipv4Subnets", default)]
    pub ipv4_subnets: Vec<Ipv4Subnet>,
    /// `VLAN` or `DIRECT`.
    #[serde(rename = "providerNetType")]
    pub provider_net_type: String,
    /// VLAN attachment.
    #[serde(default)]
    pub vlan: Vlan,
}

/// VLAN attachment of a provider network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vlan {
    /// VLAN id, `0..=4095`, carried as text.
    #[serde(rename = "vlanID", default)]
    pub vlan_id: String,
    /// Physical interface.
    #[serde(rename = "providerInterfaceName", default)]
    pub provider_interface_name: String,
    /// Interface created on the node.
    #[serde(rename = "logicalInterfaceName", default, skip_serializing_if = "String::is_empty")]
    pub logical_interface_name: String,
    /// `any`, `specific` or `all`.
    #[serde(rename = "vlanNodeSelector", default)]
    pub vlan_node_selector: String,
    /// Node labels, required when the selector is `specific`.
    #[serde(rename = "nodeLabelList", default, skip_serializing_if = "Vec::is_empty")]
    pub node_label_list: Vec<String>,
}

impl Vlan {
    fn validate(&self) -> Result<()> {
        match self.vlan_id.parse::<u16>() {
            Ok(id) if id <= MAX_VLAN_ID => {}
            _ => {
                return Err(EmcoError::InvalidInput(format!(
                    "Invalid vlanID {:?}: must be 0..={}",
                    self.vlan_id, MAX_VLAN_ID
                )));
            }
        }
        if !NODE_SELECTORS.contains(&self.vlan_node_selector.as_str()) {
            return Err(EmcoError::InvalidInput(format!(
                "Invalid vlanNodeSelector: {:?}",
                self.vlan_node_selector
            )));
        }
        if self.vlan_node_selector == "specific" && self.node_label_list.is_empty() {
            return Err(EmcoError::InvalidInput(
                "nodeLabelList must be provided when vlanNodeSelector is specific".to_string(),
            ));
        }
        Ok(())
    }
}

impl ProviderNet {
    /// Validate metadata, subnets and the VLAN attachment.
    pub fn validate(&self) -> Result<()> {
        self.metadata.validate()?;
        validate_subnets(&self.spec.cni_type, &self.spec.ipv4_subnets)?;
        if !NET_TYPES.contains(&self.spec.provider_net_type.as_str()) {
            return Err(EmcoError::InvalidInput(format!(
                "Invalid providerNetType: {:?}",
                self.spec.provider_net_type
            )));
        }
        if self.spec.provider_net_type == "VLAN" {
            self.spec.vlan.validate()?;
        }
        Ok(())
    }
}

/// Provider network key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderNetKey {
    /// Provider.
    #[serde(rename = "clusterProvider")]
    pub provider: String,
    /// Cluster.
    pub cluster: String,
    /// Provider network, empty to match any.
    #[serde(rename = "providernet")]
    pub provider_net: String,
}

impl ProviderNetKey {
    fn new(provider: &str, cluster: &str, name: &str) -> Self {
        Self {
            provider: provider.to_string(),
            cluster: cluster.to_string(),
            provider_net: name.to_string(),
        }
    }
}

/// Provider network CRUD.
#[derive(Clone)]
pub struct ProviderNetClient {
    db: Db,
    ledger: StateLedger,
}

impl ProviderNetClient {
    /// Client over `db`, guarded by the cluster ledgers in `ledger`.
    pub fn new(db: Db, ledger: StateLedger) -> Self {
        Self { db, ledger }
    }

    /// Create a provider network; with `exists` an existing one is replaced.
    pub async fn create_provider_net(
        &self,
        p: &ProviderNet,
        provider: &str,
        cluster: &str,
        exists: bool,
    ) -> Result<ProviderNet> {
        p.validate()?;
        let _guard = self
            .ledger
            .lock(CLUSTER_STORE, &ClusterKey::new(provider, cluster))
            .await?;
        ensure_modifiable(&self.ledger, provider, cluster, "creating").await?;

        if !exists
            && self
                .get_provider_net(&p.metadata.name, provider, cluster)
                .await
                .is_ok()
        {
            return Err(EmcoError::Conflict("ProviderNet already exists".to_string()));
        }
        let key = ProviderNetKey::new(provider, cluster, &p.metadata.name);
        self.db.insert(CLUSTER_STORE, &key, TAG_NETWORK, p).await?;
        Ok(p.clone())
    }

    /// A provider network.
    pub async fn get_provider_net(&self, name: &str, provider: &str, cluster: &str) -> Result<ProviderNet> {
        self.db
            .find_one(CLUSTER_STORE, &ProviderNetKey::new(provider, cluster, name), TAG_NETWORK)
            .await?
            .ok_or_else(|| EmcoError::NotFound("ProviderNet not found".to_string()))
    }

    /// Every provider network of a cluster.
    pub async fn get_provider_nets(&self, provider: &str, cluster: &str) -> Result<Vec<ProviderNet>> {
        Ok(self
            .db
            .find_as(CLUSTER_STORE, &ProviderNetKey::new(provider, cluster, ""), TAG_NETWORK)
            .await?)
    }

    /// Delete a provider network while the cluster's intents are not applied.
    pub async fn delete_provider_net(&self, name: &str, provider: &str, cluster: &str) -> Result<()> {
        let _guard = self
            .ledger
            .lock(CLUSTER_STORE, &ClusterKey::new(provider, cluster))
            .await?;
        ensure_modifiable(&self.ledger, provider, cluster, "deleting").await?;
        self.db
            .remove(CLUSTER_STORE, &ProviderNetKey::new(provider, cluster, name))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::state::{StateInfo, StateValue};

    fn pnet() -> ProviderNet {
        ProviderNet {
            metadata: Metadata::named("pnet"),
            spec: ProviderNetSpec {
                cni_type: "ovn4nfv".into(),
                ipv4_subnets: vec![Ipv4Subnet {
                    subnet: "172.16.33.0/24".into(),
                    name: "subnet2".into(),
                    ..Default::default()
                }],
                provider_net_type: "VLAN".into(),
                vlan: Vlan {
                    vlan_id: "100".into(),
                    provider_interface_name: "eth1".into(),
                    vlan_node_selector: "any".into(),
                    ..Default::default()
                },
            },
        }
    }

    #[test]
    fn test_vlan_rules() {
        assert!(pnet().validate().is_ok());

        let mut p = pnet();
        p.spec.vlan.vlan_id = "4096".into();
        assert!(p.validate().is_err());

        let mut p = pnet();
        p.spec.vlan.vlan_node_selector = "specific".into();
        assert!(p.validate().is_err());
        p.spec.vlan.node_label_list = vec!["kubernetes.io/hostname=node1".into()];
        assert!(p.validate().is_ok());

        let mut p = pnet();
        p.spec.provider_net_type = "BRIDGE".into();
        assert!(p.validate().is_err());

        let mut p = pnet();
        p.spec.provider_net_type = "DIRECT".into();
        p.spec.vlan = Vlan::default();
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_wire_names() {
        let v = serde_json::to_value(pnet()).unwrap();
        assert_eq!(v["spec"]["providerNetType"], "VLAN");
        assert_eq!(v["spec"]["vlan"]["vlanID"], "100");
        assert_eq!(v["spec"]["vlan"]["vlanNodeSelector"], "any");
    }

    #[tokio::test]
    async fn test_delete_guarded_by_state() {
        let db = Db::memory();
        let ledger = StateLedger::new(db.clone());
        let key = ClusterKey::new("p1", "c1");
        ledger.save(CLUSTER_STORE, &key, &StateInfo::created()).await.unwrap();

        let pc = ProviderNetClient::new(db, ledger.clone());
        pc.create_provider_net(&pnet(), "p1", "c1", false).await.unwrap();

        ledger
            .append_action(CLUSTER_STORE, &key, StateValue::Applied, "9", true)
            .await
            .unwrap();
        let err = pc.delete_provider_net("pnet", "p1", "c1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("terminated before deleting"));

        ledger
            .append_action(CLUSTER_STORE, &key, StateValue::Terminated, "9", false)
            .await
            .unwrap();
        pc.delete_provider_net("pnet", "p1", "c1").await.unwrap();
        assert!(pc.get_provider_nets("p1", "c1").await.unwrap().is_empty());
    }
}
