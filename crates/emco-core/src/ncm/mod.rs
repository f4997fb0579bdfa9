// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster network intents.
//!
//! `Network` and `ProviderNet` intents hang off a cluster and may only be
//! changed while the cluster's intents are not applied. The
//! [`SchedulerClient`] renders them into a context (see [`cni`]) and drives
//! the Apply/Terminate/Stop lifecycle through the cluster's state ledger.

pub mod cni;
pub mod network;
pub mod providernet;
pub mod scheduler;

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::cluster::{CLUSTER_STORE, ClusterKey};
use crate::error::{EmcoError, Result};
use crate::state::{StateLedger, intents_modifiable};
use crate::types::validate_name;

pub use network::{Network, NetworkClient, NetworkKey, NetworkSpec};
pub use providernet::{ProviderNet, ProviderNetClient, ProviderNetKey, ProviderNetSpec, Vlan};
pub use scheduler::SchedulerClient;

/// Separator between provider and cluster in context cluster names.
pub const SEPARATOR: &str = "+";
/// App under which network intents are rendered.
pub const CONTEXT_CLUSTER_APP: &str = "network-intents";
/// Tag of network and provider-network records.
pub const TAG_NETWORK: &str = "networkmetadata";

/// An IPv4 subnet of a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Subnet {
    /// `a.b.c.d/n`.
    pub subnet: String,
    /// Subnet name.
    pub name: String,
    /// Gateway, `a.b.c.d/n`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,
    /// Space separated addresses or ranges excluded from allocation.
    #[serde(rename = "excludeIps", default, skip_serializing_if = "String::is_empty")]
    pub exclude_ips: String,
}

pub(crate) fn parse_cidr(field: &str, s: &str) -> Result<()> {
    let invalid = || EmcoError::InvalidInput(format!("Invalid {}: {:?}", field, s));
    let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
    addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
    match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => Ok(()),
        _ => Err(invalid()),
    }
}

impl Ipv4Subnet {
    /// Check name, subnet and gateway formats.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        parse_cidr("subnet", &self.subnet)?;
        if !self.gateway.is_empty() {
            parse_cidr("gateway", &self.gateway)?;
        }
        Ok(())
    }
}

fn validate_subnets(cni_type: &str, subnets: &[Ipv4Subnet]) -> Result<()> {
    if cni_type.is_empty() {
        return Err(EmcoError::InvalidInput("cniType is required".to_string()));
    }
    if subnets.is_empty() {
        return Err(EmcoError::InvalidInput(
            "At least one ipv4Subnet is required".to_string(),
        ));
    }
    subnets.iter().try_for_each(Ipv4Subnet::validate)
}

/// Fail unless the cluster exists and its intents may be `verb` (creating,
/// deleting).
pub(crate) async fn ensure_modifiable(
    ledger: &StateLedger,
    provider: &str,
    cluster: &str,
    verb: &str,
) -> Result<()> {
    let info = ledger
        .load(CLUSTER_STORE, &ClusterKey::new(provider, cluster))
        .await?
        .ok_or_else(|| EmcoError::NotFound("Unable to find the cluster".to_string()))?;
    intents_modifiable(info.current_state()?, verb)
}
