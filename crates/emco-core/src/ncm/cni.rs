// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rendering of network intents into OVN4NFV custom resources.
//!
//! Every `Network` / `ProviderNet` yields its CR plus a
//! `NetworkAttachmentDefinition` pointing pods at it, named
//! `<intent>+<Kind>` under the cluster.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};

use super::{CONTEXT_CLUSTER_APP, Network, NetworkClient, ProviderNet, ProviderNetClient, SEPARATOR};
use crate::appcontext::{AppContext, INST_DEPENDENCY, INST_ORDER, LEVEL_RESOURCE};
use crate::error::{EmcoError, Result};

/// API version of the OVN4NFV CRDs.
pub const NETWORK_APIVERSION: &str = "k8s.plugin.opnfv.org/v1alpha1";
/// Kind of a virtual network CR.
pub const NETWORK_KIND: &str = "Network";
/// Kind of a provider network CR.
pub const PROVIDER_NETWORK_KIND: &str = "ProviderNetwork";
/// API version of attachment definitions.
pub const NAD_APIVERSION: &str = "k8s.cni.cncf.io/v1";
/// Kind of attachment definitions.
pub const NAD_KIND: &str = "NetworkAttachmentDefinition";
/// CNI plugin named in attachment definitions.
pub const CNI_PLUGIN: &str = "ovn4nfvk8s-cni";

#[derive(Serialize)]
struct ObjectMeta<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<&'static str, &'a str>,
}

#[derive(Serialize)]
struct CustomResource<'a, S: Serialize> {
    #[serde(rename = "apiVersion")]
    api_version: &'a str,
    kind: &'a str,
    metadata: ObjectMeta<'a>,
    spec: S,
}

#[derive(Serialize)]
struct AttachmentSpec {
    config: String,
}

/// A rendered manifest and its resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniResource {
    /// `<intent>+<Kind>`.
    pub name: String,
    /// YAML manifest.
    pub manifest: String,
}

fn custom_resource<S: Serialize>(kind: &str, name: &str, spec: &S) -> Result<CniResource> {
    let cr = CustomResource {
        api_version: NETWORK_APIVERSION,
        kind,
        metadata: ObjectMeta {
            name,
            labels: BTreeMap::from([("netName", name)]),
        },
        spec,
    };
    Ok(CniResource {
        name: format!("{name}{SEPARATOR}{kind}"),
        manifest: serde_yaml::to_string(&cr)?,
    })
}

/// `NetworkAttachmentDefinition` for network `name`.
pub fn attachment_definition(name: &str) -> Result<CniResource> {
    let config = format!(
        r#"{{"cniVersion":"0.3.1","type":"{CNI_PLUGIN}","nfn-network":"{name}"}}"#
    );
    let nad = CustomResource {
        api_version: NAD_APIVERSION,
        kind: NAD_KIND,
        metadata: ObjectMeta {
            name,
            labels: BTreeMap::new(),
        },
        spec: AttachmentSpec { config },
    };
    Ok(CniResource {
        name: format!("{name}{SEPARATOR}{NAD_KIND}"),
        manifest: serde_yaml::to_string(&nad)?,
    })
}

/// Render every intent, each CR followed by its attachment definition.
///
/// A network and a provider network sharing a name would share one
/// attachment definition, so that is rejected.
pub fn render(networks: &[Network], provider_nets: &[ProviderNet]) -> Result<Vec<CniResource>> {
    let names: HashSet<&str> = networks.iter().map(|n| n.metadata.name.as_str()).collect();
    if let Some(p) = provider_nets.iter().find(|p| names.contains(p.metadata.name.as_str())) {
        return Err(EmcoError::InvalidInput(format!(
            "Network and provider network share the name {}",
            p.metadata.name
        )));
    }

    let mut out = Vec::with_capacity(2 * (networks.len() + provider_nets.len()));
    for n in networks {
        out.push(custom_resource(NETWORK_KIND, &n.metadata.name, &n.spec)?);
        out.push(attachment_definition(&n.metadata.name)?);
    }
    for p in provider_nets {
        out.push(custom_resource(PROVIDER_NETWORK_KIND, &p.metadata.name, &p.spec)?);
        out.push(attachment_definition(&p.metadata.name)?);
    }
    Ok(out)
}

/// Attach the cluster's rendered intents to `ac` with order and dependency
/// instructions. Returns the number of resources added.
#[instrument(skip(ac, networks, provider_nets), fields(app_context = %ac.id()))]
pub async fn apply(
    ac: &AppContext,
    networks: &NetworkClient,
    provider_nets: &ProviderNetClient,
    provider: &str,
    cluster: &str,
) -> Result<usize> {
    let resources = render(
        &networks.get_networks(provider, cluster).await?,
        &provider_nets.get_provider_nets(provider, cluster).await?,
    )?;
    if resources.is_empty() {
        debug!("No network intents to render");
        return Ok(0);
    }

    let ch = ac
        .get_cluster_handle(CONTEXT_CLUSTER_APP, &format!("{provider}{SEPARATOR}{cluster}"))
        .await?;
    let mut order = Vec::with_capacity(resources.len());
    let mut deps = Map::new();
    for r in &resources {
        ac.add_resource(&ch, &r.name, &r.manifest).await?;
        order.push(r.name.clone());
        deps.insert(r.name.clone(), Value::String("go".to_string()));
    }
    ac.add_instruction(&ch, LEVEL_RESOURCE, INST_ORDER, json!({ "resorder": order }))
        .await?;
    ac.add_instruction(&ch, LEVEL_RESOURCE, INST_DEPENDENCY, json!({ "resdependency": deps }))
        .await?;
    Ok(resources.len())
}
