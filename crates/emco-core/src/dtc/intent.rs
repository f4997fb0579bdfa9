// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Traffic group, inbound server and inbound clients intents.
//!
//! The three levels share one store and nest by key: a server intent is a
//! child of its traffic group, a clients intent a child of its server intent.

use serde::{Deserialize, Serialize};

use super::{DTC_STORE, TAG_CLIENTS_INTENT, TAG_SERVER_INTENT, TAG_TRAFFIC_GROUP};
use crate::db::Db;
use crate::error::{EmcoError, Result};
use crate::ncm::parse_cidr;
use crate::types::{IntentScope, Metadata};

const PROTOCOLS: [&str; 3] = ["TCP", "UDP", "SCTP"];

/// Groups the inbound intents of a deployment intent group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficGroupIntent {
    /// Name and annotations.
    pub metadata: Metadata,
}

/// A server app accepting inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundServerIntent {
    /// Name and annotations.
    pub metadata: Metadata,
    /// Server definition.
    pub spec: InboundServerIntentSpec,
}

/// Server definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundServerIntentSpec {
    /// Server app.
    #[serde(rename = "appName")]
    pub app_name: String,
    /// Pod label of the server app.
    #[serde(rename = "appLabel", default)]
    pub app_label: String,
    /// Service exposing the server; empty disables service discovery.
    #[serde(rename = "serviceName", default)]
    pub service_name: String,
    /// External name of the service.
    #[serde(rename = "externalName", default)]
    pub external_name: String,
    /// Service port.
    pub port: u32,
    /// `TCP`, `UDP` or `SCTP`.
    pub protocol: String,
    /// Admit the clients' CIDRs instead of any address.
    #[serde(rename = "externalSupport", default)]
    pub external_support: bool,
}

/// Client apps of a server intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundClientsIntent {
    /// Name and annotations.
    pub metadata: Metadata,
    /// Clients definition.
    pub spec: InboundClientsIntentSpec,
}

/// Clients definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundClientsIntentSpec {
    /// Client app.
    #[serde(rename = "application", default)]
    pub app_name: String,
    /// Service the client calls.
    #[serde(rename = "servicename", default)]
    pub service_name: String,
    /// Namespaces of the client.
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Address ranges of external clients.
    #[serde(rename = "cidrs", default)]
    pub ip_range: Vec<String>,
}

impl InboundServerIntent {
    /// Validate metadata, app, port and protocol.
    pub fn validate(&self) -> Result<()> {
        self.metadata.validate()?;
        if self.spec.app_name.is_empty() {
            return Err(EmcoError::InvalidInput("appName is required".to_string()));
        }
        if !(1..=65535).contains(&self.spec.port) {
            return Err(EmcoError::InvalidInput(format!(
                "Invalid port: {}",
                self.spec.port
            )));
        }
        if !PROTOCOLS.contains(&self.spec.protocol.as_str()) {
            return Err(EmcoError::InvalidInput(format!(
                "Invalid protocol: {:?}",
                self.spec.protocol
            )));
        }
        Ok(())
    }
}

impl InboundClientsIntent {
    /// Validate metadata and address ranges.
    pub fn validate(&self) -> Result<()> {
        self.metadata.validate()?;
        self.spec
            .ip_range
            .iter()
            .try_for_each(|cidr| parse_cidr("cidr", cidr))
    }
}

/// Traffic group key.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficGroupIntentKey {
    /// Owning group.
    #[serde(flatten)]
    pub scope: IntentScope,
    /// Traffic group, empty to match any.
    #[serde(rename = "trafficgroupintent")]
    pub traffic_group: String,
}

/// Server intent key.
#[derive(Debug, Clone, Serialize)]
pub struct InboundServerIntentKey {
    /// Owning group.
    #[serde(flatten)]
    pub scope: IntentScope,
    /// Owning traffic group.
    #[serde(rename = "trafficgroupintent")]
    pub traffic_group: String,
    /// Server intent, empty to match any.
    #[serde(rename = "inboundserverintent")]
    pub server: String,
}

/// Clients intent key.
#[derive(Debug, Clone, Serialize)]
pub struct InboundClientsIntentKey {
    /// Owning group.
    #[serde(flatten)]
    pub scope: IntentScope,
    /// Owning traffic group.
    #[serde(rename = "trafficgroupintent")]
    pub traffic_group: String,
    /// Owning server intent.
    #[serde(rename = "inboundserverintent")]
    pub server: String,
    /// Clients intent, empty to match any.
    #[serde(rename = "inboundclientsintent")]
    pub clients: String,
}

fn tg_key(scope: &IntentScope, tg: &str) -> TrafficGroupIntentKey {
    TrafficGroupIntentKey {
        scope: scope.clone(),
        traffic_group: tg.to_string(),
    }
}

fn server_key(scope: &IntentScope, tg: &str, server: &str) -> InboundServerIntentKey {
    InboundServerIntentKey {
        scope: scope.clone(),
        traffic_group: tg.to_string(),
        server: server.to_string(),
    }
}

fn clients_key(scope: &IntentScope, tg: &str, server: &str, clients: &str) -> InboundClientsIntentKey {
    InboundClientsIntentKey {
        scope: scope.clone(),
        traffic_group: tg.to_string(),
        server: server.to_string(),
        clients: clients.to_string(),
    }
}

/// Traffic group CRUD.
#[derive(Clone)]
pub struct TrafficGroupIntentClient {
    db: Db,
}

impl TrafficGroupIntentClient {
    /// Client over `db`.
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a traffic group; with `exists` an existing one is replaced.
    pub async fn create_traffic_group_intent(
        &self,
        tgi: &TrafficGroupIntent,
        scope: &IntentScope,
        exists: bool,
    ) -> Result<TrafficGroupIntent> {
        tgi.metadata.validate()?;
        if !exists
            && self
                .get_traffic_group_intent(&tgi.metadata.name, scope)
                .await
                .is_ok()
        {
            return Err(EmcoError::Conflict(
                "TrafficGroupIntent already exists".to_string(),
            ));
        }
        self.db
            .insert(DTC_STORE, &tg_key(scope, &tgi.metadata.name), TAG_TRAFFIC_GROUP, tgi)
            .await?;
        Ok(tgi.clone())
    }

    /// A traffic group.
    pub async fn get_traffic_group_intent(&self, name: &str, scope: &IntentScope) -> Result<TrafficGroupIntent> {
        self.db
            .find_one(DTC_STORE, &tg_key(scope, name), TAG_TRAFFIC_GROUP)
            .await?
            .ok_or_else(|| EmcoError::NotFound("TrafficGroupIntent not found".to_string()))
    }

    /// Every traffic group of the deployment intent group.
    pub async fn get_traffic_group_intents(&self, scope: &IntentScope) -> Result<Vec<TrafficGroupIntent>> {
        Ok(self
            .db
            .find_as(DTC_STORE, &tg_key(scope, ""), TAG_TRAFFIC_GROUP)
            .await?)
    }

    /// Delete a traffic group; fails while server intents remain.
    pub async fn delete_traffic_group_intent(&self, name: &str, scope: &IntentScope) -> Result<()> {
        self.db.remove(DTC_STORE, &tg_key(scope, name)).await?;
        Ok(())
    }
}

/// Server intent CRUD.
#[derive(Clone)]
pub struct InboundServerIntentClient {
    db: Db,
    groups: TrafficGroupIntentClient,
}

impl InboundServerIntentClient {
    /// Client over `db`.
    pub fn new(db: Db) -> Self {
        Self {
            groups: TrafficGroupIntentClient::new(db.clone()),
            db,
        }
    }

    /// Create a server intent under an existing traffic group.
    pub async fn create_server_inbound_intent(
        &self,
        isi: &InboundServerIntent,
        scope: &IntentScope,
        traffic_group: &str,
        exists: bool,
    ) -> Result<InboundServerIntent> {
        isi.validate()?;
        if self
            .groups
            .get_traffic_group_intent(traffic_group, scope)
            .await
            .is_err()
        {
            return Err(EmcoError::NotFound(format!(
                "Traffic Group Intent {} does not exist",
                traffic_group
            )));
        }
        if !exists
            && self
                .get_server_inbound_intent(&isi.metadata.name, scope, traffic_group)
                .await
                .is_ok()
        {
            return Err(EmcoError::Conflict(
                "ServerInboundIntent already exists".to_string(),
            ));
        }
        let key = server_key(scope, traffic_group, &isi.metadata.name);
        self.db.insert(DTC_STORE, &key, TAG_SERVER_INTENT, isi).await?;
        Ok(isi.clone())
    }

    /// A server intent.
    pub async fn get_server_inbound_intent(
        &self,
        name: &str,
        scope: &IntentScope,
        traffic_group: &str,
    ) -> Result<InboundServerIntent> {
        self.db
            .find_one(DTC_STORE, &server_key(scope, traffic_group, name), TAG_SERVER_INTENT)
            .await?
            .ok_or_else(|| EmcoError::NotFound("ServerInboundIntent not found".to_string()))
    }

    /// Every server intent of a traffic group.
    pub async fn get_server_inbound_intents(
        &self,
        scope: &IntentScope,
        traffic_group: &str,
    ) -> Result<Vec<InboundServerIntent>> {
        Ok(self
            .db
            .find_as(DTC_STORE, &server_key(scope, traffic_group, ""), TAG_SERVER_INTENT)
            .await?)
    }

    /// Delete a server intent; fails while clients intents remain.
    pub async fn delete_server_inbound_intent(
        &self,
        name: &str,
        scope: &IntentScope,
        traffic_group: &str,
    ) -> Result<()> {
        self.db
            .remove(DTC_STORE, &server_key(scope, traffic_group, name))
            .await?;
        Ok(())
    }
}

/// Clients intent CRUD.
#[derive(Clone)]
pub struct InboundClientsIntentClient {
    db: Db,
    servers: InboundServerIntentClient,
}

impl InboundClientsIntentClient {
    /// Client over `db`.
    pub fn new(db: Db) -> Self {
        Self {
            servers: InboundServerIntentClient::new(db.clone()),
            db,
        }
    }

    /// Create a clients intent under an existing server intent.
    pub async fn create_clients_inbound_intent(
        &self,
        ici: &InboundClientsIntent,
        scope: &IntentScope,
        traffic_group: &str,
        server: &str,
        exists: bool,
    ) -> Result<InboundClientsIntent> {
        ici.validate()?;
        if self
            .servers
            .get_server_inbound_intent(server, scope, traffic_group)
            .await
            .is_err()
        {
            return Err(EmcoError::NotFound(format!(
                "Inbound Server Intent {} does not exist",
                server
            )));
        }
        if !exists
            && self
                .get_clients_inbound_intent(&ici.metadata.name, scope, traffic_group, server)
                .await
                .is_ok()
        {
            return Err(EmcoError::Conflict(
                "ClientsInboundIntent already exists".to_string(),
            ));
        }
        let key = clients_key(scope, traffic_group, server, &ici.metadata.name);
        self.db.insert(DTC_STORE, &key, TAG_CLIENTS_INTENT, ici).await?;
        Ok(ici.clone())
    }

    /// A clients intent.
    pub async fn get_clients_inbound_intent(
        &self,
        name: &str,
        scope: &IntentScope,
        traffic_group: &str,
        server: &str,
    ) -> Result<InboundClientsIntent> {
        self.db
            .find_one(
                DTC_STORE,
                &clients_key(scope, traffic_group, server, name),
                TAG_CLIENTS_INTENT,
            )
            .await?
            .ok_or_else(|| EmcoError::NotFound("ClientsInboundIntent not found".to_string()))
    }

    /// Every clients intent of a server intent.
    pub async fn get_clients_inbound_intents(
        &self,
        scope: &IntentScope,
        traffic_group: &str,
        server: &str,
    ) -> Result<Vec<InboundClientsIntent>> {
        Ok(self
            .db
            .find_as(
                DTC_STORE,
                &clients_key(scope, traffic_group, server, ""),
                TAG_CLIENTS_INTENT,
            )
            .await?)
    }

    /// Delete a clients intent.
    pub async fn delete_clients_inbound_intent(
        &self,
        name: &str,
        scope: &IntentScope,
        traffic_group: &str,
        server: &str,
    ) -> Result<()> {
        self.db
            .remove(DTC_STORE, &clients_key(scope, traffic_group, server, name))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn scope() -> IntentScope {
        IntentScope::new("proj1", "capp", "v1", "dig1")
    }

    fn server() -> InboundServerIntent {
        serde_json::from_value(json!({
            "metadata": {"name": "isi1"},
            "spec": {
                "appName": "server",
                "appLabel": "app=server",
                "serviceName": "server-svc",
                "port": 4443,
                "protocol": "TCP",
                "externalSupport": false
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_server_validation() {
        assert!(server().validate().is_ok());
        let mut s = server();
        s.spec.port = 0;
        assert!(s.validate().is_err());
        s.spec.port = 65536;
        assert!(s.validate().is_err());
        let mut s = server();
        s.spec.protocol = "ICMP".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_clients_wire_names() {
        let c: InboundClientsIntent = serde_json::from_value(json!({
            "metadata": {"name": "ici1"},
            "spec": {
                "application": "client",
                "servicename": "server-svc",
                "namespaces": ["default"],
                "cidrs": ["10.0.0.0/16", "bad"]
            }
        }))
        .unwrap();
        assert_eq!(c.spec.app_name, "client");
        assert_eq!(c.spec.ip_range.len(), 2);
        assert!(c.validate().is_err());
    }

    #[tokio::test]
    async fn test_nesting() {
        let db = Db::memory();
        let groups = TrafficGroupIntentClient::new(db.clone());
        let servers = InboundServerIntentClient::new(db.clone());
        let clients = InboundClientsIntentClient::new(db);

        let err = servers
            .create_server_inbound_intent(&server(), &scope(), "tg1", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("Traffic Group Intent tg1 does not exist"));

        let tg = TrafficGroupIntent {
            metadata: Metadata::named("tg1"),
        };
        groups.create_traffic_group_intent(&tg, &scope(), false).await.unwrap();
        let err = groups
            .create_traffic_group_intent(&tg, &scope(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        servers
            .create_server_inbound_intent(&server(), &scope(), "tg1", false)
            .await
            .unwrap();
        let ici = InboundClientsIntent {
            metadata: Metadata::named("ici1"),
            spec: InboundClientsIntentSpec {
                app_name: "client".into(),
                ..Default::default()
            },
        };
        clients
            .create_clients_inbound_intent(&ici, &scope(), "tg1", "isi1", false)
            .await
            .unwrap();

        let err = groups.delete_traffic_group_intent("tg1", &scope()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = servers
            .delete_server_inbound_intent("isi1", &scope(), "tg1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        assert_eq!(
            clients
                .get_clients_inbound_intents(&scope(), "tg1", "isi1")
                .await
                .unwrap(),
            vec![ici]
        );
        clients
            .delete_clients_inbound_intent("ici1", &scope(), "tg1", "isi1")
            .await
            .unwrap();
        servers
            .delete_server_inbound_intent("isi1", &scope(), "tg1")
            .await
            .unwrap();
        groups.delete_traffic_group_intent("tg1", &scope()).await.unwrap();
    }
}
