// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Controller registry and gRPC fabric.
//!
//! Controllers are external services registered by name with a host, port
//! and priority. The registry keeps lazily connected tonic [`Channel`]s
//! per registered controller; every dispatch site reads the channel table
//! instead of caching channels of its own. Unary calls carry the publish
//! deadline, server streams only the connect deadline.
//!
//! | Group | Store | Used for |
//! |-------|-------|----------|
//! | [`ControllerGroup::Orchestrator`] | `controller` | placement and action controllers, the `rsync` synchronizer |
//! | [`ControllerGroup::Clm`] | `clmController` | cluster lifecycle event subscribers |

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

use crate::db::Db;
use crate::error::{EmcoError, Result};
use crate::types::Metadata;

pub mod clients;
pub mod dispatch;
pub mod mock;
pub mod traits;

pub use clients::{GrpcClusterEventPublisher, GrpcReadyNotifier, GrpcSynchronizer};
pub use dispatch::{invoke_action_controllers, invoke_placement_controllers};
pub use traits::{AlertStream, ClusterEvent, ClusterEventPublisher, ReadyNotifier, Synchronizer};

/// Store of orchestrator controllers.
pub const CONTROLLER_STORE: &str = "controller";
/// Store of cluster-lifecycle controllers.
pub const CLM_CONTROLLER_STORE: &str = "clmController";
/// Tag of controller records.
pub const TAG_CONTROLLER: &str = "controllermetadata";
/// Registry name of the synchronizer.
pub const RSYNC_NAME: &str = "rsync";
/// Lowest priority value (dispatched first).
pub const MIN_PRIORITY: i64 = 1;
/// Highest priority value.
pub const MAX_PRIORITY: i64 = 1_000_000;
/// Controller type filtering clusters.
pub const TYPE_PLACEMENT: &str = "placement";
/// Controller type mutating contexts.
pub const TYPE_ACTION: &str = "action";

/// A registered controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controller {
    /// Name and annotations.
    pub metadata: Metadata,
    /// Endpoint and ordering.
    pub spec: ControllerSpec,
}

/// Where a controller listens and when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSpec {
    /// Host name or address.
    pub host: String,
    /// gRPC port.
    pub port: u16,
    /// `placement` or `action`.
    #[serde(rename = "type", default)]
    pub controller_type: String,
    /// Dispatch order, lowest first.
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_priority() -> i64 {
    MIN_PRIORITY
}

impl Controller {
    /// Controller with the given endpoint.
    pub fn new(name: &str, host: &str, port: u16, controller_type: &str, priority: i64) -> Self {
        Self {
            metadata: Metadata::named(name),
            spec: ControllerSpec {
                host: host.to_string(),
                port,
                controller_type: controller_type.to_string(),
                priority,
            },
        }
    }
}

/// Key of a controller record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerKey {
    /// Controller name.
    #[serde(rename = "controller")]
    pub controller_name: String,
}

/// Which catalog a registry manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerGroup {
    /// Placement/action controllers and the synchronizer.
    Orchestrator,
    /// Cluster-lifecycle event subscribers.
    Clm,
}

impl ControllerGroup {
    fn store(self) -> &'static str {
        match self {
            Self::Orchestrator => CONTROLLER_STORE,
            Self::Clm => CLM_CONTROLLER_STORE,
        }
    }
}

/// Deadlines applied to controller channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcTimeouts {
    /// Per-request deadline.
    pub publish: Duration,
    /// Connect deadline.
    pub lookup: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            publish: Duration::from_secs(600),
            lookup: Duration::from_secs(10),
        }
    }
}

fn endpoint(spec: &ControllerSpec, timeouts: &RpcTimeouts) -> Result<Endpoint> {
    Ok(Endpoint::from_shared(format!("http://{}:{}", spec.host, spec.port))
        .map_err(|e| EmcoError::InvalidInput(format!("Invalid controller address: {}", e)))?
        .connect_timeout(timeouts.lookup))
}

/// Open a lazily connected channel to `host:port` for unary calls.
pub fn dial(spec: &ControllerSpec, timeouts: &RpcTimeouts) -> Result<Channel> {
    Ok(endpoint(spec, timeouts)?.timeout(timeouts.publish).connect_lazy())
}

/// Open a lazily connected channel for long-lived server streams.
///
/// No request deadline applies; a subscription lives until either side
/// drops it.
pub fn dial_stream(spec: &ControllerSpec, timeouts: &RpcTimeouts) -> Result<Channel> {
    Ok(endpoint(spec, timeouts)?.connect_lazy())
}

#[derive(Clone)]
struct Conns {
    unary: Channel,
    stream: Channel,
}

/// Controller catalog plus its channel table.
#[derive(Clone)]
pub struct ControllerRegistry {
    db: Db,
    group: ControllerGroup,
    timeouts: RpcTimeouts,
    conns: Arc<Mutex<HashMap<String, Conns>>>,
}

impl ControllerRegistry {
    /// Registry for `group`, persisted through `db`.
    pub fn new(db: Db, group: ControllerGroup, timeouts: RpcTimeouts) -> Self {
        Self {
            db,
            group,
            timeouts,
            conns: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Deadlines used when dialing.
    pub fn timeouts(&self) -> RpcTimeouts {
        self.timeouts
    }

    fn key(name: &str) -> ControllerKey {
        ControllerKey {
            controller_name: name.to_string(),
        }
    }

    fn validate(&self, c: &Controller) -> Result<()> {
        c.metadata.validate()?;
        if c.spec.host.is_empty() {
            return Err(EmcoError::InvalidInput("Controller host is required".to_string()));
        }
        if c.spec.port == 0 {
            return Err(EmcoError::InvalidInput("Controller port is required".to_string()));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&c.spec.priority) {
            return Err(EmcoError::InvalidInput(format!(
                "Controller priority must be within [{}, {}]",
                MIN_PRIORITY, MAX_PRIORITY
            )));
        }
        let ty = c.spec.controller_type.as_str();
        let type_ok = match self.group {
            ControllerGroup::Orchestrator => ty == TYPE_PLACEMENT || ty == TYPE_ACTION,
            ControllerGroup::Clm => ty.is_empty() || ty == TYPE_PLACEMENT || ty == TYPE_ACTION,
        };
        if !type_ok {
            return Err(EmcoError::InvalidInput(format!(
                "Controller type must be {} or {}",
                TYPE_PLACEMENT, TYPE_ACTION
            )));
        }
        Ok(())
    }

    /// Create (or with `exists`, replace) a controller and redial it.
    pub async fn create_controller(&self, c: &Controller, exists: bool) -> Result<Controller> {
        self.validate(c)?;
        let name = &c.metadata.name;
        if !exists && self.get_controller(name).await.is_ok() {
            return Err(EmcoError::Conflict("Controller already exists".to_string()));
        }
        self.db
            .insert(self.group.store(), &Self::key(name), TAG_CONTROLLER, c)
            .await?;
        self.redial(c)?;
        info!(controller = %name, host = %c.spec.host, port = c.spec.port, "Controller registered");
        Ok(c.clone())
    }

    /// Controller record by name.
    pub async fn get_controller(&self, name: &str) -> Result<Controller> {
        self.db
            .find_one(self.group.store(), &Self::key(name), TAG_CONTROLLER)
            .await?
            .ok_or_else(|| EmcoError::NotFound("Controller not found".to_string()))
    }

    /// Every controller, in store order.
    pub async fn get_controllers(&self) -> Result<Vec<Controller>> {
        Ok(self
            .db
            .find_as(self.group.store(), &Self::key(""), TAG_CONTROLLER)
            .await?)
    }

    /// Remove a controller and close its channel.
    pub async fn delete_controller(&self, name: &str) -> Result<()> {
        self.db.remove(self.group.store(), &Self::key(name)).await?;
        self.conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        info!(controller = %name, "Controller removed");
        Ok(())
    }

    /// Redial every persisted controller.
    pub async fn init_controllers(&self) -> Result<usize> {
        let controllers = self.get_controllers().await?;
        let mut dialed = 0;
        for c in &controllers {
            match self.redial(c) {
                Ok(()) => dialed += 1,
                Err(e) => warn!(controller = %c.metadata.name, error = %e, "Failed to dial controller"),
            }
        }
        Ok(dialed)
    }

    fn redial(&self, c: &Controller) -> Result<()> {
        let conns = Conns {
            unary: dial(&c.spec, &self.timeouts)?,
            stream: dial_stream(&c.spec, &self.timeouts)?,
        };
        self.conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(c.metadata.name.clone(), conns);
        Ok(())
    }

    fn conns(&self, name: &str) -> Option<Conns> {
        self.conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Current unary channel to `name`, if one is open.
    pub fn get_conn(&self, name: &str) -> Option<Channel> {
        self.conns(name).map(|c| c.unary)
    }

    async fn resolve(&self, name: &str) -> Result<Conns> {
        let c = self.get_controller(name).await?;
        if let Some(conns) = self.conns(name) {
            return Ok(conns);
        }
        self.redial(&c)?;
        self.conns(name)
            .ok_or_else(|| EmcoError::Upstream(format!("No connection to {}", name)))
    }

    /// Unary channel to `name`, resolving the controller through the catalog.
    ///
    /// The record is re-read on every call so an updated endpoint is picked
    /// up even when the channel table was not refreshed.
    pub async fn connection(&self, name: &str) -> Result<Channel> {
        Ok(self.resolve(name).await?.unary)
    }

    /// Channel to `name` for server-streaming calls, without a request
    /// deadline.
    pub async fn stream_connection(&self, name: &str) -> Result<Channel> {
        Ok(self.resolve(name).await?.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ControllerRegistry {
        ControllerRegistry::new(Db::memory(), ControllerGroup::Orchestrator, RpcTimeouts::default())
    }

    #[tokio::test]
    async fn test_create_dials_and_delete_closes() {
        let reg = registry();
        let c = Controller::new("gac", "127.0.0.1", 9020, TYPE_ACTION, 10);
        reg.create_controller(&c, false).await.unwrap();
        assert!(reg.get_conn("gac").is_some());
        assert_eq!(reg.get_controller("gac").await.unwrap(), c);

        let err = reg.create_controller(&c, false).await.unwrap_err();
        assert_eq!(err.http_status(), 409);
        reg.create_controller(&c, true).await.unwrap();

        reg.delete_controller("gac").await.unwrap();
        assert!(reg.get_conn("gac").is_none());
        assert_eq!(reg.get_controller("gac").await.unwrap_err().http_status(), 404);
    }

    #[tokio::test]
    async fn test_validation() {
        let reg = registry();
        let bad_priority = Controller::new("a", "h", 1, TYPE_ACTION, 0);
        assert!(reg.create_controller(&bad_priority, false).await.is_err());
        let bad_priority = Controller::new("a", "h", 1, TYPE_ACTION, MAX_PRIORITY + 1);
        assert!(reg.create_controller(&bad_priority, false).await.is_err());
        let bad_type = Controller::new("a", "h", 1, "other", 1);
        assert!(reg.create_controller(&bad_type, false).await.is_err());

        let clm = ControllerRegistry::new(Db::memory(), ControllerGroup::Clm, RpcTimeouts::default());
        clm.create_controller(&Controller::new("capi", "h", 1, "", 1), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_init_controllers_redials_all() {
        let db = Db::memory();
        let reg = ControllerRegistry::new(db.clone(), ControllerGroup::Orchestrator, RpcTimeouts::default());
        reg.create_controller(&Controller::new("a", "h1", 1, TYPE_ACTION, 1), false)
            .await
            .unwrap();
        reg.create_controller(&Controller::new("b", "h2", 2, TYPE_PLACEMENT, 2), false)
            .await
            .unwrap();

        let fresh = ControllerRegistry::new(db, ControllerGroup::Orchestrator, RpcTimeouts::default());
        assert!(fresh.get_conn("a").is_none());
        assert_eq!(fresh.init_controllers().await.unwrap(), 2);
        assert!(fresh.get_conn("a").is_some());
        assert!(fresh.connection("b").await.is_ok());
        assert!(fresh.stream_connection("b").await.is_ok());
        assert!(fresh.connection("missing").await.is_err());
        assert!(fresh.stream_connection("missing").await.is_err());
    }
}
