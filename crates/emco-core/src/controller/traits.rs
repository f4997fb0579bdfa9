// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Seams to the external collaborators of the control plane.

use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;

use emco_protocol::readynotify::Notification;

use crate::error::Result;

pub use emco_protocol::clmcontrollereventchannel::ClmControllerEventType as ClusterEvent;

/// Readiness notifications for one subscription.
pub type AlertStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Notification, tonic::Status>> + Send>>;

/// The synchronizer that drives clusters toward a context.
#[async_trait]
pub trait Synchronizer: Send + Sync {
    /// Apply every resource of the context.
    async fn install_app(&self, app_context: &str) -> Result<()>;

    /// Remove every resource of the context.
    async fn uninstall_app(&self, app_context: &str) -> Result<()>;
}

/// Readiness alerts published by the synchronizer.
#[async_trait]
pub trait ReadyNotifier: Send + Sync {
    /// Subscribe to alerts for `app_context`.
    async fn alert(&self, client_name: &str, app_context: &str) -> Result<AlertStream>;

    /// End the subscription.
    async fn unsubscribe(&self, client_name: &str, app_context: &str) -> Result<()>;
}

/// Fan-out of cluster lifecycle events to CLM controllers.
#[async_trait]
pub trait ClusterEventPublisher: Send + Sync {
    /// Deliver `event` to every subscriber; fails if any delivery failed.
    async fn publish(&self, provider: &str, cluster: &str, event: ClusterEvent) -> Result<()>;
}
