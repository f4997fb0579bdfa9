// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gRPC implementations of the collaborator traits.

use async_trait::async_trait;
use tracing::{debug, error, instrument};

use emco_protocol::clmcontrollereventchannel::ClmControllerEventRequest;
use emco_protocol::clmcontrollereventchannel::clm_controller_event_channel_client::ClmControllerEventChannelClient;
use emco_protocol::installapp::installapp_client::InstallappClient;
use emco_protocol::installapp::{InstallAppRequest, UninstallAppRequest};
use emco_protocol::readynotify::Topic;
use emco_protocol::readynotify::ready_notify_client::ReadyNotifyClient;

use super::traits::{AlertStream, ClusterEvent, ClusterEventPublisher, ReadyNotifier, Synchronizer};
use super::{ControllerRegistry, RSYNC_NAME};
use crate::error::{EmcoError, Result};

/// Synchronizer reached through the `rsync` registry entry.
#[derive(Clone)]
pub struct GrpcSynchronizer {
    registry: ControllerRegistry,
}

impl GrpcSynchronizer {
    /// Resolve `rsync` through `registry` on every call.
    pub fn new(registry: ControllerRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Synchronizer for GrpcSynchronizer {
    #[instrument(skip(self))]
    async fn install_app(&self, app_context: &str) -> Result<()> {
        let channel = self.registry.connection(RSYNC_NAME).await?;
        let resp = InstallappClient::new(channel)
            .install_app(InstallAppRequest {
                app_context: app_context.to_string(),
            })
            .await?
            .into_inner();
        if !resp.app_context_installed {
            error!(app_context, message = %resp.app_context_install_message, "InstallApp failed");
            return Err(EmcoError::Upstream(format!(
                "InstallApp failed: {}",
                resp.app_context_install_message
            )));
        }
        debug!(app_context, "InstallApp acknowledged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn uninstall_app(&self, app_context: &str) -> Result<()> {
        let channel = self.registry.connection(RSYNC_NAME).await?;
        let resp = InstallappClient::new(channel)
            .uninstall_app(UninstallAppRequest {
                app_context: app_context.to_string(),
            })
            .await?
            .into_inner();
        if !resp.app_context_uninstalled {
            error!(app_context, message = %resp.app_context_uninstall_message, "UninstallApp failed");
            return Err(EmcoError::Upstream(format!(
                "UninstallApp failed: {}",
                resp.app_context_uninstall_message
            )));
        }
        Ok(())
    }
}

/// ReadyNotify subscriptions on the synchronizer.
#[derive(Clone)]
pub struct GrpcReadyNotifier {
    registry: ControllerRegistry,
}

impl GrpcReadyNotifier {
    /// Resolve `rsync` through `registry` on every call.
    pub fn new(registry: ControllerRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ReadyNotifier for GrpcReadyNotifier {
    async fn alert(&self, client_name: &str, app_context: &str) -> Result<AlertStream> {
        let channel = self.registry.stream_connection(RSYNC_NAME).await?;
        let stream = ReadyNotifyClient::new(channel)
            .alert(Topic {
                client_name: client_name.to_string(),
                app_context: app_context.to_string(),
            })
            .await?
            .into_inner();
        Ok(Box::pin(stream))
    }

    async fn unsubscribe(&self, client_name: &str, app_context: &str) -> Result<()> {
        let channel = self.registry.connection(RSYNC_NAME).await?;
        ReadyNotifyClient::new(channel)
            .unsubscribe(Topic {
                client_name: client_name.to_string(),
                app_context: app_context.to_string(),
            })
            .await?;
        Ok(())
    }
}

/// Publishes cluster events to every registered CLM controller.
#[derive(Clone)]
pub struct GrpcClusterEventPublisher {
    registry: ControllerRegistry,
}

impl GrpcClusterEventPublisher {
    /// `registry` must manage the CLM controller group.
    pub fn new(registry: ControllerRegistry) -> Self {
        Self { registry }
    }

    async fn publish_one(
        &self,
        controller: &str,
        provider: &str,
        cluster: &str,
        event: ClusterEvent,
    ) -> Result<()> {
        let channel = self.registry.connection(controller).await?;
        let resp = ClmControllerEventChannelClient::new(channel)
            .publish(ClmControllerEventRequest {
                provider_name: provider.to_string(),
                cluster_name: cluster.to_string(),
                event: event as i32,
            })
            .await?
            .into_inner();
        if resp.status {
            Ok(())
        } else {
            Err(EmcoError::Upstream(resp.message))
        }
    }
}

#[async_trait]
impl ClusterEventPublisher for GrpcClusterEventPublisher {
    #[instrument(skip(self))]
    async fn publish(&self, provider: &str, cluster: &str, event: ClusterEvent) -> Result<()> {
        let mut controllers = self.registry.get_controllers().await?;
        controllers.sort_by_key(|c| c.spec.priority);

        let mut failures = Vec::new();
        for c in controllers {
            let name = c.metadata.name;
            let outcome = self.publish_one(&name, provider, cluster, event).await;
            if let Err(e) = outcome {
                error!(controller = %name, error = %e, "CLM controller publish failed");
                failures.push(format!("{}: {}", name, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EmcoError::Upstream(format!(
                "Publish of {} failed: {}",
                event.as_str_name(),
                failures.join("; ")
            )))
        }
    }
}
