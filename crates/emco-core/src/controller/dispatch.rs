// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sequential, priority-ordered dispatch to registered controllers.

use tracing::{error, info, instrument};

use emco_protocol::contextupdate::ContextUpdateRequest;
use emco_protocol::contextupdate::contextupdate_client::ContextupdateClient;
use emco_protocol::placementcontroller::ResourceRequest;
use emco_protocol::placementcontroller::placement_controller_client::PlacementControllerClient;

use super::{Controller, ControllerRegistry, TYPE_ACTION, TYPE_PLACEMENT};
use crate::error::{EmcoError, Result};

async fn ordered(registry: &ControllerRegistry, names: &[&str], ty: &str) -> Result<Vec<Controller>> {
    let mut controllers = Vec::with_capacity(names.len());
    for name in names {
        let c = registry.get_controller(name).await?;
        if c.spec.controller_type != ty {
            return Err(EmcoError::InvalidInput(format!(
                "Controller {} is not a {} controller",
                name, ty
            )));
        }
        controllers.push(c);
    }
    // stable: equal priorities keep caller order
    controllers.sort_by_key(|c| c.spec.priority);
    Ok(controllers)
}

/// Ask each placement controller, lowest priority value first, to filter
/// the clusters of `app_context`.
#[instrument(skip(registry, controllers))]
pub async fn invoke_placement_controllers(
    registry: &ControllerRegistry,
    app_context: &str,
    controllers: &[String],
) -> Result<()> {
    let names: Vec<&str> = controllers.iter().map(String::as_str).collect();
    for c in ordered(registry, &names, TYPE_PLACEMENT).await? {
        let name = &c.metadata.name;
        let channel = registry.connection(name).await?;
        let resp = PlacementControllerClient::new(channel)
            .filter_clusters(ResourceRequest {
                app_context: app_context.to_string(),
            })
            .await
            .map_err(|s| {
                error!(app_context, controller = %name, error = %s, "FilterClusters failed");
                EmcoError::from(s)
            })?
            .into_inner();
        if !resp.status {
            error!(app_context, controller = %name, message = %resp.message, "FilterClusters rejected");
            return Err(EmcoError::Upstream(format!(
                "Placement controller {} failed: {}",
                name, resp.message
            )));
        }
        info!(app_context, controller = %name, "Placement controller done");
    }
    Ok(())
}

/// Run each `(controller, intent)` pair, lowest priority value first.
#[instrument(skip(registry, intents))]
pub async fn invoke_action_controllers(
    registry: &ControllerRegistry,
    app_context: &str,
    intents: &[(String, String)],
) -> Result<()> {
    let mut names: Vec<&str> = Vec::new();
    for (c, _) in intents {
        if !names.contains(&c.as_str()) {
            names.push(c);
        }
    }
    let controllers = ordered(registry, &names, TYPE_ACTION).await?;

    for c in controllers {
        let name = &c.metadata.name;
        for (_, intent) in intents.iter().filter(|(n, _)| n == name) {
            let channel = registry.connection(name).await?;
            let resp = ContextupdateClient::new(channel)
                .update_app_context(ContextUpdateRequest {
                    app_context: app_context.to_string(),
                    intent_name: intent.clone(),
                })
                .await
                .map_err(|s| {
                    error!(app_context, controller = %name, intent = %intent, error = %s, "UpdateAppContext failed");
                    EmcoError::from(s)
                })?
                .into_inner();
            if !resp.app_context_updated {
                error!(
                    app_context,
                    controller = %name,
                    intent = %intent,
                    message = %resp.app_context_update_message,
                    "UpdateAppContext rejected"
                );
                return Err(EmcoError::Upstream(format!(
                    "Action controller {} failed for intent {}: {}",
                    name, intent, resp.app_context_update_message
                )));
            }
            info!(app_context, controller = %name, intent = %intent, "Action controller done");
        }
    }
    Ok(())
}
