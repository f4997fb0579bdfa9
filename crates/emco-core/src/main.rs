// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! EMCO Core - control-plane process
//!
//! Hosts in one process:
//! - the cluster catalog and the network-intent scheduler
//! - the generic-action controller
//! - the traffic controller (network policies, service discovery)
//!
//! Action controllers are reached through the `Contextupdate` gRPC listener.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use emco_core::config::Config;
use emco_core::contextdb::ContextTree;
use emco_core::db::{Db, SqliteKvStore};
use emco_core::runtime::ControlPlane;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("emco_core=info".parse()?),
        )
        .init();

    info!("Starting EMCO Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        service = %config.service_name,
        grpc_addr = %config.grpc_addr,
        tls = config.tls.is_some(),
        "Configuration loaded"
    );

    info!("Opening KV store...");
    let kv = SqliteKvStore::connect(&config.database_url).await?;
    info!("KV store ready, migrations applied");

    let plane = ControlPlane::from_config(Db::new(Arc::new(kv)), ContextTree::memory(), &config);
    let controllers = plane.registry.init_controllers().await?;
    let clm_controllers = plane.clm_registry.init_controllers().await?;
    info!(controllers, clm_controllers, "Controller channels dialed");

    let runtime = plane.start(&config).await?;
    info!(addr = %runtime.addr(), "EMCO Core initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    runtime.shutdown().await?;

    Ok(())
}
