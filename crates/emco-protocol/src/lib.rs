// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! EMCO Protocol - gRPC contracts of the control plane
//!
//! This crate holds the protobuf messages and tonic stubs exchanged between:
//! - the orchestrator and placement/action controllers
//! - the orchestrator and the resource synchronizer (rsync)
//! - the cluster catalog and cluster-lifecycle (CLM) controllers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      emco-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RPC Layer: unary calls + server streaming (ReadyNotify)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Transport: HTTP/2 (tonic)                                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Services
//!
//! | Module | Service | Implemented by |
//! |--------|---------|----------------|
//! | [`placementcontroller`] | `FilterClusters` | placement controllers |
//! | [`contextupdate`] | `UpdateAppContext` | action controllers (ncm, gac, dtc) |
//! | [`readynotify`] | `Alert` (stream), `Unsubscribe` | rsync |
//! | [`clmcontrollereventchannel`] | `Publish` | CLM controllers |
//! | [`installapp`] | `InstallApp`, `UninstallApp` | rsync |
//!
//! All payloads reference a context by its decimal id string; controllers
//! read and write the shared context store directly and only exchange ids
//! over the wire.
//!
//! # Usage
//!
//! ```ignore
//! use emco_protocol::contextupdate::{
//!     contextupdate_client::ContextupdateClient, ContextUpdateRequest,
//! };
//!
//! let mut client = ContextupdateClient::connect("http://127.0.0.1:9031").await?;
//! let resp = client
//!     .update_app_context(ContextUpdateRequest {
//!         app_context: "7426735183628411421".to_string(),
//!         intent_name: "gac-intent".to_string(),
//!     })
//!     .await?
//!     .into_inner();
//! assert!(resp.app_context_updated);
//! ```

/// Placement controller contract.
pub mod placementcontroller {
    tonic::include_proto!("placementcontroller");
}

/// Action controller contract.
pub mod contextupdate {
    tonic::include_proto!("contextupdate");
}

/// Synchronizer readiness notifications.
pub mod readynotify {
    tonic::include_proto!("readynotify");
}

/// Cluster lifecycle event channel.
pub mod clmcontrollereventchannel {
    tonic::include_proto!("clmcontrollereventchannel");
}

/// Synchronizer install/uninstall contract.
pub mod installapp {
    tonic::include_proto!("installapp");
}
