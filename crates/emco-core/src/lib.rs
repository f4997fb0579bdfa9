// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! EMCO Core - multi-cluster edge orchestration control plane
//!
//! This crate renders user intents (networks, generic Kubernetes resources,
//! traffic groups) into per-cluster resource bundles held in an *AppContext*,
//! drives them through external controllers, and aggregates what the
//! clusters report back.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                  Contextupdate (gRPC, server.rs)                     │
//! └──────────────────────────────────────────────────────────────────────┘
//!            │ generic k8s intent                │ traffic group
//!            ▼                                   ▼
//! ┌──────────────────────┐          ┌──────────────────────────────────┐
//! │  gac                 │          │  dtc: network policy             │
//! │  resources + patches │          │       service discovery          │
//! └──────────────────────┘          └──────────────────────────────────┘
//!            │                                   │ alerts / install
//!            ▼                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ appcontext over contextdb              controller: rsync, CLM        │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │ cluster        ncm scheduler + CNI        status         state       │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                     db: SQLite or memory                             │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`db`] | Composite-key KV adapter with parent/child removal rules |
//! | [`contextdb`] | Hierarchical handle store backing AppContexts |
//! | [`state`] | Append-only lifecycle ledger of clusters |
//! | [`appcontext`] | Composite app / app / cluster / resource tree and instructions |
//! | [`controller`] | Controller registry, dispatch and synchronizer clients |
//! | [`cluster`] | Providers, clusters, labels and kv-pairs |
//! | [`ncm`] | Networks, provider networks and their scheduler |
//! | [`gac`] | Generic k8s intents and customizations |
//! | [`dtc`] | Traffic groups: network policies and service discovery |
//! | [`status`] | Status aggregation over a context |
//! | [`server`], [`runtime`] | gRPC listener and process wiring |
//!
//! # Contexts
//!
//! Every instantiation builds a fresh context identified by a decimal id.
//! Handles are slash-terminated paths:
//!
//! ```text
//! /context/<id>/app/<app>/cluster/<provider>+<cluster>/resource/<name>+<kind>/
//! ```
//!
//! The `+` separators are part of the protocol shared with the synchronizer.
//!
//! # Configuration
//!
//! See [`config::Config::from_env`].

#![deny(missing_docs)]

pub mod appcontext;
pub mod cluster;
pub mod config;
pub mod contextdb;
pub mod controller;
pub mod db;
pub mod dtc;
pub mod error;
pub mod gac;
pub mod ncm;
pub mod runtime;
pub mod server;
pub mod state;
pub mod status;
pub mod types;

pub use error::{EmcoError, ErrorKind, Result};
pub use runtime::{ControlPlane, EmcoRuntime};
