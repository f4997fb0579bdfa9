// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Default KV store location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:.data/emco.db?mode=rwc";

/// Default service identifier used to derive `<NAME>_SERVICE_HOST/PORT`.
pub const DEFAULT_SERVICE_NAME: &str = "emco";

/// EMCO control-plane configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL for the KV store
    pub database_url: String,
    /// Service identifier (upper-cased to find host/port variables)
    pub service_name: String,
    /// gRPC listen address
    pub grpc_addr: SocketAddr,
    /// TLS material, when the listener is secured
    pub tls: Option<TlsConfig>,
    /// Deadline for controller and synchronizer RPCs
    pub publish_timeout: Duration,
    /// Deadline for registry lookups and connects
    pub lookup_timeout: Duration,
    /// Back-off after a transient alert-stream error
    pub alert_retry: Duration,
    /// Orphan child-context sweep interval
    pub janitor_interval: Duration,
}

/// PEM certificate and key paths for the gRPC listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Certificate chain
    pub cert_path: PathBuf,
    /// Private key
    pub key_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            grpc_addr: SocketAddr::from(([0, 0, 0, 0], 9031)),
            tls: None,
            publish_timeout: Duration::from_secs(600),
            lookup_timeout: Duration::from_secs(10),
            alert_retry: Duration::from_secs(5),
            janitor_interval: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `EMCO_DATABASE_URL`: SQLite connection string (default: `sqlite:.data/emco.db?mode=rwc`)
    /// - `EMCO_SERVICE_NAME`: service identifier (default: `emco`)
    /// - `<NAME>_SERVICE_HOST` / `<NAME>_SERVICE_PORT`: listen address (default: `0.0.0.0:9031`)
    /// - `EMCO_TLS_ENABLED`: `true` to secure the listener; then `EMCO_TLS_CERT` and
    ///   `EMCO_TLS_KEY` are required
    /// - `EMCO_PUBLISH_TIMEOUT_SECS` (600), `EMCO_LOOKUP_TIMEOUT_SECS` (10),
    ///   `EMCO_ALERT_RETRY_SECS` (5), `EMCO_JANITOR_INTERVAL_SECS` (300)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("EMCO_DATABASE_URL")
            .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let service_name = std::env::var("EMCO_SERVICE_NAME")
            .unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string());
        let prefix = service_name.to_uppercase().replace('-', "_");

        let host: IpAddr = std::env::var(format!("{prefix}_SERVICE_HOST"))
            .unwrap_or_else(|_| "0.0.0.0".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("<NAME>_SERVICE_HOST", "must be an IP address"))?;

        let port: u16 = std::env::var(format!("{prefix}_SERVICE_PORT"))
            .unwrap_or_else(|_| "9031".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("<NAME>_SERVICE_PORT", "must be a valid port number")
            })?;

        let tls_enabled: bool = std::env::var("EMCO_TLS_ENABLED")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("EMCO_TLS_ENABLED", "must be true or false"))?;

        let tls = if tls_enabled {
            let cert_path =
                std::env::var("EMCO_TLS_CERT").map_err(|_| ConfigError::Missing("EMCO_TLS_CERT"))?;
            let key_path =
                std::env::var("EMCO_TLS_KEY").map_err(|_| ConfigError::Missing("EMCO_TLS_KEY"))?;
            Some(TlsConfig {
                cert_path: cert_path.into(),
                key_path: key_path.into(),
            })
        } else {
            None
        };

        Ok(Self {
            database_url,
            service_name,
            grpc_addr: SocketAddr::new(host, port),
            tls,
            publish_timeout: secs_var("EMCO_PUBLISH_TIMEOUT_SECS", 600)?,
            lookup_timeout: secs_var("EMCO_LOOKUP_TIMEOUT_SECS", 10)?,
            alert_retry: secs_var("EMCO_ALERT_RETRY_SECS", 5)?,
            janitor_interval: secs_var("EMCO_JANITOR_INTERVAL_SECS", 300)?,
        })
    }
}

fn secs_var(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let secs: u64 = match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "must be a non-negative integer"))?,
        Err(_) => default,
    };
    Ok(Duration::from_secs(secs))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
