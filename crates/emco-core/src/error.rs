// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for emco-core.
//!
//! Every failure is classified into one of five kinds. The kind decides the
//! REST status an outer API layer returns and the gRPC code sent back to a
//! calling controller.

use std::fmt;

use crate::contextdb::ContextDbError;
use crate::db::DbError;

/// Result type using EmcoError
pub type Result<T> = std::result::Result<T, EmcoError>;

/// Message fragment the synchronizer's alert stream reports when it drops.
pub const TRANSPORT_CLOSING: &str = "transport is closing";

/// Error classification shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Key or handle absent.
    NotFound,
    /// Duplicate create, parent with children, or illegal state transition.
    Conflict,
    /// Schema, name or range failure.
    InvalidInput,
    /// RPC or store failure.
    Upstream,
    /// Alert stream closed by the transport; callers retry.
    TransientStream,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::InvalidInput => "invalid input",
            Self::Upstream => "upstream",
            Self::TransientStream => "transient stream",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by the control-plane operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EmcoError {
    /// Object or handle does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Object exists already or the current state forbids the request.
    #[error("{0}")]
    Conflict(String),

    /// Request failed validation.
    #[error("{0}")]
    InvalidInput(String),

    /// A collaborator (store, controller, synchronizer) failed.
    #[error("{0}")]
    Upstream(String),

    /// Alert stream transport dropped.
    #[error("{0}")]
    TransientStream(String),

    /// KV store failure, classified by the store.
    #[error(transparent)]
    Db(#[from] DbError),

    /// Context store failure, classified by the store.
    #[error(transparent)]
    ContextDb(#[from] ContextDbError),
}

impl EmcoError {
    /// Kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Upstream(_) => ErrorKind::Upstream,
            Self::TransientStream(_) => ErrorKind::TransientStream,
            Self::Db(e) => e.kind(),
            Self::ContextDb(e) => e.kind(),
        }
    }

    /// Stable string code for this error.
    pub fn error_code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::Upstream => "UPSTREAM",
            ErrorKind::TransientStream => "TRANSIENT_STREAM",
        }
    }

    /// HTTP status an outer REST layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::InvalidInput => 400,
            ErrorKind::Upstream | ErrorKind::TransientStream => 500,
        }
    }

    /// True when the alert stream should be retried after a back-off.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientStream
    }
}

impl From<sqlx::Error> for EmcoError {
    fn from(err: sqlx::Error) -> Self {
        EmcoError::Db(DbError::from(err))
    }
}

impl From<serde_json::Error> for EmcoError {
    fn from(err: serde_json::Error) -> Self {
        EmcoError::Upstream(format!("json: {}", err))
    }
}

impl From<serde_yaml::Error> for EmcoError {
    fn from(err: serde_yaml::Error) -> Self {
        EmcoError::Upstream(format!("yaml: {}", err))
    }
}

impl From<base64::DecodeError> for EmcoError {
    fn from(err: base64::DecodeError) -> Self {
        EmcoError::InvalidInput(format!("base64: {}", err))
    }
}

impl From<tonic::Status> for EmcoError {
    fn from(status: tonic::Status) -> Self {
        if status.code() == tonic::Code::Unavailable && status.message().contains(TRANSPORT_CLOSING)
        {
            EmcoError::TransientStream(format!(
                "rpc error: code = Unavailable desc = {}",
                status.message()
            ))
        } else {
            EmcoError::Upstream(format!(
                "rpc error: code = {:?} desc = {}",
                status.code(),
                status.message()
            ))
        }
    }
}

impl From<tonic::transport::Error> for EmcoError {
    fn from(err: tonic::transport::Error) -> Self {
        EmcoError::Upstream(format!("transport: {}", err))
    }
}

impl From<EmcoError> for tonic::Status {
    fn from(err: EmcoError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => tonic::Status::not_found(message),
            ErrorKind::Conflict if message.contains("already exists") => {
                tonic::Status::already_exists(message)
            }
            ErrorKind::Conflict => tonic::Status::failed_precondition(message),
            ErrorKind::InvalidInput => tonic::Status::invalid_argument(message),
            ErrorKind::Upstream => tonic::Status::internal(message),
            ErrorKind::TransientStream => tonic::Status::unavailable(message),
        }
    }
}
