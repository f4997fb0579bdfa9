// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Metadata shared by every user-named object, and its validation.

use serde::{Deserialize, Serialize};

use crate::appcontext::CompositeAppMeta;
use crate::error::{EmcoError, Result};

const MAX_NAME: usize = 128;
const MAX_DESCRIPTION: usize = 1024;
const MAX_USER_DATA: usize = 512;

/// Name and free-form annotations of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Identifier.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Opaque user data.
    #[serde(rename = "userData1", default)]
    pub user_data1: String,
    /// Opaque user data.
    #[serde(rename = "userData2", default)]
    pub user_data2: String,
}

impl Metadata {
    /// Metadata with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Validate name grammar and field lengths.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        check_len("description", &self.description, MAX_DESCRIPTION)?;
        check_len("userData1", &self.user_data1, MAX_USER_DATA)?;
        check_len("userData2", &self.user_data2, MAX_USER_DATA)?;
        Ok(())
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.len() > max {
        return Err(EmcoError::InvalidInput(format!(
            "{} exceeds {} characters",
            field, max
        )));
    }
    Ok(())
}

/// Names start and end with an alphanumeric and may contain `-`, `_`, `.`.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = || EmcoError::InvalidInput(format!("Invalid name: {:?}", name));
    if name.is_empty() || name.len() > MAX_NAME {
        return Err(invalid());
    }
    let bytes = name.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return Err(invalid());
    }
    if !bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(invalid());
    }
    Ok(())
}

/// The deployment intent group that owns an intent.
///
/// Flattened into the keys of every intent record so that a group's intents
/// are children of the group in the KV store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentScope {
    /// Project.
    pub project: String,
    /// Composite app.
    #[serde(rename = "compositeapp")]
    pub composite_app: String,
    /// Composite app version.
    #[serde(rename = "compositeappversion")]
    pub version: String,
    /// Deployment intent group.
    #[serde(rename = "deploymentintentgroup")]
    pub deployment_intent_group: String,
}

impl IntentScope {
    /// Scope from its four names.
    pub fn new(project: &str, composite_app: &str, version: &str, dig: &str) -> Self {
        Self {
            project: project.to_string(),
            composite_app: composite_app.to_string(),
            version: version.to_string(),
            deployment_intent_group: dig.to_string(),
        }
    }
}

impl From<&CompositeAppMeta> for IntentScope {
    fn from(meta: &CompositeAppMeta) -> Self {
        Self::new(
            &meta.project,
            &meta.composite_app,
            &meta.version,
            &meta.deployment_intent_group,
        )
    }
}

/// Parse `true`/`false` carried either as a JSON bool or a string.
pub mod bool_or_string {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        B(bool),
        S(String),
    }

    /// Serialize as a plain bool.
    pub fn serialize<S: Serializer>(v: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bool(*v)
    }

    /// Accept `true`, `false`, `"true"` or `"false"`.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        match Raw::deserialize(d)? {
            Raw::B(b) => Ok(b),
            Raw::S(s) => match s.to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(serde::de::Error::custom(format!(
                    "expected true or false, got {:?}",
                    other
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        for ok in ["a", "c1", "ovn-network", "net_1.v2", "A9"] {
            assert!(validate_name(ok).is_ok(), "{ok}");
        }
        let long = "x".repeat(129);
        for bad in ["", "-a", "a-", "a b", "a/b", "ä", long.as_str()] {
            assert!(validate_name(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_metadata_lengths() {
        let mut m = Metadata::named("ok");
        assert!(m.validate().is_ok());
        m.user_data1 = "u".repeat(513);
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_bool_or_string() {
        #[derive(Deserialize)]
        struct S {
            #[serde(with = "bool_or_string")]
            v: bool,
        }
        let s: S = serde_json::from_str(r#"{"v":"true"}"#).unwrap();
        assert!(s.v);
        let s: S = serde_json::from_str(r#"{"v":false}"#).unwrap();
        assert!(!s.v);
        assert!(serde_json::from_str::<S>(r#"{"v":"yes"}"#).is_err());
    }
}
