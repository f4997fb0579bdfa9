// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Customizations of generic resources.

use json_patch::Patch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{GAC_STORE, TAG_CUSTOMIZATION, TAG_CUSTOMIZATION_CONTENT, resource::ResourceClient};
use crate::db::Db;
use crate::error::{EmcoError, Result};
use crate::types::{IntentScope, Metadata, bool_or_string};

/// How a resource is specialised and for which clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customization {
    /// Name and annotations.
    pub metadata: Metadata,
    /// Cluster selection and patch.
    pub spec: CustomizeSpec,
}

/// Customization definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomizeSpec {
    /// Restrict to the clusters selected by `clusterInfo`.
    #[serde(rename = "clusterSpecific", with = "bool_or_string")]
    pub cluster_specific: bool,
    /// Cluster selection.
    #[serde(rename = "clusterInfo", default)]
    pub cluster_info: ClusterInfo,
    /// `json` to patch an existing object.
    #[serde(rename = "patchType", default, skip_serializing_if = "String::is_empty")]
    pub patch_type: String,
    /// RFC 6902 operations.
    #[serde(rename = "patchJson", default, skip_serializing_if = "Vec::is_empty")]
    pub patch_json: Vec<Value>,
}

/// Cluster selection of a customization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// `label` or `name`.
    #[serde(default)]
    pub scope: String,
    /// Provider of the selected clusters.
    #[serde(rename = "clusterProvider", default)]
    pub cluster_provider: String,
    /// Bare cluster name, with scope `name`.
    #[serde(rename = "clusterName", default)]
    pub cluster_name: String,
    /// Cluster label, with scope `label`.
    #[serde(rename = "clusterLabel", default)]
    pub cluster_label: String,
    /// `allow` or `deny`.
    #[serde(default)]
    pub mode: String,
}

impl ClusterInfo {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Files patched into ConfigMaps and Secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecFileContent {
    /// Base64 file payloads.
    #[serde(rename = "fileContents", default)]
    pub file_contents: Vec<String>,
    /// File names, parallel to `file_contents`.
    #[serde(rename = "fileNames", default)]
    pub file_names: Vec<String>,
}

/// Decode RFC 6902 operations.
pub fn decode_patch(ops: &[Value]) -> Result<Patch> {
    serde_json::from_value(Value::Array(ops.to_vec()))
        .map_err(|e| EmcoError::InvalidInput(format!("Invalid patchJson: {}", e)))
}

impl Customization {
    /// Decoded `patchJson`.
    pub fn json_patch(&self) -> Result<Patch> {
        decode_patch(&self.spec.patch_json)
    }

    /// Whether the customization patches an existing object.
    pub fn is_json_patch(&self) -> bool {
        self.spec.patch_type.eq_ignore_ascii_case("json")
    }

    /// Validate metadata, cluster selection, patch and files.
    pub fn validate(&self, content: &SpecFileContent) -> Result<()> {
        self.metadata.validate()?;
        let spec = &self.spec;
        if spec.cluster_specific {
            let info = &spec.cluster_info;
            if info.is_empty() {
                return Err(EmcoError::InvalidInput("ClusterInfo missing".to_string()));
            }
            if info.cluster_provider.is_empty() {
                return Err(EmcoError::InvalidInput("clusterProvider missing".to_string()));
            }
            let (label, name) = (!info.cluster_label.is_empty(), !info.cluster_name.is_empty());
            match info.scope.to_ascii_lowercase().as_str() {
                "label" if label && !name => {}
                "name" if name && !label => {}
                "label" => {
                    return Err(EmcoError::InvalidInput(
                        "Scope label requires clusterLabel and no clusterName".to_string(),
                    ));
                }
                "name" => {
                    return Err(EmcoError::InvalidInput(
                        "Scope name requires clusterName and no clusterLabel".to_string(),
                    ));
                }
                other => {
                    return Err(EmcoError::InvalidInput(format!("Invalid scope: {:?}", other)));
                }
            }
            if !matches!(info.mode.to_ascii_lowercase().as_str(), "allow" | "deny") {
                return Err(EmcoError::InvalidInput(format!("Invalid mode: {:?}", info.mode)));
            }
        }
        if !spec.patch_type.is_empty() && !self.is_json_patch() {
            return Err(EmcoError::InvalidInput(format!(
                "Unsupported patchType: {:?}",
                spec.patch_type
            )));
        }
        decode_patch(&spec.patch_json)?;
        if content.file_contents.len() != content.file_names.len() {
            return Err(EmcoError::InvalidInput(
                "Every file content needs a file name".to_string(),
            ));
        }
        if content.file_names.iter().any(|n| n.is_empty() || n.contains('/')) {
            return Err(EmcoError::InvalidInput("Invalid file name".to_string()));
        }
        Ok(())
    }
}

/// Customization key.
#[derive(Debug, Clone, Serialize)]
pub struct CustomizationKey {
    /// Owning group.
    #[serde(flatten)]
    pub scope: IntentScope,
    /// Owning intent.
    #[serde(rename = "generick8sintent")]
    pub intent: String,
    /// Owning resource.
    pub resource: String,
    /// Customization, empty to match any.
    pub customization: String,
}

impl CustomizationKey {
    /// Key of `customization` under `resource`.
    pub fn new(scope: &IntentScope, intent: &str, resource: &str, customization: &str) -> Self {
        Self {
            scope: scope.clone(),
            intent: intent.to_string(),
            resource: resource.to_string(),
            customization: customization.to_string(),
        }
    }
}

/// Customization CRUD.
#[derive(Clone)]
pub struct CustomizationClient {
    db: Db,
    resources: ResourceClient,
}

impl CustomizationClient {
    /// Client over `db`.
    pub fn new(db: Db) -> Self {
        Self {
            resources: ResourceClient::new(db.clone()),
            db,
        }
    }

    /// Create a customization under an existing resource.
    pub async fn create_customization(
        &self,
        c: &Customization,
        content: &SpecFileContent,
        scope: &IntentScope,
        intent: &str,
        resource: &str,
        exists: bool,
    ) -> Result<Customization> {
        c.validate(content)?;
        self.resources.get_resource(resource, scope, intent).await?;
        if !exists
            && self
                .get_customization(&c.metadata.name, scope, intent, resource)
                .await
                .is_ok()
        {
            return Err(EmcoError::Conflict("Customization already exists".to_string()));
        }
        let key = CustomizationKey::new(scope, intent, resource, &c.metadata.name);
        self.db.insert(GAC_STORE, &key, TAG_CUSTOMIZATION, c).await?;
        self.db
            .insert(GAC_STORE, &key, TAG_CUSTOMIZATION_CONTENT, content)
            .await?;
        Ok(c.clone())
    }

    /// A customization.
    pub async fn get_customization(
        &self,
        name: &str,
        scope: &IntentScope,
        intent: &str,
        resource: &str,
    ) -> Result<Customization> {
        self.db
            .find_one(
                GAC_STORE,
                &CustomizationKey::new(scope, intent, resource, name),
                TAG_CUSTOMIZATION,
            )
            .await?
            .ok_or_else(|| EmcoError::NotFound("Customization not found".to_string()))
    }

    /// The files of a customization.
    pub async fn get_customization_content(
        &self,
        name: &str,
        scope: &IntentScope,
        intent: &str,
        resource: &str,
    ) -> Result<SpecFileContent> {
        self.db
            .find_one(
                GAC_STORE,
                &CustomizationKey::new(scope, intent, resource, name),
                TAG_CUSTOMIZATION_CONTENT,
            )
            .await?
            .ok_or_else(|| EmcoError::NotFound("Customization content not found".to_string()))
    }

    /// Every customization of a resource.
    pub async fn get_all_customization(
        &self,
        scope: &IntentScope,
        intent: &str,
        resource: &str,
    ) -> Result<Vec<Customization>> {
        Ok(self
            .db
            .find_as(
                GAC_STORE,
                &CustomizationKey::new(scope, intent, resource, ""),
                TAG_CUSTOMIZATION,
            )
            .await?)
    }

    /// Delete a customization.
    pub async fn delete_customization(
        &self,
        name: &str,
        scope: &IntentScope,
        intent: &str,
        resource: &str,
    ) -> Result<()> {
        self.db
            .remove(GAC_STORE, &CustomizationKey::new(scope, intent, resource, name))
            .await?;
        Ok(())
    }
}
