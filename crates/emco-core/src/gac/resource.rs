// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Base resources of a generic intent.
//!
//! A new object that is neither a ConfigMap nor a Secret is uploaded as a
//! manifest file; ConfigMaps and Secrets are synthesized from customization
//! files, and existing objects are only patched.

use serde::{Deserialize, Serialize};

use super::{GAC_STORE, TAG_RESOURCE, TAG_RESOURCE_CONTENT, intent::GenericK8sIntentClient};
use crate::db::Db;
use crate::error::{EmcoError, Result};
use crate::types::{IntentScope, Metadata, bool_or_string};

/// A resource emitted or patched by a generic intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Name and annotations.
    pub metadata: Metadata,
    /// Target app and object identity.
    pub spec: ResourceSpec,
}

/// Resource definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// App whose clusters receive the resource.
    #[serde(rename = "appName")]
    pub app_name: String,
    /// Whether the object is new or already part of the app.
    #[serde(rename = "newObject", with = "bool_or_string")]
    pub new_object: bool,
    /// Object identity.
    #[serde(rename = "resourceGVK")]
    pub resource_gvk: ResourceGvk,
}

/// `apiVersion`, `kind` and `name` of the object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGvk {
    /// API version.
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    /// Kind.
    pub kind: String,
    /// Object name.
    pub name: String,
}

impl ResourceGvk {
    /// Whether this is a ConfigMap (any case).
    pub fn is_config_map(&self) -> bool {
        self.kind.eq_ignore_ascii_case("configmap")
    }

    /// Whether this is a Secret (any case).
    pub fn is_secret(&self) -> bool {
        self.kind.eq_ignore_ascii_case("secret")
    }

    /// Context resource name, `<name>+<kind>`.
    pub fn resource_name(&self) -> String {
        format!("{}+{}", self.name, self.kind)
    }
}

/// Uploaded manifest, base64.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFileContent {
    /// Base64 of the manifest file.
    #[serde(rename = "filecontent")]
    pub file_content: String,
}

impl Resource {
    /// Whether the resource must carry a manifest file.
    pub fn needs_file(&self) -> bool {
        let gvk = &self.spec.resource_gvk;
        self.spec.new_object && !gvk.is_config_map() && !gvk.is_secret()
    }

    /// Validate metadata, identity and the presence of the manifest file.
    pub fn validate(&self, content: Option<&ResourceFileContent>) -> Result<()> {
        self.metadata.validate()?;
        if self.spec.app_name.is_empty() {
            return Err(EmcoError::InvalidInput("appName is required".to_string()));
        }
        let gvk = &self.spec.resource_gvk;
        if gvk.kind.is_empty() || gvk.name.is_empty() {
            return Err(EmcoError::InvalidInput(
                "resourceGVK kind and name are required".to_string(),
            ));
        }
        match (self.needs_file(), content) {
            (true, None) => Err(EmcoError::InvalidInput(
                "Unable to process file, check if file is present".to_string(),
            )),
            (false, Some(_)) => Err(EmcoError::InvalidInput(
                "File upload unnecessary for existing objects, configmaps or secrets".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Resource key.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceKey {
    /// Owning group.
    #[serde(flatten)]
    pub scope: IntentScope,
    /// Owning intent.
    #[serde(rename = "generick8sintent")]
    pub intent: String,
    /// Resource, empty to match any.
    pub resource: String,
}

impl ResourceKey {
    /// Key of `resource` under `intent`.
    pub fn new(scope: &IntentScope, intent: &str, resource: &str) -> Self {
        Self {
            scope: scope.clone(),
            intent: intent.to_string(),
            resource: resource.to_string(),
        }
    }
}

/// Resource CRUD.
#[derive(Clone)]
pub struct ResourceClient {
    db: Db,
    intents: GenericK8sIntentClient,
}

impl ResourceClient {
    /// Client over `db`.
    pub fn new(db: Db) -> Self {
        Self {
            intents: GenericK8sIntentClient::new(db.clone()),
            db,
        }
    }

    /// Create a resource under an existing intent.
    pub async fn create_resource(
        &self,
        r: &Resource,
        content: Option<&ResourceFileContent>,
        scope: &IntentScope,
        intent: &str,
        exists: bool,
    ) -> Result<Resource> {
        r.validate(content)?;
        self.intents.get_generic_k8s_intent(intent, scope).await?;
        if !exists && self.get_resource(&r.metadata.name, scope, intent).await.is_ok() {
            return Err(EmcoError::Conflict("Resource already exists".to_string()));
        }
        let key = ResourceKey::new(scope, intent, &r.metadata.name);
        self.db.insert(GAC_STORE, &key, TAG_RESOURCE, r).await?;
        self.db
            .insert(
                GAC_STORE,
                &key,
                TAG_RESOURCE_CONTENT,
                &content.cloned().unwrap_or_default(),
            )
            .await?;
        Ok(r.clone())
    }

    /// A resource.
    pub async fn get_resource(&self, name: &str, scope: &IntentScope, intent: &str) -> Result<Resource> {
        self.db
            .find_one(GAC_STORE, &ResourceKey::new(scope, intent, name), TAG_RESOURCE)
            .await?
            .ok_or_else(|| EmcoError::NotFound("Resource not found".to_string()))
    }

    /// The uploaded manifest of a resource.
    pub async fn get_resource_content(
        &self,
        name: &str,
        scope: &IntentScope,
        intent: &str,
    ) -> Result<ResourceFileContent> {
        self.db
            .find_one(GAC_STORE, &ResourceKey::new(scope, intent, name), TAG_RESOURCE_CONTENT)
            .await?
            .ok_or_else(|| EmcoError::NotFound("Resource content not found".to_string()))
    }

    /// Every resource of an intent.
    pub async fn get_all_resources(&self, scope: &IntentScope, intent: &str) -> Result<Vec<Resource>> {
        Ok(self
            .db
            .find_as(GAC_STORE, &ResourceKey::new(scope, intent, ""), TAG_RESOURCE)
            .await?)
    }

    /// Delete a resource; fails while customizations remain under it.
    pub async fn delete_resource(&self, name: &str, scope: &IntentScope, intent: &str) -> Result<()> {
        self.db
            .remove(GAC_STORE, &ResourceKey::new(scope, intent, name))
            .await?;
        Ok(())
    }
}
