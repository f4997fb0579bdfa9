// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generic Kubernetes intents.

use serde::{Deserialize, Serialize};

use super::{GAC_STORE, TAG_INTENT};
use crate::db::Db;
use crate::error::{EmcoError, Result};
use crate::types::{IntentScope, Metadata};

/// A named set of generic resources of a deployment intent group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericK8sIntent {
    /// Name and annotations.
    pub metadata: Metadata,
}

/// Generic intent key.
#[derive(Debug, Clone, Serialize)]
pub struct GenericK8sIntentKey {
    /// Owning group.
    #[serde(flatten)]
    pub scope: IntentScope,
    /// Intent, empty to match any.
    #[serde(rename = "generick8sintent")]
    pub intent: String,
}

impl GenericK8sIntentKey {
    /// Key of `intent` in `scope`.
    pub fn new(scope: &IntentScope, intent: &str) -> Self {
        Self {
            scope: scope.clone(),
            intent: intent.to_string(),
        }
    }
}

/// Generic intent CRUD.
#[derive(Clone)]
pub struct GenericK8sIntentClient {
    db: Db,
}

impl GenericK8sIntentClient {
    /// Client over `db`.
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create an intent; with `exists` an existing one is replaced.
    pub async fn create_generic_k8s_intent(
        &self,
        gki: &GenericK8sIntent,
        scope: &IntentScope,
        exists: bool,
    ) -> Result<GenericK8sIntent> {
        gki.metadata.validate()?;
        if !exists
            && self
                .get_generic_k8s_intent(&gki.metadata.name, scope)
                .await
                .is_ok()
        {
            return Err(EmcoError::Conflict(
                "GenericK8sIntent already exists".to_string(),
            ));
        }
        let key = GenericK8sIntentKey::new(scope, &gki.metadata.name);
        self.db.insert(GAC_STORE, &key, TAG_INTENT, gki).await?;
        Ok(gki.clone())
    }

    /// An intent.
    pub async fn get_generic_k8s_intent(&self, name: &str, scope: &IntentScope) -> Result<GenericK8sIntent> {
        self.db
            .find_one(GAC_STORE, &GenericK8sIntentKey::new(scope, name), TAG_INTENT)
            .await?
            .ok_or_else(|| EmcoError::NotFound("GenericK8sIntent not found".to_string()))
    }

    /// Every intent of the group.
    pub async fn get_all_generic_k8s_intents(&self, scope: &IntentScope) -> Result<Vec<GenericK8sIntent>> {
        Ok(self
            .db
            .find_as(GAC_STORE, &GenericK8sIntentKey::new(scope, ""), TAG_INTENT)
            .await?)
    }

    /// Delete an intent; fails while resources remain under it.
    pub async fn delete_generic_k8s_intent(&self, name: &str, scope: &IntentScope) -> Result<()> {
        self.db
            .remove(GAC_STORE, &GenericK8sIntentKey::new(scope, name))
            .await?;
        Ok(())
    }
}
