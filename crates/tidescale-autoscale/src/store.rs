//! Collaborator seams for the policy store and credential lookup.
//!
//! Both traits are implemented for [`StateStore`]; other backends (an API
//! server, a remote KV) only need to honor the same error classification.

use async_trait::async_trait;

use tidescale_core::{AutoscaleStatus, PolicyRecord, ResourceId, SecretRef};
use tidescale_state::StateStore;

use crate::error::{CredentialError, StoreError};

/// Read/write access to policy records.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Fetch a record. Missing records yield [`StoreError::NotFound`].
    async fn get(&self, id: &ResourceId) -> Result<PolicyRecord, StoreError>;

    /// Write a status if the record is still at `expected_version`.
    ///
    /// Returns the new version.
    async fn update_status(
        &self,
        id: &ResourceId,
        status: &AutoscaleStatus,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Every identity currently in the store.
    async fn list_ids(&self) -> Result<Vec<ResourceId>, StoreError>;
}

/// Resolves a secret reference into raw credential bytes.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(
        &self,
        secret: &SecretRef,
        default_namespace: &str,
    ) -> Result<Vec<u8>, CredentialError>;
}

#[async_trait]
impl PolicyStore for StateStore {
    async fn get(&self, id: &ResourceId) -> Result<PolicyRecord, StoreError> {
        self.get_policy(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update_status(
        &self,
        id: &ResourceId,
        status: &AutoscaleStatus,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        Ok(StateStore::update_status(self, id, status, expected_version)?)
    }

    async fn list_ids(&self) -> Result<Vec<ResourceId>, StoreError> {
        Ok(self.list_policies()?.into_iter().map(|r| r.id).collect())
    }
}

#[async_trait]
impl CredentialResolver for StateStore {
    async fn resolve(
        &self,
        secret: &SecretRef,
        default_namespace: &str,
    ) -> Result<Vec<u8>, CredentialError> {
        let namespace = secret.namespace_or(default_namespace);
        let data = self
            .get_secret(namespace, &secret.name)
            .map_err(StoreError::from)?
            .ok_or_else(|| CredentialError::SecretNotFound {
                namespace: namespace.to_string(),
                name: secret.name.clone(),
            })?;
        data.data
            .get(&secret.key)
            .cloned()
            .ok_or_else(|| CredentialError::KeyNotFound {
                namespace: namespace.to_string(),
                name: secret.name.clone(),
                key: secret.key.clone(),
            })
    }
}
