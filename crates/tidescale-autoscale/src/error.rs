//! Autoscaler error types.
//!
//! Errors are split by the boundary they come from. The calculator and
//! decision policy are total and have no error type.

use std::time::Duration;

use thiserror::Error;

use tidescale_core::PolicyError;
use tidescale_state::StateError;

use crate::retry::Disposition;

/// Failures from the policy store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The policy object was deleted.
    #[error("policy object not found: {0}")]
    NotFound(String),

    /// A concurrent writer bumped the record version first.
    #[error("optimistic concurrency conflict: {0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Classifier used by the conflict-retry helpers.
    pub fn disposition(&self) -> Disposition {
        match self {
            StoreError::NotFound(_) => Disposition::NotFound,
            StoreError::Conflict(_) => Disposition::Conflict,
            StoreError::Backend(_) => Disposition::Fatal,
        }
    }
}

impl From<StateError> for StoreError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound(key) => StoreError::NotFound(key),
            conflict @ StateError::Conflict { .. } => StoreError::Conflict(conflict.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Failures from the capacity or metrics backends.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("cluster {0} not found")]
    ClusterNotFound(String),

    #[error("no utilization samples for project {0}")]
    NoData(String),

    #[error("provider error: {0}")]
    Backend(String),
}

/// Failures resolving provider credentials.
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("key {key:?} missing from secret {namespace}/{name}")]
    KeyNotFound {
        namespace: String,
        name: String,
        key: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that end a reconcile pass. The dispatcher retries these with backoff.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to get policy {id}: {source}")]
    Fetch { id: String, source: StoreError },

    #[error("policy {id} is invalid: {source}")]
    InvalidPolicy { id: String, source: PolicyError },

    #[error("failed to get credentials for {id}: {source}")]
    Credentials { id: String, source: CredentialError },

    #[error("failed to initialize provider clients for {id}: {source}")]
    Client { id: String, source: ProviderError },

    #[error("failed to update status of {id}: {source}")]
    Persist { id: String, source: StoreError },

    #[error("reconcile pass for {id} panicked")]
    Panicked { id: String },
}

/// Errors that terminate a status syncer loop.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to update status of {id}: {source}")]
    Persist { id: String, source: StoreError },
}
