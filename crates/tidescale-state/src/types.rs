//! Persisted types that are local to the state store.
//!
//! Policy records themselves come from `tidescale-core`; the types here
//! back the secrets table and the local capacity/utilization tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use tidescale_core::{AutoscalePolicy, AutoscaleStatus, ClusterRef, PolicyRecord, ResourceId};

/// Key → value entries of a credentials secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretData {
    pub namespace: String,
    pub name: String,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl SecretData {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Serving node count of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCapacity {
    pub project_id: String,
    pub instance_id: String,
    pub cluster_id: String,
    pub nodes: u32,
    /// Unix timestamp (seconds) of the last change.
    pub updated_at: u64,
}

impl ClusterCapacity {
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.project_id, self.instance_id, self.cluster_id)
    }
}

/// One utilization sample for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub project_id: String,
    /// Unix timestamp (seconds) the sample was taken.
    pub timestamp: u64,
    /// Utilization as a percentage.
    pub percent: u32,
}

impl UtilizationSample {
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.project_id, self.timestamp)
    }
}
