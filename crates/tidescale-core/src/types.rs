//! Shared types used across Tidescale crates.
//!
//! An [`AutoscalePolicy`] is the operator-supplied declaration for one
//! managed cluster; its [`AutoscaleStatus`] is the observed state written
//! back by the controller. Both live together in a [`PolicyRecord`] keyed
//! by [`ResourceId`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Nodes removable in one decision when the policy leaves it unset.
pub const DEFAULT_MAX_SCALE_DOWN_NODES: u32 = 2;

// ── Identity ──────────────────────────────────────────────────────

/// Namespace-scoped identity of a policy object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Composite key used by the state store: `{namespace}/{name}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(PolicyError::InvalidId(s.to_string())),
        }
    }
}

// ── Policy ────────────────────────────────────────────────────────

/// Reference to the managed cluster (provider project/instance/cluster).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterRef {
    pub project_id: String,
    pub instance_id: String,
    pub cluster_id: String,
}

impl ClusterRef {
    /// Composite key for capacity lookups: `{project}/{instance}/{cluster}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.project_id, self.instance_id, self.cluster_id)
    }

    /// The instance that owns this cluster.
    pub fn instance(&self) -> InstanceRef {
        InstanceRef {
            project_id: self.project_id.clone(),
            instance_id: self.instance_id.clone(),
        }
    }
}

/// A provider instance, the unit capacity providers list clusters for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRef {
    pub project_id: String,
    pub instance_id: String,
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.instance_id)
    }
}

/// Reference to externally stored provider credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    /// Falls back to the policy object's namespace when unset or empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub key: String,
}

impl SecretRef {
    /// Namespace to resolve the secret in.
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns,
            _ => default,
        }
    }
}

/// Operator-supplied bounds and target for one managed cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalePolicy {
    /// Lower limit for the node count set by the autoscaler.
    pub min_nodes: u32,
    /// Upper limit for the node count. Never smaller than `min_nodes`.
    pub max_nodes: u32,
    /// Upper limit on nodes removed in a single decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_scale_down_nodes: Option<u32>,
    /// Target average utilization, as a percentage.
    pub target_utilization: u32,
    pub cluster_ref: ClusterRef,
    pub credentials_ref: SecretRef,
}

impl AutoscalePolicy {
    pub fn effective_max_scale_down_nodes(&self) -> u32 {
        match self.max_scale_down_nodes {
            Some(n) if n > 0 => n,
            _ => DEFAULT_MAX_SCALE_DOWN_NODES,
        }
    }

    /// Admission checks. A policy that passes is safe to feed the calculator.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.min_nodes < 1 {
            return Err(PolicyError::MinNodes(self.min_nodes));
        }
        if self.max_nodes < self.min_nodes {
            return Err(PolicyError::MaxBelowMin {
                min: self.min_nodes,
                max: self.max_nodes,
            });
        }
        if self.target_utilization == 0 {
            return Err(PolicyError::ZeroTarget);
        }
        if self.max_scale_down_nodes == Some(0) {
            return Err(PolicyError::ZeroScaleDown);
        }
        let cluster = &self.cluster_ref;
        for (field, value) in [
            ("cluster_ref.project_id", &cluster.project_id),
            ("cluster_ref.instance_id", &cluster.instance_id),
            ("cluster_ref.cluster_id", &cluster.cluster_id),
            ("credentials_ref.name", &self.credentials_ref.name),
            ("credentials_ref.key", &self.credentials_ref.key),
        ] {
            if value.is_empty() {
                return Err(PolicyError::EmptyField(field));
            }
        }
        Ok(())
    }
}

/// Admission failures for a policy object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("min_nodes must be at least 1, got {0}")]
    MinNodes(u32),

    #[error("max_nodes ({max}) is smaller than min_nodes ({min})")]
    MaxBelowMin { min: u32, max: u32 },

    #[error("target_utilization must be greater than 0")]
    ZeroTarget,

    #[error("max_scale_down_nodes must be at least 1 when set")]
    ZeroScaleDown,

    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("invalid resource id {0:?}, expected namespace/name")]
    InvalidId(String),
}

// ── Status ────────────────────────────────────────────────────────

/// Observed state of a managed cluster. Unset fields mean "not yet observed".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscaleStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_nodes: Option<u32>,
    /// Last sampled utilization percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_utilization: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_nodes: Option<u32>,
    /// Unix timestamp (seconds) of the last issued scale command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<u64>,
    /// Unix timestamp (seconds) of the last utilization sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetch_time: Option<u64>,
}

// ── Record ────────────────────────────────────────────────────────

/// A policy object as persisted: spec, status, and concurrency version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: ResourceId,
    pub policy: AutoscalePolicy,
    #[serde(default)]
    pub status: AutoscaleStatus,
    /// Bumped on every successful write. Writers pass the version they read.
    #[serde(default)]
    pub version: u64,
}
