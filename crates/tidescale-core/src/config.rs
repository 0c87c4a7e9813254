//! tidescaled.toml configuration parser.
//!
//! The file has a `[controller]` table of tunables plus optional
//! `[[policy]]`, `[[secret]]` and `[[cluster]]` seed entries. Every controller key is
//! optional; [`ControllerConfig::default`] documents the fallbacks.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AutoscalePolicy, ClusterRef, PolicyError, ResourceId};

/// Errors raised while loading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {value:?} for {field}")]
    Duration { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("cluster {0}: nodes must be greater than zero")]
    ClusterNodes(String),

    #[error("policy {id}: {source}")]
    Policy {
        id: String,
        #[source]
        source: PolicyError,
    },
}

/// How the calculator rounds the raw `utilization * nodes / target` quotient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    /// Round up, biasing toward earlier scale-up.
    #[default]
    Ceiling,
    /// Truncating integer division.
    Floor,
}

/// On-disk shape of the daemon config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default, rename = "policy")]
    pub policies: Vec<PolicySeed>,
    #[serde(default, rename = "secret")]
    pub secrets: Vec<SecretSeed>,
    #[serde(default, rename = "cluster")]
    pub clusters: Vec<ClusterSeed>,
}

/// Raw `[controller]` table. Durations are strings like `"30s"` or `"5m"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerSection {
    pub sync_interval: Option<String>,
    pub scale_up_cooldown: Option<String>,
    pub scale_down_cooldown: Option<String>,
    pub conflict_requeue: Option<String>,
    pub provider_timeout: Option<String>,
    pub metrics_window: Option<String>,
    pub resync_interval: Option<String>,
    pub error_backoff_base: Option<String>,
    pub error_backoff_max: Option<String>,
    pub rounding: Option<Rounding>,
    pub write_attempts: Option<u32>,
}

/// A policy object declared inline in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySeed {
    pub namespace: String,
    pub name: String,
    #[serde(flatten)]
    pub policy: AutoscalePolicy,
}

impl PolicySeed {
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.namespace, &self.name)
    }
}

/// A credentials secret declared inline in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretSeed {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// A cluster served by the daemon's built-in capacity and metrics backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSeed {
    pub project_id: String,
    pub instance_id: String,
    pub cluster_id: String,
    /// Node count written on first start only.
    pub nodes: u32,
    /// Simulated demand in node-percent (200 keeps two nodes fully busy).
    /// Without it no utilization is recorded for the cluster.
    #[serde(default)]
    pub load: Option<u32>,
}

impl ClusterSeed {
    pub fn cluster_ref(&self) -> ClusterRef {
        ClusterRef {
            project_id: self.project_id.clone(),
            instance_id: self.instance_id.clone(),
            cluster_id: self.cluster_id.clone(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve tunables and validate every seeded policy and cluster.
    pub fn resolve(&self) -> Result<ControllerConfig, ConfigError> {
        for seed in &self.policies {
            seed.policy.validate().map_err(|source| ConfigError::Policy {
                id: seed.id().to_string(),
                source,
            })?;
        }
        if let Some(seed) = self.clusters.iter().find(|c| c.nodes == 0) {
            return Err(ConfigError::ClusterNodes(seed.cluster_ref().table_key()));
        }
        ControllerConfig::from_section(&self.controller)
    }
}

/// Resolved controller tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Status syncer tick interval.
    pub sync_interval: Duration,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
    /// Requeue delay after an optimistic-concurrency conflict.
    pub conflict_requeue: Duration,
    /// Deadline for each capacity or metrics provider call.
    pub provider_timeout: Duration,
    /// Window handed to the metrics provider.
    pub metrics_window: Duration,
    /// Dispatcher periodic re-trigger interval.
    pub resync_interval: Duration,
    pub error_backoff_base: Duration,
    pub error_backoff_max: Duration,
    pub rounding: Rounding,
    /// Attempts per status write; 1 disables inline retry.
    pub write_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5),
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(60),
            conflict_requeue: Duration::from_secs(1),
            provider_timeout: Duration::from_secs(10),
            metrics_window: Duration::from_secs(5 * 60),
            resync_interval: Duration::from_secs(30),
            error_backoff_base: Duration::from_secs(1),
            error_backoff_max: Duration::from_secs(5 * 60),
            rounding: Rounding::Ceiling,
            write_attempts: 1,
        }
    }
}

impl ControllerConfig {
    pub fn from_section(section: &ControllerSection) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let pick = |field: &'static str, raw: &Option<String>, fallback: Duration| {
            raw.as_deref()
                .map(|v| parse_duration(v).ok_or_else(|| ConfigError::Duration {
                    field,
                    value: v.to_string(),
                }))
                .transpose()
                .map(|d| d.unwrap_or(fallback))
        };

        let config = Self {
            sync_interval: pick("sync_interval", &section.sync_interval, defaults.sync_interval)?,
            scale_up_cooldown: pick(
                "scale_up_cooldown",
                &section.scale_up_cooldown,
                defaults.scale_up_cooldown,
            )?,
            scale_down_cooldown: pick(
                "scale_down_cooldown",
                &section.scale_down_cooldown,
                defaults.scale_down_cooldown,
            )?,
            conflict_requeue: pick(
                "conflict_requeue",
                &section.conflict_requeue,
                defaults.conflict_requeue,
            )?,
            provider_timeout: pick(
                "provider_timeout",
                &section.provider_timeout,
                defaults.provider_timeout,
            )?,
            metrics_window: pick("metrics_window", &section.metrics_window, defaults.metrics_window)?,
            resync_interval: pick(
                "resync_interval",
                &section.resync_interval,
                defaults.resync_interval,
            )?,
            error_backoff_base: pick(
                "error_backoff_base",
                &section.error_backoff_base,
                defaults.error_backoff_base,
            )?,
            error_backoff_max: pick(
                "error_backoff_max",
                &section.error_backoff_max,
                defaults.error_backoff_max,
            )?,
            rounding: section.rounding.unwrap_or(defaults.rounding),
            write_attempts: section.write_attempts.unwrap_or(defaults.write_attempts),
        };

        // Cooldowns may be zero; loops and deadlines may not.
        for (field, value) in [
            ("sync_interval", config.sync_interval),
            ("conflict_requeue", config.conflict_requeue),
            ("provider_timeout", config.provider_timeout),
            ("metrics_window", config.metrics_window),
            ("resync_interval", config.resync_interval),
            ("error_backoff_base", config.error_backoff_base),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero(field));
            }
        }
        if config.write_attempts == 0 {
            return Err(ConfigError::Zero("write_attempts"));
        }

        Ok(config)
    }
}

/// Parse a duration string like `"250ms"`, `"30s"`, `"5m"`, `"1h"`.
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    let (digits, scale) = if let Some(secs) = s.strip_suffix('s') {
        (secs, 1)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600)
    } else {
        (s, 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(scale))
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("0s"), Some(Duration::ZERO));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert!(config.policies.is_empty());
        assert_eq!(config.resolve().unwrap(), ControllerConfig::default());
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
[controller]
sync_interval = "2s"
scale_up_cooldown = "30s"
scale_down_cooldown = "5m"
conflict_requeue = "500ms"
rounding = "floor"
write_attempts = 3

[[policy]]
namespace = "default"
name = "orders"
min_nodes = 1
max_nodes = 8
target_utilization = 60
cluster_ref = { project_id = "p", instance_id = "i", cluster_id = "i-c1" }
credentials_ref = { name = "sa", key = "json" }

[[secret]]
namespace = "default"
name = "sa"
data = { json = "{}" }
"#;
        let config = DaemonConfig::from_toml(toml_str).unwrap();
        let resolved = config.resolve().unwrap();
        assert_eq!(resolved.sync_interval, Duration::from_secs(2));
        assert_eq!(resolved.scale_up_cooldown, Duration::from_secs(30));
        assert_eq!(resolved.scale_down_cooldown, Duration::from_secs(300));
        assert_eq!(resolved.conflict_requeue, Duration::from_millis(500));
        assert_eq!(resolved.provider_timeout, Duration::from_secs(10));
        assert_eq!(resolved.rounding, Rounding::Floor);
        assert_eq!(resolved.write_attempts, 3);

        assert_eq!(config.policies.len(), 1);
        assert_eq!(config.policies[0].id().to_string(), "default/orders");
        assert_eq!(config.policies[0].policy.max_scale_down_nodes, None);
        assert_eq!(config.secrets[0].data["json"], "{}");
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        let config = DaemonConfig::from_toml("[controller]\nsync_interval = \"fast\"\n").unwrap();
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::Duration { field: "sync_interval", .. })
        ));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let config = DaemonConfig::from_toml("[controller]\nsync_interval = \"0s\"\n").unwrap();
        assert!(matches!(config.resolve(), Err(ConfigError::Zero("sync_interval"))));

        // Zero cooldowns are allowed.
        let config =
            DaemonConfig::from_toml("[controller]\nscale_up_cooldown = \"0s\"\n").unwrap();
        assert_eq!(config.resolve().unwrap().scale_up_cooldown, Duration::ZERO);
    }

    #[test]
    fn test_cluster_seeds() {
        let toml_str = r#"
[[cluster]]
project_id = "acme"
instance_id = "orders-db"
cluster_id = "orders-db-c1"
nodes = 2
load = 150

[[cluster]]
project_id = "acme"
instance_id = "orders-db"
cluster_id = "orders-db-c2"
nodes = 0
"#;
        let config = DaemonConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.clusters.len(), 2);
        assert_eq!(config.clusters[0].load, Some(150));
        assert_eq!(config.clusters[1].load, None);
        assert_eq!(
            config.clusters[0].cluster_ref().table_key(),
            "acme/orders-db/orders-db-c1"
        );
        assert!(matches!(config.resolve(), Err(ConfigError::ClusterNodes(_))));
    }

    #[test]
    fn test_invalid_seed_policy_is_rejected() {
        let toml_str = r#"
[[policy]]
namespace = "default"
name = "broken"
min_nodes = 4
max_nodes = 2
target_utilization = 60
cluster_ref = { project_id = "p", instance_id = "i", cluster_id = "c" }
credentials_ref = { name = "sa", key = "json" }
"#;
        let config = DaemonConfig::from_toml(toml_str).unwrap();
        match config.resolve() {
            Err(ConfigError::Policy { id, source }) => {
                assert_eq!(id, "default/broken");
                assert_eq!(source, PolicyError::MaxBelowMin { min: 4, max: 2 });
            }
            other => panic!("expected policy error, got {other:?}"),
        }
    }
}
