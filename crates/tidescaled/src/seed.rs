//! Upserts `[[policy]]`, `[[secret]]` and `[[cluster]]` entries from the
//! config file.
//!
//! Seeding a policy that already exists replaces its spec but keeps its
//! status, so restarts do not reset cooldowns. A cluster's node count is
//! only written when the cluster is new; after that it belongs to the
//! scaler.

use tidescale_core::DaemonConfig;
use tidescale_state::{SecretData, StateResult, StateStore};
use tracing::info;

/// Counts of what a seeding pass wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub policies: usize,
    pub secrets: usize,
    /// Clusters created by this pass.
    pub clusters: usize,
}

pub fn apply_seeds(store: &StateStore, config: &DaemonConfig) -> StateResult<SeedSummary> {
    // Secrets first so the first reconcile can resolve credentials.
    for seed in &config.secrets {
        let data = seed
            .data
            .iter()
            .map(|(key, value)| (key.clone(), value.as_bytes().to_vec()))
            .collect();
        store.put_secret(&SecretData {
            namespace: seed.namespace.clone(),
            name: seed.name.clone(),
            data,
        })?;
        info!(secret = %format!("{}/{}", seed.namespace, seed.name), "secret seeded");
    }

    for seed in &config.policies {
        let id = seed.id();
        let record = store.put_policy(&id, &seed.policy)?;
        info!(%id, version = record.version, "policy seeded");
    }

    let mut clusters = 0;
    for seed in &config.clusters {
        let cluster = seed.cluster_ref();
        if store.get_cluster(&cluster)?.is_some() {
            continue;
        }
        store.set_cluster_nodes(&cluster, seed.nodes)?;
        info!(cluster = %cluster.table_key(), nodes = seed.nodes, "cluster seeded");
        clusters += 1;
    }

    Ok(SeedSummary {
        policies: config.policies.len(),
        secrets: config.secrets.len(),
        clusters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidescale_core::{AutoscaleStatus, ResourceId};

    const CONFIG: &str = r#"
[controller]
sync_interval = "10s"

[[secret]]
namespace = "default"
name = "provider-creds"
data = { "credentials.json" = "{}" }

[[policy]]
namespace = "default"
name = "orders"
min_nodes = 1
max_nodes = 5
target_utilization = 60

[policy.cluster_ref]
project_id = "acme"
instance_id = "orders-db"
cluster_id = "orders-db-c1"

[policy.credentials_ref]
name = "provider-creds"
key = "credentials.json"

[[cluster]]
project_id = "acme"
instance_id = "orders-db"
cluster_id = "orders-db-c1"
nodes = 2
load = 150
"#;

    #[test]
    fn seeds_secrets_and_policies() {
        let store = StateStore::open_in_memory().unwrap();
        let config = DaemonConfig::from_toml(CONFIG).unwrap();

        let summary = apply_seeds(&store, &config).unwrap();
        assert_eq!(
            summary,
            SeedSummary {
                policies: 1,
                secrets: 1,
                clusters: 1
            }
        );

        let secret = store.get_secret("default", "provider-creds").unwrap().unwrap();
        assert_eq!(secret.data["credentials.json"], b"{}");

        let record = store
            .get_policy(&ResourceId::new("default", "orders"))
            .unwrap()
            .unwrap();
        assert_eq!(record.policy.max_nodes, 5);
        assert_eq!(record.version, 1);
    }

    #[test]
    fn sample_config_resolves_and_seeds() {
        let content = include_str!("../../../demos/tidescaled.toml");
        let config = DaemonConfig::from_toml(content).unwrap();
        let controller = config.resolve().unwrap();
        assert_eq!(controller.scale_down_cooldown.as_secs(), 300);

        let store = StateStore::open_in_memory().unwrap();
        let summary = apply_seeds(&store, &config).unwrap();
        assert_eq!(summary.policies, 1);
        assert_eq!(summary.secrets, 1);
        assert_eq!(summary.clusters, 1);
    }

    #[test]
    fn reseeding_keeps_existing_status() {
        let store = StateStore::open_in_memory().unwrap();
        let config = DaemonConfig::from_toml(CONFIG).unwrap();
        apply_seeds(&store, &config).unwrap();

        let id = ResourceId::new("default", "orders");
        let status = AutoscaleStatus {
            desired_nodes: Some(3),
            last_scale_time: Some(1_700_000_000),
            ..AutoscaleStatus::default()
        };
        store.update_status(&id, &status, 1).unwrap();

        apply_seeds(&store, &config).unwrap();
        let record = store.get_policy(&id).unwrap().unwrap();
        assert_eq!(record.status, status);
        assert_eq!(record.version, 3);
    }

    #[test]
    fn reseeding_keeps_scaled_cluster_sizes() {
        let store = StateStore::open_in_memory().unwrap();
        let config = DaemonConfig::from_toml(CONFIG).unwrap();
        apply_seeds(&store, &config).unwrap();

        let cluster = config.clusters[0].cluster_ref();
        store.set_cluster_nodes(&cluster, 5).unwrap();

        let summary = apply_seeds(&store, &config).unwrap();
        assert_eq!(summary.clusters, 0);
        assert_eq!(store.get_cluster(&cluster).unwrap().unwrap().nodes, 5);
    }
}
