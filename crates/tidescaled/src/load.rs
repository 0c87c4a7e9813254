//! Simulated load for clusters served by the built-in backend.
//!
//! Each `[[cluster]]` entry with a `load` contributes demand to its
//! project. Every pass turns a project's demand and its current node
//! count into one utilization sample, so scaling a cluster changes what
//! the next sample reports.

use std::collections::BTreeMap;

use tidescale_core::ClusterSeed;
use tidescale_state::{StateResult, StateStore, UtilizationSample};
use tracing::debug;

/// Percent utilization of `nodes` carrying `load` node-percent, capped at 100.
pub fn utilization(load: u32, nodes: u32) -> u32 {
    if nodes == 0 {
        return 100;
    }
    load.div_ceil(nodes).min(100)
}

/// Record one sample per project with simulated load. Returns how many
/// samples were written.
pub fn record_load_samples(
    store: &StateStore,
    clusters: &[ClusterSeed],
    now: u64,
) -> StateResult<usize> {
    // project → (load, nodes)
    let mut projects: BTreeMap<&str, (u32, u32)> = BTreeMap::new();
    for seed in clusters {
        let Some(load) = seed.load else { continue };
        let Some(capacity) = store.get_cluster(&seed.cluster_ref())? else {
            continue;
        };
        let entry = projects.entry(seed.project_id.as_str()).or_default();
        entry.0 = entry.0.saturating_add(load);
        entry.1 = entry.1.saturating_add(capacity.nodes);
    }

    for (project, (load, nodes)) in &projects {
        let percent = utilization(*load, *nodes);
        store.record_utilization(&UtilizationSample {
            project_id: project.to_string(),
            timestamp: now,
            percent,
        })?;
        debug!(project, load, nodes, percent, "utilization sampled");
    }
    Ok(projects.len())
}
