//! Store-backed providers.
//!
//! Serves capacity from the state store's clusters table and utilization
//! from its samples table. The daemon uses this as its local backend; an
//! external agent keeps the tables current.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use tidescale_core::{ClusterRef, InstanceRef};
use tidescale_state::StateStore;

use crate::clock::Clock;
use crate::error::ProviderError;
use crate::provider::{CapacityProvider, MetricsProvider, ProviderClients, ProviderFactory};

/// Provider factory over a [`StateStore`]. Credentials are not checked.
#[derive(Clone)]
pub struct StoreBackend {
    store: StateStore,
    clock: Arc<dyn Clock>,
}

impl StoreBackend {
    pub fn new(store: StateStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl ProviderFactory for StoreBackend {
    async fn connect(
        &self,
        _credentials: &[u8],
        cluster: &ClusterRef,
    ) -> Result<ProviderClients, ProviderError> {
        debug!(cluster = %cluster.table_key(), "connecting store backend");
        Ok(ProviderClients {
            capacity: Arc::new(StoreCapacity {
                store: self.store.clone(),
            }),
            metrics: Arc::new(StoreMetrics {
                store: self.store.clone(),
                clock: self.clock.clone(),
            }),
        })
    }
}

/// Capacity provider over the clusters table.
pub struct StoreCapacity {
    store: StateStore,
}

#[async_trait]
impl CapacityProvider for StoreCapacity {
    async fn list_cluster_node_counts(
        &self,
        instance: &InstanceRef,
    ) -> Result<Vec<(String, u32)>, ProviderError> {
        let clusters = self
            .store
            .list_clusters(&instance.project_id, &instance.instance_id)
            .map_err(|e| ProviderError::Backend(e.to_string()))?;
        Ok(clusters.into_iter().map(|c| (c.cluster_id, c.nodes)).collect())
    }

    async fn set_cluster_node_count(
        &self,
        instance: &InstanceRef,
        cluster_id: &str,
        nodes: u32,
    ) -> Result<(), ProviderError> {
        let known = self.list_cluster_node_counts(instance).await?;
        if !known.iter().any(|(id, _)| id == cluster_id) {
            return Err(ProviderError::ClusterNotFound(format!("{instance}/{cluster_id}")));
        }
        let cluster = ClusterRef {
            project_id: instance.project_id.clone(),
            instance_id: instance.instance_id.clone(),
            cluster_id: cluster_id.to_string(),
        };
        self.store
            .set_cluster_nodes(&cluster, nodes)
            .map_err(|e| ProviderError::Backend(e.to_string()))
    }
}

/// Metrics provider over the utilization samples table.
///
/// Reports the most recent sample inside the window.
pub struct StoreMetrics {
    store: StateStore,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl MetricsProvider for StoreMetrics {
    async fn current_utilization(
        &self,
        project_id: &str,
        window: Duration,
    ) -> Result<u32, ProviderError> {
        let since = self.clock.now().saturating_sub(window.as_secs());
        let samples = self
            .store
            .utilization_since(project_id, since)
            .map_err(|e| ProviderError::Backend(e.to_string()))?;
        samples
            .last()
            .map(|s| s.percent)
            .ok_or_else(|| ProviderError::NoData(project_id.to_string()))
    }
}
