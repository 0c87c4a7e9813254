//! Capacity and metrics provider seams.
//!
//! The reconciler builds a [`ProviderClients`] pair per pass through a
//! [`ProviderFactory`], from resolved credentials and the policy's
//! cluster reference. Every call made through these traits is bounded by
//! [`with_deadline`]; a timeout is just another [`ProviderError`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tidescale_core::{ClusterRef, InstanceRef};

use crate::error::ProviderError;

/// Reports and sets serving node counts.
#[async_trait]
pub trait CapacityProvider: Send + Sync {
    /// `(cluster_id, node_count)` for every cluster of an instance.
    async fn list_cluster_node_counts(
        &self,
        instance: &InstanceRef,
    ) -> Result<Vec<(String, u32)>, ProviderError>;

    /// Set a cluster's node count. Setting the current value is a no-op.
    async fn set_cluster_node_count(
        &self,
        instance: &InstanceRef,
        cluster_id: &str,
        nodes: u32,
    ) -> Result<(), ProviderError>;
}

/// Reports load as a utilization percentage.
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn current_utilization(
        &self,
        project_id: &str,
        window: Duration,
    ) -> Result<u32, ProviderError>;
}

/// Provider handles for one managed cluster.
#[derive(Clone)]
pub struct ProviderClients {
    pub capacity: Arc<dyn CapacityProvider>,
    pub metrics: Arc<dyn MetricsProvider>,
}

/// Builds provider handles from credentials.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn connect(
        &self,
        credentials: &[u8],
        cluster: &ClusterRef,
    ) -> Result<ProviderClients, ProviderError>;
}

/// Bound a provider call by `timeout`.
pub async fn with_deadline<T, F>(
    operation: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout { operation, timeout }),
    }
}

/// One observation of a cluster: utilization percentage and serving nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub utilization: u32,
    pub nodes: u32,
}

/// Sample utilization, then the node count of `cluster`.
pub async fn observe(
    clients: &ProviderClients,
    cluster: &ClusterRef,
    window: Duration,
    deadline: Duration,
) -> Result<Observation, ProviderError> {
    let utilization = with_deadline(
        "current_utilization",
        deadline,
        clients.metrics.current_utilization(&cluster.project_id, window),
    )
    .await?;

    let counts = with_deadline(
        "list_cluster_node_counts",
        deadline,
        clients.capacity.list_cluster_node_counts(&cluster.instance()),
    )
    .await?;

    let nodes = counts
        .into_iter()
        .find(|(id, _)| *id == cluster.cluster_id)
        .map(|(_, nodes)| nodes)
        .ok_or_else(|| ProviderError::ClusterNotFound(cluster.table_key()))?;

    Ok(Observation { utilization, nodes })
}
