//! Reconciler — one pass per trigger for a single policy identity.
//!
//! A pass fetches the policy, resolves credentials, connects the
//! providers, makes sure a status syncer is running, computes the desired
//! node count, gates it through the cooldown policy, and records the
//! result. When the policy says act, the decision is persisted first and
//! the capacity provider is called only after that write lands, so a
//! crash between the two never repeats an action immediately.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use tidescale_core::{ClusterRef, ControllerConfig, ResourceId};

use crate::calculator::{desired_nodes, CapacityInput};
use crate::clock::Clock;
use crate::decision::{decide, Cooldowns, ScaleDecision};
use crate::error::{ReconcileError, StoreError};
use crate::provider::{with_deadline, ProviderClients, ProviderFactory};
use crate::retry::{persist_status, RetryPolicy, WriteOutcome};
use crate::store::{CredentialResolver, PolicyStore};
use crate::syncer::SyncerRegistry;

/// Terminal result of a pass that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Success,
    /// Run the pass again after the delay.
    RequeueAfter(Duration),
}

/// Drives one policy identity toward its desired capacity.
pub struct Reconciler {
    store: Arc<dyn PolicyStore>,
    credentials: Arc<dyn CredentialResolver>,
    providers: Arc<dyn ProviderFactory>,
    syncers: Arc<SyncerRegistry>,
    clock: Arc<dyn Clock>,
    cooldowns: Cooldowns,
    retry: RetryPolicy,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        credentials: Arc<dyn CredentialResolver>,
        providers: Arc<dyn ProviderFactory>,
        syncers: Arc<SyncerRegistry>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            providers,
            syncers,
            clock,
            cooldowns: Cooldowns {
                scale_up: config.scale_up_cooldown,
                scale_down: config.scale_down_cooldown,
            },
            retry: RetryPolicy::with_attempts(config.write_attempts),
            config,
        }
    }

    pub fn syncers(&self) -> &Arc<SyncerRegistry> {
        &self.syncers
    }

    /// Run one reconcile pass for `id`.
    pub async fn reconcile(&self, id: &ResourceId) -> Result<ReconcileOutcome, ReconcileError> {
        let record = match self.store.get(id).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                info!(%id, "policy not found, stopping status sync");
                self.syncers.deregister(id).await;
                return Ok(ReconcileOutcome::Success);
            }
            Err(source) => {
                return Err(ReconcileError::Fetch {
                    id: id.to_string(),
                    source,
                });
            }
        };
        let policy = &record.policy;

        policy
            .validate()
            .map_err(|source| ReconcileError::InvalidPolicy {
                id: id.to_string(),
                source,
            })?;

        let credentials = self
            .credentials
            .resolve(&policy.credentials_ref, &id.namespace)
            .await
            .map_err(|source| ReconcileError::Credentials {
                id: id.to_string(),
                source,
            })?;

        let clients = with_deadline(
            "connect",
            self.config.provider_timeout,
            self.providers.connect(&credentials, &policy.cluster_ref),
        )
        .await
        .map_err(|source| ReconcileError::Client {
            id: id.to_string(),
            source,
        })?;

        let fingerprint = fingerprint(&policy.cluster_ref, &credentials);
        if self
            .syncers
            .ensure(id, &policy.cluster_ref, fingerprint, clients.clone())
            .await
        {
            debug!(%id, "status syncer (re)started");
        }

        let now = self.clock.now();
        // Unset observations count as zero for the calculator only; they are
        // never written back as if the sync loop had seen them.
        let observed = record.status.last_fetch_time.is_some();
        let current_utilization = record.status.current_utilization.unwrap_or(0);
        let current_nodes = record.status.current_nodes.unwrap_or(0);
        let input = CapacityInput::from_policy(policy, current_utilization, current_nodes);
        let desired = desired_nodes(&input, self.config.rounding);

        // A first pass only starts the cooldown clock.
        let first_pass = record.status.last_scale_time.is_none();
        let last_scale_time = record.status.last_scale_time.unwrap_or(now);
        let decision = match decide(current_nodes, desired, last_scale_time, now, &self.cooldowns) {
            ScaleDecision::Act(direction) if first_pass || !observed => {
                info!(
                    %id,
                    ?direction,
                    first_pass,
                    observed,
                    "holding scale action until capacity is observed and the cooldown clock runs"
                );
                ScaleDecision::Deferred(direction)
            }
            decision => decision,
        };
        let scale_time = if decision.is_act() { now } else { last_scale_time };

        debug!(
            %id,
            current_utilization,
            current_nodes,
            desired,
            ?decision,
            "capacity evaluated"
        );

        let outcome = persist_status(
            self.store.as_ref(),
            id,
            Some(&record),
            &self.retry,
            |status| {
                status.desired_nodes = Some(desired);
                status.last_scale_time = Some(scale_time);
            },
        )
        .await;

        match outcome {
            Ok(WriteOutcome::Written(version)) => {
                debug!(%id, version, desired, "status updated");
            }
            Ok(WriteOutcome::Conflicted) => {
                info!(
                    %id,
                    delay = ?self.config.conflict_requeue,
                    "status write conflicted, requeueing"
                );
                return Ok(ReconcileOutcome::RequeueAfter(self.config.conflict_requeue));
            }
            Ok(WriteOutcome::Gone) => {
                info!(%id, "policy deleted during reconcile, stopping status sync");
                self.syncers.deregister(id).await;
                return Ok(ReconcileOutcome::Success);
            }
            Err(source) => {
                return Err(ReconcileError::Persist {
                    id: id.to_string(),
                    source,
                });
            }
        }

        if let ScaleDecision::Act(direction) = decision {
            self.scale(id, &policy.cluster_ref, &clients, current_nodes, desired)
                .await;
            debug!(%id, ?direction, "scale command issued");
        }

        Ok(ReconcileOutcome::Success)
    }

    /// Ask the capacity provider for `desired` nodes. Failures are logged;
    /// the recorded desired count lets the next pass try again.
    async fn scale(
        &self,
        id: &ResourceId,
        cluster: &ClusterRef,
        clients: &ProviderClients,
        current: u32,
        desired: u32,
    ) {
        let result = with_deadline(
            "set_cluster_node_count",
            self.config.provider_timeout,
            clients
                .capacity
                .set_cluster_node_count(&cluster.instance(), &cluster.cluster_id, desired),
        )
        .await;

        match result {
            Ok(()) => info!(
                %id,
                cluster = %cluster.table_key(),
                from = current,
                to = desired,
                "cluster scaled"
            ),
            Err(e) => warn!(
                %id,
                cluster = %cluster.table_key(),
                desired,
                error = %e,
                "failed to set cluster node count"
            ),
        }
    }
}

/// Identifies the cluster and credentials a syncer was started with.
fn fingerprint(cluster: &ClusterRef, credentials: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    cluster.hash(&mut hasher);
    credentials.hash(&mut hasher);
    hasher.finish()
}
