//! Status syncer — background task that keeps observed status fresh.
//!
//! The [`SyncerRegistry`] runs one sync loop per policy identity. Each
//! tick samples utilization and node count from the providers and writes
//! them into the record's status, independent of reconcile cadence.
//!
//! # Replacement
//!
//! Registering an identity that already has a loop signals the old loop
//! to stop and hands its join handle to the new task, which waits for the
//! old loop to exit before its first tick. Registration itself never
//! blocks on a tick, and two loops never write the same record at once.
//!
//! # Termination
//!
//! A loop ends when it is stopped or replaced, when its record is deleted
//! (not-found on write), or on any other store failure. Only the last
//! case is an error; it is reported on the registry's failure channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tidescale_core::{ClusterRef, ControllerConfig, ResourceId};

use crate::clock::Clock;
use crate::error::{ProviderError, SyncError};
use crate::provider::{observe, ProviderClients};
use crate::retry::{persist_status, RetryPolicy, WriteOutcome};
use crate::store::PolicyStore;

/// Tunables shared by every sync loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Pause between ticks.
    pub interval: Duration,
    /// Upper bound on each provider call.
    pub provider_timeout: Duration,
    /// Window passed to the metrics provider.
    pub metrics_window: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            interval: config.sync_interval,
            provider_timeout: config.provider_timeout,
            metrics_window: config.metrics_window,
        }
    }

    /// Provider calls may not outlive a tick.
    fn call_deadline(&self) -> Duration {
        self.provider_timeout.min(self.interval)
    }
}

/// A sync loop that ended on a store failure.
#[derive(Debug)]
pub struct SyncFailure {
    pub id: ResourceId,
    pub error: SyncError,
}

/// Why a sync loop returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncExit {
    Stopped,
    Deleted,
}

/// Per-identity loop state.
struct SyncerSlot {
    generation: u64,
    /// Identifies the cluster and credentials the loop was started with.
    fingerprint: Option<u64>,
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns every running sync loop, keyed by identity.
pub struct SyncerRegistry {
    store: Arc<dyn PolicyStore>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    /// Active loops: identity → slot.
    running: Arc<RwLock<HashMap<ResourceId, SyncerSlot>>>,
    generation: AtomicU64,
    failures_tx: mpsc::UnboundedSender<SyncFailure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncFailure>>>,
}

impl SyncerRegistry {
    pub fn new(store: Arc<dyn PolicyStore>, clock: Arc<dyn Clock>, settings: SyncSettings) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            store,
            clock,
            settings,
            running: Arc::new(RwLock::new(HashMap::new())),
            generation: AtomicU64::new(0),
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
        }
    }

    /// Take the receiving end of the failure channel. Only the first call
    /// gets it.
    pub fn take_failures(&self) -> Option<mpsc::UnboundedReceiver<SyncFailure>> {
        self.failures_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Start syncing `id`, replacing any loop already running for it.
    pub async fn register(&self, id: &ResourceId, cluster: &ClusterRef, clients: ProviderClients) {
        let mut running = self.running.write().await;
        self.spawn_locked(&mut running, id, cluster, None, clients);
    }

    /// Start syncing `id` unless a live loop was started with the same
    /// `fingerprint`. Returns whether a new loop was started.
    pub async fn ensure(
        &self,
        id: &ResourceId,
        cluster: &ClusterRef,
        fingerprint: u64,
        clients: ProviderClients,
    ) -> bool {
        let mut running = self.running.write().await;
        let current = running.get(id).is_some_and(|slot| {
            slot.fingerprint == Some(fingerprint) && !slot.handle.is_finished()
        });
        if current {
            return false;
        }
        self.spawn_locked(&mut running, id, cluster, Some(fingerprint), clients);
        true
    }

    fn spawn_locked(
        &self,
        running: &mut HashMap<ResourceId, SyncerSlot>,
        id: &ResourceId,
        cluster: &ClusterRef,
        fingerprint: Option<u64>,
        clients: ProviderClients,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let predecessor = running.remove(id).map(|old| {
            let _ = old.shutdown_tx.send(true);
            debug!(%id, generation = old.generation, "stopping previous sync loop");
            old.handle
        });

        let sync = SyncLoop {
            id: id.clone(),
            cluster: cluster.clone(),
            clients,
            store: self.store.clone(),
            clock: self.clock.clone(),
            settings: self.settings,
        };
        let registry = self.running.clone();
        let failures = self.failures_tx.clone();
        let task_id = id.clone();

        let handle = tokio::spawn(async move {
            if let Some(previous) = predecessor {
                // Handshake: the old loop must be gone before the first tick.
                let _ = previous.await;
            }

            let result = sync.run(shutdown_rx).await;

            // Only clear the slot if it still belongs to this loop.
            {
                let mut running = registry.write().await;
                if running.get(&task_id).map(|s| s.generation) == Some(generation) {
                    running.remove(&task_id);
                }
            }

            match result {
                Ok(SyncExit::Stopped) => debug!(id = %task_id, "sync loop stopped"),
                Ok(SyncExit::Deleted) => info!(id = %task_id, "policy deleted, sync loop finished"),
                Err(error) => {
                    error!(id = %task_id, %error, "sync loop failed");
                    let _ = failures.send(SyncFailure { id: task_id, error });
                }
            }
        });

        running.insert(
            id.clone(),
            SyncerSlot {
                generation,
                fingerprint,
                handle,
                shutdown_tx,
            },
        );

        info!(%id, cluster = %cluster.table_key(), generation, "status sync started");
    }

    /// Stop syncing `id` and wait for its loop to exit.
    pub async fn deregister(&self, id: &ResourceId) {
        let slot = self.running.write().await.remove(id);
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            let _ = slot.handle.await;
            info!(%id, "status sync stopped");
        }
    }

    /// Stop every loop (for graceful shutdown).
    pub async fn stop_all(&self) {
        let slots: Vec<(ResourceId, SyncerSlot)> = self.running.write().await.drain().collect();
        for (_, slot) in &slots {
            let _ = slot.shutdown_tx.send(true);
        }
        for (id, slot) in slots {
            let _ = slot.handle.await;
            debug!(%id, "status sync stopped");
        }
        info!("all status syncers stopped");
    }

    /// Identities with a registered loop.
    pub async fn active(&self) -> Vec<ResourceId> {
        let running = self.running.read().await;
        running.keys().cloned().collect()
    }

    pub async fn is_running(&self, id: &ResourceId) -> bool {
        let running = self.running.read().await;
        running.contains_key(id)
    }
}

/// Outcome of a single tick that does not end the loop with an error.
enum Tick {
    Continue,
    Deleted,
}

/// The sync loop for a single identity.
struct SyncLoop {
    id: ResourceId,
    cluster: ClusterRef,
    clients: ProviderClients,
    store: Arc<dyn PolicyStore>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
}

impl SyncLoop {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<SyncExit, SyncError> {
        debug!(id = %self.id, interval = ?self.settings.interval, "sync loop starting");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(SyncExit::Stopped),
                _ = tokio::time::sleep(self.settings.interval) => {}
            }

            // A stop signal also cancels an in-flight tick, without writing.
            let tick = tokio::select! {
                biased;
                _ = shutdown.changed() => return Ok(SyncExit::Stopped),
                tick = self.tick() => tick?,
            };

            if let Tick::Deleted = tick {
                return Ok(SyncExit::Deleted);
            }
        }
    }

    async fn tick(&self) -> Result<Tick, SyncError> {
        let observation = match observe(
            &self.clients,
            &self.cluster,
            self.settings.metrics_window,
            self.settings.call_deadline(),
        )
        .await
        {
            Ok(observation) => observation,
            Err(e) => {
                log_provider_error(&self.id, &e);
                return Ok(Tick::Continue);
            }
        };

        let fetched_at = self.clock.now();
        debug!(
            id = %self.id,
            utilization = observation.utilization,
            nodes = observation.nodes,
            "metrics read"
        );

        let outcome = persist_status(
            self.store.as_ref(),
            &self.id,
            None,
            &RetryPolicy::ONCE,
            |status| {
                status.current_utilization = Some(observation.utilization);
                status.current_nodes = Some(observation.nodes);
                status.last_fetch_time = Some(fetched_at);
            },
        )
        .await;

        match outcome {
            Ok(WriteOutcome::Written(version)) => {
                debug!(id = %self.id, version, "status synced");
                Ok(Tick::Continue)
            }
            Ok(WriteOutcome::Conflicted) => {
                // The next tick reads fresh values anyway.
                warn!(id = %self.id, "status sync conflicted with a concurrent writer");
                Ok(Tick::Continue)
            }
            Ok(WriteOutcome::Gone) => Ok(Tick::Deleted),
            Err(source) => Err(SyncError::Persist {
                id: self.id.to_string(),
                source,
            }),
        }
    }
}

fn log_provider_error(id: &ResourceId, e: &ProviderError) {
    warn!(%id, error = %e, "failed to sample cluster, skipping tick");
}
