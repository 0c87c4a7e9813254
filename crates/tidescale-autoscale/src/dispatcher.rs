//! Trigger dispatcher — schedules reconcile passes.
//!
//! Triggers come from three places: a periodic resync over every stored
//! identity, explicit [`Trigger`] handles, and sync loops that died on a
//! store failure. At most one pass runs per identity; a trigger that
//! arrives mid-pass is folded into a single rerun afterwards.
//!
//! `RequeueAfter` outcomes reschedule after their delay. Errors reschedule
//! with exponential backoff that resets on the next clean pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tidescale_core::{ControllerConfig, ResourceId};

use crate::error::ReconcileError;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::store::PolicyStore;
use crate::syncer::SyncFailure;

/// Delay before retry `failures` of a failing identity.
///
/// Doubles from `base` and saturates at `max`.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Handle for requesting a reconcile of a specific identity.
#[derive(Clone)]
pub struct Trigger {
    tx: mpsc::UnboundedSender<ResourceId>,
}

impl Trigger {
    /// Request a pass. Returns false once the dispatcher has stopped.
    pub fn trigger(&self, id: ResourceId) -> bool {
        self.tx.send(id).is_ok()
    }
}

/// Scheduling state for one identity.
#[derive(Debug, Default)]
struct Schedule {
    /// When the next pass is due, if one is queued.
    due: Option<Instant>,
    /// Consecutive failed passes.
    failures: u32,
    /// A trigger arrived while a pass was in flight.
    rerun: bool,
}

type PassResult = (ResourceId, Result<ReconcileOutcome, ReconcileError>);

pub struct Dispatcher {
    store: Arc<dyn PolicyStore>,
    reconciler: Arc<Reconciler>,
    resync_interval: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
    schedules: HashMap<ResourceId, Schedule>,
    in_flight: HashSet<ResourceId>,
    /// Running pass tasks, so a panicked pass can release its identity.
    tasks: HashMap<task::Id, ResourceId>,
    /// Identities seen in the last resync listing.
    listed: HashSet<ResourceId>,
    passes: JoinSet<PassResult>,
    triggers_tx: mpsc::UnboundedSender<ResourceId>,
    triggers_rx: mpsc::UnboundedReceiver<ResourceId>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        reconciler: Arc<Reconciler>,
        config: &ControllerConfig,
    ) -> Self {
        let (triggers_tx, triggers_rx) = mpsc::unbounded_channel();
        Self {
            store,
            reconciler,
            resync_interval: config.resync_interval,
            backoff_base: config.error_backoff_base,
            backoff_max: config.error_backoff_max,
            schedules: HashMap::new(),
            in_flight: HashSet::new(),
            tasks: HashMap::new(),
            listed: HashSet::new(),
            passes: JoinSet::new(),
            triggers_tx,
            triggers_rx,
        }
    }

    pub fn trigger_handle(&self) -> Trigger {
        Trigger {
            tx: self.triggers_tx.clone(),
        }
    }

    /// Dispatch until `shutdown` fires, then drain in-flight passes and
    /// stop every status syncer.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let syncers = self.reconciler.syncers().clone();
        let mut failures = syncers.take_failures();
        let mut resync = tokio::time::interval(self.resync_interval);

        info!(resync = ?self.resync_interval, "dispatcher started");

        loop {
            let next_due = self.next_due();

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("dispatcher shutting down");
                    break;
                }
                _ = resync.tick() => self.resync().await,
                Some(id) = self.triggers_rx.recv() => self.enqueue(id),
                Some(failure) = recv_failure(&mut failures) => self.on_sync_failure(failure),
                Some(joined) = self.passes.join_next_with_id(), if !self.passes.is_empty() => {
                    self.joined(joined);
                }
                _ = sleep_until(next_due) => {}
            }

            self.start_due();
        }

        while let Some(joined) = self.passes.join_next().await {
            if let Ok((id, Err(e))) = joined {
                warn!(%id, error = %e, "reconcile failed during shutdown");
            }
        }
        syncers.stop_all().await;
        info!("dispatcher stopped");
    }

    /// Queue every stored identity, plus any that vanished since the last
    /// listing so their passes observe the deletion.
    async fn resync(&mut self) {
        let ids = match self.store.list_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "failed to list policies for resync");
                return;
            }
        };

        let listed: HashSet<ResourceId> = ids.into_iter().collect();
        let vanished: Vec<ResourceId> = self.listed.difference(&listed).cloned().collect();
        debug!(policies = listed.len(), vanished = vanished.len(), "resync");

        for id in listed.iter().cloned().chain(vanished) {
            self.enqueue(id);
        }
        self.listed = listed;
    }

    fn enqueue(&mut self, id: ResourceId) {
        let now = Instant::now();
        let in_flight = self.in_flight.contains(&id);
        let schedule = self.schedules.entry(id).or_default();
        if in_flight {
            schedule.rerun = true;
        } else {
            // Backoff and requeue delays are not shortened by resync.
            if schedule.failures == 0 || schedule.due.is_none() {
                schedule.due = Some(schedule.due.map_or(now, |due| due.min(now)));
            }
        }
    }

    fn on_sync_failure(&mut self, failure: SyncFailure) {
        warn!(id = %failure.id, error = %failure.error, "status sync failed, requeueing reconcile");
        self.enqueue(failure.id);
    }

    fn joined(&mut self, joined: Result<(task::Id, PassResult), JoinError>) {
        match joined {
            Ok((task, (id, result))) => {
                self.tasks.remove(&task);
                self.complete(id, result);
            }
            Err(e) => {
                let Some(id) = self.tasks.remove(&e.id()) else {
                    error!(error = %e, "untracked reconcile task failed");
                    return;
                };
                error!(%id, error = %e, "reconcile task panicked");
                let err = ReconcileError::Panicked { id: id.to_string() };
                self.complete(id, Err(err));
            }
        }
    }

    fn complete(&mut self, id: ResourceId, result: Result<ReconcileOutcome, ReconcileError>) {
        self.in_flight.remove(&id);
        let now = Instant::now();
        let listed = self.listed.contains(&id);

        let Some(schedule) = self.schedules.get_mut(&id) else {
            return;
        };
        let rerun = std::mem::take(&mut schedule.rerun);

        match result {
            Ok(ReconcileOutcome::Success) => {
                schedule.failures = 0;
                schedule.due = rerun.then_some(now);
                debug!(%id, "reconcile succeeded");
            }
            Ok(ReconcileOutcome::RequeueAfter(delay)) => {
                schedule.failures = 0;
                schedule.due = Some(if rerun { now } else { now + delay });
                debug!(%id, ?delay, "reconcile requeued");
            }
            Err(e) => {
                schedule.failures = schedule.failures.saturating_add(1);
                let delay = backoff_delay(self.backoff_base, self.backoff_max, schedule.failures);
                schedule.due = Some(now + delay);
                warn!(%id, error = %e, failures = schedule.failures, ?delay, "reconcile failed");
            }
        }

        if schedule.due.is_none() && !listed {
            self.schedules.remove(&id);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.schedules
            .iter()
            .filter(|(id, _)| !self.in_flight.contains(*id))
            .filter_map(|(_, s)| s.due)
            .min()
    }

    fn start_due(&mut self) {
        let now = Instant::now();
        for (id, schedule) in self.schedules.iter_mut() {
            if self.in_flight.contains(id) {
                continue;
            }
            if schedule.due.is_some_and(|due| due <= now) {
                schedule.due = None;
                self.in_flight.insert(id.clone());

                let reconciler = self.reconciler.clone();
                let pass_id = id.clone();
                let handle = self.passes.spawn(async move {
                    let result = reconciler.reconcile(&pass_id).await;
                    (pass_id, result)
                });
                self.tasks.insert(handle.id(), id.clone());
            }
        }
    }
}

async fn recv_failure(
    failures: &mut Option<mpsc::UnboundedReceiver<SyncFailure>>,
) -> Option<SyncFailure> {
    match failures {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
