//! tidescale-autoscale — utilization-driven node scaling.
//!
//! Compares observed utilization against a policy's target, derives a
//! desired node count, and drives the cluster toward it through a
//! capacity provider, with cooldown windows between actions.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher (resync, triggers, backoff)
//!   └── Reconciler::reconcile(id)
//!         ├── PolicyStore::get → CredentialResolver → ProviderFactory
//!         ├── SyncerRegistry::ensure (one sync loop per identity)
//!         ├── desired_nodes() → decide()
//!         └── persist_status → CapacityProvider::set_cluster_node_count
//! ```
//!
//! # Capacity Algorithm
//!
//! ```text
//! raw     = ceil(utilization * nodes / target)      // or floor
//! if nodes - raw > max_scale_down_nodes:
//!     raw = nodes - max_scale_down_nodes
//! desired = clamp(raw, min_nodes, max_nodes)
//! ```
//!
//! Status is shared by two writers: the reconciler owns `desired_nodes`
//! and `last_scale_time`, the sync loop owns the observed fields. Both
//! write with optimistic versioning and treat a conflict as routine.
//! No scale command is issued until the sync loop has observed the
//! cluster at least once.

pub mod backend;
pub mod calculator;
pub mod clock;
pub mod decision;
pub mod dispatcher;
pub mod error;
pub mod provider;
pub mod reconciler;
pub mod retry;
pub mod store;
pub mod syncer;

pub use backend::StoreBackend;
pub use calculator::{desired_nodes, CapacityInput};
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{decide, Cooldowns, Direction, ScaleDecision};
pub use dispatcher::{backoff_delay, Dispatcher, Trigger};
pub use error::{CredentialError, ProviderError, ReconcileError, StoreError, SyncError};
pub use provider::{CapacityProvider, MetricsProvider, ProviderClients, ProviderFactory};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use retry::{persist_status, write_with_retry, Disposition, RetryPolicy, WriteOutcome};
pub use store::{CredentialResolver, PolicyStore};
pub use syncer::{SyncFailure, SyncSettings, SyncerRegistry};
