//! Optimistic-concurrency retry, shared by the reconciler and the syncer.
//!
//! [`write_with_retry`] runs a write, classifies each failure, and retries
//! only conflicts. [`persist_status`] builds on it for status writes: each
//! attempt applies the caller's field group onto a record and writes it
//! back at that record's version.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

use tidescale_core::{AutoscaleStatus, PolicyRecord, ResourceId};

use crate::error::StoreError;
use crate::store::PolicyStore;

/// How a failed write should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stale version; a fresh attempt may succeed.
    Conflict,
    /// The target is gone; stop writing to it.
    NotFound,
    /// Anything else; surface to the caller.
    Fatal,
}

/// Terminal result of a retried write that did not fail fatally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome<T> {
    Written(T),
    /// Every attempt hit a conflict.
    Conflicted,
    /// The target no longer exists.
    Gone,
}

/// Attempt budget for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub attempts: u32,
    /// Pause between attempts, multiplied by the attempt number.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// A single attempt: conflicts are reported, never retried inline.
    pub const ONCE: RetryPolicy = RetryPolicy {
        attempts: 1,
        backoff: Duration::ZERO,
    };

    /// `attempts` tries with the default pause between them.
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts,
            backoff: INLINE_BACKOFF,
        }
    }
}

/// Base pause between inline write attempts.
pub const INLINE_BACKOFF: Duration = Duration::from_millis(50);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::ONCE
    }
}

/// Run `op` until it succeeds, fails non-retryably, or the budget is spent.
pub async fn write_with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    mut op: F,
    classify: C,
) -> Result<WriteOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> Disposition,
{
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        let err = match op().await {
            Ok(value) => return Ok(WriteOutcome::Written(value)),
            Err(err) => err,
        };
        match classify(&err) {
            Disposition::NotFound => return Ok(WriteOutcome::Gone),
            Disposition::Fatal => return Err(err),
            Disposition::Conflict if attempt == attempts => break,
            Disposition::Conflict => {
                debug!(attempt, attempts, "write conflicted, retrying");
                if !policy.backoff.is_zero() {
                    tokio::time::sleep(policy.backoff * attempt).await;
                }
            }
        }
    }
    Ok(WriteOutcome::Conflicted)
}

/// Write one field group of a record's status.
///
/// The first attempt applies `apply` onto `base` (the record the caller
/// computed from) so a concurrent write surfaces as a conflict. Later
/// attempts re-read the record and apply onto the fresh status. With no
/// `base`, every attempt starts from a fresh read.
pub async fn persist_status<A>(
    store: &dyn PolicyStore,
    id: &ResourceId,
    base: Option<&PolicyRecord>,
    policy: &RetryPolicy,
    apply: A,
) -> Result<WriteOutcome<u64>, StoreError>
where
    A: Fn(&mut AutoscaleStatus),
{
    let first = AtomicBool::new(true);
    let (first, apply) = (&first, &apply);

    write_with_retry(
        policy,
        move || async move {
            let seeded = if first.swap(false, Ordering::SeqCst) { base } else { None };
            let (mut status, version) = match seeded {
                Some(record) => (record.status.clone(), record.version),
                None => {
                    let record = store.get(id).await?;
                    (record.status, record.version)
                }
            };
            apply(&mut status);
            store.update_status(id, &status, version).await
        },
        StoreError::disposition,
    )
    .await
}
