//! The claim protocol: how N worker processes share one persisted queue
//! without double-executing or losing jobs.
//!
//! A claim is a single critical section under the store lock: load the queue
//! document, reap abandoned claims, pick the first runnable pending job in
//! priority order, mark it `processing` with a fresh claim token, save. Since
//! the whole read-select-mark-write sequence runs under mutual exclusion, at
//! most one worker can observe any given job as claimable, making claims
//! linearizable across processes.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::job::{Job, JobState};
use crate::policy;
use crate::store::{QueueDocument, Store, StoreError};

/// Lock-contention retries before a claim cycle is reported as idle.
const CLAIM_RETRY_LIMIT: u32 = 3;
const CLAIM_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Claims the next runnable job for `worker`, or returns `None` when nothing
/// is claimable. Contention on the store lock is retried a bounded number of
/// times and then treated as an idle cycle rather than an error.
pub(crate) async fn claim_next<S: Store>(
    store: &S,
    worker: &str,
    config: &QueueConfig,
) -> Result<Option<Job>, StoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_claim(store, worker, config).await {
            Err(StoreError::LockContended(_)) if attempt < CLAIM_RETRY_LIMIT => {
                tracing::debug!(worker, attempt, "store lock contended, retrying claim");
                tokio::time::sleep(CLAIM_RETRY_DELAY).await;
            }
            Err(StoreError::LockContended(_)) => {
                tracing::debug!(worker, "store lock contended, treating cycle as idle");
                return Ok(None);
            }
            other => return other,
        }
    }
}

async fn try_claim<S: Store>(
    store: &S,
    worker: &str,
    config: &QueueConfig,
) -> Result<Option<Job>, StoreError> {
    let _guard = store.lock().await?;
    let mut doc = store.load_queue().await?;
    let now = Utc::now();

    let reaped = reap_abandoned(&mut doc, config, now);
    let claimed = select_and_mark(&mut doc, worker, now);
    if reaped > 0 || claimed.is_some() {
        store.save_queue(&doc).await?;
    }
    Ok(claimed)
}

/// Marks the first runnable job in claim order as `processing` and returns a
/// snapshot of it, token included.
pub(crate) fn select_and_mark(
    doc: &mut QueueDocument,
    worker: &str,
    now: DateTime<Utc>,
) -> Option<Job> {
    let mut runnable: Vec<&mut Job> = doc
        .jobs
        .iter_mut()
        .filter(|job| job.is_runnable(now))
        .collect();
    runnable.sort_by(|a, b| Job::claim_order(a, b));

    let job = runnable.into_iter().next()?;
    job.mark_processing(worker, Uuid::new_v4(), now);
    tracing::debug!(job_id = %job.id, worker, "claimed job");
    Some(job.clone())
}

/// Recovers jobs stuck in `processing` after their owning worker died.
///
/// A claim is abandoned once `claimed_at` plus the job's own timeout (or the
/// configured ceiling) has passed; the job is then put through the normal
/// failure policy, counting the lost run as an attempt. Returns how many jobs
/// were reaped.
pub(crate) fn reap_abandoned(
    doc: &mut QueueDocument,
    config: &QueueConfig,
    now: DateTime<Utc>,
) -> usize {
    let expired: Vec<_> = doc
        .jobs
        .iter()
        .filter(|job| job.state == JobState::Processing && claim_expired(job, config, now))
        .map(|job| job.id.clone())
        .collect();

    for id in &expired {
        tracing::warn!(job_id = %id, "reclaiming abandoned job; counting the lost run as a failed attempt");
        policy::fail_job(
            doc,
            id,
            "claim expired; owning worker presumed dead",
            config,
            now,
        );
    }
    expired.len()
}

fn claim_expired(job: &Job, config: &QueueConfig, now: DateTime<Utc>) -> bool {
    // A processing job without claim metadata was written by something that
    // violated the claim invariant; reclaim it immediately.
    let Some(claimed_at) = job.claimed_at else {
        return true;
    };
    let ceiling = job.timeout_duration().unwrap_or_else(|| config.claim_timeout());
    let ceiling = TimeDelta::from_std(ceiling).unwrap_or(TimeDelta::MAX);
    claimed_at
        .checked_add_signed(ceiling)
        .map_or(false, |deadline| now >= deadline)
}
