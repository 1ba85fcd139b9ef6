//! Outcome resolution: turning an execution result into the job's next state.
//!
//! Success completes the job. Failure consumes one attempt and either
//! reschedules the job with an exponential backoff (a future `run_at`, never a
//! sleeping worker) or, once the retry budget is spent, moves it to the dead
//! letter queue.

use chrono::{DateTime, Utc};

use crate::backoff::{Exponential, Strategy};
use crate::config::QueueConfig;
use crate::job::{Job, JobId, JobState};
use crate::runner::ExecutionOutcome;
use crate::store::{QueueDocument, Store, StoreError};

/// What resolving an execution did to the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    /// Failed with budget remaining; runnable again at the given instant.
    Retrying { run_at: DateTime<Utc> },
    /// Budget exhausted; the job now sits in the dead letter queue.
    Dead,
    /// The claim no longer belonged to the resolving worker (reclaimed or
    /// resolved elsewhere); the result was dropped.
    Lost,
}

/// Applies the retry/DLQ policy for a job the worker executed.
///
/// Runs under the store lock and re-validates ownership first: state changes
/// are only applied if the persisted job still carries the claim token the
/// worker was handed, which guards against a reclaim racing a slow resolver.
pub(crate) async fn resolve<S: Store>(
    store: &S,
    claimed: &Job,
    outcome: &ExecutionOutcome,
    config: &QueueConfig,
) -> Result<Resolution, StoreError> {
    let _guard = store.lock().await?;
    let mut doc = store.load_queue().await?;
    let now = Utc::now();

    let resolution = resolve_in(&mut doc, claimed, outcome, config, now);
    if resolution != Resolution::Lost {
        store.save_queue(&doc).await?;
    }
    Ok(resolution)
}

fn resolve_in(
    doc: &mut QueueDocument,
    claimed: &Job,
    outcome: &ExecutionOutcome,
    config: &QueueConfig,
    now: DateTime<Utc>,
) -> Resolution {
    let Some(current) = doc.jobs.iter_mut().find(|job| job.id == claimed.id) else {
        tracing::warn!(job_id = %claimed.id, "job vanished before resolution, dropping result");
        return Resolution::Lost;
    };
    if current.state != JobState::Processing
        || claimed.claim_token.is_none()
        || current.claim_token != claimed.claim_token
    {
        tracing::warn!(job_id = %claimed.id, "job was reclaimed before resolution, dropping result");
        return Resolution::Lost;
    }

    if outcome.is_success() {
        current.mark_completed(now);
        tracing::debug!(job_id = %claimed.id, "job complete");
        Resolution::Completed
    } else {
        fail_job(doc, &claimed.id, &outcome.to_string(), config, now)
    }
}

/// Consumes one attempt for a failed run: back to `pending` with a scheduled
/// backoff while the budget lasts, otherwise into the DLQ.
///
/// Shared by the resolver and the abandoned-claim reaper, so the caller is
/// expected to hold the store lock.
pub(crate) fn fail_job(
    doc: &mut QueueDocument,
    id: &JobId,
    error: &str,
    config: &QueueConfig,
    now: DateTime<Utc>,
) -> Resolution {
    let Some(index) = doc.jobs.iter().position(|job| &job.id == id) else {
        return Resolution::Lost;
    };

    let job = &mut doc.jobs[index];
    job.attempts += 1;
    if job.attempts <= job.max_retries {
        let delay = Exponential::new(config.backoff_base).backoff(job.attempts);
        let run_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        job.mark_retryable(run_at, error, now);
        tracing::warn!(
            job_id = %id,
            attempts = job.attempts,
            max_retries = job.max_retries,
            %run_at,
            "job failed, retrying: {error}",
        );
        Resolution::Retrying { run_at }
    } else {
        job.mark_dead(error, now);
        tracing::error!(
            job_id = %id,
            attempts = job.attempts,
            "job failed permanently, moving to the dead letter queue: {error}",
        );
        let dead = doc.jobs.remove(index);
        doc.dlq.push(dead);
        Resolution::Dead
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use uuid::Uuid;

    use super::*;
    use crate::claim;
    use crate::job::builder::JobBuilder;
    use crate::store::MemoryStore;

    fn failure() -> ExecutionOutcome {
        ExecutionOutcome::Completed { code: 1 }
    }

    fn success() -> ExecutionOutcome {
        ExecutionOutcome::Completed { code: 0 }
    }

    async fn enqueue_and_claim(store: &MemoryStore, max_retries: u32) -> Job {
        let job = JobBuilder::default()
            .with_command("true")
            .with_max_retries(max_retries)
            .build(&QueueConfig::default(), Utc::now())
            .unwrap();
        let mut doc = store.load_queue().await.unwrap();
        doc.jobs.push(job);
        store.save_queue(&doc).await.unwrap();
        claim::claim_next(store, "w", &QueueConfig::default())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn success_completes_and_clears_the_claim() {
        let store = MemoryStore::new();
        let claimed = enqueue_and_claim(&store, 3).await;

        let resolution = resolve(&store, &claimed, &success(), &QueueConfig::default())
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Completed);

        let doc = store.load_queue().await.unwrap();
        let job = doc.job(&claimed.id).unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 0);
        assert!(job.claim_token.is_none());
        assert!(job.claimed_by.is_none());
    }

    #[tokio::test]
    async fn completed_jobs_are_never_reclaimed_or_retried() {
        let store = MemoryStore::new();
        let claimed = enqueue_and_claim(&store, 3).await;
        resolve(&store, &claimed, &success(), &QueueConfig::default())
            .await
            .unwrap();

        let again = claim::claim_next(&store, "w", &QueueConfig::default())
            .await
            .unwrap();
        assert!(again.is_none());

        // A stale resolver reporting a failure afterwards changes nothing.
        let late = resolve(&store, &claimed, &failure(), &QueueConfig::default())
            .await
            .unwrap();
        assert_eq!(late, Resolution::Lost);
        let doc = store.load_queue().await.unwrap();
        assert_eq!(doc.job(&claimed.id).unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn failure_schedules_a_backoff_instead_of_blocking() {
        let store = MemoryStore::new();
        let claimed = enqueue_and_claim(&store, 3).await;
        let before = Utc::now();

        let resolution = resolve(&store, &claimed, &failure(), &QueueConfig::default())
            .await
            .unwrap();
        // First retry of the default base 2 backs off by 2^1 seconds.
        let run_at = assert_matches!(resolution, Resolution::Retrying { run_at } => run_at);
        assert!(run_at >= before + TimeDelta::seconds(2));

        let doc = store.load_queue().await.unwrap();
        let job = doc.job(&claimed.id).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.claim_token.is_none());
        assert!(!job.is_runnable(Utc::now()));
        assert!(job.last_error.is_some());
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_moves_the_job_to_the_dlq() {
        let store = MemoryStore::new();
        let mut config = QueueConfig::default();
        config.backoff_base = 0.0;

        let first = enqueue_and_claim(&store, 2).await;
        let id = first.id.clone();

        // max_retries = 2 allows exactly three attempts.
        let mut claimed = first;
        for expected_attempts in 1..=3u32 {
            let resolution = resolve(&store, &claimed, &failure(), &config).await.unwrap();
            if expected_attempts <= 2 {
                assert_matches!(resolution, Resolution::Retrying { .. });
                claimed = claim::claim_next(&store, "w", &config)
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(claimed.attempts, expected_attempts);
            } else {
                assert_eq!(resolution, Resolution::Dead);
            }
        }

        let doc = store.load_queue().await.unwrap();
        assert!(doc.job(&id).is_none(), "dead job must leave the active set");
        assert_eq!(doc.dlq.len(), 1);
        assert_eq!(doc.dlq[0].id, id);
        assert_eq!(doc.dlq[0].state, JobState::Dead);
        assert_eq!(doc.dlq[0].attempts, 3);

        assert!(claim::claim_next(&store, "w", &config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mismatched_token_drops_the_result() {
        let store = MemoryStore::new();
        let claimed = enqueue_and_claim(&store, 3).await;

        let mut stale = claimed.clone();
        stale.claim_token = Some(Uuid::new_v4());

        let resolution = resolve(&store, &stale, &success(), &QueueConfig::default())
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Lost);

        let doc = store.load_queue().await.unwrap();
        let job = doc.job(&claimed.id).unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.claim_token, claimed.claim_token);
    }

    #[tokio::test]
    async fn timeouts_and_spawn_failures_consume_an_attempt() {
        let store = MemoryStore::new();
        let mut config = QueueConfig::default();
        config.backoff_base = 0.0;

        let claimed = enqueue_and_claim(&store, 3).await;
        resolve(&store, &claimed, &ExecutionOutcome::TimedOut, &config)
            .await
            .unwrap();

        let claimed = claim::claim_next(&store, "w", &config).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 1);

        let spawn_failed = ExecutionOutcome::SpawnFailed {
            message: "sh not found".into(),
        };
        resolve(&store, &claimed, &spawn_failed, &config).await.unwrap();
        let doc = store.load_queue().await.unwrap();
        let job = doc.job(&claimed.id).unwrap();
        assert_eq!(job.attempts, 2);
        assert!(job.last_error.as_deref().unwrap().contains("sh not found"));
    }
}
