//! The queue handle: producer, operator, and worker entry points over a store.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use serde_json::Value;

use crate::claim;
use crate::config::{self, ConfigDocument, QueueConfig};
use crate::job::builder::{JobBuilder, JobSpec, JobSpecError};
use crate::job::{Job, JobId, JobState};
use crate::policy::{self, Resolution};
use crate::runner::ExecutionOutcome;
use crate::store::{Store, StoreError};
use crate::ShellqError;

/// Counts per state over the active set, plus the DLQ size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub counts: BTreeMap<JobState, usize>,
    pub dead: usize,
}

/// Handle over a shared job queue.
///
/// Cheap to clone; every operation goes back to the store, so handles in
/// different processes observe the same queue.
#[derive(Clone)]
pub struct Queue<S: Store> {
    store: S,
}

impl<S: Store> Queue<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Admits a new pending job, filling unset fields from the current
    /// configuration. The id must be unique across the active set and DLQ.
    pub async fn enqueue(&self, builder: JobBuilder) -> Result<Job, ShellqError> {
        let config = self.current_config().await?;

        let _guard = self.store.lock().await?;
        let mut doc = self.store.load_queue().await?;
        let job = builder.build(&config, Utc::now())?;
        if doc.contains_id(&job.id) {
            return Err(JobSpecError::DuplicateId(job.id).into());
        }
        doc.jobs.push(job.clone());
        self.store.save_queue(&doc).await?;
        tracing::info!(job_id = %job.id, "job enqueued");
        Ok(job)
    }

    /// Admits a job from an inline JSON spec.
    pub async fn enqueue_spec(&self, spec_json: &str) -> Result<Job, ShellqError> {
        let spec: JobSpec = serde_json::from_str(spec_json)
            .map_err(|err| JobSpecError::Malformed(err.to_string()))?;
        self.enqueue(JobBuilder::from_spec(spec)).await
    }

    /// Admits a job from a JSON spec file.
    pub async fn enqueue_from_source(&self, path: &Path) -> Result<Job, ShellqError> {
        let raw = std::fs::read_to_string(path)?;
        self.enqueue_spec(&raw).await
    }

    pub async fn status(&self, filter: Option<JobState>) -> Result<StatusReport, ShellqError> {
        let doc = self.store.load_queue().await?;
        let mut counts = BTreeMap::new();
        for job in &doc.jobs {
            if filter.is_some_and(|state| state != job.state) {
                continue;
            }
            *counts.entry(job.state).or_insert(0) += 1;
        }
        Ok(StatusReport {
            counts,
            dead: doc.dlq.len(),
        })
    }

    pub async fn dlq_list(&self) -> Result<Vec<Job>, ShellqError> {
        Ok(self.store.load_queue().await?.dlq)
    }

    /// Gives a dead job a fresh start: back to `pending` with a zeroed attempt
    /// count and no schedule, appended to the active set.
    pub async fn dlq_retry(&self, id: &JobId) -> Result<Job, ShellqError> {
        let _guard = self.store.lock().await?;
        let mut doc = self.store.load_queue().await?;
        let Some(index) = doc.dlq.iter().position(|job| &job.id == id) else {
            return Err(ShellqError::DlqJobNotFound(id.clone()));
        };
        let mut job = doc.dlq.remove(index);
        job.mark_requeued(Utc::now());
        doc.jobs.push(job.clone());
        self.store.save_queue(&doc).await?;
        tracing::info!(job_id = %id, "job requeued from the dead letter queue");
        Ok(job)
    }

    /// The typed tunables, read fresh from the store.
    pub async fn current_config(&self) -> Result<QueueConfig, StoreError> {
        Ok(QueueConfig::from_document(&self.store.load_config().await?))
    }

    /// The raw configuration document.
    pub async fn config_document(&self) -> Result<ConfigDocument, ShellqError> {
        Ok(self.store.load_config().await?)
    }

    /// Replaces the whole configuration document.
    pub async fn save_config_document(&self, doc: &ConfigDocument) -> Result<(), ShellqError> {
        Ok(self.store.save_config(doc).await?)
    }

    pub async fn config_get(&self, key: &str) -> Result<Option<Value>, ShellqError> {
        Ok(self.store.load_config().await?.get(key).cloned())
    }

    /// Sets a tunable, parsing the raw value as integer, then float, then
    /// string. Takes effect on every worker's next cycle.
    pub async fn config_set(&self, key: &str, raw: &str) -> Result<Value, ShellqError> {
        let value = config::parse_scalar(raw);
        let _guard = self.store.lock().await?;
        let mut doc = self.store.load_config().await?;
        doc.insert(key.to_owned(), value.clone());
        self.store.save_config(&doc).await?;
        tracing::info!(key, %value, "configuration updated");
        Ok(value)
    }

    /// Claims the next runnable job for `worker`; see the claim protocol for
    /// the ordering and reaping rules.
    pub async fn claim(
        &self,
        worker: &str,
        config: &QueueConfig,
    ) -> Result<Option<Job>, StoreError> {
        claim::claim_next(&self.store, worker, config).await
    }

    /// Resolves an executed job through the retry/DLQ policy.
    pub async fn resolve(
        &self,
        claimed: &Job,
        outcome: &ExecutionOutcome,
        config: &QueueConfig,
    ) -> Result<Resolution, StoreError> {
        policy::resolve(&self.store, claimed, outcome, config).await
    }
}
