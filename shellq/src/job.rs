use std::cmp::Ordering;
use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod builder;

/// Opaque job identifier.
///
/// Producers may supply their own; otherwise one is generated at enqueue time.
/// Unique across the active set and the dead letter queue at any instant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// Transitions:
/// - `Pending -> Processing` via a successful claim
/// - `Processing -> Completed` on a zero exit status
/// - `Processing -> Pending` on failure with retry budget remaining
/// - `Processing -> Dead` on failure with the budget exhausted
/// - `Dead -> Pending` via an explicit DLQ retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Dead,
}

impl JobState {
    /// Is this a terminal state (no further transitions without operator action)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "dead" => Ok(JobState::Dead),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A unit of work: one shell command with its scheduling and retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub timeout: Option<f64>,
    pub priority: i64,
    /// Earliest instant the job may run, as an RFC 3339 string.
    ///
    /// Kept as the raw string: a value that does not parse schedules the job
    /// as immediately runnable rather than wedging it (see [`Job::is_runnable`]).
    pub run_at: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    #[serde(default)]
    pub claim_token: Option<Uuid>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Job {
    /// A job is runnable iff it is pending and its scheduled time, if any, has
    /// passed. An unparseable `run_at` counts as "always runnable".
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        if self.state != JobState::Pending {
            return false;
        }
        match self.run_at.as_deref() {
            None => true,
            Some(raw) => match parse_run_at(raw) {
                Some(at) => at <= now,
                None => true,
            },
        }
    }

    /// Per-attempt execution time limit, when one is set and sane.
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Total order used by the claim scan: highest priority first, then oldest
    /// first. Stable-sorting the stored list with this comparator yields FIFO
    /// within a priority band.
    pub fn claim_order(a: &Job, b: &Job) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    }

    pub(crate) fn mark_processing(&mut self, worker: &str, token: Uuid, now: DateTime<Utc>) {
        self.state = JobState::Processing;
        self.claimed_by = Some(worker.to_owned());
        self.claim_token = Some(token);
        self.claimed_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.clear_claim();
        self.updated_at = now;
    }

    pub(crate) fn mark_retryable(
        &mut self,
        run_at: DateTime<Utc>,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.state = JobState::Pending;
        self.run_at = Some(run_at.to_rfc3339());
        self.last_error = Some(error.into());
        self.clear_claim();
        self.updated_at = now;
    }

    pub(crate) fn mark_dead(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.state = JobState::Dead;
        self.last_error = Some(error.into());
        self.clear_claim();
        self.updated_at = now;
    }

    pub(crate) fn mark_requeued(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.attempts = 0;
        self.run_at = None;
        self.clear_claim();
        self.updated_at = now;
    }

    fn clear_claim(&mut self) {
        self.claimed_by = None;
        self.claim_token = None;
        self.claimed_at = None;
    }
}

pub(crate) fn parse_run_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::config::QueueConfig;
    use crate::job::builder::JobBuilder;

    fn pending_job(command: &str) -> Job {
        JobBuilder::default()
            .with_command(command)
            .build(&QueueConfig::default(), Utc::now())
            .unwrap()
    }

    #[test]
    fn job_without_run_at_is_runnable() {
        let job = pending_job("true");
        assert!(job.is_runnable(Utc::now()));
    }

    #[test]
    fn job_with_future_run_at_is_not_runnable_until_due() {
        let now = Utc::now();
        let mut job = pending_job("true");
        job.run_at = Some((now + TimeDelta::hours(1)).to_rfc3339());

        assert!(!job.is_runnable(now));
        assert!(job.is_runnable(now + TimeDelta::hours(2)));
    }

    #[test]
    fn unparseable_run_at_fails_open() {
        let mut job = pending_job("true");
        job.run_at = Some("not a timestamp".to_owned());
        assert!(job.is_runnable(Utc::now()));
    }

    #[test]
    fn non_pending_jobs_are_never_runnable() {
        let now = Utc::now();
        for state in [JobState::Processing, JobState::Completed, JobState::Dead] {
            let mut job = pending_job("true");
            job.state = state;
            assert!(!job.is_runnable(now), "{state} should not be runnable");
        }
    }

    #[test]
    fn claim_order_prefers_priority_then_age() {
        let now = Utc::now();
        let mut low_old = pending_job("a");
        low_old.priority = 1;
        low_old.created_at = now - TimeDelta::minutes(10);
        let mut high = pending_job("b");
        high.priority = 5;
        high.created_at = now;
        let mut low_new = pending_job("c");
        low_new.priority = 1;
        low_new.created_at = now;

        let mut jobs = vec![low_new.clone(), high.clone(), low_old.clone()];
        jobs.sort_by(Job::claim_order);

        let ids: Vec<_> = jobs.iter().map(|job| job.id.clone()).collect();
        assert_eq!(ids, vec![high.id, low_old.id, low_new.id]);
    }

    #[test]
    fn mark_processing_sets_claim_metadata() {
        let now = Utc::now();
        let mut job = pending_job("true");
        let token = Uuid::new_v4();
        job.mark_processing("worker-1", token, now);

        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.claimed_by.as_deref(), Some("worker-1"));
        assert_eq!(job.claim_token, Some(token));
        assert_eq!(job.claimed_at, Some(now));
    }

    #[test]
    fn terminal_marks_clear_claim_metadata() {
        let now = Utc::now();
        let mut job = pending_job("true");
        job.mark_processing("worker-1", Uuid::new_v4(), now);
        job.mark_completed(now);

        assert_eq!(job.state, JobState::Completed);
        assert!(job.claimed_by.is_none());
        assert!(job.claim_token.is_none());
        assert!(job.claimed_at.is_none());
    }

    #[test]
    fn mark_requeued_resets_attempts_and_schedule() {
        let now = Utc::now();
        let mut job = pending_job("true");
        job.attempts = 4;
        job.run_at = Some(now.to_rfc3339());
        job.mark_dead("boom", now);

        job.mark_requeued(now);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.run_at.is_none());
    }

    #[test]
    fn state_serializes_lowercase() {
        let job = pending_job("true");
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["state"], "pending");

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back.state, JobState::Pending);
        assert_eq!(back.id, job.id);
    }

    #[test]
    fn timeout_duration_rejects_nonsense() {
        let mut job = pending_job("true");
        assert!(job.timeout_duration().is_none());
        job.timeout = Some(0.0);
        assert!(job.timeout_duration().is_none());
        job.timeout = Some(f64::NAN);
        assert!(job.timeout_duration().is_none());
        job.timeout = Some(1.5);
        assert_eq!(job.timeout_duration(), Some(Duration::from_millis(1500)));
    }
}
