use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use thiserror::Error;

use super::{Job, JobId, JobState};
use crate::config::QueueConfig;

/// Reasons a job spec is rejected at enqueue time.
#[derive(Debug, Error)]
pub enum JobSpecError {
    #[error("job spec is missing a command")]
    MissingCommand,
    #[error("job timeout must be a positive number of seconds, got {0}")]
    InvalidTimeout(f64),
    #[error("job id {0} already exists in the queue")]
    DuplicateId(JobId),
    #[error("malformed job spec: {0}")]
    Malformed(String),
}

/// Raw producer payload, as accepted over the CLI or from a spec file.
///
/// Everything except `command` is optional and defaults per the queue
/// configuration. `run_at` is admitted as an arbitrary string; scheduling
/// treats an unparseable value as immediately runnable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSpec {
    pub id: Option<String>,
    pub command: Option<String>,
    pub max_retries: Option<u32>,
    pub timeout: Option<f64>,
    pub priority: Option<i64>,
    pub run_at: Option<String>,
}

/// Builder for enqueuing a job.
pub struct JobBuilder {
    id: Option<JobId>,
    command: Option<String>,
    max_retries: Option<u32>,
    timeout: Option<f64>,
    priority: i64,
    run_at: Option<String>,
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self {
            id: None,
            command: None,
            max_retries: None,
            timeout: None,
            priority: 0,
            run_at: None,
        }
    }
}

impl JobBuilder {
    pub fn with_id(self, id: impl Into<JobId>) -> Self {
        Self {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn with_command(self, command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..self
        }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..self
        }
    }

    /// Execution time limit for a single attempt, in seconds.
    pub fn with_timeout(self, seconds: f64) -> Self {
        Self {
            timeout: Some(seconds),
            ..self
        }
    }

    pub fn with_priority(self, priority: i64) -> Self {
        Self { priority, ..self }
    }

    pub fn schedule_at(self, run_at: DateTime<Utc>) -> Self {
        Self {
            run_at: Some(run_at.to_rfc3339()),
            ..self
        }
    }

    pub fn schedule_in(self, delay: TimeDelta) -> Self {
        self.schedule_at(Utc::now() + delay)
    }

    pub(crate) fn from_spec(spec: JobSpec) -> Self {
        Self {
            id: spec.id.map(JobId::from),
            command: spec.command,
            max_retries: spec.max_retries,
            timeout: spec.timeout,
            priority: spec.priority.unwrap_or(0),
            run_at: spec.run_at,
        }
    }

    /// Validates the spec and produces a pending job, filling unset fields
    /// from `defaults`.
    pub fn build(self, defaults: &QueueConfig, now: DateTime<Utc>) -> Result<Job, JobSpecError> {
        let command = match self.command {
            Some(command) if !command.trim().is_empty() => command,
            _ => return Err(JobSpecError::MissingCommand),
        };
        if let Some(timeout) = self.timeout {
            if !timeout.is_finite() || timeout <= 0.0 {
                return Err(JobSpecError::InvalidTimeout(timeout));
            }
        }

        Ok(Job {
            id: self.id.unwrap_or_else(JobId::generate),
            command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            timeout: self.timeout,
            priority: self.priority,
            run_at: self.run_at,
            created_at: now,
            updated_at: now,
            claimed_by: None,
            claim_token: None,
            claimed_at: None,
            last_error: None,
        })
    }
}
