//! Execution of job commands, behind a seam the worker loop does not look
//! through: a runner takes a command string and an optional timeout and
//! reports what happened as data. Nothing a command does can crash a worker.

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Sentinel exit code reported for timeouts, spawn failures, and processes
/// killed by a signal.
pub const FAILURE_SENTINEL: i32 = -1;

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The command ran to completion with the given exit code.
    Completed { code: i32 },
    /// The command outlived its timeout and was killed.
    TimedOut,
    /// The command never started.
    SpawnFailed { message: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { code: 0 })
    }

    pub fn code(&self) -> i32 {
        match self {
            ExecutionOutcome::Completed { code } => *code,
            _ => FAILURE_SENTINEL,
        }
    }
}

impl Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionOutcome::Completed { code } => write!(f, "exited with code {code}"),
            ExecutionOutcome::TimedOut => write!(f, "timed out"),
            ExecutionOutcome::SpawnFailed { message } => write!(f, "failed to spawn: {message}"),
        }
    }
}

/// Executes job commands.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, command: &str, timeout: Option<Duration>) -> ExecutionOutcome;
}

/// Runs commands through `sh -c`, inheriting the worker's stdio.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

#[async_trait]
impl Runner for ShellRunner {
    async fn run(&self, command: &str, timeout: Option<Duration>) -> ExecutionOutcome {
        let mut child = match Command::new("sh").arg("-c").arg(command).spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(%err, "failed to spawn job command");
                return ExecutionOutcome::SpawnFailed {
                    message: err.to_string(),
                };
            }
        };

        let waited = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited,
                Err(_elapsed) => {
                    tracing::warn!(?limit, "job command timed out, killing it");
                    if let Err(err) = child.kill().await {
                        tracing::error!(%err, "failed to kill timed out job command");
                    }
                    return ExecutionOutcome::TimedOut;
                }
            },
            None => child.wait().await,
        };

        match waited {
            Ok(status) => ExecutionOutcome::Completed {
                code: status.code().unwrap_or(FAILURE_SENTINEL),
            },
            Err(err) => ExecutionOutcome::SpawnFailed {
                message: err.to_string(),
            },
        }
    }
}
