//! A durable, multi-process job queue for shell commands.
//!
//! Producers enqueue commands with a priority, an optional schedule, a timeout
//! and a retry budget. Any number of independent worker processes share one
//! persisted queue through a claim protocol that guarantees no job is ever
//! owned by two workers at once; failed jobs retry with exponential backoff
//! until their budget is spent and they land in the dead letter queue.
//!
//! Execution is at-least-once: a worker dying mid-job leaves the job
//! reclaimable, so jobs should be idempotent.
//!
//! ```no_run
//! # use shellq::{FileStore, JobBuilder, Queue, ShellRunner, Worker};
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let queue = Queue::new(FileStore::new("data"));
//!
//! queue
//!     .enqueue(JobBuilder::default().with_command("echo hello").with_priority(5))
//!     .await?;
//!
//! Worker::new(queue, ShellRunner).run().await;
//! # Ok::<(), shellq::ShellqError>(())
//! # });
//! ```

use thiserror::Error;

pub mod backoff;
mod claim;
pub mod config;
pub mod job;
pub mod policy;
pub mod queue;
pub mod runner;
pub mod store;
pub mod worker;

pub use job::builder::{JobBuilder, JobSpecError};
pub use job::{Job, JobId, JobState};
pub use queue::{Queue, StatusReport};
pub use runner::{ExecutionOutcome, Runner, ShellRunner};
pub use store::{FileStore, MemoryStore, Store, StoreError};
pub use worker::Worker;

#[derive(Debug, Error)]
pub enum ShellqError {
    #[error("storage error: {0}")]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    JobSpec(#[from] job::builder::JobSpecError),
    #[error("job {0} not found in the dead letter queue")]
    DlqJobNotFound(JobId),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
