//! Durable persistence for the queue and configuration documents.
//!
//! The store is the single source of truth shared by every worker process.
//! Mutations follow a lock-load-modify-save cycle: [`Store::lock`] returns an
//! RAII guard for the store-wide critical section, and nothing may write
//! either document without holding it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigDocument;
use crate::job::{Job, JobId};

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

/// The persisted queue document: the active job set and the dead letter queue,
/// both as flat ordered lists (list order is enqueue order).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueDocument {
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub dlq: Vec<Job>,
}

impl QueueDocument {
    /// Id uniqueness spans both the active set and the DLQ.
    pub fn contains_id(&self, id: &JobId) -> bool {
        self.jobs
            .iter()
            .chain(self.dlq.iter())
            .any(|job| &job.id == id)
    }

    pub fn job(&self, id: &JobId) -> Option<&Job> {
        self.jobs.iter().find(|job| &job.id == id)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error accessing the store: {0}")]
    Io(#[from] std::io::Error),
    #[error("error encoding document: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("store lock contended: not acquired within {0:?}")]
    LockContended(std::time::Duration),
    #[error("store in bad state")]
    BadState,
}

/// A durable, crash-safe document store.
///
/// Loading a missing or corrupted document yields a fresh default (which is
/// persisted) rather than failing the caller, and saves are atomic with
/// respect to partial writes. Implementations hold no state that outlives a
/// single operation: every load observes whatever the last save left behind,
/// from any process.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// RAII guard for the store-wide critical section. Dropping it releases
    /// the store to other workers.
    type Guard: Send;

    /// Acquires the critical section shared by all workers of this store.
    ///
    /// Acquisition is bounded: contention past the implementation's deadline
    /// surfaces as [`StoreError::LockContended`], which callers recover from
    /// by retrying.
    async fn lock(&self) -> Result<Self::Guard, StoreError>;

    async fn load_queue(&self) -> Result<QueueDocument, StoreError>;

    async fn save_queue(&self, doc: &QueueDocument) -> Result<(), StoreError>;

    async fn load_config(&self) -> Result<ConfigDocument, StoreError>;

    async fn save_config(&self, doc: &ConfigDocument) -> Result<(), StoreError>;
}
