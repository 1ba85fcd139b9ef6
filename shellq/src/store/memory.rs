//! Provides an in memory implementation of [`Store`].
//!
//! Currently this is provided for testing purposes and not designed for use in
//! a production system: it is a correct implementation of the store contract
//! within a single process, which is exactly what the lifecycle tests need.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{QueueDocument, Store, StoreError};
use crate::config::{ConfigDocument, QueueConfig};

/// An in memory implementation of [`Store`].
///
/// Cloning shares the underlying documents, so one instance can stand in for
/// the shared data directory across any number of concurrent test workers.
#[derive(Clone)]
pub struct MemoryStore {
    guard: Arc<Mutex<()>>,
    queue: Arc<RwLock<QueueDocument>>,
    config: Arc<RwLock<ConfigDocument>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            guard: Arc::new(Mutex::new(())),
            queue: Arc::new(RwLock::new(QueueDocument::default())),
            config: Arc::new(RwLock::new(QueueConfig::default_document())),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Guard = OwnedMutexGuard<()>;

    async fn lock(&self) -> Result<Self::Guard, StoreError> {
        Ok(self.guard.clone().lock_owned().await)
    }

    async fn load_queue(&self) -> Result<QueueDocument, StoreError> {
        Ok(self
            .queue
            .read()
            .map_err(|_| StoreError::BadState)?
            .clone())
    }

    async fn save_queue(&self, doc: &QueueDocument) -> Result<(), StoreError> {
        *self.queue.write().map_err(|_| StoreError::BadState)? = doc.clone();
        Ok(())
    }

    async fn load_config(&self) -> Result<ConfigDocument, StoreError> {
        Ok(self
            .config
            .read()
            .map_err(|_| StoreError::BadState)?
            .clone())
    }

    async fn save_config(&self, doc: &ConfigDocument) -> Result<(), StoreError> {
        *self.config.write().map_err(|_| StoreError::BadState)? = doc.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::job::builder::JobBuilder;

    #[tokio::test]
    async fn clones_share_the_documents() {
        let store = MemoryStore::new();
        let other = store.clone();

        let job = JobBuilder::default()
            .with_command("true")
            .build(&QueueConfig::default(), Utc::now())
            .unwrap();
        let mut doc = store.load_queue().await.unwrap();
        doc.jobs.push(job.clone());
        store.save_queue(&doc).await.unwrap();

        let seen = other.load_queue().await.unwrap();
        assert_eq!(seen.jobs.len(), 1);
        assert_eq!(seen.jobs[0].id, job.id);
    }

    #[tokio::test]
    async fn guard_serializes_critical_sections() {
        let store = MemoryStore::new();
        let guard = store.lock().await.unwrap();

        let contender = {
            let store = store.clone();
            tokio::spawn(async move { store.lock().await.map(drop) })
        };
        // The contender cannot finish while the guard is held.
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn starts_with_default_config_document() {
        let store = MemoryStore::new();
        let config = QueueConfig::from_document(&store.load_config().await.unwrap());
        assert_eq!(config, QueueConfig::default());
    }
}
