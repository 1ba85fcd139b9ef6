//! JSON-file implementation of [`Store`].
//!
//! Documents live under a data directory shared by every process working the
//! queue: `jobs.json`, `config.json`, and a `jobs.lock` lockfile providing the
//! cross-process critical section.
//!
//! Saves are crash-safe: the document is serialized to a temp file in the same
//! directory, fsynced, and atomically renamed over the target, so a process
//! dying mid-write can never leave a document that fails to parse.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use super::{QueueDocument, Store, StoreError};
use crate::config::{ConfigDocument, QueueConfig};

const JOBS_FILE: &str = "jobs.json";
const CONFIG_FILE: &str = "config.json";
const LOCK_FILE: &str = "jobs.lock";

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(25);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// Critical sections are sub-second; a lockfile this old belongs to a dead
/// process and is safe to break.
const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

/// [`Store`] backed by JSON documents in a shared directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    data_dir: PathBuf,
    lock_timeout: Duration,
    lock_stale_after: Duration,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
        }
    }

    /// How long [`Store::lock`] waits before reporting contention.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Age past which another process's lockfile is considered abandoned.
    pub fn with_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.lock_stale_after = stale_after;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn jobs_path(&self) -> PathBuf {
        self.data_dir.join(JOBS_FILE)
    }

    fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE)
    }

    /// Loads a document, recovering a missing or corrupt file by persisting
    /// and returning `default` instead of failing the caller.
    fn load_or_init<T>(&self, path: &Path, default: impl FnOnce() -> T) -> Result<T, StoreError>
    where
        T: Serialize + DeserializeOwned,
    {
        fs::create_dir_all(&self.data_dir)?;
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(doc) => Ok(doc),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        %err,
                        "unreadable document, resetting to a fresh default",
                    );
                    let doc = default();
                    self.atomic_save(path, &doc)?;
                    Ok(doc)
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                let doc = default();
                self.atomic_save(path, &doc)?;
                Ok(doc)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn atomic_save<T: Serialize>(&self, path: &Path, doc: &T) -> Result<(), StoreError> {
        fs::create_dir_all(&self.data_dir)?;
        let temp = NamedTempFile::new_in(&self.data_dir)?;
        serde_json::to_writer_pretty(temp.as_file(), doc)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|err| err.error)?;
        Ok(())
    }
}

/// Owner metadata written into the lockfile, for diagnostics when a lock is
/// found held.
#[derive(Debug, Serialize)]
struct LockOwner {
    pid: u32,
    acquired_at: chrono::DateTime<Utc>,
}

/// Holds `jobs.lock`; dropping it releases the critical section.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::error!(path = %self.path.display(), %err, "failed to release store lock");
        }
    }
}

#[async_trait]
impl Store for FileStore {
    type Guard = FileLockGuard;

    async fn lock(&self) -> Result<FileLockGuard, StoreError> {
        fs::create_dir_all(&self.data_dir)?;
        let path = self.lock_path();
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let owner = LockOwner {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    if let Ok(payload) = serde_json::to_vec(&owner) {
                        let _ = file.write_all(&payload);
                    }
                    return Ok(FileLockGuard { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if lock_age(&path).is_some_and(|age| age >= self.lock_stale_after) {
                        tracing::warn!(
                            path = %path.display(),
                            "breaking stale store lock left by a dead process",
                        );
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= self.lock_timeout {
                        return Err(StoreError::LockContended(self.lock_timeout));
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn load_queue(&self) -> Result<QueueDocument, StoreError> {
        self.load_or_init(&self.jobs_path(), QueueDocument::default)
    }

    async fn save_queue(&self, doc: &QueueDocument) -> Result<(), StoreError> {
        self.atomic_save(&self.jobs_path(), doc)
    }

    async fn load_config(&self) -> Result<ConfigDocument, StoreError> {
        self.load_or_init(&self.config_path(), QueueConfig::default_document)
    }

    async fn save_config(&self, doc: &ConfigDocument) -> Result<(), StoreError> {
        self.atomic_save(&self.config_path(), doc)
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
}
