//! The per-process worker loop: claim, execute, resolve, repeat, until the
//! queue stays empty long enough to exit.

use std::time::Duration;

use crate::config::QueueConfig;
use crate::policy::Resolution;
use crate::queue::Queue;
use crate::runner::Runner;
use crate::store::Store;

/// One worker process's scheduling loop.
///
/// Workers share nothing but the store; any number can run this loop
/// concurrently against the same data directory. Configuration is reloaded
/// from the store every cycle and again before resolving, so operators can
/// change tunables without restarting workers.
pub struct Worker<S: Store, R: Runner> {
    queue: Queue<S>,
    runner: R,
    name: String,
    poll_interval: Duration,
}

impl<S: Store, R: Runner> Worker<S, R> {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

    pub fn new(queue: Queue<S>, runner: R) -> Self {
        Self {
            queue,
            runner,
            name: format!("worker-{}", std::process::id()),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    /// Identity recorded as `claimed_by` on jobs this worker owns.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Runs until more than `worker_idle_cycles` consecutive polls claim
    /// nothing, then returns cleanly.
    ///
    /// Nothing inside the loop is fatal: execution failures feed the retry
    /// policy, and store errors are logged and counted as idle cycles so even
    /// a permanently broken store ends in a clean exit rather than a crash.
    pub async fn run(&self) {
        tracing::info!(worker = %self.name, "worker started");
        let mut idle_cycles: u32 = 0;
        loop {
            let config = self.load_config().await;
            match self.queue.claim(&self.name, &config).await {
                Ok(Some(job)) => {
                    idle_cycles = 0;
                    tracing::info!(
                        worker = %self.name,
                        job_id = %job.id,
                        attempt = job.attempts + 1,
                        "executing job: {}",
                        job.command,
                    );
                    let outcome = self.runner.run(&job.command, job.timeout_duration()).await;

                    // Reload so a mid-flight `config set` applies to this
                    // resolution already.
                    let config = self.load_config().await;
                    match self.queue.resolve(&job, &outcome, &config).await {
                        Ok(Resolution::Completed) => {
                            tracing::info!(worker = %self.name, job_id = %job.id, "job complete")
                        }
                        Ok(Resolution::Retrying { run_at }) => {
                            tracing::info!(worker = %self.name, job_id = %job.id, %run_at, "job will be retried")
                        }
                        Ok(Resolution::Dead) => {
                            tracing::warn!(worker = %self.name, job_id = %job.id, "job moved to the dead letter queue")
                        }
                        Ok(Resolution::Lost) => {
                            tracing::warn!(worker = %self.name, job_id = %job.id, "job was reclaimed, result dropped")
                        }
                        Err(err) => {
                            tracing::error!(worker = %self.name, job_id = %job.id, %err, "failed to persist job resolution")
                        }
                    }
                }
                Ok(None) => {
                    idle_cycles += 1;
                    if idle_cycles > config.worker_idle_cycles {
                        break;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(err) => {
                    tracing::error!(worker = %self.name, %err, "claim failed");
                    idle_cycles += 1;
                    if idle_cycles > config.worker_idle_cycles {
                        break;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
        tracing::info!(worker = %self.name, "no runnable jobs, worker exiting");
    }

    async fn load_config(&self) -> QueueConfig {
        match self.queue.current_config().await {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(worker = %self.name, %err, "failed to load configuration, using defaults");
                QueueConfig::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::job::builder::JobBuilder;
    use crate::job::JobState;
    use crate::runner::ExecutionOutcome;
    use crate::store::MemoryStore;

    /// Runner that replays a script of outcomes, then succeeds.
    #[derive(Clone, Default)]
    struct ScriptedRunner {
        outcomes: Arc<Mutex<VecDeque<ExecutionOutcome>>>,
        commands: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn failing_times(count: usize) -> Self {
            let runner = Self::default();
            let mut outcomes = runner.outcomes.lock().unwrap();
            for _ in 0..count {
                outcomes.push_back(ExecutionOutcome::Completed { code: 1 });
            }
            drop(outcomes);
            runner
        }
    }

    #[async_trait]
    impl Runner for ScriptedRunner {
        async fn run(&self, command: &str, _timeout: Option<Duration>) -> ExecutionOutcome {
            self.commands.lock().unwrap().push(command.to_owned());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ExecutionOutcome::Completed { code: 0 })
        }
    }

    fn test_worker(store: &MemoryStore, runner: ScriptedRunner) -> Worker<MemoryStore, ScriptedRunner> {
        Worker::new(Queue::new(store.clone()), runner)
            .with_name("test-worker")
            .with_poll_interval(Duration::ZERO)
    }

    async fn set_config(store: &MemoryStore, key: &str, value: impl Into<serde_json::Value>) {
        let queue = Queue::new(store.clone());
        let mut doc = queue.config_document().await.unwrap();
        doc.insert(key.to_owned(), value.into());
        queue.save_config_document(&doc).await.unwrap();
    }

    #[tokio::test]
    async fn idle_worker_exits_cleanly() {
        let store = MemoryStore::new();
        set_config(&store, "worker_idle_cycles", 1).await;
        test_worker(&store, ScriptedRunner::default()).run().await;
    }

    #[tokio::test]
    async fn worker_drains_jobs_then_exits() {
        let store = MemoryStore::new();
        set_config(&store, "worker_idle_cycles", 0).await;
        let queue = Queue::new(store.clone());
        for i in 0..3 {
            queue
                .enqueue(JobBuilder::default().with_command(format!("job {i}")))
                .await
                .unwrap();
        }

        let runner = ScriptedRunner::default();
        test_worker(&store, runner.clone()).run().await;

        let doc = store.load_queue().await.unwrap();
        assert_eq!(doc.jobs.len(), 3);
        assert!(doc.jobs.iter().all(|job| job.state == JobState::Completed));
        assert_eq!(runner.commands.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failing_job_ends_in_the_dlq_after_its_budget() {
        let store = MemoryStore::new();
        set_config(&store, "worker_idle_cycles", 0).await;
        set_config(&store, "backoff_base", 0).await;
        let queue = Queue::new(store.clone());
        queue
            .enqueue(
                JobBuilder::default()
                    .with_command("doomed")
                    .with_max_retries(2),
            )
            .await
            .unwrap();

        // Fails every attempt; with backoff base 0 each retry is immediately
        // runnable, so a single worker pass drains the whole budget.
        let runner = ScriptedRunner::failing_times(10);
        test_worker(&store, runner.clone()).run().await;

        let doc = store.load_queue().await.unwrap();
        assert!(doc.jobs.is_empty());
        assert_eq!(doc.dlq.len(), 1);
        assert_eq!(doc.dlq[0].attempts, 3);
        assert_eq!(doc.dlq[0].state, JobState::Dead);
        assert_eq!(runner.commands.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn worker_executes_higher_priority_first() {
        let store = MemoryStore::new();
        set_config(&store, "worker_idle_cycles", 0).await;
        let queue = Queue::new(store.clone());
        queue
            .enqueue(JobBuilder::default().with_command("low").with_priority(1))
            .await
            .unwrap();
        queue
            .enqueue(JobBuilder::default().with_command("high").with_priority(5))
            .await
            .unwrap();

        let runner = ScriptedRunner::default();
        test_worker(&store, runner.clone()).run().await;

        let commands = runner.commands.lock().unwrap().clone();
        assert_eq!(commands, vec!["high".to_owned(), "low".to_owned()]);
    }
}
