use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitCode, Stdio};

use clap::{Parser, Subcommand};
use serde_json::Value;
use shellq::{FileStore, JobId, JobState, Queue, ShellRunner, Worker};
use tracing_subscriber::EnvFilter;

/// Durable multi-process job queue for shell commands.
#[derive(Debug, Parser)]
#[command(name = "shellq", version, about)]
struct Cli {
    /// Directory holding the queue and configuration documents.
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Enqueue a job from an inline JSON spec.
    Enqueue {
        /// Job spec, e.g. '{"command": "echo hi", "priority": 5}'.
        job_json: String,
    },

    /// Enqueue a job from a JSON spec file.
    EnqueueFile { path: PathBuf },

    /// Manage worker processes.
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },

    /// Show counts of jobs per state.
    Status {
        /// Only count jobs in this state.
        #[arg(long)]
        state: Option<JobState>,
    },

    /// Inspect and retry dead letter queue entries.
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },

    /// Read and write queue tunables.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum WorkerCommand {
    /// Start detached worker processes and return immediately.
    Start {
        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// Run one worker loop in the foreground until it idles out.
    ///
    /// This is what `worker start` spawns; it is also handy under a process
    /// supervisor.
    #[command(hide = true)]
    Run,
}

#[derive(Debug, Subcommand)]
enum DlqCommand {
    /// List jobs in the dead letter queue.
    List,
    /// Move a dead job back into the queue with a fresh retry budget.
    Retry { job_id: String },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Set a tunable. Values parse as integer, then float, then string.
    Set { key: String, value: String },
    /// Print a single tunable.
    Get { key: String },
    /// Print all tunables.
    Show,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), shellq::ShellqError> {
    let queue = Queue::new(FileStore::new(&cli.data_dir));

    match cli.command {
        Command::Enqueue { job_json } => {
            let job = queue.enqueue_spec(&job_json).await?;
            println!("Job {} enqueued", job.id);
        }
        Command::EnqueueFile { path } => {
            let job = queue.enqueue_from_source(&path).await?;
            println!("Job {} enqueued from {}", job.id, path.display());
        }
        Command::Worker { command } => match command {
            WorkerCommand::Start { count } => {
                spawn_workers(&cli.data_dir, count)?;
                println!("Started {count} worker(s)");
            }
            WorkerCommand::Run => {
                Worker::new(queue, ShellRunner).run().await;
            }
        },
        Command::Status { state } => {
            let report = queue.status(state).await?;
            for (state, count) in &report.counts {
                println!("{state}: {count}");
            }
            if report.dead > 0 {
                println!("dead: {}", report.dead);
            }
        }
        Command::Dlq { command } => match command {
            DlqCommand::List => {
                let dead = queue.dlq_list().await?;
                if dead.is_empty() {
                    println!("No DLQ jobs");
                }
                for job in dead {
                    let mut line = format!(
                        "{}: {} attempts={} priority={}",
                        job.id, job.command, job.attempts, job.priority
                    );
                    if let Some(error) = &job.last_error {
                        line.push_str(&format!(" error={error}"));
                    }
                    println!("{line}");
                }
            }
            DlqCommand::Retry { job_id } => {
                let job = queue.dlq_retry(&JobId::from(job_id)).await?;
                println!("Job {} requeued from DLQ", job.id);
            }
        },
        Command::Config { command } => match command {
            ConfigCommand::Set { key, value } => {
                let stored = queue.config_set(&key, &value).await?;
                println!("Set {key}={}", scalar(&stored));
            }
            ConfigCommand::Get { key } => match queue.config_get(&key).await? {
                Some(value) => println!("{}", scalar(&value)),
                None => println!("{key} is not set"),
            },
            ConfigCommand::Show => {
                for (key, value) in queue.config_document().await? {
                    println!("{key}: {}", scalar(&value));
                }
            }
        },
    }
    Ok(())
}

/// Scalars print bare, without JSON quoting.
fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn spawn_workers(data_dir: &Path, count: u32) -> std::io::Result<()> {
    let exe = std::env::current_exe()?;
    for _ in 0..count {
        let child = std::process::Command::new(&exe)
            .arg("--data-dir")
            .arg(data_dir)
            .args(["worker", "run"])
            .stdin(Stdio::null())
            .spawn()?;
        writeln!(std::io::stderr(), "spawned worker pid {}", child.id()).ok();
    }
    Ok(())
}
