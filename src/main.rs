//! demograder
//!
//! Coordinator and worker for sandboxed evaluation of course submissions.
//! The same binary plays both roles: `serve` runs the job queue and the MCP
//! front end, and re-executes itself as `worker` once per job.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use demograder::config::{Config, CONFIG_ENV};
use demograder::evaluation::{self, Orchestrator, Task, TaskOutput};
use demograder::queue::{JobQueue, Launcher};
use demograder::store::SqliteStore;
use demograder::transport::ProcessLauncher;
use demograder::{mcp, worker};

#[derive(Parser, Debug)]
#[command(name = "demograder")]
#[command(about = "Sandboxed, dependency-aware evaluation of course submissions")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// JSON config file (otherwise DEMOGRADER_CONFIG, otherwise defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the job queue and serve the MCP front end
    Serve {
        /// Run in stdio mode (for MCP clients)
        #[arg(long)]
        stdio: bool,
    },
    /// Run exactly one job read from stdin
    #[command(hide = true)]
    Worker,
    /// Apply database migrations
    Migrate,
    /// Run sleeping jobs through the queue and report their timings
    Probe {
        /// Number of jobs to submit
        #[arg(long, default_value_t = 8)]
        jobs: usize,
        /// How long each job sleeps
        #[arg(long, default_value_t = 1.0)]
        seconds: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP and worker frames)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Command::Serve { stdio } => serve(config, &args.log_level, stdio).await,
        Command::Worker => {
            worker::serve_stdio(move |task: Task| async move {
                evaluation::run_task(&config, task).await
            })
            .await
        }
        Command::Migrate => {
            let store = open_store(&config).await?;
            store.migrate().await.context("Failed to apply migrations")?;
            Ok(())
        }
        Command::Probe { jobs, seconds } => probe(config, &args.log_level, jobs, seconds).await,
    }
}

async fn serve(config: Config, log_level: &str, stdio: bool) -> Result<()> {
    if !stdio {
        bail!("Only --stdio mode is currently supported");
    }

    let store = open_store(&config).await?;
    store.migrate().await.context("Failed to apply migrations")?;

    info!(
        database = %config.database_url,
        submissions = %config.submission_path.display(),
        max_workers = config.max_concurrency(),
        run_as = ?config.sandbox.run_as,
        "Loaded configuration"
    );

    let orchestrator = Orchestrator::new(start_queue(&config, log_level)?);
    mcp::serve_stdio(orchestrator.clone(), Arc::new(store)).await?;

    let queue = orchestrator.queue();
    if !queue.is_idle() {
        info!(in_flight = queue.in_flight(), "Client disconnected; waiting for queued jobs");
        queue.wait_idle().await;
    }
    info!("All jobs finished");
    Ok(())
}

async fn probe(config: Config, log_level: &str, jobs: usize, seconds: f64) -> Result<()> {
    let millis = Duration::try_from_secs_f64(seconds)
        .context("--seconds must be a non-negative number")?
        .as_millis();
    let millis = u64::try_from(millis).context("--seconds is too large")?;

    let queue = start_queue(&config, log_level)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let origin = Utc::now();

    for _ in 0..jobs {
        let ok_tx = tx.clone();
        let err_tx = tx.clone();
        queue.submit(
            Task::Probe { millis },
            move |output| {
                let _ = ok_tx.send(Ok(output));
            },
            move |err| {
                let _ = err_tx.send(Err(err));
            },
        );
    }
    drop(tx);

    let mut failures = 0usize;
    while let Some(outcome) = rx.recv().await {
        match outcome {
            Ok(TaskOutput::Probed {
                pid,
                started_at,
                finished_at,
            }) => println!(
                "pid {pid:>7}  start {:>6} ms  end {:>6} ms  elapsed {:>6} ms",
                (started_at - origin).num_milliseconds(),
                (finished_at - origin).num_milliseconds(),
                (finished_at - started_at).num_milliseconds(),
            ),
            Ok(other) => warn!(?other, "Probe reported an unexpected output"),
            Err(e) => {
                failures += 1;
                error!(error = %e, "Probe failed");
            }
        }
    }

    if failures > 0 {
        bail!("{failures} of {jobs} probe jobs failed");
    }
    Ok(())
}

/// Queue whose jobs run in fresh copies of this binary.
fn start_queue(config: &Config, log_level: &str) -> Result<JobQueue<Task, TaskOutput>> {
    let launcher: Arc<dyn Launcher<Task, TaskOutput>> = Arc::new(
        ProcessLauncher::current_exe()
            .context("Failed to locate the demograder executable")?
            .arg("--log-level")
            .arg(log_level)
            .arg("worker")
            .env(CONFIG_ENV, config.to_json()?),
    );
    Ok(JobQueue::new(config.max_concurrency(), launcher))
}

async fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))
}
