//! Evaluation pipeline.
//!
//! The coordinator drives it through the [`Orchestrator`]; every piece of
//! real work is a [`Task`] executed by an [`Evaluator`] inside a short-lived
//! worker process.

mod evaluator;
mod orchestrator;
mod task;

pub use evaluator::{probe, Evaluator};
pub use orchestrator::Orchestrator;
pub use task::{Task, TaskOutput};

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::Config;
use crate::sandbox::SandboxRunner;
use crate::store::{FileStore, SqliteStore};

/// Worker entry point: run one task with handles of its own.
///
/// The store connection lives exactly as long as this call. Probes never
/// touch the database.
pub async fn run_task(config: &Config, task: Task) -> Result<TaskOutput> {
    if let Task::Probe { millis } = task {
        return Ok(probe(millis).await);
    }

    let store = SqliteStore::connect(&config.database_url)
        .await
        .context("Failed to connect to the database")?;
    let sandbox = SandboxRunner::new(&config.sandbox).context("Failed to prepare the sandbox")?;
    let evaluator = Evaluator::new(store, FileStore::new(&config.submission_path), sandbox);

    debug!(task = task.kind(), "Running task");
    Ok(evaluator.run(task).await?)
}
