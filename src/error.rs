//! Error types for the evaluation pipeline.

use thiserror::Error;

/// Result type alias using the crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by config validation, the store, resolver and evaluator.
///
/// Student-code outcomes (nonzero exit, timeout) are never errors; they are
/// ordinary evaluation results.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A record referenced by id does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A persisted record holds a value the pipeline cannot interpret
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Sandbox environment error
    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

/// Environment-level sandbox failures.
///
/// These mean the grader itself broke; the Result being evaluated stays
/// pending so it can be retried.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The scratch directory could not be prepared or populated
    #[error("Failed to prepare workspace: {0}")]
    Workspace(#[source] std::io::Error),

    /// A stored file name would escape the workspace
    #[error("Refusing to place file with unsafe name: {0:?}")]
    UnsafeFileName(String),

    /// The restricted execution identity does not exist
    #[error("Unknown sandbox user: {0}")]
    UnknownUser(String),

    /// Looking up the restricted execution identity failed
    #[error("Failed to look up sandbox user {name}: {source}")]
    UserLookup {
        name: String,
        #[source]
        source: nix::Error,
    },

    /// The script's process could not be set up (fork, identity switch)
    #[error("Failed to start sandboxed script: {0}")]
    Spawn(#[source] std::io::Error),

    /// Waiting on or reading from the sandboxed process failed
    #[error("Failed to supervise sandboxed script: {0}")]
    Supervise(#[source] std::io::Error),
}

/// Why a job did not produce a value.
///
/// Delivered to the job's error callback; never raised inside the queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The job ran and reported an error (including a panic)
    #[error("Job failed: {0}")]
    Failed(String),

    /// The worker process could not be started
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    /// The worker process went away without reporting a result
    #[error("Worker exited without a result ({0})")]
    Crashed(String),

    /// The worker process reported something that is not a valid result
    #[error("Worker protocol error: {0}")]
    Protocol(String),
}
