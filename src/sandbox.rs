//! Sandbox runner: executes one evaluation script against its input files.
//!
//! Each run gets a fresh workspace holding the script and the files, is
//! executed as the configured unprivileged identity under a hard timeout,
//! and has its workspace removed afterwards whatever happened. Only
//! environment faults are errors; any way the script itself ends is an
//! ordinary [`ExecutionResult`].

mod restricted;
mod workspace;

pub use restricted::{Identity, TIMEOUT_RETURN_CODE};
pub use workspace::{normalize_script, Workspace, SCRIPT_NAME};

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use restricted::{Exit, Limits};

/// Outcome of running a script to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// 0 = pass; nonzero = fail; [`TIMEOUT_RETURN_CODE`] on timeout.
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A stored file to place in the workspace under `name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxFile {
    pub name: String,
    pub source: PathBuf,
}

/// Everything needed for one run.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub script: String,
    pub timeout: Duration,
    /// Upstream files, copied first in order.
    pub upstream_files: Vec<SandboxFile>,
    /// The evaluated submission's own files, copied last.
    pub files: Vec<SandboxFile>,
}

/// Something that can run a [`SandboxRequest`].
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    async fn execute(&self, request: &SandboxRequest) -> Result<ExecutionResult, SandboxError>;
}

/// Runs scripts in a scratch directory as a restricted identity.
#[derive(Debug, Clone)]
pub struct SandboxRunner {
    identity: Option<Identity>,
    scratch_dir: Option<PathBuf>,
    output_limit: usize,
    drain_grace: Duration,
}

impl SandboxRunner {
    /// Build a runner, resolving the restricted identity up front.
    pub fn new(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let identity = config.run_as.as_deref().map(Identity::lookup).transpose()?;
        Ok(Self {
            identity,
            scratch_dir: config.scratch_dir.clone(),
            output_limit: config.output_limit_bytes,
            drain_grace: config.drain_grace(),
        })
    }

    pub const fn identity(&self) -> Option<Identity> {
        self.identity
    }
}

#[async_trait]
impl IsolationBackend for SandboxRunner {
    #[instrument(skip_all, fields(timeout = request.timeout.as_secs(), files = request.upstream_files.len() + request.files.len()))]
    async fn execute(&self, request: &SandboxRequest) -> Result<ExecutionResult, SandboxError> {
        let workspace = Workspace::create(self.scratch_dir.as_deref())?;

        let script = workspace.write_script(&request.script)?;
        for file in request.upstream_files.iter().chain(&request.files) {
            workspace.copy_in(file)?;
        }
        workspace.open_up()?;

        let limits = Limits {
            timeout: request.timeout,
            output_limit: self.output_limit,
            drain_grace: self.drain_grace,
        };
        let completion = restricted::run(&script, workspace.path(), self.identity, limits).await;
        workspace.close();
        let completion = completion?;

        let return_code = completion.exit.return_code();
        let stdout = String::from_utf8_lossy(&completion.stdout);
        let mut stderr = String::from_utf8_lossy(&completion.stderr).into_owned();
        if completion.exit == Exit::TimedOut {
            stderr.push_str("\n\n");
            stderr.push_str(&timeout_message(request.timeout));
        }

        debug!(return_code, "Script finished");
        Ok(ExecutionResult {
            return_code,
            stdout: stdout.trim().to_string(),
            stderr: stderr.trim().to_string(),
        })
    }
}

/// Explanation appended to stderr when a run is killed for taking too long.
pub fn timeout_message(timeout: Duration) -> String {
    format!(
        "The program failed to complete within {} seconds and was terminated.",
        timeout.as_secs()
    )
}
