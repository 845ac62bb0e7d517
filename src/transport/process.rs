//! One-shot worker processes.
//!
//! Spawns a fresh worker per job, sends it the framed job on stdin, reads the
//! framed result from stdout and reaps the process. Workers are never reused,
//! so a job that crashes or leaks resources takes only its own process down.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::protocol::{read_frame, write_frame, FrameError, Outcome, ProcessInput, ProcessOutput};
use crate::error::JobError;
use crate::queue::{JobId, Launcher};

/// Launcher that runs each job in a new OS process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
}

impl ProcessLauncher {
    /// Launch `program args...` for every job.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Re-execute the running binary as the worker.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Append an argument to the worker command line.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for every worker.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    async fn run<J: Serialize + Sync, T: DeserializeOwned>(
        &self,
        job_id: JobId,
        job: &J,
    ) -> Result<T, JobError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| JobError::Spawn(format!("{}: {e}", self.program.display())))?;

        debug!(pid = child.id(), "Worker spawned");

        let exchange = async {
            let mut stdin = child.stdin.take().ok_or_else(|| closed("stdin"))?;
            write_frame(&mut stdin, &ProcessInput { job_id, job }).await?;
            drop(stdin);

            let mut stdout = child.stdout.take().ok_or_else(|| closed("stdout"))?;
            read_frame::<_, ProcessOutput<T>>(&mut stdout).await
        };
        let reply = exchange.await;

        let status = child
            .wait()
            .await
            .map_err(|e| JobError::Crashed(format!("cannot reap worker: {e}")))?;

        let output = match reply {
            Ok(output) => output,
            Err(FrameError::Malformed(e)) => {
                return Err(JobError::Protocol(format!("unusable frame: {e}")));
            }
            Err(e) => {
                warn!(%status, error = %e, "Worker exited without a result");
                return Err(JobError::Crashed(format!("{status}; {e}")));
            }
        };

        if output.job_id != job_id {
            return Err(JobError::Protocol(format!(
                "worker answered for job {} instead of {job_id}",
                output.job_id
            )));
        }
        if !status.success() {
            warn!(%status, "Worker reported a result but exited abnormally");
        }

        match output.outcome {
            Outcome::Ok { value } => Ok(value),
            Outcome::Error { message } => Err(JobError::Failed(message)),
        }
    }
}

fn closed(pipe: &str) -> FrameError {
    FrameError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("worker {pipe} is not piped"),
    ))
}

#[async_trait]
impl<J, T> Launcher<J, T> for ProcessLauncher
where
    J: Serialize + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
{
    #[instrument(skip(self, job), fields(program = %self.program.display()))]
    async fn launch(&self, job_id: JobId, job: J) -> Result<T, JobError> {
        self.run(job_id, &job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let launcher = ProcessLauncher::new("/nonexistent/demograder-worker");
        let result: Result<u32, JobError> = launcher.run(0, &"job").await;
        assert!(matches!(result, Err(JobError::Spawn(_))));
    }

    #[tokio::test]
    async fn silent_exit_is_a_crash() {
        // Exits 0 without ever answering.
        let launcher = ProcessLauncher::new("/bin/sh").arg("-c").arg("exit 0");
        let result: Result<u32, JobError> = launcher.run(1, &"job").await;
        assert!(matches!(result, Err(JobError::Crashed(_))));
    }

    #[tokio::test]
    async fn killed_worker_is_a_crash() {
        let launcher = ProcessLauncher::new("/bin/sh").arg("-c").arg("kill -9 $$");
        let result: Result<u32, JobError> = launcher.run(2, &"job").await;
        match result {
            Err(JobError::Crashed(reason)) => assert!(reason.contains("signal")),
            other => panic!("expected crash, got {other:?}"),
        }
    }
}
