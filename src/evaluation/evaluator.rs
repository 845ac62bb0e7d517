//! Worker-side execution of [`Task`]s.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::task::{Task, TaskOutput};
use crate::error::{Error, Result};
use crate::resolver;
use crate::sandbox::{IsolationBackend, SandboxFile, SandboxRequest};
use crate::store::{DataStore, FileStore, ResultId, Submission, SubmissionId};

/// Executes tasks against its own store handle and sandbox.
///
/// Every write goes through a single [`DataStore`] call that commits on its
/// own, so a worker dying between steps leaves only whole records behind.
pub struct Evaluator<S, B> {
    store: S,
    files: FileStore,
    sandbox: B,
}

impl<S: DataStore, B: IsolationBackend> Evaluator<S, B> {
    pub const fn new(store: S, files: FileStore, sandbox: B) -> Self {
        Self {
            store,
            files,
            sandbox,
        }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Execute one task.
    #[instrument(skip(self), fields(task = task.kind()))]
    pub async fn run(&self, task: Task) -> Result<TaskOutput> {
        match task {
            Task::MaterializeResults { submission_id } => Ok(TaskOutput::Materialized {
                submission_id,
                result_ids: self.materialize(submission_id).await?,
            }),
            Task::RematerializeResults { submission_id } => Ok(TaskOutput::Materialized {
                submission_id,
                result_ids: self.rematerialize(submission_id).await?,
            }),
            Task::EvaluateResult { result_id } => Ok(TaskOutput::Evaluated {
                result_id,
                return_code: self.evaluate(result_id).await?,
            }),
            Task::DiscardResult { result_id } => Ok(TaskOutput::Discarded {
                result_id,
                submission_id: self.discard(result_id).await?,
            }),
            Task::Probe { millis } => Ok(probe(millis).await),
        }
    }

    /// Persist one pending Result per upstream set, in resolution order.
    pub async fn materialize(&self, submission_id: SubmissionId) -> Result<Vec<ResultId>> {
        let sets = resolver::upstream_id_sets(&self.store, submission_id).await?;
        let mut result_ids = Vec::with_capacity(sets.len());
        for upstream in &sets {
            result_ids.push(self.store.create_result(submission_id, upstream).await?);
        }
        info!(submission_id, results = result_ids.len(), "Materialized results");
        Ok(result_ids)
    }

    /// Drop every Result of the submission, then materialize from scratch.
    pub async fn rematerialize(&self, submission_id: SubmissionId) -> Result<Vec<ResultId>> {
        let removed = self.store.delete_submission_results(submission_id).await?;
        debug!(submission_id, removed, "Discarded previous results");
        self.materialize(submission_id).await
    }

    /// Run the sandbox for a Result and record the outcome.
    ///
    /// A Result that is already final is left untouched and its stored code
    /// returned. Sandbox failures propagate and leave the Result pending.
    pub async fn evaluate(&self, result_id: ResultId) -> Result<Option<i32>> {
        let result = self
            .store
            .result(result_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("result {result_id}")))?;
        if !result.is_pending() {
            info!(result_id, return_code = ?result.return_code, "Result is already final");
            return Ok(result.return_code);
        }

        let submission = self.submission(result.submission_id).await?;
        let question = self
            .store
            .question(submission.question_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("question {}", submission.question_id)))?;

        let mut upstream_files = Vec::new();
        for upstream_id in self.store.result_upstream(result_id).await? {
            let upstream = self.submission(upstream_id).await?;
            upstream_files.extend(self.sandbox_files(&upstream).await?);
        }
        let request = SandboxRequest {
            script: question.script,
            timeout: Duration::from_secs(question.timeout_seconds),
            upstream_files,
            files: self.sandbox_files(&submission).await?,
        };

        let outcome = self.sandbox.execute(&request).await?;
        if self.store.complete_result(result_id, &outcome).await? {
            info!(result_id, return_code = outcome.return_code, "Result evaluated");
            Ok(Some(outcome.return_code))
        } else {
            warn!(result_id, "Result was removed or finished elsewhere while running; outcome dropped");
            Ok(None)
        }
    }

    /// Delete a Result, returning the submission it belonged to.
    pub async fn discard(&self, result_id: ResultId) -> Result<SubmissionId> {
        let result = self
            .store
            .result(result_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("result {result_id}")))?;
        self.store.delete_result(result_id).await?;
        info!(result_id, submission_id = result.submission_id, "Result discarded");
        Ok(result.submission_id)
    }

    async fn submission(&self, id: SubmissionId) -> Result<Submission> {
        self.store
            .submission(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("submission {id}")))
    }

    async fn sandbox_files(&self, submission: &Submission) -> Result<Vec<SandboxFile>> {
        self.store
            .submission_files(submission.id)
            .await?
            .into_iter()
            .map(|file| {
                Ok(SandboxFile {
                    source: self.files.path(submission, &file)?,
                    name: file.filename,
                })
            })
            .collect()
    }
}

/// Sleep for `millis` and report when it happened.
pub async fn probe(millis: u64) -> TaskOutput {
    let started_at = Utc::now();
    tokio::time::sleep(Duration::from_millis(millis)).await;
    TaskOutput::Probed {
        pid: std::process::id(),
        started_at,
        finished_at: Utc::now(),
    }
}
