//! Coordinator-side entry points.
//!
//! Each entry point queues one job and returns at once. Follow-up work is
//! chained from the success callbacks, so the front end only ever observes
//! progress by re-reading Result rows.

use tracing::{error, info, warn};

use super::task::{Task, TaskOutput};
use crate::error::JobError;
use crate::queue::{JobId, JobQueue};
use crate::store::{ResultId, SubmissionId};

/// Handle through which the front end schedules evaluations.
#[derive(Clone)]
pub struct Orchestrator {
    queue: JobQueue<Task, TaskOutput>,
}

impl Orchestrator {
    pub const fn new(queue: JobQueue<Task, TaskOutput>) -> Self {
        Self { queue }
    }

    pub const fn queue(&self) -> &JobQueue<Task, TaskOutput> {
        &self.queue
    }

    /// Materialize the submission's Results, then evaluate each one.
    pub fn evaluate_submission(&self, submission_id: SubmissionId) -> JobId {
        self.materialize(Task::MaterializeResults { submission_id }, submission_id)
    }

    /// Discard the submission's Results and evaluate it from scratch.
    pub fn reevaluate_submission(&self, submission_id: SubmissionId) -> JobId {
        self.materialize(Task::RematerializeResults { submission_id }, submission_id)
    }

    /// Run one existing Result with its stored upstream set.
    pub fn evaluate_result(&self, result_id: ResultId) -> JobId {
        self.queue.submit(
            Task::EvaluateResult { result_id },
            move |output| match output {
                TaskOutput::Evaluated {
                    return_code: Some(return_code),
                    ..
                } => info!(result_id, return_code, "Evaluation finished"),
                TaskOutput::Evaluated {
                    return_code: None, ..
                } => warn!(result_id, "Evaluation finished for a Result that no longer exists"),
                other => unexpected("evaluate_result", &other),
            },
            move |err| failed("evaluate_result", result_id, &err),
        )
    }

    /// Discard one Result, then re-evaluate its whole submission.
    ///
    /// The discarded Result's upstream set is not reused; the submission is
    /// expanded again against current data.
    pub fn reevaluate_result(&self, result_id: ResultId) -> JobId {
        let this = self.clone();
        self.queue.submit(
            Task::DiscardResult { result_id },
            move |output| match output {
                TaskOutput::Discarded { submission_id, .. } => {
                    this.evaluate_submission(submission_id);
                }
                other => unexpected("discard_result", &other),
            },
            move |err| failed("discard_result", result_id, &err),
        )
    }

    fn materialize(&self, task: Task, target: SubmissionId) -> JobId {
        let kind = task.kind();
        let this = self.clone();
        self.queue.submit(
            task,
            move |output| match output {
                TaskOutput::Materialized {
                    submission_id,
                    result_ids,
                } => {
                    info!(submission_id, results = result_ids.len(), "Scheduling evaluations");
                    for result_id in result_ids {
                        this.evaluate_result(result_id);
                    }
                }
                other => unexpected(kind, &other),
            },
            move |err| failed(kind, target, &err),
        )
    }
}

fn failed(kind: &str, id: i64, err: &JobError) {
    error!(task = kind, id, error = %err, "Task failed; affected results stay pending");
}

fn unexpected(kind: &str, output: &TaskOutput) {
    error!(task = kind, ?output, "Task reported an unexpected output");
}
