//! Jobs the coordinator sends to worker processes, and what they report back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{ResultId, SubmissionId};

/// One unit of work for a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// Resolve dependencies and persist one pending Result per upstream set.
    MaterializeResults { submission_id: SubmissionId },
    /// Delete every Result of the submission, then materialize again.
    RematerializeResults { submission_id: SubmissionId },
    /// Run the sandbox for one pending Result and record the outcome.
    EvaluateResult { result_id: ResultId },
    /// Delete one Result and its upstream links.
    DiscardResult { result_id: ResultId },
    /// Sleep and report timings; exercises the queue without a database.
    Probe { millis: u64 },
}

/// Value a successful [`Task`] reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "output", rename_all = "snake_case")]
pub enum TaskOutput {
    Materialized {
        submission_id: SubmissionId,
        result_ids: Vec<ResultId>,
    },
    Evaluated {
        result_id: ResultId,
        /// `None` when the Result disappeared before the outcome was written.
        return_code: Option<i32>,
    },
    Discarded {
        result_id: ResultId,
        submission_id: SubmissionId,
    },
    Probed {
        pid: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
}

impl Task {
    /// Short name for logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MaterializeResults { .. } => "materialize_results",
            Self::RematerializeResults { .. } => "rematerialize_results",
            Self::EvaluateResult { .. } => "evaluate_result",
            Self::DiscardResult { .. } => "discard_result",
            Self::Probe { .. } => "probe",
        }
    }
}
