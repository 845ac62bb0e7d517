//! Records the pipeline reads and writes, and the stores that hold them.
//!
//! The [`DataStore`] trait is the pipeline's whole view of persistence:
//! lookups by id, the filtered queries dependency resolution needs, and
//! single-record writes for Results. [`SqliteStore`] is the implementation
//! used by the coordinator and by every worker process (each opening its own
//! pool). [`FileStore`] maps submission files to their on-disk location.

mod files;
mod sqlite;

#[cfg(test)]
pub mod fixtures;

pub use files::{is_plain_file_name, FileStore};
pub use sqlite::SqliteStore;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sandbox::ExecutionResult;

pub type UserId = i64;
pub type CourseId = i64;
pub type AssignmentId = i64;
pub type QuestionId = i64;
pub type SubmissionId = i64;
pub type ResultId = i64;

/// One upload by one user to one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub id: SubmissionId,
    pub user_id: UserId,
    pub question_id: QuestionId,
    pub assignment_id: AssignmentId,
    pub course_id: CourseId,
    pub timestamp: DateTime<Utc>,
    pub disabled: bool,
}

/// A file belonging to a submission, addressed by its stored name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionFile {
    pub id: i64,
    pub submission_id: SubmissionId,
    pub filename: String,
}

/// The parts of a question that evaluation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub id: QuestionId,
    pub assignment_id: AssignmentId,
    pub course_id: CourseId,
    /// Evaluation script, run with the submission's files beside it.
    pub script: String,
    pub timeout_seconds: u64,
}

/// Which producer submissions feed a consumer's evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    /// Every eligible submission.
    All,
    /// Each submitter's most recent eligible submission.
    Latest,
}

/// Whose producer submissions are eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Submitters {
    Instructors,
    Students,
    Everyone,
}

impl InputType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Latest => "latest",
        }
    }
}

impl Submitters {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Instructors => "instructors",
            Self::Students => "students",
            Self::Everyone => "everyone",
        }
    }
}

impl FromStr for InputType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Self::All),
            "latest" => Ok(Self::Latest),
            other => Err(Error::InvalidRecord(format!("unknown input_type {other:?}"))),
        }
    }
}

impl FromStr for Submitters {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "instructors" => Ok(Self::Instructors),
            "students" => Ok(Self::Students),
            "everyone" => Ok(Self::Everyone),
            other => Err(Error::InvalidRecord(format!("unknown submitters {other:?}"))),
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Submitters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared producer → consumer relationship between two questions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionDependency {
    pub id: i64,
    pub producer_id: QuestionId,
    pub consumer_id: QuestionId,
    pub input_type: InputType,
    pub submitters: Submitters,
    pub viewable: bool,
}

/// A persisted evaluation of one submission against one upstream set.
///
/// `return_code == None` means the evaluation is still pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRecord {
    pub id: ResultId,
    pub submission_id: SubmissionId,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub return_code: Option<i32>,
}

impl ResultRecord {
    pub const fn is_pending(&self) -> bool {
        self.return_code.is_none()
    }

    pub const fn passed(&self) -> bool {
        matches!(self.return_code, Some(0))
    }
}

/// Course membership used by the submitter filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub instructors: HashSet<UserId>,
    pub students: HashSet<UserId>,
}

impl Roster {
    /// Whether `user_id` matches the submitter policy.
    pub fn admits(&self, submitters: Submitters, user_id: UserId) -> bool {
        match submitters {
            Submitters::Instructors => self.instructors.contains(&user_id),
            Submitters::Students => self.students.contains(&user_id),
            Submitters::Everyone => {
                self.instructors.contains(&user_id) || self.students.contains(&user_id)
            }
        }
    }
}

/// Pass/fail/pending counts for one submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResultSummary {
    pub passed: usize,
    pub failed: usize,
    pub pending: usize,
}

impl ResultSummary {
    pub fn tally<'a>(results: impl IntoIterator<Item = &'a ResultRecord>) -> Self {
        results
            .into_iter()
            .fold(Self::default(), |mut summary, result| {
                match result.return_code {
                    None => summary.pending += 1,
                    Some(0) => summary.passed += 1,
                    Some(_) => summary.failed += 1,
                }
                summary
            })
    }
}

/// Persistence operations the pipeline consumes.
///
/// Every write commits on its own; nothing spans two calls.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn submission(&self, id: SubmissionId) -> Result<Option<Submission>>;

    async fn question(&self, id: QuestionId) -> Result<Option<Question>>;

    /// Dependencies whose consumer is `question_id`, in declaration order.
    async fn dependencies(&self, question_id: QuestionId) -> Result<Vec<QuestionDependency>>;

    /// Submissions to `question_id` that are not disabled.
    async fn active_submissions(&self, question_id: QuestionId) -> Result<Vec<Submission>>;

    async fn roster(&self, course_id: CourseId) -> Result<Roster>;

    async fn submission_files(&self, submission_id: SubmissionId) -> Result<Vec<SubmissionFile>>;

    /// Insert a pending Result together with its upstream links, atomically.
    async fn create_result(
        &self,
        submission_id: SubmissionId,
        upstream: &[SubmissionId],
    ) -> Result<ResultId>;

    async fn result(&self, id: ResultId) -> Result<Option<ResultRecord>>;

    /// Upstream submission ids of a Result, in the order they were linked.
    async fn result_upstream(&self, id: ResultId) -> Result<Vec<SubmissionId>>;

    async fn results_for_submission(&self, submission_id: SubmissionId) -> Result<Vec<ResultRecord>>;

    /// Write the final outcome of a pending Result.
    ///
    /// Returns `false` if the Result no longer exists or was already final.
    async fn complete_result(&self, id: ResultId, outcome: &ExecutionResult) -> Result<bool>;

    /// Delete one Result and its links. Returns `false` if it did not exist.
    async fn delete_result(&self, id: ResultId) -> Result<bool>;

    /// Delete every Result of a submission and their links.
    async fn delete_submission_results(&self, submission_id: SubmissionId) -> Result<u64>;

    /// Passed / failed / pending counts over a submission's Results.
    async fn submission_summary(&self, submission_id: SubmissionId) -> Result<ResultSummary> {
        let results = self.results_for_submission(submission_id).await?;
        Ok(ResultSummary::tally(&results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: ResultId, return_code: Option<i32>) -> ResultRecord {
        ResultRecord {
            id,
            submission_id: 1,
            stdout: None,
            stderr: None,
            return_code,
        }
    }

    #[test]
    fn roster_admits_by_policy() {
        let roster = Roster {
            instructors: HashSet::from([1]),
            students: HashSet::from([2]),
        };

        assert!(roster.admits(Submitters::Instructors, 1));
        assert!(!roster.admits(Submitters::Instructors, 2));
        assert!(roster.admits(Submitters::Students, 2));
        assert!(!roster.admits(Submitters::Students, 1));
        assert!(roster.admits(Submitters::Everyone, 1));
        assert!(roster.admits(Submitters::Everyone, 2));
        assert!(!roster.admits(Submitters::Everyone, 3));
    }

    #[test]
    fn summary_counts_each_state() {
        let results = [
            record(1, Some(0)),
            record(2, Some(1)),
            record(3, Some(-9)),
            record(4, None),
        ];
        let summary = ResultSummary::tally(&results);
        assert_eq!(
            summary,
            ResultSummary {
                passed: 1,
                failed: 2,
                pending: 1
            }
        );
        assert!(results[0].passed());
        assert!(results[3].is_pending());
    }

    #[test]
    fn policy_names_parse() {
        assert_eq!("latest".parse::<InputType>().unwrap(), InputType::Latest);
        assert_eq!("all".parse::<InputType>().unwrap(), InputType::All);
        assert_eq!(
            "everyone".parse::<Submitters>().unwrap(),
            Submitters::Everyone
        );
        assert!("newest".parse::<InputType>().is_err());
        assert_eq!(Submitters::Students.to_string(), "students");
    }
}
