//! SQLite-backed [`DataStore`].
//!
//! Each process opens its own pool; the database file is shared between the
//! coordinator and its workers, so the pool runs in WAL mode with a generous
//! busy timeout.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use tracing::{debug, info};

use super::{
    CourseId, DataStore, Question, QuestionDependency, QuestionId, ResultId, ResultRecord, Roster,
    Submission, SubmissionFile, SubmissionId,
};
use crate::error::{Error, Result};
use crate::sandbox::ExecutionResult;

const SUBMISSION_COLUMNS: &str = r"
    SELECT s.id, s.user_id, s.question_id, q.assignment_id, a.course_id, s.timestamp, s.disabled
    FROM submissions s
    JOIN questions q ON q.id = s.question_id
    JOIN assignments a ON a.id = q.assignment_id
";

#[derive(Debug, FromRow)]
struct SubmissionRow {
    id: i64,
    user_id: i64,
    question_id: i64,
    assignment_id: i64,
    course_id: i64,
    timestamp: DateTime<Utc>,
    disabled: bool,
}

impl From<SubmissionRow> for Submission {
    fn from(row: SubmissionRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            question_id: row.question_id,
            assignment_id: row.assignment_id,
            course_id: row.course_id,
            timestamp: row.timestamp,
            disabled: row.disabled,
        }
    }
}

#[derive(Debug, FromRow)]
struct QuestionRow {
    id: i64,
    assignment_id: i64,
    course_id: i64,
    script: String,
    timeout_seconds: i64,
}

impl TryFrom<QuestionRow> for Question {
    type Error = Error;

    fn try_from(row: QuestionRow) -> Result<Self> {
        let timeout_seconds = u64::try_from(row.timeout_seconds).map_err(|_| {
            Error::InvalidRecord(format!(
                "question {} has negative timeout {}",
                row.id, row.timeout_seconds
            ))
        })?;
        Ok(Self {
            id: row.id,
            assignment_id: row.assignment_id,
            course_id: row.course_id,
            script: row.script,
            timeout_seconds,
        })
    }
}

#[derive(Debug, FromRow)]
struct DependencyRow {
    id: i64,
    producer_id: i64,
    consumer_id: i64,
    input_type: String,
    submitters: String,
    viewable: bool,
}

impl TryFrom<DependencyRow> for QuestionDependency {
    type Error = Error;

    fn try_from(row: DependencyRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            producer_id: row.producer_id,
            consumer_id: row.consumer_id,
            input_type: row.input_type.parse()?,
            submitters: row.submitters.parse()?,
            viewable: row.viewable,
        })
    }
}

#[derive(Debug, FromRow)]
struct ResultRow {
    id: i64,
    submission_id: i64,
    stdout: Option<String>,
    stderr: Option<String>,
    return_code: Option<i32>,
}

impl From<ResultRow> for ResultRecord {
    fn from(row: ResultRow) -> Self {
        Self {
            id: row.id,
            submission_id: row.submission_id,
            stdout: row.stdout,
            stderr: row.stderr,
            return_code: row.return_code,
        }
    }
}

/// Data store backed by a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url`, e.g.
    /// `sqlite://demograder.sqlite`.
    pub async fn connect(url: &str) -> Result<Self> {
        debug!(url, "Opening SQLite store");

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database schema is up to date");
        Ok(())
    }

    /// Underlying connection pool.
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn submission(&self, id: SubmissionId) -> Result<Option<Submission>> {
        let row: Option<SubmissionRow> =
            sqlx::query_as(&format!("{SUBMISSION_COLUMNS} WHERE s.id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Submission::from))
    }

    async fn question(&self, id: QuestionId) -> Result<Option<Question>> {
        let row: Option<QuestionRow> = sqlx::query_as(
            r"
            SELECT q.id, q.assignment_id, a.course_id, q.script, q.timeout_seconds
            FROM questions q
            JOIN assignments a ON a.id = q.assignment_id
            WHERE q.id = ?
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Question::try_from).transpose()
    }

    async fn dependencies(&self, question_id: QuestionId) -> Result<Vec<QuestionDependency>> {
        let rows: Vec<DependencyRow> = sqlx::query_as(
            r"
            SELECT id, producer_id, consumer_id, input_type, submitters, viewable
            FROM question_dependencies
            WHERE consumer_id = ?
            ORDER BY id
            ",
        )
        .bind(question_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QuestionDependency::try_from).collect()
    }

    async fn active_submissions(&self, question_id: QuestionId) -> Result<Vec<Submission>> {
        let rows: Vec<SubmissionRow> = sqlx::query_as(&format!(
            "{SUBMISSION_COLUMNS} WHERE s.question_id = ? AND s.disabled = 0 ORDER BY s.id"
        ))
        .bind(question_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Submission::from).collect())
    }

    async fn roster(&self, course_id: CourseId) -> Result<Roster> {
        let instructors: Vec<(i64,)> =
            sqlx::query_as("SELECT user_id FROM instructors WHERE course_id = ?")
                .bind(course_id)
                .fetch_all(&self.pool)
                .await?;
        let students: Vec<(i64,)> =
            sqlx::query_as("SELECT user_id FROM students WHERE course_id = ?")
                .bind(course_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(Roster {
            instructors: instructors.into_iter().map(|(id,)| id).collect(),
            students: students.into_iter().map(|(id,)| id).collect(),
        })
    }

    async fn submission_files(&self, submission_id: SubmissionId) -> Result<Vec<SubmissionFile>> {
        let rows: Vec<(i64, i64, String)> = sqlx::query_as(
            "SELECT id, submission_id, filename FROM submission_files WHERE submission_id = ? ORDER BY id",
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, submission_id, filename)| SubmissionFile {
                id,
                submission_id,
                filename,
            })
            .collect())
    }

    async fn create_result(
        &self,
        submission_id: SubmissionId,
        upstream: &[SubmissionId],
    ) -> Result<ResultId> {
        let mut tx = self.pool.begin().await?;

        let result_id = sqlx::query("INSERT INTO results (submission_id) VALUES (?)")
            .bind(submission_id)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        for upstream_id in upstream {
            sqlx::query("INSERT INTO result_dependencies (result_id, submission_id) VALUES (?, ?)")
                .bind(result_id)
                .bind(upstream_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(result_id, submission_id, ?upstream, "Created pending result");
        Ok(result_id)
    }

    async fn result(&self, id: ResultId) -> Result<Option<ResultRecord>> {
        let row: Option<ResultRow> = sqlx::query_as(
            "SELECT id, submission_id, stdout, stderr, return_code FROM results WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ResultRecord::from))
    }

    async fn result_upstream(&self, id: ResultId) -> Result<Vec<SubmissionId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT submission_id FROM result_dependencies WHERE result_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn results_for_submission(&self, submission_id: SubmissionId) -> Result<Vec<ResultRecord>> {
        let rows: Vec<ResultRow> = sqlx::query_as(
            r"
            SELECT id, submission_id, stdout, stderr, return_code
            FROM results
            WHERE submission_id = ?
            ORDER BY id
            ",
        )
        .bind(submission_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ResultRecord::from).collect())
    }

    async fn complete_result(&self, id: ResultId, outcome: &ExecutionResult) -> Result<bool> {
        let updated = sqlx::query(
            r"
            UPDATE results
            SET stdout = ?, stderr = ?, return_code = ?
            WHERE id = ? AND return_code IS NULL
            ",
        )
        .bind(&outcome.stdout)
        .bind(&outcome.stderr)
        .bind(outcome.return_code)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }

    async fn delete_result(&self, id: ResultId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM result_dependencies WHERE result_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM results WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted == 1)
    }

    async fn delete_submission_results(&self, submission_id: SubmissionId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r"
            DELETE FROM result_dependencies
            WHERE result_id IN (SELECT id FROM results WHERE submission_id = ?)
            ",
        )
        .bind(submission_id)
        .execute(&mut *tx)
        .await?;
        let deleted = sqlx::query("DELETE FROM results WHERE submission_id = ?")
            .bind(submission_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }
}
