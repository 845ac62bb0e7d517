//! Seed data for tests: a migrated scratch database with one course.

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use super::{
    AssignmentId, CourseId, InputType, QuestionId, SqliteStore, SubmissionId, Submitters, UserId,
};

/// Fixed base time plus `offset` seconds.
pub fn timestamp(offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + offset, 0).unwrap()
}

pub struct Fixture {
    pub dir: TempDir,
    pub store: SqliteStore,
    pub course_id: CourseId,
    pub assignment_id: AssignmentId,
}

impl Fixture {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect(&Self::url_in(&dir)).await.unwrap();
        store.migrate().await.unwrap();

        let course_id = sqlx::query("INSERT INTO courses (title) VALUES ('Systems')")
            .execute(store.pool())
            .await
            .unwrap()
            .last_insert_rowid();
        let assignment_id = sqlx::query("INSERT INTO assignments (course_id, name) VALUES (?, 'A1')")
            .bind(course_id)
            .execute(store.pool())
            .await
            .unwrap()
            .last_insert_rowid();

        Self {
            dir,
            store,
            course_id,
            assignment_id,
        }
    }

    fn url_in(dir: &TempDir) -> String {
        format!("sqlite://{}", dir.path().join("demograder.sqlite").display())
    }

    /// Connection URL of the scratch database.
    pub fn url(&self) -> String {
        Self::url_in(&self.dir)
    }

    async fn user(&self, email: &str) -> UserId {
        sqlx::query("INSERT INTO users (email) VALUES (?)")
            .bind(email)
            .execute(self.store.pool())
            .await
            .unwrap()
            .last_insert_rowid()
    }

    pub async fn student(&self, email: &str) -> UserId {
        let user_id = self.user(email).await;
        sqlx::query("INSERT INTO students (user_id, course_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(self.course_id)
            .execute(self.store.pool())
            .await
            .unwrap();
        user_id
    }

    pub async fn instructor(&self, email: &str) -> UserId {
        let user_id = self.user(email).await;
        sqlx::query("INSERT INTO instructors (user_id, course_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(self.course_id)
            .execute(self.store.pool())
            .await
            .unwrap();
        user_id
    }

    /// A user who is not enrolled in the fixture course.
    pub async fn outsider(&self, email: &str) -> UserId {
        self.user(email).await
    }

    pub async fn question(&self, script: &str, timeout_seconds: i64) -> QuestionId {
        sqlx::query("INSERT INTO questions (assignment_id, script, timeout_seconds) VALUES (?, ?, ?)")
            .bind(self.assignment_id)
            .bind(script)
            .bind(timeout_seconds)
            .execute(self.store.pool())
            .await
            .unwrap()
            .last_insert_rowid()
    }

    pub async fn depend(
        &self,
        producer_id: QuestionId,
        consumer_id: QuestionId,
        input_type: InputType,
        submitters: Submitters,
    ) -> i64 {
        sqlx::query(
            "INSERT INTO question_dependencies (producer_id, consumer_id, input_type, submitters) VALUES (?, ?, ?, ?)",
        )
        .bind(producer_id)
        .bind(consumer_id)
        .bind(input_type.as_str())
        .bind(submitters.as_str())
        .execute(self.store.pool())
        .await
        .unwrap()
        .last_insert_rowid()
    }

    /// Submit at `timestamp(offset)`.
    pub async fn submit(&self, user_id: UserId, question_id: QuestionId, offset: i64) -> SubmissionId {
        sqlx::query("INSERT INTO submissions (user_id, question_id, timestamp) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(question_id)
            .bind(timestamp(offset))
            .execute(self.store.pool())
            .await
            .unwrap()
            .last_insert_rowid()
    }

    pub async fn attach(&self, submission_id: SubmissionId, filename: &str) {
        sqlx::query("INSERT INTO submission_files (submission_id, filename) VALUES (?, ?)")
            .bind(submission_id)
            .bind(filename)
            .execute(self.store.pool())
            .await
            .unwrap();
    }

    pub async fn disable(&self, submission_id: SubmissionId) {
        sqlx::query("UPDATE submissions SET disabled = 1 WHERE id = ?")
            .bind(submission_id)
            .execute(self.store.pool())
            .await
            .unwrap();
    }
}
