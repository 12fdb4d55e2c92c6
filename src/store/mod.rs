//! Persistence for lessons, deficit patterns and message jobs.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{DeficitPattern, JobKey, LessonObservation, MessageJob, ReportWeek};

#[async_trait]
pub trait Store: Send + Sync {
    /// Returns `false` when the lesson id was already stored.
    async fn save_lesson(&self, lesson: &LessonObservation) -> Result<bool>;

    async fn lesson(&self, lesson_id: &str) -> Result<Option<LessonObservation>>;

    /// Lessons with `from <= timestamp < to`, oldest first.
    async fn lessons_between(
        &self,
        student_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LessonObservation>>;

    async fn deficit(&self, student_id: &str, topic: &str) -> Result<Option<DeficitPattern>>;

    /// Compare-and-set on `pattern.version`; version 0 inserts. Returns the
    /// stored pattern with its version bumped, or `None` if someone else
    /// wrote first.
    async fn save_deficit(&self, pattern: &DeficitPattern) -> Result<Option<DeficitPattern>>;

    async fn deficits(&self, student_id: Option<&str>) -> Result<Vec<DeficitPattern>>;

    /// Inserts unless a job with the same key, or a weekly report for the
    /// same student and week, already exists. Returns whether it inserted.
    async fn insert_job(&self, job: &MessageJob) -> Result<bool>;

    async fn job(&self, key: &JobKey) -> Result<Option<MessageJob>>;

    async fn job_by_id(&self, id: Uuid) -> Result<Option<MessageJob>>;

    async fn weekly_job(&self, student_id: &str, week: ReportWeek) -> Result<Option<MessageJob>>;

    async fn jobs(&self, student_id: Option<&str>) -> Result<Vec<MessageJob>>;

    /// Jobs a sweep at `now` should pick up, earliest first. Jobs left in
    /// `due` count as abandoned once untouched for `due_lease`.
    async fn ready_jobs(&self, now: DateTime<Utc>, due_lease: Duration) -> Result<Vec<MessageJob>>;

    /// Compare-and-set on `job.version`. On success returns the stored job
    /// with its version bumped; returns `None` if someone else wrote first.
    async fn update_job(&self, job: &MessageJob) -> Result<Option<MessageJob>>;
}
