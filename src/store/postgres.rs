use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{CadenceError, Result};
use crate::models::{
    AiExtraction, DeficitPattern, EmojiRating, JobKey, JobStatus, LessonObservation, MessageJob,
    RenderedContent, ReportWeek, Stage, Student,
};
use crate::ports::Directory;
use crate::store::Store;

const JOB_COLUMNS: &str = "id, student_id, lesson_id, stage, tutor_id, report_year, report_week, \
     scheduled_for, status, attempts, retry_at, payload, last_error, version, \
     created_at, updated_at";

const LESSON_COLUMNS: &str = "lesson_id, student_id, tutor_id, occurred_at, duration_minutes, \
     topics, rating, struggle_types, notes, ai_extraction";

const DEFICIT_COLUMNS: &str = "student_id, topic, occurrence_count, last_occurrence, \
     struggle_types, suggested_action, resolved, resolved_at, counted_lessons, version";

/// Postgres-backed store; also serves as the student directory.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_db(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn seed(&self) -> Result<()> {
        let tutors = vec![("tutor-rivera", "Sam Rivera", -300), ("tutor-okafor", "Ada Okafor", 60)];
        for (id, name, offset) in tutors {
            sqlx::query(
                r#"
                INSERT INTO tutor_cadence.tutors (id, full_name, utc_offset_minutes)
                VALUES ($1, $2, $3)
                ON CONFLICT (id) DO UPDATE
                SET full_name = EXCLUDED.full_name, utc_offset_minutes = EXCLUDED.utc_offset_minutes
                "#,
            )
            .bind(id)
            .bind(name)
            .bind(offset)
            .execute(&self.pool)
            .await?;
        }

        let students = vec![
            ("stu-maya", "Maya Chen", "tutor-rivera"),
            ("stu-leo", "Leo Martins", "tutor-rivera"),
            ("stu-imani", "Imani Brooks", "tutor-okafor"),
        ];
        for (id, name, tutor_id) in students {
            sqlx::query(
                r#"
                INSERT INTO tutor_cadence.students (id, full_name, tutor_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (id) DO UPDATE
                SET full_name = EXCLUDED.full_name, tutor_id = EXCLUDED.tutor_id
                "#,
            )
            .bind(id)
            .bind(name)
            .bind(tutor_id)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn set_opted_out(&self, student_id: &str, opted_out: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE tutor_cadence.students SET opted_out = $2 WHERE id = $1")
            .bind(student_id)
            .bind(opted_out)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl Directory for PgStore {
    async fn student(&self, student_id: &str) -> Result<Option<Student>> {
        let row = sqlx::query(
            "SELECT id, full_name, tutor_id, opted_out FROM tutor_cadence.students WHERE id = $1",
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Student> {
            Ok(Student {
                id: row.try_get("id")?,
                full_name: row.try_get("full_name")?,
                tutor_id: row.try_get("tutor_id")?,
                opted_out: row.try_get("opted_out")?,
            })
        })
        .transpose()
    }

    async fn tutor_offset(&self, tutor_id: &str) -> Result<Option<FixedOffset>> {
        let minutes: Option<i32> =
            sqlx::query_scalar("SELECT utc_offset_minutes FROM tutor_cadence.tutors WHERE id = $1")
                .bind(tutor_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(minutes.and_then(|m| FixedOffset::east_opt(m * 60)))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn save_lesson(&self, lesson: &LessonObservation) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO tutor_cadence.lessons
            (lesson_id, student_id, tutor_id, occurred_at, duration_minutes, topics, rating,
             struggle_types, notes, ai_extraction)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (lesson_id) DO NOTHING
            "#,
        )
        .bind(&lesson.lesson_id)
        .bind(&lesson.student_id)
        .bind(&lesson.tutor_id)
        .bind(lesson.timestamp)
        .bind(i32::try_from(lesson.duration_minutes).map_err(|_| {
            CadenceError::validation(format!(
                "duration {} minutes does not fit the lessons table",
                lesson.duration_minutes
            ))
        })?)
        .bind(&lesson.topics)
        .bind(lesson.rating.as_str())
        .bind(&lesson.struggle_types)
        .bind(&lesson.notes)
        .bind(lesson.ai_extraction.as_ref().map(Json))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn lesson(&self, lesson_id: &str) -> Result<Option<LessonObservation>> {
        let query =
            format!("SELECT {LESSON_COLUMNS} FROM tutor_cadence.lessons WHERE lesson_id = $1");
        let row = sqlx::query(&query)
            .bind(lesson_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lesson_from_row).transpose()
    }

    async fn lessons_between(
        &self,
        student_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LessonObservation>> {
        let query = format!(
            "SELECT {LESSON_COLUMNS} FROM tutor_cadence.lessons \
             WHERE student_id = $1 AND occurred_at >= $2 AND occurred_at < $3 \
             ORDER BY occurred_at"
        );
        let rows = sqlx::query(&query)
            .bind(student_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(lesson_from_row).collect()
    }

    async fn deficit(&self, student_id: &str, topic: &str) -> Result<Option<DeficitPattern>> {
        let query = format!(
            "SELECT {DEFICIT_COLUMNS} FROM tutor_cadence.deficit_patterns \
             WHERE student_id = $1 AND topic = $2"
        );
        let row = sqlx::query(&query)
            .bind(student_id)
            .bind(topic)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(deficit_from_row).transpose()
    }

    async fn save_deficit(&self, pattern: &DeficitPattern) -> Result<Option<DeficitPattern>> {
        let counted: Vec<String> = pattern.counted_lessons.iter().cloned().collect();
        let statement = if pattern.version == 0 {
            r#"
            INSERT INTO tutor_cadence.deficit_patterns
            (student_id, topic, occurrence_count, last_occurrence, struggle_types,
             suggested_action, resolved, resolved_at, counted_lessons, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 1)
            ON CONFLICT (student_id, topic) DO NOTHING
            RETURNING version
            "#
        } else {
            r#"
            UPDATE tutor_cadence.deficit_patterns
            SET occurrence_count = $3, last_occurrence = $4, struggle_types = $5,
                suggested_action = $6, resolved = $7, resolved_at = $8,
                counted_lessons = $9, version = version + 1
            WHERE student_id = $1 AND topic = $2 AND version = $10
            RETURNING version
            "#
        };
        let mut query = sqlx::query_scalar::<_, i64>(statement)
            .bind(&pattern.student_id)
            .bind(&pattern.topic)
            .bind(i32::try_from(pattern.occurrence_count).unwrap_or(i32::MAX))
            .bind(pattern.last_occurrence)
            .bind(Json(&pattern.struggle_types))
            .bind(&pattern.suggested_action)
            .bind(pattern.resolved)
            .bind(pattern.resolved_at)
            .bind(counted);
        if pattern.version > 0 {
            query = query.bind(pattern.version as i64);
        }
        let version = query.fetch_optional(&self.pool).await?;

        Ok(version.map(|v| {
            let mut stored = pattern.clone();
            stored.version = v as u64;
            stored
        }))
    }

    async fn deficits(&self, student_id: Option<&str>) -> Result<Vec<DeficitPattern>> {
        let mut query = format!("SELECT {DEFICIT_COLUMNS} FROM tutor_cadence.deficit_patterns");
        if student_id.is_some() {
            query.push_str(" WHERE student_id = $1");
        }
        query.push_str(" ORDER BY student_id, topic");

        let mut rows = sqlx::query(&query);
        if let Some(value) = student_id {
            rows = rows.bind(value);
        }
        let records = rows.fetch_all(&self.pool).await?;
        records.iter().map(deficit_from_row).collect()
    }

    async fn insert_job(&self, job: &MessageJob) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO tutor_cadence.message_jobs
            (id, student_id, lesson_id, stage, tutor_id, report_year, report_week,
             scheduled_for, status, attempts, retry_at, payload, last_error, version,
             created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(&job.key.student_id)
        .bind(&job.key.lesson_id)
        .bind(job.key.stage.as_str())
        .bind(&job.tutor_id)
        .bind(job.report_week.map(|w| w.year))
        .bind(job.report_week.map(|w| w.week as i32))
        .bind(job.scheduled_for)
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.retry_at)
        .bind(job.payload.as_ref().map(Json))
        .bind(&job.last_error)
        .bind(job.version as i64)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn job(&self, key: &JobKey) -> Result<Option<MessageJob>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM tutor_cadence.message_jobs \
             WHERE student_id = $1 AND lesson_id = $2 AND stage = $3"
        );
        let row = sqlx::query(&query)
            .bind(&key.student_id)
            .bind(&key.lesson_id)
            .bind(key.stage.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn job_by_id(&self, id: Uuid) -> Result<Option<MessageJob>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM tutor_cadence.message_jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn weekly_job(&self, student_id: &str, week: ReportWeek) -> Result<Option<MessageJob>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM tutor_cadence.message_jobs \
             WHERE student_id = $1 AND stage = 'weekly_report' \
             AND report_year = $2 AND report_week = $3"
        );
        let row = sqlx::query(&query)
            .bind(student_id)
            .bind(week.year)
            .bind(week.week as i32)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn jobs(&self, student_id: Option<&str>) -> Result<Vec<MessageJob>> {
        let mut query = format!("SELECT {JOB_COLUMNS} FROM tutor_cadence.message_jobs");
        if student_id.is_some() {
            query.push_str(" WHERE student_id = $1");
        }
        query.push_str(" ORDER BY scheduled_for, student_id, lesson_id, stage");

        let mut rows = sqlx::query(&query);
        if let Some(value) = student_id {
            rows = rows.bind(value);
        }
        let records = rows.fetch_all(&self.pool).await?;
        records.iter().map(job_from_row).collect()
    }

    async fn ready_jobs(&self, now: DateTime<Utc>, due_lease: Duration) -> Result<Vec<MessageJob>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM tutor_cadence.message_jobs \
             WHERE (status = 'pending' AND scheduled_for <= $1) \
                OR (status = 'failed' AND retry_at IS NOT NULL AND retry_at <= $1) \
                OR (status = 'due' AND updated_at <= $2) \
             ORDER BY scheduled_for, student_id, lesson_id, stage"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(now - due_lease)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn update_job(&self, job: &MessageJob) -> Result<Option<MessageJob>> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE tutor_cadence.message_jobs
            SET scheduled_for = $3, status = $4, attempts = $5, retry_at = $6,
                payload = $7, last_error = $8, updated_at = $9, version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING version
            "#,
        )
        .bind(job.id)
        .bind(job.version as i64)
        .bind(job.scheduled_for)
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.retry_at)
        .bind(job.payload.as_ref().map(Json))
        .bind(&job.last_error)
        .bind(job.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(version.map(|v| {
            let mut stored = job.clone();
            stored.version = v as u64;
            stored
        }))
    }
}

fn lesson_from_row(row: &PgRow) -> Result<LessonObservation> {
    let rating: String = row.try_get("rating")?;
    let duration: i32 = row.try_get("duration_minutes")?;
    let extraction: Option<Json<AiExtraction>> = row.try_get("ai_extraction")?;
    Ok(LessonObservation {
        lesson_id: row.try_get("lesson_id")?,
        student_id: row.try_get("student_id")?,
        tutor_id: row.try_get("tutor_id")?,
        timestamp: row.try_get("occurred_at")?,
        duration_minutes: duration.max(0) as u32,
        topics: row.try_get("topics")?,
        rating: EmojiRating::parse(&rating).unwrap_or(EmojiRating::Unrated),
        struggle_types: row.try_get("struggle_types")?,
        notes: row.try_get("notes")?,
        ai_extraction: extraction.map(|j| j.0),
    })
}

fn deficit_from_row(row: &PgRow) -> Result<DeficitPattern> {
    let count: i32 = row.try_get("occurrence_count")?;
    let tags: Json<BTreeMap<String, u32>> = row.try_get("struggle_types")?;
    let counted: Vec<String> = row.try_get("counted_lessons")?;
    let version: i64 = row.try_get("version")?;
    Ok(DeficitPattern {
        student_id: row.try_get("student_id")?,
        topic: row.try_get("topic")?,
        occurrence_count: count.max(0) as u32,
        last_occurrence: row.try_get("last_occurrence")?,
        struggle_types: tags.0,
        suggested_action: row.try_get("suggested_action")?,
        resolved: row.try_get("resolved")?,
        resolved_at: row.try_get("resolved_at")?,
        counted_lessons: counted.into_iter().collect(),
        version: version.max(0) as u64,
    })
}

fn job_from_row(row: &PgRow) -> Result<MessageJob> {
    let stage: String = row.try_get("stage")?;
    let status: String = row.try_get("status")?;
    let year: Option<i32> = row.try_get("report_year")?;
    let week: Option<i32> = row.try_get("report_week")?;
    let attempts: i32 = row.try_get("attempts")?;
    let version: i64 = row.try_get("version")?;
    let payload: Option<Json<RenderedContent>> = row.try_get("payload")?;

    Ok(MessageJob {
        id: row.try_get("id")?,
        key: JobKey {
            student_id: row.try_get("student_id")?,
            lesson_id: row.try_get("lesson_id")?,
            stage: Stage::parse(&stage)
                .ok_or_else(|| CadenceError::Storage(format!("unknown stage {stage}")))?,
        },
        tutor_id: row.try_get("tutor_id")?,
        report_week: year.zip(week).map(|(year, week)| ReportWeek {
            year,
            week: week as u32,
        }),
        scheduled_for: row.try_get("scheduled_for")?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| CadenceError::Storage(format!("unknown job status {status}")))?,
        attempts: attempts.max(0) as u32,
        retry_at: row.try_get("retry_at")?,
        payload: payload.map(|j| j.0),
        last_error: row.try_get("last_error")?,
        version: version as u64,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
