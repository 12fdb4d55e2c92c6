use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    DeficitPattern, JobKey, LessonObservation, MessageJob, ReportWeek, Stage, Student,
};
use crate::ports::Directory;
use crate::store::Store;

#[derive(Default)]
struct Tables {
    students: HashMap<String, Student>,
    tutor_offsets: HashMap<String, FixedOffset>,
    lessons: HashMap<String, LessonObservation>,
    deficits: HashMap<(String, String), DeficitPattern>,
    jobs: HashMap<JobKey, MessageJob>,
}

/// Process-local store and directory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_student(&self, id: &str, full_name: &str, tutor_id: &str) {
        self.tables().students.insert(
            id.to_string(),
            Student {
                id: id.to_string(),
                full_name: full_name.to_string(),
                tutor_id: tutor_id.to_string(),
                opted_out: false,
            },
        );
    }

    /// Returns `false` if the student is unknown.
    pub fn set_opted_out(&self, id: &str, opted_out: bool) -> bool {
        match self.tables().students.get_mut(id) {
            Some(student) => {
                student.opted_out = opted_out;
                true
            }
            None => false,
        }
    }

    pub fn set_tutor_offset(&self, tutor_id: &str, offset: FixedOffset) {
        self.tables()
            .tutor_offsets
            .insert(tutor_id.to_string(), offset);
    }
}

#[async_trait]
impl Directory for MemoryStore {
    async fn student(&self, student_id: &str) -> Result<Option<Student>> {
        Ok(self.tables().students.get(student_id).cloned())
    }

    async fn tutor_offset(&self, tutor_id: &str) -> Result<Option<FixedOffset>> {
        Ok(self.tables().tutor_offsets.get(tutor_id).copied())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_lesson(&self, lesson: &LessonObservation) -> Result<bool> {
        let mut tables = self.tables();
        if tables.lessons.contains_key(&lesson.lesson_id) {
            return Ok(false);
        }
        tables
            .lessons
            .insert(lesson.lesson_id.clone(), lesson.clone());
        Ok(true)
    }

    async fn lesson(&self, lesson_id: &str) -> Result<Option<LessonObservation>> {
        Ok(self.tables().lessons.get(lesson_id).cloned())
    }

    async fn lessons_between(
        &self,
        student_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LessonObservation>> {
        let mut lessons: Vec<LessonObservation> = self
            .tables()
            .lessons
            .values()
            .filter(|l| l.student_id == student_id && l.timestamp >= from && l.timestamp < to)
            .cloned()
            .collect();
        lessons.sort_by_key(|l| l.timestamp);
        Ok(lessons)
    }

    async fn deficit(&self, student_id: &str, topic: &str) -> Result<Option<DeficitPattern>> {
        Ok(self
            .tables()
            .deficits
            .get(&(student_id.to_string(), topic.to_string()))
            .cloned())
    }

    async fn save_deficit(&self, pattern: &DeficitPattern) -> Result<Option<DeficitPattern>> {
        let mut tables = self.tables();
        let key = (pattern.student_id.clone(), pattern.topic.clone());
        let current = tables.deficits.get(&key).map_or(0, |stored| stored.version);
        if current != pattern.version {
            return Ok(None);
        }
        let mut next = pattern.clone();
        next.version += 1;
        tables.deficits.insert(key, next.clone());
        Ok(Some(next))
    }

    async fn deficits(&self, student_id: Option<&str>) -> Result<Vec<DeficitPattern>> {
        let mut patterns: Vec<DeficitPattern> = self
            .tables()
            .deficits
            .values()
            .filter(|p| student_id.map_or(true, |id| p.student_id == id))
            .cloned()
            .collect();
        patterns.sort_by(|a, b| (&a.student_id, &a.topic).cmp(&(&b.student_id, &b.topic)));
        Ok(patterns)
    }

    async fn insert_job(&self, job: &MessageJob) -> Result<bool> {
        let mut tables = self.tables();
        if tables.jobs.contains_key(&job.key) {
            return Ok(false);
        }
        if job.key.stage == Stage::WeeklyReport
            && tables.jobs.values().any(|existing| {
                existing.key.stage == Stage::WeeklyReport
                    && existing.key.student_id == job.key.student_id
                    && existing.report_week == job.report_week
            })
        {
            return Ok(false);
        }
        tables.jobs.insert(job.key.clone(), job.clone());
        Ok(true)
    }

    async fn job(&self, key: &JobKey) -> Result<Option<MessageJob>> {
        Ok(self.tables().jobs.get(key).cloned())
    }

    async fn job_by_id(&self, id: Uuid) -> Result<Option<MessageJob>> {
        Ok(self.tables().jobs.values().find(|j| j.id == id).cloned())
    }

    async fn weekly_job(&self, student_id: &str, week: ReportWeek) -> Result<Option<MessageJob>> {
        Ok(self
            .tables()
            .jobs
            .values()
            .find(|j| {
                j.key.stage == Stage::WeeklyReport
                    && j.key.student_id == student_id
                    && j.report_week == Some(week)
            })
            .cloned())
    }

    async fn jobs(&self, student_id: Option<&str>) -> Result<Vec<MessageJob>> {
        let mut jobs: Vec<MessageJob> = self
            .tables()
            .jobs
            .values()
            .filter(|j| student_id.map_or(true, |id| j.key.student_id == id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (a.scheduled_for, &a.key).cmp(&(b.scheduled_for, &b.key)));
        Ok(jobs)
    }

    async fn ready_jobs(&self, now: DateTime<Utc>, due_lease: Duration) -> Result<Vec<MessageJob>> {
        let mut jobs: Vec<MessageJob> = self
            .tables()
            .jobs
            .values()
            .filter(|j| j.is_ready(now, due_lease))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (a.scheduled_for, &a.key).cmp(&(b.scheduled_for, &b.key)));
        Ok(jobs)
    }

    async fn update_job(&self, job: &MessageJob) -> Result<Option<MessageJob>> {
        let mut tables = self.tables();
        let Some(stored) = tables.jobs.get_mut(&job.key) else {
            return Ok(None);
        };
        if stored.version != job.version {
            return Ok(None);
        }
        let mut next = job.clone();
        next.version += 1;
        *stored = next.clone();
        Ok(Some(next))
    }
}
