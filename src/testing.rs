//! Fixtures and collaborator fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CadenceError, Result};
use crate::models::{
    DeficitPattern, EmojiRating, JobKey, LessonObservation, MessageJob, ReportWeek, Stage, Student,
};
use crate::normalize::parse_timestamp;
use crate::ports::{Ack, ShareArtifact, TutorNotifier};
use crate::store::{MemoryStore, Store};

pub fn ts(value: &str) -> DateTime<Utc> {
    parse_timestamp(value).unwrap()
}

pub fn lesson(
    id: &str,
    student_id: &str,
    at: &str,
    topics: &[&str],
    struggles: &[&str],
) -> LessonObservation {
    LessonObservation {
        lesson_id: id.to_string(),
        student_id: student_id.to_string(),
        tutor_id: "tutor-1".to_string(),
        timestamp: ts(at),
        duration_minutes: 60,
        topics: topics.iter().map(|t| t.to_string()).collect(),
        rating: EmojiRating::Unrated,
        struggle_types: struggles.iter().map(|s| s.to_string()).collect(),
        notes: String::new(),
        ai_extraction: None,
    }
}

pub fn student(id: &str, name: &str) -> Student {
    Student {
        id: id.to_string(),
        full_name: name.to_string(),
        tutor_id: "tutor-1".to_string(),
        opted_out: false,
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Step {
    Ack,
    Fail(&'static str),
    /// Never answers within any sane timeout.
    Hang,
}

/// Notifier that replays a script of outcomes, then acknowledges.
#[derive(Default)]
pub struct ScriptedNotifier {
    script: Mutex<VecDeque<Step>>,
    presented: Mutex<Vec<(Stage, ShareArtifact)>>,
    failures: Mutex<Vec<(Uuid, String)>>,
    calls: AtomicUsize,
}

impl ScriptedNotifier {
    pub fn new(steps: &[Step]) -> Self {
        Self {
            script: Mutex::new(steps.iter().copied().collect()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn presented(&self) -> Vec<(Stage, ShareArtifact)> {
        self.presented.lock().unwrap().clone()
    }

    pub fn failures(&self) -> Vec<(Uuid, String)> {
        self.failures.lock().unwrap().clone()
    }
}

#[async_trait]
impl TutorNotifier for ScriptedNotifier {
    async fn present_for_send(&self, stage: Stage, artifact: &ShareArtifact) -> Result<Ack> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Ack);
        match step {
            Step::Ack => {}
            Step::Fail(reason) => return Err(CadenceError::Dispatch(reason.to_string())),
            Step::Hang => tokio::time::sleep(Duration::from_secs(24 * 3600)).await,
        }
        self.presented
            .lock()
            .unwrap()
            .push((stage, artifact.clone()));
        Ok(Ack {
            reference: format!("ack-{}", artifact.job_id),
        })
    }

    async fn report_failure(&self, job_id: Uuid, error: &CadenceError) -> Result<()> {
        self.failures
            .lock()
            .unwrap()
            .push((job_id, error.to_string()));
        Ok(())
    }
}

type RivalWrite = Box<dyn Fn(&mut DeficitPattern) + Send + Sync>;

/// Store that behaves as if another process shares the database: armed rival
/// writes land just before the caller's deficit save, and job updates can be
/// made to lose every compare-and-set.
pub struct ContendedStore {
    inner: Arc<MemoryStore>,
    rival: Mutex<Option<(usize, RivalWrite)>>,
    reject_job_updates: AtomicBool,
}

impl ContendedStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            rival: Mutex::new(None),
            reject_job_updates: AtomicBool::new(false),
        }
    }

    /// The next `times` deficit saves are each preceded by `write` applied to
    /// the stored pattern.
    pub fn arm_rival<F>(&self, times: usize, write: F)
    where
        F: Fn(&mut DeficitPattern) + Send + Sync + 'static,
    {
        *self.rival.lock().unwrap() = Some((times, Box::new(write)));
    }

    pub fn reject_job_updates(&self) {
        self.reject_job_updates.store(true, Ordering::SeqCst);
    }

    async fn rival_write(&self, pattern: &DeficitPattern) -> Result<()> {
        let mut current = self
            .inner
            .deficit(&pattern.student_id, &pattern.topic)
            .await?
            .unwrap_or_else(|| {
                DeficitPattern::new(&pattern.student_id, &pattern.topic, pattern.last_occurrence)
            });
        {
            let mut rival = self.rival.lock().unwrap();
            let Some((remaining, write)) = rival.as_mut() else {
                return Ok(());
            };
            if *remaining == 0 {
                return Ok(());
            }
            *remaining -= 1;
            write(&mut current);
        }
        self.inner.save_deficit(&current).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for ContendedStore {
    async fn save_lesson(&self, lesson: &LessonObservation) -> Result<bool> {
        self.inner.save_lesson(lesson).await
    }

    async fn lesson(&self, lesson_id: &str) -> Result<Option<LessonObservation>> {
        self.inner.lesson(lesson_id).await
    }

    async fn lessons_between(
        &self,
        student_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LessonObservation>> {
        self.inner.lessons_between(student_id, from, to).await
    }

    async fn deficit(&self, student_id: &str, topic: &str) -> Result<Option<DeficitPattern>> {
        self.inner.deficit(student_id, topic).await
    }

    async fn save_deficit(&self, pattern: &DeficitPattern) -> Result<Option<DeficitPattern>> {
        self.rival_write(pattern).await?;
        self.inner.save_deficit(pattern).await
    }

    async fn deficits(&self, student_id: Option<&str>) -> Result<Vec<DeficitPattern>> {
        self.inner.deficits(student_id).await
    }

    async fn insert_job(&self, job: &MessageJob) -> Result<bool> {
        self.inner.insert_job(job).await
    }

    async fn job(&self, key: &JobKey) -> Result<Option<MessageJob>> {
        self.inner.job(key).await
    }

    async fn job_by_id(&self, id: Uuid) -> Result<Option<MessageJob>> {
        self.inner.job_by_id(id).await
    }

    async fn weekly_job(&self, student_id: &str, week: ReportWeek) -> Result<Option<MessageJob>> {
        self.inner.weekly_job(student_id, week).await
    }

    async fn jobs(&self, student_id: Option<&str>) -> Result<Vec<MessageJob>> {
        self.inner.jobs(student_id).await
    }

    async fn ready_jobs(
        &self,
        now: DateTime<Utc>,
        due_lease: chrono::Duration,
    ) -> Result<Vec<MessageJob>> {
        self.inner.ready_jobs(now, due_lease).await
    }

    async fn update_job(&self, job: &MessageJob) -> Result<Option<MessageJob>> {
        if self.reject_job_updates.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.update_job(job).await
    }
}
