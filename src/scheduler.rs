//! Creates message jobs for ingested lessons and fires them when due.

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use futures::stream::{self, StreamExt};

use crate::cadence::{report_week, report_window, Cadence, CadenceStep, JobScope};
use crate::config::CadenceConfig;
use crate::deficit::rank_by_focus;
use crate::dispatch::{DispatchTracker, Outcome};
use crate::error::{CadenceError, Result};
use crate::locks::KeyedLocks;
use crate::models::{
    JobKey, LessonObservation, MessageJob, RenderedContent, ReportWeek, Stage, Student,
    WeeklyReportWindow,
};
use crate::ports::Directory;
use crate::render::{render, RenderSubject};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ScheduleLock {
    Lesson { student_id: String, lesson_id: String },
    Week { student_id: String, week: ReportWeek },
}

/// Jobs that changed state during one sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepOutcome {
    pub dispatched: Vec<MessageJob>,
    /// Failed on this sweep, whether terminally or with a retry scheduled.
    pub failed: Vec<MessageJob>,
    pub cancelled: Vec<MessageJob>,
    /// Jobs left untouched because of a storage or concurrency error.
    pub errors: usize,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
    cadence: Cadence,
    tracker: DispatchTracker,
    locks: KeyedLocks<ScheduleLock>,
    default_offset: FixedOffset,
    due_lease: Duration,
    concurrency: usize,
}

impl Scheduler {
    pub fn new(
        config: &CadenceConfig,
        store: Arc<dyn Store>,
        directory: Arc<dyn Directory>,
        tracker: DispatchTracker,
    ) -> Result<Self> {
        let default_offset = FixedOffset::east_opt(config.default_tutor_offset_minutes * 60)
            .ok_or_else(|| {
                CadenceError::Config(format!(
                    "default_tutor_offset_minutes out of range: {}",
                    config.default_tutor_offset_minutes
                ))
            })?;
        Ok(Self {
            store,
            directory,
            cadence: Cadence::from_config(config),
            tracker,
            locks: KeyedLocks::new(),
            default_offset,
            due_lease: config.due_lease(),
            concurrency: config.sweep_concurrency.max(1),
        })
    }

    /// Ensures every cadence stage has a job for `lesson`, creating the
    /// missing ones. Due times are anchored on `now`.
    pub async fn schedule(
        &self,
        lesson: &LessonObservation,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageJob>> {
        let offset = self.tutor_offset(&lesson.tutor_id).await?;
        let _lesson_guard = self
            .locks
            .lock(ScheduleLock::Lesson {
                student_id: lesson.student_id.clone(),
                lesson_id: lesson.lesson_id.clone(),
            })
            .await;

        let mut jobs = Vec::with_capacity(self.cadence.steps().len());
        for step in self.cadence.steps() {
            let key = JobKey {
                student_id: lesson.student_id.clone(),
                lesson_id: lesson.lesson_id.clone(),
                stage: step.stage,
            };
            if let Some(existing) = self.store.job(&key).await? {
                jobs.push(existing);
                continue;
            }
            let job = self.create_for_step(step, key, lesson, offset, now).await?;
            jobs.push(job);
        }
        self.locks.prune();
        Ok(jobs)
    }

    async fn create_for_step(
        &self,
        step: &CadenceStep,
        key: JobKey,
        lesson: &LessonObservation,
        offset: FixedOffset,
        now: DateTime<Utc>,
    ) -> Result<MessageJob> {
        let due = step.rule.due_at(now, offset);
        match step.scope {
            JobScope::PerLesson => {
                let job = MessageJob::new(key, &lesson.tutor_id, None, due, now);
                self.insert(job).await
            }
            JobScope::PerWeek => {
                let week = report_week(due, offset);
                let _week_guard = self
                    .locks
                    .lock(ScheduleLock::Week {
                        student_id: lesson.student_id.clone(),
                        week,
                    })
                    .await;
                if let Some(existing) = self.store.weekly_job(&lesson.student_id, week).await? {
                    tracing::debug!(
                        student = %lesson.student_id,
                        lesson = %lesson.lesson_id,
                        week = %week,
                        "weekly report already scheduled"
                    );
                    return Ok(existing);
                }
                let job = MessageJob::new(key, &lesson.tutor_id, Some(week), due, now);
                self.insert(job).await
            }
        }
    }

    /// Inserts `job`, or returns the row another process inserted first.
    async fn insert(&self, job: MessageJob) -> Result<MessageJob> {
        if self.store.insert_job(&job).await? {
            tracing::info!(
                job = %job.id,
                key = %job.key,
                scheduled_for = %job.scheduled_for,
                "job scheduled"
            );
            return Ok(job);
        }
        if let Some(existing) = self.store.job(&job.key).await? {
            return Ok(existing);
        }
        if let Some(week) = job.report_week {
            if let Some(existing) = self.store.weekly_job(&job.key.student_id, week).await? {
                return Ok(existing);
            }
        }
        Err(CadenceError::ConcurrencyConflict(format!("job {}", job.key)))
    }

    /// Fires every ready job. Keys run concurrently; each key is serialised.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepOutcome> {
        let ready = self.store.ready_jobs(now, self.due_lease).await?;
        if ready.is_empty() {
            return Ok(SweepOutcome::default());
        }
        tracing::debug!(count = ready.len(), "sweeping ready jobs");

        let results: Vec<(JobKey, Result<Outcome>)> = stream::iter(ready)
            .map(|job| async move {
                let result = self.fire(&job.key, now).await;
                (job.key, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut outcome = SweepOutcome::default();
        for (key, result) in results {
            match result {
                Ok(Outcome::Sent(job)) => outcome.dispatched.push(job),
                Ok(Outcome::Failed(job)) => outcome.failed.push(job),
                Ok(Outcome::Cancelled(job)) => outcome.cancelled.push(job),
                Ok(Outcome::Skipped) => {}
                Err(err) => {
                    tracing::error!(key = %key, error = %err, "job left for next sweep");
                    outcome.errors += 1;
                }
            }
        }
        for list in [&mut outcome.dispatched, &mut outcome.failed, &mut outcome.cancelled] {
            list.sort_by(|a, b| {
                a.scheduled_for
                    .cmp(&b.scheduled_for)
                    .then_with(|| a.key.cmp(&b.key))
            });
        }
        self.tracker.prune_locks();

        tracing::info!(
            dispatched = outcome.dispatched.len(),
            failed = outcome.failed.len(),
            cancelled = outcome.cancelled.len(),
            errors = outcome.errors,
            "sweep finished"
        );
        Ok(outcome)
    }

    async fn fire(&self, key: &JobKey, now: DateTime<Utc>) -> Result<Outcome> {
        let _guard = self.tracker.lock(key).await;
        let Some(job) = self.store.job(key).await? else {
            return Ok(Outcome::Skipped);
        };
        if !job.is_ready(now, self.due_lease) {
            tracing::debug!(key = %key, status = %job.status, "job no longer ready");
            return Ok(Outcome::Skipped);
        }

        let student = match self.directory.student(&key.student_id).await? {
            Some(student) if student.opted_out => return self.tracker.cancel(&job, now).await,
            Some(student) => student,
            None => {
                let err = CadenceError::NotFound {
                    entity: "student",
                    id: key.student_id.clone(),
                };
                return self.tracker.reject(&job, err, now).await;
            }
        };

        let Some(job) = self.tracker.begin(&job, now).await? else {
            return Ok(Outcome::Skipped);
        };
        match self.compose(&job, &student).await {
            Ok(content) => self.tracker.deliver(job, content, now).await,
            Err(err @ (CadenceError::Template { .. } | CadenceError::NotFound { .. })) => {
                self.tracker.reject(&job, err, now).await
            }
            // Left in `due`; the lease hands it to a later sweep.
            Err(err) => Err(err),
        }
    }

    async fn compose(&self, job: &MessageJob, student: &Student) -> Result<RenderedContent> {
        match job.stage() {
            Stage::WeeklyReport => {
                let window = self.weekly_window(job).await?;
                render(
                    job.stage(),
                    RenderSubject::Week(&window),
                    &student.full_name,
                    &window.deficits,
                )
            }
            Stage::PostLesson | Stage::ProgressCard => {
                // A lesson stored under another student never renders here.
                let lesson = self
                    .store
                    .lesson(&job.key.lesson_id)
                    .await?
                    .filter(|lesson| lesson.student_id == job.key.student_id)
                    .ok_or_else(|| CadenceError::NotFound {
                        entity: "lesson",
                        id: job.key.lesson_id.clone(),
                    })?;
                let mut deficits: Vec<_> = self
                    .store
                    .deficits(Some(&job.key.student_id))
                    .await?
                    .into_iter()
                    .filter(|d| lesson.topics.contains(&d.topic))
                    .collect();
                rank_by_focus(&mut deficits, job.scheduled_for);
                render(
                    job.stage(),
                    RenderSubject::Lesson(&lesson),
                    &student.full_name,
                    &deficits,
                )
            }
        }
    }

    /// Lessons and open deficits the weekly report for `job` covers.
    pub async fn weekly_window(&self, job: &MessageJob) -> Result<WeeklyReportWindow> {
        let week = job.report_week.ok_or(CadenceError::Template {
            stage: Stage::WeeklyReport,
            placeholder: "week",
        })?;
        let (starts_at, ends_at) = report_window(job.scheduled_for);
        let lessons = self
            .store
            .lessons_between(&job.key.student_id, starts_at, ends_at)
            .await?;
        let mut deficits: Vec<_> = self
            .store
            .deficits(Some(&job.key.student_id))
            .await?
            .into_iter()
            .filter(|d| {
                !d.resolved && d.last_occurrence >= starts_at && d.last_occurrence < ends_at
            })
            .collect();
        rank_by_focus(&mut deficits, ends_at);
        Ok(WeeklyReportWindow {
            student_id: job.key.student_id.clone(),
            week,
            starts_at,
            ends_at,
            lessons,
            deficits,
        })
    }

    /// Cancels every job for the student that has not finished yet.
    pub async fn cancel_student(
        &self,
        student_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageJob>> {
        let mut cancelled = Vec::new();
        for job in self.store.jobs(Some(student_id)).await? {
            if job.is_terminal() {
                continue;
            }
            // Waits for an in-flight dispatch of this key to finish.
            let _guard = self.tracker.lock(&job.key).await;
            let Some(current) = self.store.job(&job.key).await? else {
                continue;
            };
            if current.is_terminal() {
                continue;
            }
            if let Outcome::Cancelled(job) = self.tracker.cancel(&current, now).await? {
                cancelled.push(job);
            }
        }
        self.tracker.prune_locks();
        tracing::info!(
            student = %student_id,
            cancelled = cancelled.len(),
            "student jobs cancelled"
        );
        Ok(cancelled)
    }

    async fn tutor_offset(&self, tutor_id: &str) -> Result<FixedOffset> {
        Ok(self
            .directory
            .tutor_offset(tutor_id)
            .await?
            .unwrap_or(self.default_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeficitPattern, JobStatus};
    use crate::ports::SpecOnlyImageRenderer;
    use crate::store::MemoryStore;
    use crate::testing::{lesson, ts, ContendedStore, ScriptedNotifier, Step};

    struct Harness {
        store: Arc<MemoryStore>,
        notifier: Arc<ScriptedNotifier>,
        scheduler: Scheduler,
    }

    fn harness(steps: &[Step]) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.add_student("stu-1", "Maya Chen", "tutor-1");
        harness_on(store, steps)
    }

    fn harness_on(store: Arc<MemoryStore>, steps: &[Step]) -> Harness {
        let notifier = Arc::new(ScriptedNotifier::new(steps));
        let scheduler = scheduler_over(store.clone(), store.clone(), notifier.clone());
        Harness {
            store,
            notifier,
            scheduler,
        }
    }

    fn scheduler_over(
        store: Arc<dyn Store>,
        directory: Arc<MemoryStore>,
        notifier: Arc<ScriptedNotifier>,
    ) -> Scheduler {
        let config = CadenceConfig::default();
        let tracker = DispatchTracker::new(
            &config,
            store.clone(),
            Arc::new(SpecOnlyImageRenderer),
            notifier,
        );
        Scheduler::new(&config, store, directory, tracker).unwrap()
    }

    async fn ingest(h: &Harness, observation: &LessonObservation, now: &str) -> Vec<MessageJob> {
        h.store.save_lesson(observation).await.unwrap();
        h.scheduler.schedule(observation, ts(now)).await.unwrap()
    }

    #[tokio::test]
    async fn lesson_gets_three_stages() {
        let h = harness(&[]);
        let l1 = lesson("l1", "stu-1", "2024-01-10T15:00:00Z", &["fractions"], &["computation"]);
        let jobs = ingest(&h, &l1, "2024-01-10T15:00:00Z").await;

        let due: Vec<_> = jobs.iter().map(|j| (j.stage(), j.scheduled_for)).collect();
        assert_eq!(
            due,
            vec![
                (Stage::PostLesson, ts("2024-01-10T15:00:00Z")),
                (Stage::ProgressCard, ts("2024-01-13T15:00:00Z")),
                (Stage::WeeklyReport, ts("2024-01-14T00:00:00Z")),
            ]
        );
        assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));
        assert_eq!(jobs[2].report_week, Some(ReportWeek { year: 2024, week: 2 }));
    }

    #[tokio::test]
    async fn weekly_report_follows_tutor_offset() {
        let h = harness(&[]);
        h.store
            .set_tutor_offset("tutor-1", FixedOffset::west_opt(5 * 3600).unwrap());
        let l1 = lesson("l1", "stu-1", "2024-01-10T15:00:00Z", &["fractions"], &[]);
        let jobs = ingest(&h, &l1, "2024-01-10T15:00:00Z").await;
        assert_eq!(jobs[2].scheduled_for, ts("2024-01-14T05:00:00Z"));
    }

    #[tokio::test]
    async fn re_ingest_is_idempotent() {
        let h = harness(&[]);
        let l1 = lesson("l1", "stu-1", "2024-01-10T15:00:00Z", &["fractions"], &[]);
        let first = ingest(&h, &l1, "2024-01-10T15:00:00Z").await;
        let second = ingest(&h, &l1, "2024-01-10T18:00:00Z").await;

        assert_eq!(first, second);
        assert_eq!(h.store.jobs(Some("stu-1")).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn one_weekly_report_per_student_week() {
        let h = harness(&[]);
        let l1 = lesson("l1", "stu-1", "2024-01-08T15:00:00Z", &["fractions"], &[]);
        let l2 = lesson("l2", "stu-1", "2024-01-10T15:00:00Z", &["decimals"], &[]);
        let first = ingest(&h, &l1, "2024-01-08T15:00:00Z").await;
        let second = ingest(&h, &l2, "2024-01-10T15:00:00Z").await;

        assert_eq!(first[2].id, second[2].id);
        assert_eq!(second[2].key.lesson_id, "l1");
        let weekly = h
            .store
            .jobs(Some("stu-1"))
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.stage() == Stage::WeeklyReport)
            .count();
        assert_eq!(weekly, 1);

        // Next week gets its own report.
        let l3 = lesson("l3", "stu-1", "2024-01-15T15:00:00Z", &["decimals"], &[]);
        let third = ingest(&h, &l3, "2024-01-15T15:00:00Z").await;
        assert_ne!(third[2].id, first[2].id);
        assert_eq!(third[2].report_week, Some(ReportWeek { year: 2024, week: 3 }));
    }

    #[tokio::test]
    async fn sweep_sends_due_jobs_once() {
        let h = harness(&[]);
        let l1 = lesson("l1", "stu-1", "2024-01-10T15:00:00Z", &["fractions"], &["computation"]);
        ingest(&h, &l1, "2024-01-10T15:00:00Z").await;

        let outcome = h.scheduler.sweep(ts("2024-01-10T15:00:00Z")).await.unwrap();
        assert_eq!(outcome.dispatched.len(), 1);
        assert_eq!(outcome.dispatched[0].stage(), Stage::PostLesson);

        let again = h.scheduler.sweep(ts("2024-01-10T15:05:00Z")).await.unwrap();
        assert!(again.dispatched.is_empty());
        assert_eq!(h.notifier.calls(), 1);

        let later = h.scheduler.sweep(ts("2024-01-14T00:00:00Z")).await.unwrap();
        let stages: Vec<_> = later.dispatched.iter().map(|j| j.stage()).collect();
        assert_eq!(stages, vec![Stage::ProgressCard, Stage::WeeklyReport]);
        assert_eq!(h.notifier.calls(), 3);
    }

    #[tokio::test]
    async fn concurrent_sweeps_send_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        store.add_student("stu-1", "Maya Chen", "tutor-1");
        // Separate schedulers share only the store, like separate processes.
        let instances: Vec<Harness> = (0..4).map(|_| harness_on(store.clone(), &[])).collect();
        let l1 = lesson("l1", "stu-1", "2024-01-10T15:00:00Z", &["fractions"], &[]);
        ingest(&instances[0], &l1, "2024-01-10T15:00:00Z").await;

        let now = ts("2024-01-10T15:00:00Z");
        let sweeps = instances
            .iter()
            .flat_map(|h| [h.scheduler.sweep(now), h.scheduler.sweep(now)]);
        let outcomes = futures::future::join_all(sweeps).await;

        let sent: usize = outcomes
            .iter()
            .map(|o| o.as_ref().unwrap().dispatched.len())
            .sum();
        assert_eq!(sent, 1);
        let calls: usize = instances.iter().map(|h| h.notifier.calls()).sum();
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_until_sent() {
        let h = harness(&[Step::Hang, Step::Hang]);
        let l1 = lesson("l1", "stu-1", "2024-01-10T15:00:00Z", &["fractions"], &[]);
        ingest(&h, &l1, "2024-01-10T15:00:00Z").await;

        let first = h.scheduler.sweep(ts("2024-01-10T15:00:00Z")).await.unwrap();
        assert_eq!(first.failed.len(), 1);
        let retry_at = first.failed[0].retry_at.unwrap();
        assert_eq!(retry_at, ts("2024-01-10T15:01:00Z"));

        // Not before the backoff elapses.
        let early = h.scheduler.sweep(ts("2024-01-10T15:00:30Z")).await.unwrap();
        assert!(early.failed.is_empty() && early.dispatched.is_empty());

        let second = h.scheduler.sweep(retry_at).await.unwrap();
        let retry_at = second.failed[0].retry_at.unwrap();
        assert_eq!(retry_at, ts("2024-01-10T15:06:00Z"));

        let third = h.scheduler.sweep(retry_at).await.unwrap();
        assert_eq!(third.dispatched.len(), 1);
        let sent = &third.dispatched[0];
        assert_eq!(sent.status, JobStatus::Sent);
        assert_eq!(sent.attempts, 3);
        assert!(h.notifier.failures().is_empty());
    }

    #[tokio::test]
    async fn progress_card_without_topics_fails_without_attempt() {
        let h = harness(&[]);
        let l1 = lesson("l1", "stu-1", "2024-01-10T15:00:00Z", &[], &[]);
        ingest(&h, &l1, "2024-01-10T15:00:00Z").await;

        let outcome = h.scheduler.sweep(ts("2024-01-13T15:00:00Z")).await.unwrap();
        assert_eq!(outcome.dispatched.len(), 1);
        assert_eq!(outcome.failed.len(), 1);
        let failed = &outcome.failed[0];
        assert_eq!(failed.stage(), Stage::ProgressCard);
        assert_eq!(failed.attempts, 0);
        assert!(failed.is_terminal());
        assert!(failed.last_error.as_deref().unwrap().contains("topics"));
        assert_eq!(h.notifier.failures().len(), 1);
    }

    #[tokio::test]
    async fn weekly_window_collects_lessons_and_open_deficits() {
        let h = harness(&[]);
        let l1 = lesson("l1", "stu-1", "2024-01-08T15:00:00Z", &["fractions"], &[]);
        let l2 = lesson("l2", "stu-1", "2024-01-10T15:00:00Z", &["decimals"], &[]);
        let jobs = ingest(&h, &l1, "2024-01-08T15:00:00Z").await;
        ingest(&h, &l2, "2024-01-10T15:00:00Z").await;

        let window = h.scheduler.weekly_window(&jobs[2]).await.unwrap();
        assert_eq!(window.starts_at, ts("2024-01-07T00:00:00Z"));
        assert_eq!(window.ends_at, ts("2024-01-14T00:00:00Z"));
        let ids: Vec<_> = window.lessons.iter().map(|l| l.lesson_id.as_str()).collect();
        assert_eq!(ids, vec!["l1", "l2"]);
    }

    #[tokio::test]
    async fn cancel_student_leaves_sent_jobs_alone() {
        let h = harness(&[]);
        let l1 = lesson("l1", "stu-1", "2024-01-10T15:00:00Z", &["fractions"], &[]);
        ingest(&h, &l1, "2024-01-10T15:00:00Z").await;
        h.scheduler.sweep(ts("2024-01-10T15:00:00Z")).await.unwrap();

        let cancelled = h
            .scheduler
            .cancel_student("stu-1", ts("2024-01-11T09:00:00Z"))
            .await
            .unwrap();
        let stages: Vec<_> = cancelled.iter().map(|j| j.stage()).collect();
        assert_eq!(stages.len(), 2);
        assert!(!stages.contains(&Stage::PostLesson));

        let jobs = h.store.jobs(Some("stu-1")).await.unwrap();
        for job in jobs {
            let expected = if job.stage() == Stage::PostLesson {
                JobStatus::Sent
            } else {
                JobStatus::Cancelled
            };
            assert_eq!(job.status, expected, "{}", job.key);
        }

        let later = h.scheduler.sweep(ts("2024-01-20T00:00:00Z")).await.unwrap();
        assert_eq!(later, SweepOutcome::default());
    }

    #[tokio::test]
    async fn opted_out_student_is_cancelled_at_fire_time() {
        let h = harness(&[]);
        let l1 = lesson("l1", "stu-1", "2024-01-10T15:00:00Z", &["fractions"], &[]);
        ingest(&h, &l1, "2024-01-10T15:00:00Z").await;
        h.store.set_opted_out("stu-1", true);

        let outcome = h.scheduler.sweep(ts("2024-01-10T15:00:00Z")).await.unwrap();
        assert_eq!(outcome.cancelled.len(), 1);
        assert_eq!(h.notifier.calls(), 0);
    }

    #[tokio::test]
    async fn missing_lesson_rejects_the_job() {
        let h = harness(&[]);
        let l1 = lesson("l1", "stu-1", "2024-01-10T15:00:00Z", &["fractions"], &[]);
        // Scheduled without ever being stored.
        h.scheduler.schedule(&l1, ts("2024-01-10T15:00:00Z")).await.unwrap();

        let outcome = h.scheduler.sweep(ts("2024-01-10T15:00:00Z")).await.unwrap();
        assert_eq!(outcome.failed.len(), 1);
        assert!(outcome.failed[0].last_error.as_deref().unwrap().contains("lesson"));
        assert_eq!(outcome.failed[0].attempts, 0);
    }

    #[tokio::test]
    async fn lesson_of_another_student_is_never_rendered() {
        let h = harness(&[]);
        h.store.add_student("stu-2", "Ben Ortiz", "tutor-1");
        let mut l1 = lesson("l1", "stu-1", "2024-01-10T15:00:00Z", &["fractions"], &[]);
        l1.notes = "Maya found the quiz stressful.".into();
        ingest(&h, &l1, "2024-01-10T15:00:00Z").await;
        // Same lesson id scheduled for someone else, never stored for them.
        let stray = lesson("l1", "stu-2", "2024-01-10T15:00:00Z", &["geometry"], &[]);
        h.scheduler.schedule(&stray, ts("2024-01-10T15:00:00Z")).await.unwrap();

        let outcome = h.scheduler.sweep(ts("2024-01-10T15:00:00Z")).await.unwrap();
        assert_eq!(outcome.dispatched.len(), 1);
        assert_eq!(outcome.dispatched[0].key.student_id, "stu-1");
        assert_eq!(outcome.failed.len(), 1);
        let rejected = &outcome.failed[0];
        assert_eq!(rejected.key.student_id, "stu-2");
        assert_eq!(rejected.attempts, 0);
        assert!(rejected.payload.is_none());

        assert_eq!(h.notifier.calls(), 1);
        let presented = h.notifier.presented();
        assert!(presented[0].1.content.title.contains("Maya Chen"));
        assert_eq!(h.notifier.failures().len(), 1);
    }

    #[tokio::test]
    async fn abandoned_due_job_is_picked_up_after_the_lease() {
        let h = harness(&[]);
        let l1 = lesson("l1", "stu-1", "2024-01-10T15:00:00Z", &["fractions"], &[]);
        let jobs = ingest(&h, &l1, "2024-01-10T15:00:00Z").await;

        // A dispatcher claimed the message and then went away.
        let mut claimed = jobs[0].clone();
        claimed.status = JobStatus::Due;
        claimed.updated_at = ts("2024-01-10T15:00:00Z");
        h.store.update_job(&claimed).await.unwrap().unwrap();

        let early = h.scheduler.sweep(ts("2024-01-10T15:02:00Z")).await.unwrap();
        assert_eq!(early, SweepOutcome::default());
        assert_eq!(h.notifier.calls(), 0);

        let expired = h.scheduler.sweep(ts("2024-01-10T15:05:00Z")).await.unwrap();
        assert_eq!(expired.dispatched.len(), 1);
        assert_eq!(expired.dispatched[0].stage(), Stage::PostLesson);
        assert_eq!(expired.dispatched[0].status, JobStatus::Sent);
        assert_eq!(expired.dispatched[0].attempts, 1);

        let after = h.scheduler.sweep(ts("2024-01-10T15:10:00Z")).await.unwrap();
        assert!(after.dispatched.is_empty());
        assert_eq!(h.notifier.calls(), 1);
    }

    #[tokio::test]
    async fn claims_lost_to_another_writer_are_counted_and_left_pending() {
        let h = harness(&[]);
        let l1 = lesson("l1", "stu-1", "2024-01-10T15:00:00Z", &["fractions"], &[]);
        ingest(&h, &l1, "2024-01-10T15:00:00Z").await;

        let contended = Arc::new(ContendedStore::new(h.store.clone()));
        contended.reject_job_updates();
        let notifier = Arc::new(ScriptedNotifier::default());
        let losing = scheduler_over(contended, h.store.clone(), notifier.clone());

        let outcome = losing.sweep(ts("2024-01-10T15:00:00Z")).await.unwrap();
        assert!(outcome.dispatched.is_empty());
        assert_eq!(outcome.errors, 1);
        assert_eq!(notifier.calls(), 0);
        let key = JobKey {
            student_id: "stu-1".into(),
            lesson_id: "l1".into(),
            stage: Stage::PostLesson,
        };
        let stored = h.store.job(&key).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);

        let healthy = h.scheduler.sweep(ts("2024-01-10T15:00:00Z")).await.unwrap();
        assert_eq!(healthy.dispatched.len(), 1);
    }

    #[tokio::test]
    async fn lesson_messages_lead_with_the_most_pressing_deficit() {
        let h = harness(&[]);
        let l1 = lesson("l1", "stu-1", "2024-02-29T15:00:00Z", &["fractions", "decimals"], &[]);
        ingest(&h, &l1, "2024-03-01T00:00:00Z").await;

        let mut recent = DeficitPattern::new("stu-1", "fractions", ts("2024-02-28T00:00:00Z"));
        recent.occurrence_count = 2;
        recent.suggested_action = "Monitor fractions: difficulty in 2 lessons".into();
        let mut stale = DeficitPattern::new("stu-1", "decimals", ts("2023-12-01T00:00:00Z"));
        stale.occurrence_count = 4;
        stale.suggested_action = "Monitor decimals: difficulty in 4 lessons".into();
        for pattern in [&recent, &stale] {
            h.store.save_deficit(pattern).await.unwrap().unwrap();
        }

        let outcome = h.scheduler.sweep(ts("2024-03-01T00:00:00Z")).await.unwrap();
        assert_eq!(outcome.dispatched.len(), 1);
        let body = &h.notifier.presented()[0].1.content.body;
        let fractions = body.find("- fractions: Monitor").unwrap();
        let decimals = body.find("- decimals: Monitor").unwrap();
        assert!(fractions < decimals, "{body}");
    }
}
