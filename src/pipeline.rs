//! Entry points the outside world calls: lesson ingest, sweeps, and the
//! signals that cancel jobs or close deficit patterns.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::config::CadenceConfig;
use crate::deficit::DeficitAggregator;
use crate::dispatch::DispatchTracker;
use crate::error::{CadenceError, Result};
use crate::models::{DeficitPattern, LessonObservation, MessageJob, RawLessonObservation};
use crate::normalize::normalize;
use crate::ports::{Directory, ImageRenderer, TutorNotifier};
use crate::scheduler::{Scheduler, SweepOutcome};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub lesson: LessonObservation,
    pub deficit_updates: Vec<DeficitPattern>,
    /// Jobs for the lesson, existing or new. Empty for opted-out students.
    pub scheduled_jobs: Vec<MessageJob>,
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    aggregator: DeficitAggregator,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(
        config: &CadenceConfig,
        store: Arc<dyn Store>,
        directory: Arc<dyn Directory>,
        images: Arc<dyn ImageRenderer>,
        notifier: Arc<dyn TutorNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let tracker = DispatchTracker::new(config, store.clone(), images, notifier);
        let scheduler = Scheduler::new(config, store.clone(), directory.clone(), tracker)?;
        let aggregator = DeficitAggregator::new(store.clone(), directory, config.decay);
        Ok(Self {
            store,
            aggregator,
            scheduler,
            clock,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Normalizes, folds into deficit patterns, stores, and schedules. Safe
    /// to repeat for the same lesson.
    pub async fn ingest_lesson(&self, raw: RawLessonObservation) -> Result<IngestOutcome> {
        let mut lesson = normalize(raw)?;
        let student = self.aggregator.ensure_student(&lesson.student_id).await?;

        if !self.store.save_lesson(&lesson).await? {
            lesson = self.stored_copy(lesson).await?;
        }
        let deficit_updates = self.aggregator.ingest(&student, &lesson).await?;

        let scheduled_jobs = if student.opted_out {
            tracing::info!(
                student = %student.id,
                lesson = %lesson.lesson_id,
                "student opted out, no messages scheduled"
            );
            Vec::new()
        } else {
            self.scheduler.schedule(&lesson, self.clock.now()).await?
        };

        tracing::info!(
            lesson = %lesson.lesson_id,
            student = %lesson.student_id,
            deficits = deficit_updates.len(),
            jobs = scheduled_jobs.len(),
            "lesson ingested"
        );
        Ok(IngestOutcome {
            lesson,
            deficit_updates,
            scheduled_jobs,
        })
    }

    /// A lesson id stays bound to the student and tutor it was first stored
    /// with. Repeats carry on with the stored copy.
    async fn stored_copy(&self, incoming: LessonObservation) -> Result<LessonObservation> {
        let stored = self
            .store
            .lesson(&incoming.lesson_id)
            .await?
            .ok_or_else(|| {
                CadenceError::Storage(format!(
                    "lesson {} reported as stored but cannot be read",
                    incoming.lesson_id
                ))
            })?;
        if stored.student_id != incoming.student_id || stored.tutor_id != incoming.tutor_id {
            return Err(CadenceError::validation(format!(
                "lesson id {} is already recorded for another student or tutor",
                incoming.lesson_id
            )));
        }
        if stored == incoming {
            tracing::debug!(lesson = %incoming.lesson_id, "lesson already stored");
        } else {
            tracing::warn!(
                lesson = %incoming.lesson_id,
                "lesson already stored with different details, keeping the first copy"
            );
        }
        Ok(stored)
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepOutcome> {
        self.scheduler.sweep(now).await
    }

    /// Reacts to a student being removed or opting out.
    pub async fn cancel_student(&self, student_id: &str) -> Result<Vec<MessageJob>> {
        self.scheduler
            .cancel_student(student_id, self.clock.now())
            .await
    }

    pub async fn resolve_deficit(&self, student_id: &str, topic: &str) -> Result<DeficitPattern> {
        self.aggregator
            .resolve(student_id, topic, self.clock.now())
            .await
    }

    pub async fn reopen_deficit(&self, student_id: &str, topic: &str) -> Result<DeficitPattern> {
        self.aggregator.reopen(student_id, topic).await
    }

    pub async fn apply_decay(&self) -> Result<Vec<DeficitPattern>> {
        self.aggregator.apply_decay(self.clock.now()).await
    }
}
