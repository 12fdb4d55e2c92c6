//! Hand-off of rendered messages to the tutor, with attempt bookkeeping.
//!
//! Every state change goes through [`DispatchTracker::commit`], a versioned
//! compare-and-set against the store. Within one process, callers also hold
//! the job's key lock so a job is never dispatched twice concurrently.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use crate::config::CadenceConfig;
use crate::error::{CadenceError, Result};
use crate::locks::KeyedLocks;
use crate::models::{JobKey, JobStatus, MessageJob, RenderedContent};
use crate::ports::{Ack, ImageRenderer, ShareArtifact, TutorNotifier};
use crate::store::Store;

/// Result of one pass over a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Sent(MessageJob),
    /// Failed on this pass; `retry_at` tells whether it will be retried.
    Failed(MessageJob),
    Cancelled(MessageJob),
    /// Not ready, or another dispatcher got there first.
    Skipped,
}

pub struct DispatchTracker {
    store: Arc<dyn Store>,
    images: Arc<dyn ImageRenderer>,
    notifier: Arc<dyn TutorNotifier>,
    locks: KeyedLocks<JobKey>,
    config: CadenceConfig,
}

impl DispatchTracker {
    pub fn new(
        config: &CadenceConfig,
        store: Arc<dyn Store>,
        images: Arc<dyn ImageRenderer>,
        notifier: Arc<dyn TutorNotifier>,
    ) -> Self {
        Self {
            store,
            images,
            notifier,
            locks: KeyedLocks::new(),
            config: config.clone(),
        }
    }

    pub async fn lock(&self, key: &JobKey) -> OwnedMutexGuard<()> {
        self.locks.lock(key.clone()).await
    }

    pub fn prune_locks(&self) {
        self.locks.prune();
    }

    /// Claims a ready job by moving it to `due`.
    pub async fn begin(&self, job: &MessageJob, now: DateTime<Utc>) -> Result<Option<MessageJob>> {
        let claimed = self
            .commit(job, now, |j| {
                j.status = JobStatus::Due;
                j.retry_at = None;
            })
            .await?;
        if let Some(claimed) = &claimed {
            tracing::debug!(job = %claimed.id, key = %claimed.key, "job due");
        }
        Ok(claimed)
    }

    /// Presents `content` to the tutor and records the attempt.
    pub async fn deliver(
        &self,
        job: MessageJob,
        content: RenderedContent,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let attempt = job.attempts + 1;
        match self.hand_off(&job, &content).await {
            Ok(ack) => {
                let committed = self
                    .commit(&job, now, |j| {
                        j.status = JobStatus::Sent;
                        j.attempts = attempt;
                        j.retry_at = None;
                        j.last_error = None;
                        j.payload = Some(content.clone());
                    })
                    .await?;
                match committed {
                    Some(sent) => {
                        tracing::info!(
                            job = %sent.id,
                            key = %sent.key,
                            attempt,
                            reference = %ack.reference,
                            "message presented to tutor"
                        );
                        Ok(Outcome::Sent(sent))
                    }
                    None => {
                        tracing::warn!(
                            job = %job.id,
                            key = %job.key,
                            "message presented but job changed underneath; keeping stored state"
                        );
                        Ok(Outcome::Skipped)
                    }
                }
            }
            Err(err) => self.record_failure(&job, attempt, content, err, now).await,
        }
    }

    /// Fails a job that can never succeed without upstream changes. No
    /// attempt is consumed.
    pub async fn reject(
        &self,
        job: &MessageJob,
        err: CadenceError,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let message = err.to_string();
        let committed = self
            .commit(job, now, |j| {
                j.status = JobStatus::Failed;
                j.retry_at = None;
                j.last_error = Some(message.clone());
            })
            .await?;
        let Some(failed) = committed else {
            return Ok(Outcome::Skipped);
        };
        tracing::warn!(job = %failed.id, key = %failed.key, error = %err, "job rejected");
        self.report(&failed, &err).await;
        Ok(Outcome::Failed(failed))
    }

    pub async fn cancel(&self, job: &MessageJob, now: DateTime<Utc>) -> Result<Outcome> {
        let committed = self
            .commit(job, now, |j| {
                j.status = JobStatus::Cancelled;
                j.retry_at = None;
            })
            .await?;
        Ok(match committed {
            Some(cancelled) => {
                tracing::info!(job = %cancelled.id, key = %cancelled.key, "job cancelled");
                Outcome::Cancelled(cancelled)
            }
            None => Outcome::Skipped,
        })
    }

    async fn hand_off(&self, job: &MessageJob, content: &RenderedContent) -> Result<Ack> {
        let timeout = self.config.dispatch_timeout();
        let attempt = async {
            let image = match &content.image {
                Some(spec) => Some(self.images.render_image(spec).await?),
                None => None,
            };
            let artifact = ShareArtifact {
                job_id: job.id,
                student_id: job.key.student_id.clone(),
                tutor_id: job.tutor_id.clone(),
                content: content.clone(),
                image,
            };
            self.notifier.present_for_send(job.stage(), &artifact).await
        };
        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| CadenceError::DispatchTimeout(timeout))?
    }

    async fn record_failure(
        &self,
        job: &MessageJob,
        attempt: u32,
        content: RenderedContent,
        err: CadenceError,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let retry_at = (err.is_retryable() && attempt < self.config.max_attempts)
            .then(|| now + self.config.backoff_after(attempt));
        let message = err.to_string();
        let committed = self
            .commit(job, now, |j| {
                j.status = JobStatus::Failed;
                j.attempts = attempt;
                j.retry_at = retry_at;
                j.last_error = Some(message.clone());
                j.payload = Some(content.clone());
            })
            .await?;
        let Some(failed) = committed else {
            return Ok(Outcome::Skipped);
        };

        match failed.retry_at {
            Some(at) => tracing::warn!(
                job = %failed.id,
                key = %failed.key,
                attempt,
                retry_at = %at,
                error = %err,
                "dispatch failed, retry scheduled"
            ),
            None => {
                tracing::error!(
                    job = %failed.id,
                    key = %failed.key,
                    attempt,
                    error = %err,
                    "dispatch failed permanently"
                );
                self.report(&failed, &err).await;
            }
        }
        Ok(Outcome::Failed(failed))
    }

    async fn report(&self, job: &MessageJob, err: &CadenceError) {
        if let Err(report_err) = self.notifier.report_failure(job.id, err).await {
            // The job stays failed in the store and is listed by `jobs`.
            tracing::error!(
                job = %job.id,
                error = %report_err,
                "could not report failed job to tutor"
            );
        }
    }

    /// Applies `apply` to `current` and writes it if nobody else has. On a
    /// lost race the job is re-read: if its status moved on, the other
    /// writer won and this is a no-op; otherwise the write is retried once.
    pub async fn commit<F>(
        &self,
        current: &MessageJob,
        now: DateTime<Utc>,
        apply: F,
    ) -> Result<Option<MessageJob>>
    where
        F: Fn(&mut MessageJob),
    {
        let mut next = current.clone();
        apply(&mut next);
        next.updated_at = now;
        if let Some(stored) = self.store.update_job(&next).await? {
            return Ok(Some(stored));
        }

        let fresh = self
            .store
            .job(&current.key)
            .await?
            .ok_or_else(|| CadenceError::NotFound {
                entity: "message job",
                id: current.key.to_string(),
            })?;
        if fresh.status != current.status || fresh.is_terminal() {
            tracing::debug!(
                job = %fresh.id,
                expected = %current.status,
                found = %fresh.status,
                "job already moved by another writer"
            );
            return Ok(None);
        }

        let mut retry = fresh;
        apply(&mut retry);
        retry.updated_at = now;
        match self.store.update_job(&retry).await? {
            Some(stored) => Ok(Some(stored)),
            None => Err(CadenceError::ConcurrencyConflict(format!("job {}", current.key))),
        }
    }
}
