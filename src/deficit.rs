//! Folds lesson struggles into per-student, per-topic deficit patterns.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};
use crate::locks::KeyedLocks;
use crate::models::{DeficitPattern, LessonObservation, Student};
use crate::ports::Directory;
use crate::store::Store;

/// How unresolved patterns become resolved without a tutor acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DecayPolicy {
    /// Only an explicit resolve closes a pattern.
    Manual,
    /// Close patterns with no new occurrence for this many weeks.
    QuietWeeks { weeks: u32 },
}

type ActionRule = fn(&DeficitPattern) -> Option<String>;

/// Evaluated in order; the first rule that matches supplies the action.
const ACTION_RULES: &[ActionRule] = &[review_session, targeted_practice, monitor, early_note];

fn review_session(p: &DeficitPattern) -> Option<String> {
    (p.occurrence_count >= 5)
        .then(|| format!("Schedule a dedicated review session for {}", p.topic))
}

fn targeted_practice(p: &DeficitPattern) -> Option<String> {
    p.struggle_types
        .iter()
        .filter(|(_, count)| **count >= 3)
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(tag, _)| format!("Recommend targeted practice set for {} ({tag})", p.topic))
}

fn monitor(p: &DeficitPattern) -> Option<String> {
    (p.occurrence_count >= 2)
        .then(|| format!("Monitor {}: difficulty in {} lessons", p.topic, p.occurrence_count))
}

fn early_note(p: &DeficitPattern) -> Option<String> {
    Some(format!("Note early difficulty with {}", p.topic))
}

pub fn suggested_action(pattern: &DeficitPattern) -> String {
    ACTION_RULES
        .iter()
        .find_map(|rule| rule(pattern))
        .unwrap_or_default()
}

/// Applies one observation to a pattern. Returns `false` when the pattern is
/// resolved or already counted this lesson.
pub fn fold_observation(pattern: &mut DeficitPattern, lesson: &LessonObservation) -> bool {
    if pattern.resolved || lesson.struggle_types.is_empty() {
        return false;
    }
    if !pattern.counted_lessons.insert(lesson.lesson_id.clone()) {
        return false;
    }
    pattern.occurrence_count += 1;
    for tag in &lesson.struggle_types {
        *pattern.struggle_types.entry(tag.clone()).or_insert(0) += 1;
    }
    if lesson.timestamp > pattern.last_occurrence {
        pattern.last_occurrence = lesson.timestamp;
    }
    pattern.suggested_action = suggested_action(pattern);
    true
}

pub fn recency_weight(days_ago: i64) -> f64 {
    match days_ago {
        i64::MIN..=7 => 1.0,
        8..=30 => 0.7,
        31..=60 => 0.4,
        _ => 0.2,
    }
}

/// Ranking used when only a few patterns fit in a message.
pub fn focus_score(pattern: &DeficitPattern, now: DateTime<Utc>) -> f64 {
    if pattern.resolved {
        return 0.0;
    }
    let days_ago = (now - pattern.last_occurrence).num_days();
    pattern.occurrence_count as f64 * recency_weight(days_ago)
}

/// Highest focus score first; ties broken by topic.
pub fn rank_by_focus(patterns: &mut [DeficitPattern], now: DateTime<Utc>) {
    patterns.sort_by(|a, b| {
        focus_score(b, now)
            .partial_cmp(&focus_score(a, now))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.topic.cmp(&b.topic))
    });
}

/// Attempts per pattern write before giving up on a contended pattern.
const MAX_SAVE_ATTEMPTS: usize = 3;

pub struct DeficitAggregator {
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
    locks: KeyedLocks<(String, String)>,
    decay: DecayPolicy,
}

impl DeficitAggregator {
    pub fn new(store: Arc<dyn Store>, directory: Arc<dyn Directory>, decay: DecayPolicy) -> Self {
        Self {
            store,
            directory,
            locks: KeyedLocks::new(),
            decay,
        }
    }

    pub async fn ensure_student(&self, student_id: &str) -> Result<Student> {
        self.directory
            .student(student_id)
            .await?
            .ok_or_else(|| CadenceError::NotFound {
                entity: "student",
                id: student_id.to_string(),
            })
    }

    /// Updates every pattern the lesson touches and returns the changed ones.
    /// `student` is the directory record the caller already fetched.
    pub async fn ingest(
        &self,
        student: &Student,
        lesson: &LessonObservation,
    ) -> Result<Vec<DeficitPattern>> {
        if student.id != lesson.student_id {
            return Err(CadenceError::validation(format!(
                "lesson {} belongs to {}, not {}",
                lesson.lesson_id, lesson.student_id, student.id
            )));
        }
        if lesson.struggle_types.is_empty() {
            return Ok(Vec::new());
        }

        let mut updated = Vec::new();
        for topic in &lesson.topics {
            let _guard = self.locks.lock((student.id.clone(), topic.clone())).await;

            let saved = self
                .save_with_retry(&student.id, topic, |current| {
                    let mut pattern = current.unwrap_or_else(|| {
                        DeficitPattern::new(&student.id, topic, lesson.timestamp)
                    });
                    if pattern.resolved {
                        tracing::debug!(
                            student = %student.id,
                            topic = %topic,
                            "skipping resolved deficit pattern"
                        );
                        return Ok(None);
                    }
                    Ok(fold_observation(&mut pattern, lesson).then_some(pattern))
                })
                .await?;

            if let Some(pattern) = saved {
                tracing::info!(
                    student = %pattern.student_id,
                    topic = %pattern.topic,
                    occurrences = pattern.occurrence_count,
                    action = %pattern.suggested_action,
                    "deficit pattern updated"
                );
                updated.push(pattern);
            }
        }
        self.locks.prune();
        Ok(updated)
    }

    pub async fn resolve(
        &self,
        student_id: &str,
        topic: &str,
        at: DateTime<Utc>,
    ) -> Result<DeficitPattern> {
        self.update(student_id, topic, |pattern| {
            if !pattern.resolved {
                pattern.resolved = true;
                pattern.resolved_at = Some(at);
            }
        })
        .await
    }

    /// Makes a resolved pattern count new struggles again. History is kept.
    pub async fn reopen(&self, student_id: &str, topic: &str) -> Result<DeficitPattern> {
        self.update(student_id, topic, |pattern| {
            pattern.resolved = false;
            pattern.resolved_at = None;
            pattern.suggested_action = suggested_action(pattern);
        })
        .await
    }

    /// Resolves quiet patterns per the decay policy. Returns the ones closed.
    pub async fn apply_decay(&self, now: DateTime<Utc>) -> Result<Vec<DeficitPattern>> {
        let DecayPolicy::QuietWeeks { weeks } = self.decay else {
            return Ok(Vec::new());
        };
        let cutoff = now - Duration::weeks(weeks as i64);

        let mut closed = Vec::new();
        for candidate in self.store.deficits(None).await? {
            if candidate.resolved || candidate.last_occurrence > cutoff {
                continue;
            }
            let _guard = self
                .locks
                .lock((candidate.student_id.clone(), candidate.topic.clone()))
                .await;
            // The stored copy is re-read on every attempt; a fresh occurrence
            // keeps the pattern open.
            let saved = self
                .save_with_retry(&candidate.student_id, &candidate.topic, |current| {
                    Ok(current
                        .filter(|p| !p.resolved && p.last_occurrence <= cutoff)
                        .map(|mut p| {
                            p.resolved = true;
                            p.resolved_at = Some(now);
                            p
                        }))
                })
                .await?;
            let Some(pattern) = saved else {
                continue;
            };
            tracing::info!(
                student = %pattern.student_id,
                topic = %pattern.topic,
                quiet_weeks = weeks,
                "deficit pattern resolved by decay"
            );
            closed.push(pattern);
        }
        self.locks.prune();
        Ok(closed)
    }

    async fn update<F>(&self, student_id: &str, topic: &str, apply: F) -> Result<DeficitPattern>
    where
        F: Fn(&mut DeficitPattern),
    {
        let topic = topic.trim().to_lowercase();
        let missing = || CadenceError::NotFound {
            entity: "deficit pattern",
            id: format!("{student_id}/{topic}"),
        };
        let _guard = self
            .locks
            .lock((student_id.to_string(), topic.clone()))
            .await;
        self.save_with_retry(student_id, &topic, |current| {
            let mut pattern = current.ok_or_else(missing)?;
            apply(&mut pattern);
            Ok(Some(pattern))
        })
        .await?
        .ok_or_else(missing)
    }

    /// Read-modify-write against the stored version. `change` sees the
    /// current pattern (if any) and returns what to store, or `None` to
    /// leave it alone. Another process writing in between forces a re-read.
    async fn save_with_retry<F>(
        &self,
        student_id: &str,
        topic: &str,
        mut change: F,
    ) -> Result<Option<DeficitPattern>>
    where
        F: FnMut(Option<DeficitPattern>) -> Result<Option<DeficitPattern>>,
    {
        for attempt in 1..=MAX_SAVE_ATTEMPTS {
            let current = self.store.deficit(student_id, topic).await?;
            let Some(next) = change(current)? else {
                return Ok(None);
            };
            if let Some(stored) = self.store.save_deficit(&next).await? {
                return Ok(Some(stored));
            }
            tracing::debug!(
                student = %student_id,
                topic = %topic,
                attempt,
                "deficit pattern changed underneath, retrying"
            );
        }
        Err(CadenceError::ConcurrencyConflict(format!(
            "deficit pattern {student_id}/{topic}"
        )))
    }
}
