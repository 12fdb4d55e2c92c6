//! When each message stage becomes due.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, Utc, Weekday};

use crate::config::CadenceConfig;
use crate::models::{ReportWeek, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetRule {
    Immediate,
    After(Duration),
    /// First occurrence of `weekday` at `at` (tutor-local) strictly after now.
    NextWeekday { weekday: Weekday, at: NaiveTime },
}

/// How many jobs a stage may have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobScope {
    PerLesson,
    /// One per student per report week, whatever the lesson count.
    PerWeek,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadenceStep {
    pub stage: Stage,
    pub rule: OffsetRule,
    pub scope: JobScope,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cadence {
    steps: Vec<CadenceStep>,
}

impl Cadence {
    /// Immediate summary, progress card after the configured delay, weekly
    /// report at the next Sunday midnight.
    pub fn from_config(config: &CadenceConfig) -> Self {
        Self {
            steps: vec![
                CadenceStep {
                    stage: Stage::PostLesson,
                    rule: OffsetRule::Immediate,
                    scope: JobScope::PerLesson,
                },
                CadenceStep {
                    stage: Stage::ProgressCard,
                    rule: OffsetRule::After(config.progress_card_delay()),
                    scope: JobScope::PerLesson,
                },
                CadenceStep {
                    stage: Stage::WeeklyReport,
                    rule: OffsetRule::NextWeekday {
                        weekday: Weekday::Sun,
                        at: NaiveTime::MIN,
                    },
                    scope: JobScope::PerWeek,
                },
            ],
        }
    }

    pub fn steps(&self) -> &[CadenceStep] {
        &self.steps
    }
}

impl OffsetRule {
    pub fn due_at(&self, now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
        match *self {
            Self::Immediate => now,
            Self::After(delay) => now + delay,
            Self::NextWeekday { weekday, at } => next_weekday_at(now, offset, weekday, at),
        }
    }
}

pub fn next_weekday_at(
    now: DateTime<Utc>,
    offset: FixedOffset,
    weekday: Weekday,
    at: NaiveTime,
) -> DateTime<Utc> {
    let local = now.with_timezone(&offset).naive_local();
    let days_ahead =
        (7 + weekday.num_days_from_monday() - local.weekday().num_days_from_monday()) % 7;
    let mut candidate = (local.date() + Duration::days(days_ahead as i64)).and_time(at);
    if candidate <= local {
        candidate += Duration::days(7);
    }
    (candidate - Duration::seconds(offset.local_minus_utc() as i64)).and_utc()
}

/// Week whose lessons a report due at `due` covers: the ISO week of the
/// local day before the due date.
pub fn report_week(due: DateTime<Utc>, offset: FixedOffset) -> ReportWeek {
    let local = due.with_timezone(&offset).date_naive();
    (local - Duration::days(1)).iso_week().into()
}

/// Half-open window `[due - 7 days, due)` a weekly report summarises.
pub fn report_window(due: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    (due - Duration::days(7), due)
}
