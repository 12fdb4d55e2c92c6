use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, IsoWeek, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmojiRating {
    Good,
    Okay,
    Struggled,
    Unrated,
}

impl EmojiRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Okay => "okay",
            Self::Struggled => "struggled",
            Self::Unrated => "unrated",
        }
    }

    /// Parses a rating word or emoji. Unknown input yields `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "good" | "great" | "😀" | "😃" | "😄" | "🙂" | "👍" => Some(Self::Good),
            "okay" | "ok" | "fine" | "😐" | "🤔" => Some(Self::Okay),
            "struggled" | "struggling" | "😕" | "😟" | "😣" | "😞" => Some(Self::Struggled),
            "unrated" | "" => Some(Self::Unrated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiExtraction {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub struggle_types: Vec<String>,
    #[serde(default)]
    pub key_observations: Vec<String>,
}

/// Lesson observation as delivered by the upstream extractor, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawLessonObservation {
    pub lesson_id: Option<String>,
    pub student_id: Option<String>,
    pub tutor_id: Option<String>,
    pub timestamp: Option<String>,
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub topics: Vec<String>,
    pub rating: Option<String>,
    #[serde(default)]
    pub struggle_types: Vec<String>,
    pub notes: Option<String>,
    pub ai_extraction: Option<AiExtraction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonObservation {
    pub lesson_id: String,
    pub student_id: String,
    pub tutor_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_minutes: u32,
    pub topics: Vec<String>,
    pub rating: EmojiRating,
    pub struggle_types: Vec<String>,
    pub notes: String,
    pub ai_extraction: Option<AiExtraction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeficitPattern {
    pub student_id: String,
    pub topic: String,
    pub occurrence_count: u32,
    pub last_occurrence: DateTime<Utc>,
    /// Struggle-type tag to the number of lessons it appeared in.
    pub struggle_types: BTreeMap<String, u32>,
    pub suggested_action: String,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Lessons already folded into this pattern.
    pub counted_lessons: BTreeSet<String>,
    /// Bumped on every stored write; 0 means never stored.
    #[serde(default)]
    pub version: u64,
}

impl DeficitPattern {
    pub fn new(student_id: &str, topic: &str, first_seen: DateTime<Utc>) -> Self {
        Self {
            student_id: student_id.to_string(),
            topic: topic.to_string(),
            occurrence_count: 0,
            last_occurrence: first_seen,
            struggle_types: BTreeMap::new(),
            suggested_action: String::new(),
            resolved: false,
            resolved_at: None,
            counted_lessons: BTreeSet::new(),
            version: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PostLesson,
    ProgressCard,
    WeeklyReport,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::PostLesson, Stage::ProgressCard, Stage::WeeklyReport];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostLesson => "post_lesson",
            Self::ProgressCard => "progress_card",
            Self::WeeklyReport => "weekly_report",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == value)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Due,
    Sent,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Due => "due",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "due" => Some(Self::Due),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Idempotency key of a message job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub student_id: String,
    pub lesson_id: String,
    pub stage: Stage,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.student_id, self.lesson_id, self.stage)
    }
}

/// ISO week a weekly report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReportWeek {
    pub year: i32,
    pub week: u32,
}

impl From<IsoWeek> for ReportWeek {
    fn from(week: IsoWeek) -> Self {
        Self {
            year: week.year(),
            week: week.week(),
        }
    }
}

impl fmt::Display for ReportWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageJob {
    pub id: Uuid,
    pub key: JobKey,
    pub tutor_id: String,
    pub report_week: Option<ReportWeek>,
    pub scheduled_for: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    /// Set while a failed job is still eligible for another attempt.
    pub retry_at: Option<DateTime<Utc>>,
    pub payload: Option<RenderedContent>,
    pub last_error: Option<String>,
    /// Bumped on every stored write; used for compare-and-set.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageJob {
    pub fn new(
        key: JobKey,
        tutor_id: &str,
        report_week: Option<ReportWeek>,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            tutor_id: tutor_id.to_string(),
            report_week,
            scheduled_for,
            status: JobStatus::Pending,
            attempts: 0,
            retry_at: None,
            payload: None,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage(&self) -> Stage {
        self.key.stage
    }

    /// Sent, cancelled, or failed with no retry left.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Sent | JobStatus::Cancelled => true,
            JobStatus::Failed => self.retry_at.is_none(),
            JobStatus::Pending | JobStatus::Due => false,
        }
    }

    /// Whether a sweep at `now` should pick this job up. A job stuck in `due`
    /// for longer than `due_lease` belongs to a dispatcher that went away.
    pub fn is_ready(&self, now: DateTime<Utc>, due_lease: Duration) -> bool {
        match self.status {
            JobStatus::Pending => self.scheduled_for <= now,
            JobStatus::Due => self.updated_at + due_lease <= now,
            JobStatus::Failed => self.retry_at.is_some_and(|at| at <= now),
            JobStatus::Sent | JobStatus::Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub full_name: String,
    pub tutor_id: String,
    pub opted_out: bool,
}

/// Structured descriptor handed to the image service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub template: String,
    pub width: u32,
    pub height: u32,
    pub headline: String,
    pub subtitle: String,
    pub badges: Vec<String>,
    pub highlights: Vec<String>,
    pub accent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArtifact {
    pub uri: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedContent {
    pub stage: Stage,
    pub title: String,
    pub body: String,
    pub image: Option<ImageSpec>,
}

/// Lessons and deficits that fall into one weekly report. Never stored.
#[derive(Debug, Clone)]
pub struct WeeklyReportWindow {
    pub student_id: String,
    pub week: ReportWeek,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub lessons: Vec<LessonObservation>,
    pub deficits: Vec<DeficitPattern>,
}
