use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{CadenceError, Result};
use crate::models::{EmojiRating, LessonObservation, RawLessonObservation};

/// A single lesson never runs past a full day.
pub const MAX_DURATION_MINUTES: i64 = 24 * 60;

/// Validates a raw observation and converts it to the canonical shape.
pub fn normalize(raw: RawLessonObservation) -> Result<LessonObservation> {
    let lesson_id = required(raw.lesson_id, "lesson_id")?;
    let student_id = required(raw.student_id, "student_id")?;
    let tutor_id = required(raw.tutor_id, "tutor_id")?;
    let timestamp = parse_timestamp(&required(raw.timestamp, "timestamp")?)?;

    let duration_minutes = match raw.duration_minutes {
        None => 0,
        Some(minutes) if minutes < 0 => {
            return Err(CadenceError::validation(format!(
                "duration must not be negative (got {minutes})"
            )))
        }
        Some(minutes) if minutes > MAX_DURATION_MINUTES => {
            return Err(CadenceError::validation(format!(
                "duration of {minutes} minutes is longer than a day"
            )))
        }
        Some(minutes) => minutes as u32,
    };

    let extracted = raw.ai_extraction.clone().unwrap_or_default();
    let topics = canonical_tags(raw.topics.iter().chain(extracted.topics.iter()));
    let struggle_types = canonical_tags(
        raw.struggle_types
            .iter()
            .chain(extracted.struggle_types.iter()),
    );

    let rating = raw
        .rating
        .as_deref()
        .and_then(EmojiRating::parse)
        .unwrap_or(EmojiRating::Unrated);

    Ok(LessonObservation {
        lesson_id,
        student_id,
        tutor_id,
        timestamp,
        duration_minutes,
        topics,
        rating,
        struggle_types,
        notes: raw.notes.map(|n| n.trim().to_string()).unwrap_or_default(),
        ai_extraction: raw.ai_extraction,
    })
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(CadenceError::validation(format!("missing required field {field}"))),
    }
}

/// RFC 3339, or a naive date-time read as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(CadenceError::validation(format!("unparseable timestamp: {value}")))
}

/// Trims, lower-cases and deduplicates, keeping first-seen order.
fn canonical_tags<'a>(values: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for value in values {
        let tag = value.trim().to_lowercase();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}
