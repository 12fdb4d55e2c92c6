//! Bulk lesson import from CSV exports of the tutoring app.

use std::io::Read;

use serde::Deserialize;

use crate::error::{CadenceError, Result};
use crate::models::RawLessonObservation;
use crate::pipeline::Pipeline;

const LIST_SEPARATOR: char = ';';

#[derive(Debug, Deserialize)]
struct CsvRow {
    lesson_id: Option<String>,
    student_id: Option<String>,
    tutor_id: Option<String>,
    timestamp: Option<String>,
    duration_minutes: Option<i64>,
    #[serde(default)]
    topics: String,
    rating: Option<String>,
    #[serde(default)]
    struggle_types: String,
    notes: Option<String>,
}

impl From<CsvRow> for RawLessonObservation {
    fn from(row: CsvRow) -> Self {
        Self {
            lesson_id: row.lesson_id,
            student_id: row.student_id,
            tutor_id: row.tutor_id,
            timestamp: row.timestamp,
            duration_minutes: row.duration_minutes,
            topics: split_list(&row.topics),
            rating: row.rating,
            struggle_types: split_list(&row.struggle_types),
            notes: row.notes,
            ai_extraction: None,
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(LIST_SEPARATOR)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub ingested: usize,
    pub rejected: usize,
}

/// Ingests every row. Rows that fail validation or name an unknown student
/// are skipped and counted; storage errors abort the import.
pub async fn import_csv<R: Read>(pipeline: &Pipeline, source: R) -> Result<ImportSummary> {
    let mut reader = csv::Reader::from_reader(source);
    let mut summary = ImportSummary::default();

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = index + 2;
        let row = match result {
            Ok(row) => row,
            Err(err) => {
                tracing::warn!(line, error = %err, "skipping unreadable row");
                summary.rejected += 1;
                continue;
            }
        };
        match pipeline.ingest_lesson(row.into()).await {
            Ok(_) => summary.ingested += 1,
            Err(err @ (CadenceError::Validation(_) | CadenceError::NotFound { .. })) => {
                tracing::warn!(line, error = %err, "skipping rejected row");
                summary.rejected += 1;
            }
            Err(err) => return Err(err),
        }
    }

    tracing::info!(
        ingested = summary.ingested,
        rejected = summary.rejected,
        "csv import finished"
    );
    Ok(summary)
}
