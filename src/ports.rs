//! Collaborators the pipeline talks to, plus the adapters shipped with the binary.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{CadenceError, Result};
use crate::models::{ImageArtifact, ImageSpec, RenderedContent, Stage, Student};

/// Read access to students and tutors kept by the record store.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn student(&self, student_id: &str) -> Result<Option<Student>>;

    /// UTC offset of the tutor's local time, if known.
    async fn tutor_offset(&self, tutor_id: &str) -> Result<Option<FixedOffset>>;
}

/// Rasterises an [`ImageSpec`].
#[async_trait]
pub trait ImageRenderer: Send + Sync {
    async fn render_image(&self, spec: &ImageSpec) -> Result<ImageArtifact>;
}

/// Everything the tutor needs to forward one message by hand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShareArtifact {
    pub job_id: Uuid,
    pub student_id: String,
    pub tutor_id: String,
    pub content: RenderedContent,
    pub image: Option<ImageArtifact>,
}

/// Acknowledgement that an artifact reached the tutor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub reference: String,
}

/// Tutor-facing surface. There is no push channel to parents, so a
/// successful `present_for_send` is the delivery criterion.
#[async_trait]
pub trait TutorNotifier: Send + Sync {
    async fn present_for_send(&self, stage: Stage, artifact: &ShareArtifact) -> Result<Ack>;

    async fn report_failure(&self, job_id: Uuid, error: &CadenceError) -> Result<()>;
}

/// Returns a reference to the spec itself; rasterisation happens downstream.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpecOnlyImageRenderer;

#[async_trait]
impl ImageRenderer for SpecOnlyImageRenderer {
    async fn render_image(&self, spec: &ImageSpec) -> Result<ImageArtifact> {
        Ok(ImageArtifact {
            uri: format!("spec://{}/{}", spec.template, Uuid::new_v4()),
            mime_type: "application/vnd.tutor-cadence.image-spec+json".to_string(),
        })
    }
}

/// Writes each artifact as a JSON file the tutor app picks up, and appends
/// failures to `failures.jsonl` in the same directory.
pub struct OutboxNotifier {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

#[derive(Serialize)]
struct FailureLine {
    job_id: Uuid,
    error: String,
    retryable: bool,
    reported_at: DateTime<Utc>,
}

impl OutboxNotifier {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            clock,
        }
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CadenceError::Dispatch(format!("outbox unavailable: {e}")))
    }
}

#[async_trait]
impl TutorNotifier for OutboxNotifier {
    async fn present_for_send(&self, stage: Stage, artifact: &ShareArtifact) -> Result<Ack> {
        self.ensure_dir().await?;
        let file = self
            .dir
            .join(format!("{}-{}-{}.json", artifact.student_id, stage, artifact.job_id));
        let json = serde_json::to_vec_pretty(artifact)
            .map_err(|e| CadenceError::Dispatch(format!("serialize artifact: {e}")))?;
        tokio::fs::write(&file, json)
            .await
            .map_err(|e| CadenceError::Dispatch(format!("write {}: {e}", file.display())))?;
        tracing::info!(
            job = %artifact.job_id,
            stage = %stage,
            path = %file.display(),
            "artifact ready for tutor to share"
        );
        Ok(Ack {
            reference: file.display().to_string(),
        })
    }

    async fn report_failure(&self, job_id: Uuid, error: &CadenceError) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        self.ensure_dir().await?;
        let line = FailureLine {
            job_id,
            error: error.to_string(),
            retryable: error.is_retryable(),
            reported_at: self.clock.now(),
        };
        let mut json = serde_json::to_vec(&line)
            .map_err(|e| CadenceError::Dispatch(format!("serialize failure: {e}")))?;
        json.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("failures.jsonl"))
            .await
            .map_err(|e| CadenceError::Dispatch(format!("open failure log: {e}")))?;
        file.write_all(&json)
            .await
            .map_err(|e| CadenceError::Dispatch(format!("write failure log: {e}")))?;
        tracing::warn!(job = %job_id, error = %error, "job reported for manual intervention");
        Ok(())
    }
}
