//! Job record, status machine, and caller-facing views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::fetcher::DownloadRequest;
use crate::queue::progress::ProgressSnapshot;

/// Job status values.
///
/// Transitions are monotonic along
/// `pending -> downloading -> processing -> completed|failed|cancelled`;
/// stages may be skipped but never revisited, and terminal states are
/// immutable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is queued and waiting to be picked up by a worker.
    Pending,
    /// A worker is transferring bytes for this job.
    Downloading,
    /// Transfer finished; the engine is finalizing (merge, remux, tag).
    Processing,
    /// Job finished successfully.
    Completed,
    /// Job failed with a classified error.
    Failed,
    /// Job was cancelled by the caller.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Downloading => 1,
            Self::Processing => 2,
            Self::Completed | Self::Failed | Self::Cancelled => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the status sequence
    /// monotonic. Terminal states admit no further transitions.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// One download job. Created at submission, mutated only by the worker that
/// dequeued it, retained after reaching a terminal state until swept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID, generated at submission.
    pub id: Uuid,
    /// The request as submitted. Immutable.
    pub request: DownloadRequest,
    /// Current status.
    pub status: JobStatus,
    /// Owning session, if the request named one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Owning user, for history attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set once on entering a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Path of the finished file, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    /// Final filename, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,
    /// Classified error message, set on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn new(request: DownloadRequest, user_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: request.session_id.clone(),
            request,
            status: JobStatus::Pending,
            user_id,
            created_at: Utc::now(),
            completed_at: None,
            output_path: None,
            output_name: None,
            error: None,
        }
    }
}

/// Read model returned to status pollers: the job's identity and terminal
/// fields plus the latest progress sample, flattened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: f64,
    pub downloaded_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobView {
    pub fn from_parts(job: &Job, snapshot: &ProgressSnapshot) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress: snapshot.progress,
            downloaded_bytes: snapshot.downloaded_bytes,
            total_bytes: snapshot.total_bytes,
            speed: snapshot.speed,
            eta: snapshot.eta,
            filename: snapshot.filename.clone(),
            // The job's terminal error wins over a stale sample error.
            error: job.error.clone().or_else(|| snapshot.error.clone()),
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub downloading: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Jobs enqueued but not yet picked up by a worker.
    pub queue_depth: u64,
}
