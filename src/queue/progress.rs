//! Per-job progress plumbing.
//!
//! The extraction engine pushes samples through a [`ProgressReporter`]; a
//! single aggregator task folds them into the per-job latest-snapshot slot
//! that pollers read. The channel is lossy (`try_send`) and the slot only
//! keeps the newest sample, so a slow poller never backs up a download.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::queue::job::{Job, JobStatus};

/// Latest observed progress for one job. Replaced wholesale on every sample,
/// never mutated field-by-field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub status: JobStatus,
    /// Percent complete, 0.0 to 100.0.
    pub progress: f64,
    pub downloaded_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    /// Transfer rate in bytes per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Estimated seconds remaining.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: None,
            speed: None,
            eta: None,
            filename: None,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: Uuid,
    pub snapshot: ProgressSnapshot,
}

/// Handle the extraction engine uses to emit progress samples for one job.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: Uuid,
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(job_id: Uuid, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self { job_id, tx }
    }

    /// Reporter that drops every sample. For contexts without a queue.
    pub fn noop(job_id: Uuid) -> Self {
        let (tx, _rx) = mpsc::channel::<ProgressUpdate>(1);
        Self::new(job_id, tx)
    }

    pub fn report(&self, mut snapshot: ProgressSnapshot) {
        snapshot.updated_at = Utc::now();
        let _ = self.tx.try_send(ProgressUpdate {
            job_id: self.job_id,
            snapshot,
        });
    }
}

/// Drain progress updates into the per-job snapshot slots, mirroring the job
/// status forward (`downloading` -> `processing`) as the engine advances.
///
/// Samples for unknown or already-terminal jobs are dropped so a late sample
/// can never overwrite a terminal outcome.
pub(crate) fn spawn_progress_aggregator(
    mut rx: mpsc::Receiver<ProgressUpdate>,
    jobs: Arc<DashMap<Uuid, Job>>,
    progress_cache: Arc<DashMap<Uuid, ProgressSnapshot>>,
) {
    if tokio::runtime::Handle::try_current().is_err() {
        // Some unit tests construct the queue outside a Tokio runtime.
        // Progress tracking is best-effort and can be disabled there.
        return;
    }

    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            let ProgressUpdate {
                job_id,
                mut snapshot,
            } = update;

            let Some(mut job) = jobs.get_mut(&job_id) else {
                continue;
            };
            if job.status.is_terminal() {
                continue;
            }

            if snapshot.status != job.status && job.status.can_transition_to(snapshot.status) {
                job.status = snapshot.status;
            }
            // Keep the visible snapshot consistent with the job record even
            // when the sample's status lags behind it.
            snapshot.status = job.status;
            snapshot.progress = snapshot.progress.clamp(0.0, 100.0);
            drop(job);

            progress_cache.insert(job_id, snapshot);
        }
    });
}
