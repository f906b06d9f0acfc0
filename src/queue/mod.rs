//! In-memory job queue.
//!
//! Tracks every job from submission to a terminal state. Dispatch goes
//! through a bounded FIFO channel that the worker pool drains; job records
//! and progress snapshots live in concurrent maps so status reads never
//! block dispatch.

pub mod job;
pub mod progress;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fetcher::DownloadRequest;
use crate::vault::Credentials;

pub use job::{Job, JobStatus, JobView, QueueStats};
pub use progress::{ProgressReporter, ProgressSnapshot, ProgressUpdate};
pub use worker::WorkerPool;

/// Capacity of the progress sample channel. Samples are lossy by design,
/// so a full channel just drops the oldest-in-flight update.
const PROGRESS_CHANNEL_CAPACITY: usize = 1024;

/// Payload handed from `submit` to a worker.
#[derive(Debug)]
pub(crate) struct QueuedJob {
    pub job_id: Uuid,
    pub request: DownloadRequest,
    pub credentials: Option<Credentials>,
}

/// Bounded FIFO download queue with shared job state.
pub struct DownloadQueue {
    capacity: usize,
    job_tx: mpsc::Sender<QueuedJob>,
    job_rx: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    jobs: Arc<DashMap<Uuid, Job>>,
    progress_cache: Arc<DashMap<Uuid, ProgressSnapshot>>,
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
    progress_tx: mpsc::Sender<ProgressUpdate>,
    /// Jobs sent but not yet received, i.e. the channel backlog.
    depth: AtomicUsize,
}

impl DownloadQueue {
    /// Create a queue that holds at most `capacity` undispatched jobs.
    pub fn new(capacity: usize) -> Self {
        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);

        let jobs = Arc::new(DashMap::new());
        let progress_cache = Arc::new(DashMap::new());
        progress::spawn_progress_aggregator(
            progress_rx,
            Arc::clone(&jobs),
            Arc::clone(&progress_cache),
        );

        Self {
            capacity,
            job_tx,
            job_rx: Arc::new(Mutex::new(job_rx)),
            jobs,
            progress_cache,
            cancellation_tokens: DashMap::new(),
            progress_tx,
            depth: AtomicUsize::new(0),
        }
    }

    /// Submit a job for background execution.
    ///
    /// Creates the job record in `pending`, registers its cancellation
    /// token, then enqueues it. If the channel is at capacity the records
    /// are rolled back and the submission fails with a queue-full error.
    pub fn submit(
        &self,
        request: DownloadRequest,
        user_id: Option<String>,
        credentials: Option<Credentials>,
    ) -> Result<Uuid> {
        let job = Job::new(request.clone(), user_id);
        let job_id = job.id;

        self.jobs.insert(job_id, job);
        self.progress_cache
            .insert(job_id, ProgressSnapshot::new(JobStatus::Pending));
        self.cancellation_tokens
            .insert(job_id, CancellationToken::new());

        // Count the job before it becomes visible to workers, so a fast
        // dequeue cannot decrement the depth below zero.
        self.depth.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.job_tx.try_send(QueuedJob {
            job_id,
            request,
            credentials,
        }) {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            self.jobs.remove(&job_id);
            self.progress_cache.remove(&job_id);
            self.cancellation_tokens.remove(&job_id);
            return match e {
                TrySendError::Full(_) => Err(Error::QueueFull {
                    capacity: self.capacity,
                }),
                TrySendError::Closed(_) => {
                    Err(Error::Other("Job queue is shut down".to_string()))
                }
            };
        }

        debug!(job_id = %job_id, depth = self.queue_depth(), "Job enqueued");
        Ok(job_id)
    }

    /// Await the next queued job. Workers share the receiver, so at most one
    /// of them gets each job. Returns `None` once the queue is dropped.
    pub(crate) async fn next_job(&self) -> Option<QueuedJob> {
        let queued = {
            let mut rx = self.job_rx.lock().await;
            rx.recv().await
        };
        if queued.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        queued
    }

    /// Combined status view for a job, or `None` if unknown.
    pub fn status(&self, job_id: &Uuid) -> Option<JobView> {
        let job = self.jobs.get(job_id)?;
        let snapshot = self
            .progress_cache
            .get(job_id)
            .map(|s| s.clone())
            .unwrap_or_else(|| ProgressSnapshot::new(job.status));
        Some(JobView::from_parts(&job, &snapshot))
    }

    /// Latest progress snapshot for a job, or `None` if unknown.
    pub fn progress(&self, job_id: &Uuid) -> Option<ProgressSnapshot> {
        self.progress_cache.get(job_id).map(|s| s.clone())
    }

    /// Owned copy of the full job record.
    pub(crate) fn job(&self, job_id: &Uuid) -> Option<Job> {
        self.jobs.get(job_id).map(|j| j.clone())
    }

    /// Move a job forward in its lifecycle.
    pub(crate) fn transition(&self, job_id: &Uuid, next: JobStatus) -> Result<()> {
        {
            let mut job = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::not_found("Job", job_id.to_string()))?;
            if !job.status.can_transition_to(next) {
                return Err(Error::InvalidStateTransition {
                    from: job.status.to_string(),
                    to: next.to_string(),
                });
            }
            job.status = next;
            if next.is_terminal() {
                job.completed_at = Some(Utc::now());
            }
        }
        if let Some(mut snapshot) = self.progress_cache.get_mut(job_id) {
            snapshot.status = next;
            snapshot.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Finish a job successfully and record where the output landed.
    pub(crate) fn mark_completed(
        &self,
        job_id: &Uuid,
        output_path: PathBuf,
        output_name: String,
    ) -> Result<()> {
        {
            let mut job = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::not_found("Job", job_id.to_string()))?;
            if !job.status.can_transition_to(JobStatus::Completed) {
                return Err(Error::InvalidStateTransition {
                    from: job.status.to_string(),
                    to: JobStatus::Completed.to_string(),
                });
            }
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            job.output_path = Some(output_path);
            job.output_name = Some(output_name.clone());
        }
        if let Some(mut snapshot) = self.progress_cache.get_mut(job_id) {
            snapshot.status = JobStatus::Completed;
            snapshot.progress = 100.0;
            snapshot.filename = Some(output_name);
            snapshot.error = None;
            snapshot.updated_at = Utc::now();
        }
        self.cancellation_tokens.remove(job_id);
        Ok(())
    }

    /// Finish a job with a classified failure message.
    pub(crate) fn mark_failed(&self, job_id: &Uuid, error: String) -> Result<()> {
        {
            let mut job = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::not_found("Job", job_id.to_string()))?;
            if !job.status.can_transition_to(JobStatus::Failed) {
                return Err(Error::InvalidStateTransition {
                    from: job.status.to_string(),
                    to: JobStatus::Failed.to_string(),
                });
            }
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error = Some(error.clone());
        }
        if let Some(mut snapshot) = self.progress_cache.get_mut(job_id) {
            snapshot.status = JobStatus::Failed;
            snapshot.error = Some(error);
            snapshot.updated_at = Utc::now();
        }
        self.cancellation_tokens.remove(job_id);
        Ok(())
    }

    /// Cancel a job.
    ///
    /// Non-terminal jobs move straight to `cancelled` and their token fires
    /// so an in-flight fetch aborts. Returns false for unknown or already
    /// terminal jobs, so a second cancel is a no-op.
    pub fn cancel(&self, job_id: &Uuid) -> bool {
        {
            let Some(mut job) = self.jobs.get_mut(job_id) else {
                return false;
            };
            if job.status.is_terminal() {
                return false;
            }
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
        }
        if let Some(mut snapshot) = self.progress_cache.get_mut(job_id) {
            snapshot.status = JobStatus::Cancelled;
            snapshot.updated_at = Utc::now();
        }
        // The token entry stays until the worker finishes its bookkeeping.
        if let Some(token) = self.cancellation_tokens.get(job_id) {
            token.cancel();
        }
        info!(job_id = %job_id, "Job cancelled");
        true
    }

    /// Clone of the job's cancellation token. Jobs whose token entry is
    /// already gone get a fresh token that nothing will ever fire.
    pub(crate) fn cancellation_token(&self, job_id: &Uuid) -> CancellationToken {
        self.cancellation_tokens
            .get(job_id)
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// Drop the token entry for a job that skipped execution.
    pub(crate) fn remove_token(&self, job_id: &Uuid) {
        self.cancellation_tokens.remove(job_id);
    }

    /// Reporter that feeds this queue's progress aggregator.
    pub(crate) fn progress_reporter(&self, job_id: Uuid) -> ProgressReporter {
        ProgressReporter::new(job_id, self.progress_tx.clone())
    }

    /// Jobs enqueued but not yet dequeued by a worker.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Jobs currently downloading.
    pub fn active_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| entry.status == JobStatus::Downloading)
            .count()
    }

    /// Per-status counts plus channel backlog.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for entry in self.jobs.iter() {
            match entry.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Downloading => stats.downloading += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.queue_depth = self.queue_depth() as u64;
        stats
    }

    /// Evict terminal jobs older than `max_age`. Returns how many were
    /// removed.
    pub fn sweep_old(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);

        let mut expired = Vec::new();
        for entry in self.jobs.iter() {
            let old = entry
                .completed_at
                .map(|completed| completed < cutoff)
                .unwrap_or(false);
            if entry.status.is_terminal() && old {
                expired.push(*entry.key());
            }
        }
        for job_id in &expired {
            self.jobs.remove(job_id);
            self.progress_cache.remove(job_id);
            self.cancellation_tokens.remove(job_id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Evicted old terminal jobs");
        }
        expired.len()
    }
}
