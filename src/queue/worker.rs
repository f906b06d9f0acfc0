//! Worker pool that drains the download queue.
//!
//! Each worker is a task in a `JoinSet` looping over the shared FIFO. A
//! worker suspends only while waiting for a job or driving a fetch; all
//! status bookkeeping is non-blocking map work. One worker hitting an
//! unexpected state never takes the pool down.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::JobStatus;
use super::{DownloadQueue, QueuedJob};
use crate::error::{Error, Result};
use crate::fetcher::{FetchError, MediaFetcher};
use crate::history::{HistoryRecord, HistoryStore};
use crate::session::SessionRegistry;

/// Pause after an unexpected bookkeeping fault before the worker resumes.
const FAULT_BACKOFF: Duration = Duration::from_millis(200);

/// Configuration for the download worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks, i.e. maximum concurrent downloads.
    pub max_workers: usize,
    /// Guard timeout for a single job in seconds.
    ///
    /// A fetch that exceeds this duration is dropped and the job fails
    /// with a timeout message.
    pub job_timeout_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            job_timeout_secs: 3600,
        }
    }
}

/// Shared dependencies handed to every worker.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<DownloadQueue>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub sessions: Arc<SessionRegistry>,
    pub history: Arc<dyn HistoryStore>,
}

/// Pool of download workers.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::with_config(WorkerPoolConfig::default())
    }

    pub fn with_config(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Start the worker pool.
    pub fn start(&self, context: WorkerContext) {
        let job_timeout = Duration::from_secs(self.config.job_timeout_secs);

        info!("Starting worker pool with {} workers", self.config.max_workers);

        let mut tasks = self.tasks.lock();
        if let Some(ref mut join_set) = *tasks {
            for i in 0..self.config.max_workers {
                let cancellation_token = self.cancellation_token.clone();
                let context = context.clone();

                join_set.spawn(async move {
                    debug!("Worker {} started", i);

                    loop {
                        let queued = tokio::select! {
                            _ = cancellation_token.cancelled() => break,
                            queued = context.queue.next_job() => match queued {
                                Some(queued) => queued,
                                // Queue dropped, nothing more will arrive.
                                None => break,
                            },
                        };

                        if let Err(e) = run_job(i, queued, &context, job_timeout).await {
                            error!(worker = i, error = %e, "Worker bookkeeping error");
                            tokio::time::sleep(FAULT_BACKOFF).await;
                        }
                    }

                    debug!("Worker {} shutting down", i);
                });
            }
        }
    }

    /// Stop the worker pool and wait for in-flight jobs to wind down.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        // Take the join set out of the mutex before awaiting.
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute one dequeued job end to end.
///
/// Returns `Err` only for states the queue should never hand a worker;
/// raced cancellations are expected and handled inline. Session detach and
/// history persistence run no matter how the fetch ended.
async fn run_job(
    worker_id: usize,
    queued: QueuedJob,
    context: &WorkerContext,
    job_timeout: Duration,
) -> Result<()> {
    let QueuedJob {
        job_id,
        request,
        credentials,
    } = queued;

    let Some(job) = context.queue.job(&job_id) else {
        return Err(Error::not_found("Job", job_id.to_string()));
    };

    // Cancelled while pending: skip the fetch, keep the bookkeeping.
    let runnable = if job.status.is_terminal() {
        debug!(worker = worker_id, job_id = %job_id, status = %job.status, "Skipping terminal job");
        false
    } else {
        match context.queue.transition(&job_id, JobStatus::Downloading) {
            Ok(()) => true,
            Err(e) => {
                let terminal = context
                    .queue
                    .job(&job_id)
                    .map(|j| j.status.is_terminal())
                    .unwrap_or(true);
                if !terminal {
                    return Err(e);
                }
                debug!(worker = worker_id, job_id = %job_id, "Job cancelled before dispatch");
                false
            }
        }
    };

    if runnable {
        let token = context.queue.cancellation_token(&job_id);
        let reporter = context.queue.progress_reporter(job_id);
        info!(worker = worker_id, job_id = %job_id, url = %request.url, "Starting download");

        let outcome = tokio::time::timeout(
            job_timeout,
            context
                .fetcher
                .fetch(job_id, &request, credentials.as_ref(), reporter, token),
        )
        .await;

        match outcome {
            Ok(Ok(output)) => {
                match context
                    .queue
                    .mark_completed(&job_id, output.output_path, output.output_name)
                {
                    Ok(()) => info!(worker = worker_id, job_id = %job_id, "Download completed"),
                    // Cancel won the race; the terminal state stands.
                    Err(e) => debug!(job_id = %job_id, error = %e, "Completion superseded"),
                }
            }
            Ok(Err(e)) if e.is_cancelled() => {
                debug!(worker = worker_id, job_id = %job_id, "Download cancelled mid-fetch");
            }
            Ok(Err(e)) => {
                warn!(worker = worker_id, job_id = %job_id, error = %e, "Download failed");
                if let Err(e) = context.queue.mark_failed(&job_id, e.to_string()) {
                    debug!(job_id = %job_id, error = %e, "Failure superseded");
                }
            }
            Err(_) => {
                let message = FetchError::Timeout(job_timeout.as_secs()).to_string();
                warn!(worker = worker_id, job_id = %job_id, "{message}");
                if let Err(e) = context.queue.mark_failed(&job_id, message) {
                    debug!(job_id = %job_id, error = %e, "Timeout superseded");
                }
            }
        }
    }

    context.queue.remove_token(&job_id);

    if let Some(job) = context.queue.job(&job_id) {
        if let Some(session_id) = job.session_id.as_deref() {
            context.sessions.remove_job(session_id, job_id);
        }

        // History writes stay off the worker's critical path.
        let history = Arc::clone(&context.history);
        let record = HistoryRecord::from_job(&job);
        tokio::spawn(async move {
            if let Err(e) = history.record(&record).await {
                warn!(job_id = %record.job_id, error = %e, "Failed to persist download history");
            }
        });
    }

    Ok(())
}
