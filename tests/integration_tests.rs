//! Integration tests for the download orchestration core.
//!
//! These tests drive the real queue, worker pool, session registry, vault,
//! and SQLite history store together, with a scripted in-crate fetcher
//! standing in for the external downloader.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vget::config::Settings;
use vget::error::Error;
use vget::fetcher::{DownloadRequest, FetchError, FetchOutput, MediaFetcher};
use vget::history::{HistoryRecord, HistoryStore, NullHistoryStore, SqliteHistoryStore};
use vget::queue::worker::{WorkerContext, WorkerPool, WorkerPoolConfig};
use vget::queue::{DownloadQueue, JobStatus, ProgressReporter, ProgressSnapshot};
use vget::service::DownloadService;
use vget::session::SessionRegistry;
use vget::vault::{CredentialVault, Credentials};

/// Scripted fetcher: emits staged progress, honors cancellation, and keeps
/// a high-water mark of concurrent fetches. Requests whose URL contains
/// `slow` take much longer, so tests can pin one job in flight.
struct TestFetcher {
    work: Duration,
    fail_message: Option<String>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl TestFetcher {
    fn new(work: Duration) -> Self {
        Self {
            work,
            fail_message: None,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    fn failing(work: Duration, message: &str) -> Self {
        Self {
            fail_message: Some(message.to_string()),
            ..Self::new(work)
        }
    }

    fn work_for(&self, request: &DownloadRequest) -> Duration {
        if request.url.contains("slow") {
            Duration::from_secs(30)
        } else {
            self.work
        }
    }

    async fn run(
        &self,
        request: &DownloadRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<FetchOutput, FetchError> {
        const STEPS: u32 = 4;
        let slice = self.work_for(request) / STEPS;

        for step in 1..=STEPS {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(slice) => {}
            }
            let mut snapshot = ProgressSnapshot::new(JobStatus::Downloading);
            snapshot.progress = f64::from(step) / f64::from(STEPS) * 100.0;
            snapshot.downloaded_bytes = u64::from(step) * 256;
            snapshot.total_bytes = Some(1024);
            snapshot.filename = Some("video.mp4".to_string());
            progress.report(snapshot);
        }

        if let Some(message) = &self.fail_message {
            return Err(FetchError::classify(message));
        }

        let mut finishing = ProgressSnapshot::new(JobStatus::Processing);
        finishing.progress = 100.0;
        finishing.filename = Some("video.mp4".to_string());
        progress.report(finishing);

        Ok(FetchOutput {
            output_path: PathBuf::from("/tmp/video.mp4"),
            output_name: "video.mp4".to_string(),
        })
    }
}

#[async_trait]
impl MediaFetcher for TestFetcher {
    async fn fetch(
        &self,
        _job_id: Uuid,
        request: &DownloadRequest,
        _credentials: Option<&Credentials>,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<FetchOutput, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let result = self.run(request, &progress, &cancel).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct Harness {
    queue: Arc<DownloadQueue>,
    sessions: Arc<SessionRegistry>,
    fetcher: Arc<TestFetcher>,
    pool: WorkerPool,
}

/// Spin up a worker pool over a fresh queue with `workers` slots.
fn start_harness(workers: usize, fetcher: TestFetcher) -> Harness {
    let queue = Arc::new(DownloadQueue::new(64));
    let sessions = Arc::new(SessionRegistry::new());
    let fetcher = Arc::new(fetcher);
    let pool = WorkerPool::with_config(WorkerPoolConfig {
        max_workers: workers,
        job_timeout_secs: 60,
    });
    pool.start(WorkerContext {
        queue: Arc::clone(&queue),
        fetcher: fetcher.clone(),
        sessions: Arc::clone(&sessions),
        history: Arc::new(NullHistoryStore),
    });
    Harness {
        queue,
        sessions,
        fetcher,
        pool,
    }
}

fn request(url: &str) -> DownloadRequest {
    DownloadRequest::new(url)
}

async fn wait_until(deadline: Duration, check: impl Fn() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

async fn wait_terminal(queue: &DownloadQueue, job_id: &Uuid) {
    let reached = wait_until(Duration::from_secs(10), || {
        queue
            .status(job_id)
            .map(|view| view.status.is_terminal())
            .unwrap_or(false)
    })
    .await;
    assert!(
        reached,
        "job {job_id} never reached a terminal state: {:?}",
        queue.status(job_id).map(|v| v.status)
    );
}

mod lifecycle_tests {
    use super::*;

    fn rank(status: JobStatus) -> u8 {
        match status {
            JobStatus::Pending => 0,
            JobStatus::Downloading => 1,
            JobStatus::Processing => 2,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 3,
        }
    }

    #[tokio::test]
    async fn test_status_sequence_is_monotonic() {
        let harness = start_harness(1, TestFetcher::new(Duration::from_millis(60)));
        let job_id = harness.queue.submit(request("https://example.com/a"), None, None).unwrap();

        let mut observed = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let view = harness.queue.status(&job_id).unwrap();
            if observed.last() != Some(&view.status) {
                observed.push(view.status);
            }
            assert!(
                (0.0..=100.0).contains(&view.progress),
                "progress out of bounds: {}",
                view.progress
            );
            if view.status.is_terminal() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never finished");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(observed.first(), Some(&JobStatus::Pending));
        assert_eq!(observed.last(), Some(&JobStatus::Completed));
        for pair in observed.windows(2) {
            assert!(
                rank(pair[0]) < rank(pair[1]),
                "status went backward: {observed:?}"
            );
        }
        harness.pool.stop().await;
    }

    #[tokio::test]
    async fn test_single_worker_runs_jobs_in_submission_order() {
        let harness = start_harness(1, TestFetcher::new(Duration::from_millis(50)));
        let first = harness.queue.submit(request("https://example.com/a"), None, None).unwrap();
        let second = harness.queue.submit(request("https://example.com/b"), None, None).unwrap();

        // The second job cannot leave pending while the first is live.
        let second_started = wait_until(Duration::from_secs(10), || {
            harness
                .queue
                .status(&second)
                .map(|v| v.status != JobStatus::Pending)
                .unwrap_or(false)
        })
        .await;
        assert!(second_started);
        let first_view = harness.queue.status(&first).unwrap();
        assert!(
            first_view.status.is_terminal(),
            "second job started while first was {:?}",
            first_view.status
        );

        wait_terminal(&harness.queue, &second).await;
        harness.pool.stop().await;
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_pool_size() {
        let harness = start_harness(2, TestFetcher::new(Duration::from_millis(40)));
        let ids: Vec<Uuid> = (0..6)
            .map(|i| {
                harness
                    .queue
                    .submit(request(&format!("https://example.com/{i}")), None, None)
                    .unwrap()
            })
            .collect();

        let all_done = wait_until(Duration::from_secs(10), || {
            assert!(harness.queue.active_count() <= 2);
            ids.iter().all(|id| {
                harness
                    .queue
                    .status(id)
                    .map(|v| v.status.is_terminal())
                    .unwrap_or(false)
            })
        })
        .await;
        assert!(all_done, "not all jobs reached terminal states");
        assert!(harness.fetcher.max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(harness.fetcher.calls.load(Ordering::SeqCst), 6);
        harness.pool.stop().await;
    }

    #[tokio::test]
    async fn test_failure_is_classified_on_the_job() {
        let harness = start_harness(
            1,
            TestFetcher::failing(
                Duration::from_millis(20),
                "ERROR: Sign in to confirm you're not a bot",
            ),
        );
        let job_id = harness.queue.submit(request("https://example.com/a"), None, None).unwrap();
        wait_terminal(&harness.queue, &job_id).await;

        let view = harness.queue.status(&job_id).unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.error.as_deref().unwrap_or("").contains("sign-in required"));
        harness.pool.stop().await;
    }
}

mod cancel_tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_true_exactly_once() {
        let harness = start_harness(1, TestFetcher::new(Duration::from_millis(30)));
        let job_id = harness
            .queue
            .submit(request("https://example.com/slow/a"), None, None)
            .unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || {
                harness.queue.status(&job_id).map(|v| v.status) == Some(JobStatus::Downloading)
            })
            .await
        );

        assert!(harness.queue.cancel(&job_id));
        assert!(!harness.queue.cancel(&job_id));
        wait_terminal(&harness.queue, &job_id).await;
        assert_eq!(harness.queue.status(&job_id).unwrap().status, JobStatus::Cancelled);
        harness.pool.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_mid_fetch_frees_the_worker_slot() {
        let harness = start_harness(1, TestFetcher::new(Duration::from_millis(30)));
        let slow = harness
            .queue
            .submit(request("https://example.com/slow/a"), None, None)
            .unwrap();
        let quick = harness.queue.submit(request("https://example.com/b"), None, None).unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || {
                harness.queue.status(&slow).map(|v| v.status) == Some(JobStatus::Downloading)
            })
            .await
        );
        assert!(harness.queue.cancel(&slow));

        // The freed slot picks up the queued job and finishes it.
        wait_terminal(&harness.queue, &quick).await;
        assert_eq!(harness.queue.status(&quick).unwrap().status, JobStatus::Completed);
        harness.pool.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_returns_false_for_completed_job() {
        let harness = start_harness(1, TestFetcher::new(Duration::from_millis(10)));
        let job_id = harness.queue.submit(request("https://example.com/a"), None, None).unwrap();
        wait_terminal(&harness.queue, &job_id).await;
        assert!(!harness.queue.cancel(&job_id));
        harness.pool.stop().await;
    }
}

mod backpressure_tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_full_rejects_without_a_record() {
        // No workers draining, so the channel fills at its capacity.
        let queue = DownloadQueue::new(2);
        queue.submit(request("https://example.com/a"), None, None).unwrap();
        queue.submit(request("https://example.com/b"), None, None).unwrap();

        let err = queue
            .submit(request("https://example.com/c"), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull { capacity: 2 }));

        let stats = queue.stats();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.queue_depth, 2);
    }

    #[tokio::test]
    async fn test_all_jobs_drain_after_burst() {
        let harness = start_harness(3, TestFetcher::new(Duration::from_millis(20)));
        let ids: Vec<Uuid> = (0..10)
            .map(|i| {
                harness
                    .queue
                    .submit(request(&format!("https://example.com/{i}")), None, None)
                    .unwrap()
            })
            .collect();

        let waits = ids.iter().map(|id| wait_terminal(&harness.queue, id));
        futures::future::join_all(waits).await;

        let stats = harness.queue.stats();
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.queue_depth, 0);
        harness.pool.stop().await;
    }
}

mod vault_tests {
    use super::*;

    fn cookie_credentials() -> Credentials {
        let mut values = std::collections::HashMap::new();
        values.insert("SID".to_string(), "secret-value".to_string());
        Credentials::Cookies { values }
    }

    #[tokio::test]
    async fn test_expired_record_is_gone_after_read() {
        let vault = CredentialVault::new(&CredentialVault::generate_key()).unwrap();
        vault
            .store("session-1", &cookie_credentials(), Duration::from_millis(20))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(vault.retrieve("session-1").unwrap().is_none());
        assert!(vault.is_expired("session-1"));
        assert_eq!(vault.session_count(), 0);
    }

    #[tokio::test]
    async fn test_needs_refresh_window() {
        let vault = CredentialVault::new(&CredentialVault::generate_key()).unwrap();
        vault
            .store("session-1", &cookie_credentials(), Duration::from_secs(3600))
            .unwrap();

        assert!(!vault.needs_refresh("session-1", Duration::from_secs(1800)));
        assert!(vault.needs_refresh("session-1", Duration::from_secs(7200)));
        assert!(vault.needs_refresh("unknown", Duration::from_secs(1)));
    }
}

mod session_tests {
    use super::*;

    #[tokio::test]
    async fn test_anonymous_session_lifecycle() {
        let registry = SessionRegistry::new();
        let id = registry.create(None, Duration::from_millis(30));

        let view = registry.get(&id).unwrap();
        assert!(!view.authenticated);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_session_cap_enforced_in_facade() {
        let settings = Settings {
            max_jobs_per_session: 2,
            ..Settings::default()
        };
        let queue = Arc::new(DownloadQueue::new(settings.queue_capacity));
        let sessions = Arc::new(SessionRegistry::new());
        let vault = Arc::new(CredentialVault::new(&CredentialVault::generate_key()).unwrap());
        let service = DownloadService::new(queue, sessions, vault, &settings);

        // No workers are draining, so submitted jobs stay active on the session.
        let session_id = service.create_session(None);
        for i in 0..2 {
            let mut req = request(&format!("https://example.com/{i}"));
            req.session_id = Some(session_id.clone());
            service.submit(req, None).unwrap();
        }

        let mut req = request("https://example.com/extra");
        req.session_id = Some(session_id.clone());
        let err = service.submit(req, None).unwrap_err();
        assert!(matches!(err, Error::SessionCapExceeded { active: 2, .. }));
    }

    #[tokio::test]
    async fn test_worker_detaches_job_from_session() {
        let harness = start_harness(1, TestFetcher::new(Duration::from_millis(10)));
        let session_id = harness.sessions.create(None, Duration::from_secs(60));

        let mut req = request("https://example.com/a");
        req.session_id = Some(session_id.clone());
        let job_id = harness.queue.submit(req, None, None).unwrap();
        harness.sessions.add_job(&session_id, job_id);

        wait_terminal(&harness.queue, &job_id).await;
        let detached = wait_until(Duration::from_secs(5), || {
            harness.sessions.active_job_count(&session_id) == 0
        })
        .await;
        assert!(detached);
        harness.pool.stop().await;
    }
}

mod history_tests {
    use super::*;

    async fn sqlite_store() -> (tempfile::TempDir, Arc<SqliteHistoryStore>) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("history.db").display());
        let pool = vget::history::init_pool(&url).await.unwrap();
        vget::history::run_migrations(&pool).await.unwrap();
        (dir, Arc::new(SqliteHistoryStore::new(pool)))
    }

    #[tokio::test]
    async fn test_worker_persists_history_once() {
        let (_dir, store) = sqlite_store().await;
        let queue = Arc::new(DownloadQueue::new(8));
        let sessions = Arc::new(SessionRegistry::new());
        let pool = WorkerPool::with_config(WorkerPoolConfig {
            max_workers: 1,
            job_timeout_secs: 60,
        });
        pool.start(WorkerContext {
            queue: Arc::clone(&queue),
            fetcher: Arc::new(TestFetcher::new(Duration::from_millis(10))),
            sessions,
            history: store.clone(),
        });

        let job_id = queue
            .submit(request("https://example.com/a"), Some("user-1".to_string()), None)
            .unwrap();
        wait_terminal(&queue, &job_id).await;

        // The persist is fire-and-forget, so give the spawned write a moment.
        let mut rows = Vec::new();
        for _ in 0..200 {
            rows = store.recent(10).await.unwrap();
            if !rows.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].job_id, job_id);
        assert_eq!(rows[0].status, "completed");
        assert_eq!(rows[0].user_id.as_deref(), Some("user-1"));

        // Replaying the same terminal job cannot duplicate the row.
        let job = queue.status(&job_id).unwrap();
        let record = HistoryRecord {
            job_id: job.job_id,
            user_id: Some("user-1".to_string()),
            source_url: "https://example.com/a".to_string(),
            format_type: "video".to_string(),
            quality: "best".to_string(),
            format_id: None,
            status: "completed".to_string(),
            error_message: None,
            output_path: Some("/tmp/video.mp4".to_string()),
            output_name: Some("video.mp4".to_string()),
            created_at: job.created_at,
            completed_at: job.completed_at,
        };
        store.record(&record).await.unwrap();
        assert_eq!(store.recent(10).await.unwrap().len(), 1);

        pool.stop().await;
    }
}
