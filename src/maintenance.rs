//! Periodic housekeeping.
//!
//! One background task sweeps the three in-memory arenas on a fixed
//! interval: expired sessions, expired credential records, and terminal
//! jobs past their retention window. Each sweep also logs a queue stats
//! snapshot so operators can watch backlog trends from the logs alone.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::queue::DownloadQueue;
use crate::session::SessionRegistry;
use crate::vault::CredentialVault;

/// Configuration for the maintenance scheduler.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Interval between sweeps (default: 1 hour).
    pub sweep_interval: Duration,
    /// How long terminal jobs stay visible in memory (default: 24 hours).
    pub job_retention: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60 * 60),
            job_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Background sweeper for sessions, credentials, and old jobs.
pub struct MaintenanceScheduler {
    queue: Arc<DownloadQueue>,
    sessions: Arc<SessionRegistry>,
    vault: Arc<CredentialVault>,
    config: MaintenanceConfig,
    shutdown: CancellationToken,
}

impl MaintenanceScheduler {
    pub fn new(
        queue: Arc<DownloadQueue>,
        sessions: Arc<SessionRegistry>,
        vault: Arc<CredentialVault>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            queue,
            sessions,
            vault,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the maintenance scheduler.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        })
    }

    /// Stop the maintenance scheduler.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    async fn run_loop(&self) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        // The first tick completes immediately; skip it so startup stays quiet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => self.run_maintenance(),
            }
        }
    }

    /// Run one full sweep. Also invoked directly by tests and shutdown paths.
    pub fn run_maintenance(&self) {
        let sessions_swept = self.sessions.sweep_expired();
        let credentials_swept = self.vault.sweep_expired();
        let jobs_evicted = self.queue.sweep_old(self.config.job_retention);

        let stats = self.queue.stats();
        info!(
            sessions_swept,
            credentials_swept,
            jobs_evicted,
            pending = stats.pending,
            downloading = stats.downloading,
            processing = stats.processing,
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            queue_depth = stats.queue_depth,
            "Maintenance sweep completed"
        );
    }
}
