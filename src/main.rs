use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vget::config::Settings;
use vget::fetcher::{MediaFetcher, YtDlpFetcher};
use vget::history::{self, HistoryStore, SqliteHistoryStore};
use vget::maintenance::{MaintenanceConfig, MaintenanceScheduler};
use vget::queue::worker::{WorkerContext, WorkerPool, WorkerPoolConfig};
use vget::queue::DownloadQueue;
use vget::service::DownloadService;
use vget::session::SessionRegistry;
use vget::vault::CredentialVault;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env()?;

    // The guard keeps the non-blocking file writer alive until main returns.
    let _log_guard = vget::logging::init_logging(settings.log_dir.as_deref())?;
    vget::panic_hook::install(
        settings
            .log_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".")),
    );

    let shutdown = CancellationToken::new();
    if let Some(log_dir) = &settings.log_dir {
        vget::logging::start_retention_cleanup(log_dir.clone(), shutdown.clone());
    }

    let vault = match &settings.vault_key {
        Some(key) => Arc::new(CredentialVault::new(key)?),
        None => {
            warn!(
                "VGET_VAULT_KEY not set; using an ephemeral vault key, \
                 stored credentials will not survive a restart"
            );
            Arc::new(CredentialVault::new(&CredentialVault::generate_key())?)
        }
    };

    let pool = history::init_pool(&settings.database_url).await?;
    history::run_migrations(&pool).await?;
    let history: Arc<dyn HistoryStore> = Arc::new(SqliteHistoryStore::new(pool));

    let queue = Arc::new(DownloadQueue::new(settings.queue_capacity));
    let sessions = Arc::new(SessionRegistry::new());

    let fetcher = YtDlpFetcher::new(settings.ytdlp_path.as_str(), settings.output_dir.clone());
    match fetcher.version() {
        Some(version) => info!(version, "yt-dlp detected"),
        None => warn!(
            path = %settings.ytdlp_path,
            "yt-dlp not found or not executable; downloads will fail until it is installed"
        ),
    }
    let fetcher: Arc<dyn MediaFetcher> = Arc::new(fetcher);

    let worker_pool = WorkerPool::with_config(WorkerPoolConfig {
        max_workers: settings.max_concurrent,
        job_timeout_secs: settings.job_timeout_secs,
    });
    worker_pool.start(WorkerContext {
        queue: Arc::clone(&queue),
        fetcher,
        sessions: Arc::clone(&sessions),
        history,
    });

    let scheduler = Arc::new(MaintenanceScheduler::new(
        Arc::clone(&queue),
        Arc::clone(&sessions),
        Arc::clone(&vault),
        MaintenanceConfig {
            sweep_interval: settings.sweep_interval(),
            job_retention: settings.job_retention(),
        },
    ));
    let maintenance_handle = scheduler.clone().start();

    let service = DownloadService::new(queue, sessions, vault, &settings);
    info!(
        workers = settings.max_concurrent,
        queue_capacity = settings.queue_capacity,
        output_dir = %settings.output_dir.display(),
        "vget ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    worker_pool.stop().await;
    scheduler.stop();
    shutdown.cancel();
    let _ = maintenance_handle.await;

    let stats = service.stats();
    info!(
        completed = stats.completed,
        failed = stats.failed,
        cancelled = stats.cancelled,
        "Shutdown complete"
    );
    Ok(())
}
