//! SQLite-backed history store.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{HistoryRecord, HistoryStore};
use crate::error::{Error, Result};

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

const DEFAULT_POOL_SIZE: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Initialize the history database pool.
///
/// WAL mode so history reads never stall a worker's write-through.
pub async fn init_pool(database_url: &str) -> Result<DbPool> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(DEFAULT_POOL_SIZE)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(connect_options)
        .await?;

    info!("History database pool initialized with WAL mode");
    Ok(pool)
}

/// Run pending migrations from `./migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// SQLite implementation of [`HistoryStore`].
pub struct SqliteHistoryStore {
    pool: DbPool,
}

impl SqliteHistoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Most recent history rows, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT * FROM download_history ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HistoryRow::into_record).collect()
    }

    /// History rows for one user, newest first.
    pub async fn for_user(&self, user_id: &str, limit: i64) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT * FROM download_history WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(HistoryRow::into_record).collect()
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    #[instrument(skip(self, record), fields(job_id = %record.job_id, status = %record.status))]
    async fn record(&self, record: &HistoryRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO download_history (
                job_id, user_id, source_url, format_type, quality, format_id,
                status, error_message, output_path, output_name,
                created_at, completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.job_id.to_string())
        .bind(&record.user_id)
        .bind(&record.source_url)
        .bind(&record.format_type)
        .bind(&record.quality)
        .bind(&record.format_id)
        .bind(&record.status)
        .bind(&record.error_message)
        .bind(&record.output_path)
        .bind(&record.output_name)
        .bind(record.created_at.to_rfc3339())
        .bind(record.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("History row already present, skipped");
        }
        Ok(())
    }
}

/// Raw table row. Timestamps and ids are stored as TEXT.
#[derive(sqlx::FromRow)]
struct HistoryRow {
    job_id: String,
    user_id: Option<String>,
    source_url: String,
    format_type: String,
    quality: String,
    format_id: Option<String>,
    status: String,
    error_message: Option<String>,
    output_path: Option<String>,
    output_name: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl HistoryRow {
    fn into_record(self) -> Result<HistoryRecord> {
        Ok(HistoryRecord {
            job_id: Uuid::parse_str(&self.job_id)
                .map_err(|e| Error::Other(format!("Corrupt history row id: {e}")))?,
            user_id: self.user_id,
            source_url: self.source_url,
            format_type: self.format_type,
            quality: self.quality,
            format_id: self.format_id,
            status: self.status,
            error_message: self.error_message,
            output_path: self.output_path,
            output_name: self.output_name,
            created_at: parse_timestamp(&self.created_at)?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("Corrupt history timestamp '{raw}': {e}")))
}
