//! Download history persistence.
//!
//! Workers push one record per finished job through [`HistoryStore`]. The
//! write happens off the hot path and is idempotent on job id, so a retried
//! persist can never duplicate a row.

pub mod sqlite;

pub use sqlite::{SqliteHistoryStore, init_pool, run_migrations};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;
use crate::queue::Job;

/// Flattened terminal-job record, one row per job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub job_id: Uuid,
    pub user_id: Option<String>,
    pub source_url: String,
    pub format_type: String,
    pub quality: String,
    pub format_id: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub output_path: Option<String>,
    pub output_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl HistoryRecord {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            user_id: job.user_id.clone(),
            source_url: job.request.url.clone(),
            format_type: job.request.format_type.to_string(),
            quality: job.request.quality.as_str().to_string(),
            format_id: job.request.format_id.clone(),
            status: job.status.as_str().to_string(),
            error_message: job.error.clone(),
            output_path: job
                .output_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            output_name: job.output_name.clone(),
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

/// Write-through sink for finished jobs.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist one terminal job. Implementations must be idempotent on
    /// `job_id`.
    async fn record(&self, record: &HistoryRecord) -> Result<()>;
}

/// Store that drops every record, for embedders with their own persistence.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHistoryStore;

#[async_trait]
impl HistoryStore for NullHistoryStore {
    async fn record(&self, _record: &HistoryRecord) -> Result<()> {
        Ok(())
    }
}
