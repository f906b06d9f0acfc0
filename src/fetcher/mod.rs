//! Extraction engine contract and adapters.
//!
//! The orchestration core never talks to the remote media source itself. It
//! hands a job to a [`MediaFetcher`] and consumes either a successful output
//! or a classified error; progress flows back through a [`ProgressReporter`]
//! while the fetch runs.

pub mod request;
pub mod ytdlp;

pub use request::{DownloadRequest, FormatType, Quality, sanitize_filename};
pub use ytdlp::YtDlpFetcher;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::queue::progress::ProgressReporter;
use crate::vault::Credentials;

/// Classified failure from the extraction engine.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The source demands sign-in before serving the media.
    #[error("Authentication required: {0}")]
    AuthRequired(String),
    /// The media is gone, private, or otherwise not servable.
    #[error("Media unavailable: {0}")]
    Unavailable(String),
    /// The source is throttling us.
    #[error("Rate limited: {0}")]
    RateLimited(String),
    /// The job's cancellation token fired mid-fetch.
    #[error("Download cancelled")]
    Cancelled,
    /// The guard timeout elapsed before the engine finished.
    #[error("Download timed out after {0}s")]
    Timeout(u64),
    /// Anything else the engine reported.
    #[error("Download failed: {0}")]
    Failed(String),
}

impl FetchError {
    /// Classify raw engine error output by its message.
    pub fn classify(message: &str) -> Self {
        if message.contains("Sign in to confirm") {
            Self::AuthRequired(
                "sign-in required by the source, update the session credentials".to_string(),
            )
        } else if message.contains("This video is unavailable") || message.contains("Private video")
        {
            Self::Unavailable(message.trim().to_string())
        } else if message.contains("HTTP Error 429") || message.contains("Too Many Requests") {
            Self::RateLimited("rate limit exceeded, try again later".to_string())
        } else {
            Self::Failed(message.trim().to_string())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Successful fetch result.
#[derive(Debug, Clone)]
pub struct FetchOutput {
    /// Where the finished file landed.
    pub output_path: PathBuf,
    /// Final (sanitized) filename.
    pub output_name: String,
}

/// Contract between the worker pool and the extraction engine.
///
/// A single operation: perform the job, stream progress samples through
/// `progress`, and return the output or a classified error. Implementations
/// must honor `cancel` promptly; a fired token aborts in-flight work and
/// yields [`FetchError::Cancelled`].
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(
        &self,
        job_id: Uuid,
        request: &DownloadRequest,
        credentials: Option<&Credentials>,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<FetchOutput, FetchError>;
}
