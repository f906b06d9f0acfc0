//! yt-dlp download engine adapter.
//!
//! Spawns the `yt-dlp` binary per job, feeds it a machine-readable progress
//! template, and maps its output onto the fetch contract: progress samples
//! while bytes flow, a final file path on success, a classified error
//! otherwise. Credentials are handed over as a Netscape cookie file that
//! lives only for the duration of the run.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::request::{DownloadRequest, FormatType, sanitize_filename};
use super::{FetchError, FetchOutput, MediaFetcher};
use crate::queue::job::JobStatus;
use crate::queue::progress::{ProgressReporter, ProgressSnapshot};
use crate::vault::Credentials;

/// Prefix emitted by the progress template below.
const PROGRESS_PREFIX: &str = "download:";

/// Template that makes yt-dlp print one JSON progress record per line.
const PROGRESS_TEMPLATE: &str = "download:%(progress)j";

/// Browser user agent sent to the source to avoid bot detection.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const SOCKET_TIMEOUT_SECS: u32 = 30;
const TRANSFER_RETRIES: u32 = 3;
const KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// yt-dlp based [`MediaFetcher`].
pub struct YtDlpFetcher {
    /// Path to the yt-dlp binary.
    binary_path: String,
    /// Directory for completed downloads.
    output_dir: PathBuf,
    /// Domain written into generated cookie files for name/value credentials.
    cookie_domain: String,
    /// Cached version string, probed at construction.
    version: Option<String>,
}

impl YtDlpFetcher {
    pub fn new(binary_path: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        let binary_path = binary_path.into();
        let version = Self::detect_version(&binary_path);
        Self {
            binary_path,
            output_dir: output_dir.into(),
            cookie_domain: ".youtube.com".to_string(),
            version,
        }
    }

    /// Set the domain used when rendering name/value cookies to a file.
    pub fn with_cookie_domain(mut self, domain: impl Into<String>) -> Self {
        self.cookie_domain = domain.into();
        self
    }

    /// Detect the yt-dlp version.
    fn detect_version(path: &str) -> Option<String> {
        let mut cmd = std::process::Command::new(path);
        cmd.arg("--version");
        cmd.output()
            .ok()
            .and_then(|output| String::from_utf8(output.stdout).ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Check if the binary responded to a version probe.
    pub fn is_available(&self) -> bool {
        self.version.is_some()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Build the yt-dlp argument list for a request.
    fn build_args(&self, request: &DownloadRequest, cookie_file: Option<&Path>) -> Vec<String> {
        let mut args = Vec::new();

        // Quiet except for progress records and the final filepath print.
        args.extend([
            "--quiet".to_string(),
            "--no-warnings".to_string(),
            "--no-colors".to_string(),
            "--newline".to_string(),
            "--progress".to_string(),
            "--progress-template".to_string(),
            PROGRESS_TEMPLATE.to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            "--no-simulate".to_string(),
        ]);

        args.extend([
            "--socket-timeout".to_string(),
            SOCKET_TIMEOUT_SECS.to_string(),
            "--retries".to_string(),
            TRANSFER_RETRIES.to_string(),
            "--fragment-retries".to_string(),
            TRANSFER_RETRIES.to_string(),
            "--skip-unavailable-fragments".to_string(),
            "--user-agent".to_string(),
            USER_AGENT.to_string(),
        ]);

        args.extend(["-f".to_string(), request.format_selector()]);
        args.extend([
            "-o".to_string(),
            self.output_dir
                .join("%(title)s.%(ext)s")
                .to_string_lossy()
                .to_string(),
        ]);

        if request.format_type == FormatType::Audio {
            let audio_format = match request.audio_format.as_deref() {
                None | Some("best") => "m4a",
                Some(other) => other,
            };
            args.extend([
                "-x".to_string(),
                "--audio-format".to_string(),
                audio_format.to_string(),
                "--audio-quality".to_string(),
                "192".to_string(),
            ]);
        } else {
            args.extend(["--merge-output-format".to_string(), "mp4".to_string()]);
        }

        if let Some(path) = cookie_file {
            args.extend([
                "--cookies".to_string(),
                path.to_string_lossy().to_string(),
            ]);
        }

        args.push(request.url.trim().to_string());
        args
    }

    /// Write credentials to a temp cookie file in Netscape format.
    ///
    /// The file is deleted when the returned handle drops, i.e. as soon as
    /// the fetch finishes in any way.
    fn create_cookie_file(
        &self,
        credentials: &Credentials,
    ) -> Result<tempfile::NamedTempFile, FetchError> {
        let mut file = tempfile::Builder::new()
            .prefix("vget-cookies-")
            .suffix(".txt")
            .tempfile()
            .map_err(|e| FetchError::Failed(format!("Failed to create cookie file: {e}")))?;
        file.write_all(credentials.to_netscape(&self.cookie_domain).as_bytes())
            .map_err(|e| FetchError::Failed(format!("Failed to write cookie file: {e}")))?;
        file.flush()
            .map_err(|e| FetchError::Failed(format!("Failed to write cookie file: {e}")))?;
        Ok(file)
    }
}

/// Parse one stdout line from the progress template.
///
/// `download:{...}` records map onto progress snapshots the way the engine
/// reports them: `downloading` while bytes flow, `finished` once transfer is
/// done and post-processing starts. Anything else returns `None`.
fn parse_progress_line(line: &str) -> Option<ProgressSnapshot> {
    let payload = line.strip_prefix(PROGRESS_PREFIX)?;
    let value: serde_json::Value = serde_json::from_str(payload.trim()).ok()?;

    match value.get("status").and_then(|s| s.as_str()) {
        Some("downloading") => {
            let downloaded = value
                .get("downloaded_bytes")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let total = value
                .get("total_bytes")
                .and_then(|v| v.as_f64())
                .or_else(|| value.get("total_bytes_estimate").and_then(|v| v.as_f64()))
                .filter(|t| *t > 0.0);

            let mut snapshot = ProgressSnapshot::new(JobStatus::Downloading);
            snapshot.progress = total.map(|t| downloaded / t * 100.0).unwrap_or(0.0);
            snapshot.downloaded_bytes = downloaded as u64;
            snapshot.total_bytes = total.map(|t| t as u64);
            snapshot.speed = value.get("speed").and_then(|v| v.as_f64());
            snapshot.eta = value.get("eta").and_then(|v| v.as_f64());
            snapshot.filename = value
                .get("filename")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Some(snapshot)
        }
        Some("finished") => {
            let mut snapshot = ProgressSnapshot::new(JobStatus::Processing);
            snapshot.progress = 100.0;
            snapshot.filename = value
                .get("filename")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Some(snapshot)
        }
        _ => None,
    }
}

#[async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        job_id: Uuid,
        request: &DownloadRequest,
        credentials: Option<&Credentials>,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<FetchOutput, FetchError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| FetchError::Failed(format!("Failed to create output dir: {e}")))?;

        // Keep the handle alive for the whole run; dropping it deletes the file.
        let cookie_file = match credentials {
            Some(credentials) => Some(self.create_cookie_file(credentials)?),
            None => None,
        };

        let args = self.build_args(request, cookie_file.as_ref().map(|f| f.path()));
        debug!(job_id = %job_id, binary = %self.binary_path, "Spawning downloader");

        let mut command = tokio::process::Command::new(&self.binary_path);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| FetchError::Failed(format!("Failed to spawn downloader: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Failed("Failed to capture downloader stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FetchError::Failed("Failed to capture downloader stderr".to_string()))?;

        // Collect stderr for classification once the process exits.
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "vget::ytdlp", "{line}");
                if !collected.is_empty() {
                    collected.push('\n');
                }
                collected.push_str(&line);
            }
            collected
        });

        // Drive stdout until EOF or cancellation. The last non-progress line
        // is the `after_move:filepath` print, i.e. the finished file.
        let mut lines = BufReader::new(stdout).lines();
        let mut final_path: Option<String> = None;
        let cancelled = loop {
            tokio::select! {
                _ = cancel.cancelled() => break true,
                next = lines.next_line() => match next {
                    Ok(Some(line)) => {
                        if let Some(snapshot) = parse_progress_line(&line) {
                            progress.report(snapshot);
                        } else if !line.trim().is_empty() {
                            final_path = Some(line.trim().to_string());
                        }
                    }
                    Ok(None) => break false,
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Error reading downloader stdout");
                        break false;
                    }
                }
            }
        };

        if cancelled {
            debug!(job_id = %job_id, "Cancellation requested, killing downloader");
            let _ = child.kill().await;
            let _ = tokio::time::timeout(KILL_TIMEOUT, child.wait()).await;
            stderr_task.abort();
            return Err(FetchError::Cancelled);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| FetchError::Failed(format!("Failed to wait for downloader: {e}")))?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let message = if stderr_text.trim().is_empty() {
                format!("downloader exited with {status}")
            } else {
                stderr_text
            };
            return Err(FetchError::classify(&message));
        }

        let Some(path) = final_path.map(PathBuf::from) else {
            return Err(FetchError::Failed(
                "Download completed but file not found".to_string(),
            ));
        };
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(FetchError::Failed(
                "Download completed but file not found".to_string(),
            ));
        }

        let output_name = path
            .file_name()
            .map(|name| sanitize_filename(&name.to_string_lossy()))
            .unwrap_or_else(|| "download".to_string());

        info!(job_id = %job_id, path = %path.display(), "Download completed");
        Ok(FetchOutput {
            output_path: path,
            output_name,
        })
    }
}
