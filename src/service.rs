//! Download service facade.
//!
//! Front door for embedders: validates requests, enforces the per-session
//! job cap, pulls credentials out of the vault, and hands the job to the
//! queue. Everything past submission is observed by polling the queue.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::fetcher::DownloadRequest;
use crate::queue::{DownloadQueue, JobView, ProgressSnapshot, QueueStats};
use crate::session::{SessionRegistry, SessionUpdate, SessionView};
use crate::vault::{Credentials, CredentialVault};

/// Orchestrates submissions across the queue, sessions, and vault.
pub struct DownloadService {
    queue: Arc<DownloadQueue>,
    sessions: Arc<SessionRegistry>,
    vault: Arc<CredentialVault>,
    max_jobs_per_session: usize,
    session_ttl: Duration,
    credential_ttl: Duration,
    credential_refresh_threshold: Duration,
}

impl DownloadService {
    pub fn new(
        queue: Arc<DownloadQueue>,
        sessions: Arc<SessionRegistry>,
        vault: Arc<CredentialVault>,
        settings: &Settings,
    ) -> Self {
        Self {
            queue,
            sessions,
            vault,
            max_jobs_per_session: settings.max_jobs_per_session,
            session_ttl: settings.session_ttl(),
            credential_ttl: settings.credential_ttl(),
            credential_refresh_threshold: settings.credential_refresh_threshold(),
        }
    }

    /// Validate and submit a download request.
    ///
    /// A request that names a live session is counted against that session's
    /// active-job cap and picks up its stored credentials. Unknown or
    /// expired session ids degrade to an anonymous submission; unusable
    /// credentials degrade to an uncredentialed fetch. Both are logged, not
    /// fatal.
    pub fn submit(&self, request: DownloadRequest, user_id: Option<String>) -> Result<Uuid> {
        request.validate()?;

        let session_id = request.session_id.clone();
        let mut credentials = None;

        if let Some(session_id) = session_id.as_deref() {
            if self.sessions.get(session_id).is_some() {
                let active = self.sessions.active_job_count(session_id);
                if active >= self.max_jobs_per_session {
                    return Err(Error::SessionCapExceeded {
                        session_id: session_id.to_string(),
                        active,
                        limit: self.max_jobs_per_session,
                    });
                }

                match self.vault.retrieve(session_id) {
                    Ok(Some(stored)) => {
                        if self
                            .vault
                            .needs_refresh(session_id, self.credential_refresh_threshold)
                        {
                            warn!(session_id, "Session credentials expire soon, refresh advised");
                        }
                        credentials = Some(stored);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            session_id,
                            error = %e,
                            "Stored credentials unusable, continuing without"
                        );
                    }
                }
            } else {
                warn!(session_id, "Unknown or expired session on request, continuing without credentials");
            }
        }

        let job_id = self.queue.submit(request, user_id, credentials)?;
        if let Some(session_id) = session_id.as_deref() {
            self.sessions.add_job(session_id, job_id);
        }
        info!(job_id = %job_id, "Download submitted");
        Ok(job_id)
    }

    /// Cancel a job. True exactly once per job, false afterwards and for
    /// unknown ids.
    pub fn cancel(&self, job_id: &Uuid) -> bool {
        self.queue.cancel(job_id)
    }

    pub fn status(&self, job_id: &Uuid) -> Option<JobView> {
        self.queue.status(job_id)
    }

    pub fn progress(&self, job_id: &Uuid) -> Option<ProgressSnapshot> {
        self.queue.progress(job_id)
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Create a session with the configured TTL.
    pub fn create_session(&self, user_id: Option<String>) -> String {
        self.sessions.create(user_id, self.session_ttl)
    }

    pub fn session(&self, session_id: &str) -> Option<SessionView> {
        self.sessions.get(session_id)
    }

    pub fn update_session(&self, session_id: &str, patch: SessionUpdate) -> bool {
        self.sessions.update(session_id, patch)
    }

    /// Delete a session along with any credentials stored under it.
    pub fn delete_session(&self, session_id: &str) -> bool {
        self.vault.delete(session_id);
        self.sessions.delete(session_id)
    }

    /// Seal credentials into the vault under a live session.
    pub fn attach_credentials(&self, session_id: &str, credentials: &Credentials) -> Result<()> {
        if self.sessions.get(session_id).is_none() {
            return Err(Error::not_found("Session", session_id));
        }
        self.vault
            .store(session_id, credentials, self.credential_ttl)?;
        Ok(())
    }

    /// Whether the session's stored credentials are inside the refresh
    /// window. True when nothing is stored at all.
    pub fn credentials_need_refresh(&self, session_id: &str) -> bool {
        self.vault
            .needs_refresh(session_id, self.credential_refresh_threshold)
    }
}
