//! Runtime configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Application settings.
///
/// Every field has a usable default so the binary starts with nothing but a
/// vault key configured. `Settings::from_env` reads `VGET_*` variables on top
/// of the defaults and validates the combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum concurrent downloads (worker pool size).
    pub max_concurrent: usize,
    /// Bounded submission backlog; submissions beyond this fail fast.
    pub queue_capacity: usize,
    /// Maximum active jobs a single session may hold.
    pub max_jobs_per_session: usize,
    /// Guard timeout for a single job in seconds.
    pub job_timeout_secs: u64,
    /// Session time-to-live in seconds.
    pub session_ttl_secs: u64,
    /// Credential record time-to-live in seconds.
    pub credential_ttl_secs: u64,
    /// Warn-ahead window for credential refresh in seconds.
    pub credential_refresh_threshold_secs: u64,
    /// Interval between maintenance sweeps in seconds.
    pub sweep_interval_secs: u64,
    /// How long terminal jobs stay visible in memory, in seconds.
    pub job_retention_secs: u64,
    /// SQLite database URL for download history.
    pub database_url: String,
    /// Directory for completed downloads.
    pub output_dir: PathBuf,
    /// Directory for rolling log files. Console-only logging when unset.
    pub log_dir: Option<PathBuf>,
    /// Path to the yt-dlp binary.
    pub ytdlp_path: String,
    /// Base64-encoded 256-bit key for the credential vault.
    pub vault_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            queue_capacity: 256,
            max_jobs_per_session: 3,
            job_timeout_secs: 3600,
            session_ttl_secs: 24 * 60 * 60,
            credential_ttl_secs: 24 * 60 * 60,
            credential_refresh_threshold_secs: 6 * 60 * 60,
            sweep_interval_secs: 60 * 60,
            job_retention_secs: 24 * 60 * 60,
            database_url: "sqlite:vget.db?mode=rwc".to_string(),
            output_dir: PathBuf::from("downloads"),
            log_dir: None,
            ytdlp_path: "yt-dlp".to_string(),
            vault_key: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::config(format!("{name} has invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let settings = Self {
            max_concurrent: env_parse("VGET_MAX_CONCURRENT", defaults.max_concurrent)?,
            queue_capacity: env_parse("VGET_QUEUE_CAPACITY", defaults.queue_capacity)?,
            max_jobs_per_session: env_parse(
                "VGET_MAX_JOBS_PER_SESSION",
                defaults.max_jobs_per_session,
            )?,
            job_timeout_secs: env_parse("VGET_JOB_TIMEOUT_SECS", defaults.job_timeout_secs)?,
            session_ttl_secs: env_parse("VGET_SESSION_TTL_SECS", defaults.session_ttl_secs)?,
            credential_ttl_secs: env_parse(
                "VGET_CREDENTIAL_TTL_SECS",
                defaults.credential_ttl_secs,
            )?,
            credential_refresh_threshold_secs: env_parse(
                "VGET_CREDENTIAL_REFRESH_THRESHOLD_SECS",
                defaults.credential_refresh_threshold_secs,
            )?,
            sweep_interval_secs: env_parse("VGET_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?,
            job_retention_secs: env_parse("VGET_JOB_RETENTION_SECS", defaults.job_retention_secs)?,
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            output_dir: std::env::var("VGET_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            log_dir: std::env::var("VGET_LOG_DIR").ok().map(PathBuf::from),
            ytdlp_path: std::env::var("VGET_YTDLP_PATH").unwrap_or(defaults.ytdlp_path),
            vault_key: std::env::var("VGET_VAULT_KEY").ok().filter(|k| !k.is_empty()),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::config("VGET_MAX_CONCURRENT must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::config("VGET_QUEUE_CAPACITY must be at least 1"));
        }
        if self.max_jobs_per_session == 0 {
            return Err(Error::config("VGET_MAX_JOBS_PER_SESSION must be at least 1"));
        }
        if self.job_timeout_secs == 0 {
            return Err(Error::config("VGET_JOB_TIMEOUT_SECS must be at least 1"));
        }
        if self.session_ttl_secs == 0 {
            return Err(Error::config("VGET_SESSION_TTL_SECS must be at least 1"));
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_secs)
    }

    pub fn credential_refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.credential_refresh_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_concurrent, 3);
        assert_eq!(settings.queue_capacity, 256);
        assert_eq!(settings.max_jobs_per_session, 3);
        assert_eq!(settings.job_timeout_secs, 3600);
        assert_eq!(settings.session_ttl_secs, 86_400);
        assert_eq!(settings.credential_refresh_threshold_secs, 21_600);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let settings = Settings {
            max_concurrent: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let settings = Settings {
            queue_capacity: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
