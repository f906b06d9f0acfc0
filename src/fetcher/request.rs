//! Download request specification and input validation.
//!
//! A [`DownloadRequest`] is validated once at submission time; anything that
//! passes is safe to hand to the extraction engine as-is.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Characters that are invalid in filenames on at least one platform.
const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Maximum sanitized filename length.
const MAX_FILENAME_LENGTH: usize = 200;

/// Codec names accepted for `video_codec` / `audio_codec` preferences.
const VALID_CODECS: &[&str] = &[
    "h264", "h265", "vp9", "av1", "aac", "opus", "mp3", "vorbis", "any",
];

/// What the caller wants out of the source media.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    #[default]
    Video,
    Audio,
    Both,
}

/// Quality preference for video downloads.
///
/// `Best`/`Worst` pass straight through to the engine; the fixed rungs cap
/// the stream height.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum Quality {
    #[default]
    #[serde(rename = "best")]
    #[strum(serialize = "best")]
    Best,
    #[serde(rename = "worst")]
    #[strum(serialize = "worst")]
    Worst,
    #[serde(rename = "2160p")]
    #[strum(serialize = "2160p")]
    Q2160p,
    #[serde(rename = "1440p")]
    #[strum(serialize = "1440p")]
    Q1440p,
    #[serde(rename = "1080p")]
    #[strum(serialize = "1080p")]
    Q1080p,
    #[serde(rename = "720p")]
    #[strum(serialize = "720p")]
    Q720p,
    #[serde(rename = "480p")]
    #[strum(serialize = "480p")]
    Q480p,
    #[serde(rename = "360p")]
    #[strum(serialize = "360p")]
    Q360p,
    #[serde(rename = "240p")]
    #[strum(serialize = "240p")]
    Q240p,
    #[serde(rename = "144p")]
    #[strum(serialize = "144p")]
    Q144p,
}

impl Quality {
    /// Maximum stream height for this rung, `None` for `best`/`worst`.
    pub fn height(&self) -> Option<u32> {
        match self {
            Self::Best | Self::Worst => None,
            Self::Q2160p => Some(2160),
            Self::Q1440p => Some(1440),
            Self::Q1080p => Some(1080),
            Self::Q720p => Some(720),
            Self::Q480p => Some(480),
            Self::Q360p => Some(360),
            Self::Q240p => Some(240),
            Self::Q144p => Some(144),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::Worst => "worst",
            Self::Q2160p => "2160p",
            Self::Q1440p => "1440p",
            Self::Q1080p => "1080p",
            Self::Q720p => "720p",
            Self::Q480p => "480p",
            Self::Q360p => "360p",
            Self::Q240p => "240p",
            Self::Q144p => "144p",
        }
    }
}

/// One media download job specification. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    #[serde(default)]
    pub format_type: FormatType,
    /// Specific engine format id; overrides `quality` and codec preferences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_id: Option<String>,
    #[serde(default)]
    pub quality: Quality,
    /// Target container for extracted audio (`m4a`, `mp3`, ...). `None`
    /// and `"best"` both mean the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    /// Session to attribute the job to and to fetch credentials for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format_type: FormatType::default(),
            format_id: None,
            quality: Quality::default(),
            audio_format: None,
            video_codec: None,
            audio_codec: None,
            session_id: None,
        }
    }

    /// Validate the request. Called once at submission; a request that fails
    /// here never becomes a job.
    pub fn validate(&self) -> Result<()> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(Error::validation("URL must be a non-empty string"));
        }

        let parsed =
            Url::parse(url).map_err(|e| Error::validation(format!("Invalid URL: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::validation(format!(
                "Unsupported URL scheme: {}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().is_none() {
            return Err(Error::validation("URL must include a host"));
        }

        if let Some(format_id) = &self.format_id {
            if format_id.is_empty()
                || !format_id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-'))
            {
                return Err(Error::validation(format!(
                    "Invalid format id: {format_id}"
                )));
            }
        }

        if let Some(codec) = &self.video_codec {
            validate_codec(codec)?;
        }
        if let Some(codec) = &self.audio_codec {
            validate_codec(codec)?;
        }

        Ok(())
    }

    /// Build the engine format selector string.
    ///
    /// Precedence: explicit `format_id` wins; audio-only requests select the
    /// best audio stream; otherwise quality (and optionally video codec) cap
    /// the video stream.
    pub fn format_selector(&self) -> String {
        if let Some(format_id) = &self.format_id {
            return format_id.clone();
        }

        if self.format_type == FormatType::Audio {
            return "bestaudio/best".to_string();
        }

        match self.quality.height() {
            None => self.quality.as_str().to_string(),
            Some(height) => match &self.video_codec {
                Some(codec) => {
                    format!("bestvideo[height<={height}][vcodec*={codec}]+bestaudio/best")
                }
                None => format!("bestvideo[height<={height}]+bestaudio/best"),
            },
        }
    }
}

fn validate_codec(codec: &str) -> Result<()> {
    if VALID_CODECS.contains(&codec.to_lowercase().as_str()) {
        Ok(())
    } else {
        Err(Error::validation(format!("Invalid codec: {codec}")))
    }
}

/// Sanitize a filename: strip path separators and other unsafe characters,
/// trim leading/trailing dots and spaces, and truncate to a safe length
/// while preserving the extension. Empty input becomes `"download"`.
pub fn sanitize_filename(filename: &str) -> String {
    let replaced: String = filename
        .chars()
        .map(|c| {
            if c.is_control() || INVALID_FILENAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        return "download".to_string();
    }

    if trimmed.chars().count() <= MAX_FILENAME_LENGTH {
        return trimmed.to_string();
    }

    // Truncate the stem, keep the extension intact.
    let (stem, ext) = match trimmed.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() => (stem, Some(ext)),
        _ => (trimmed, None),
    };
    match ext {
        Some(ext) => {
            let available = MAX_FILENAME_LENGTH.saturating_sub(ext.chars().count() + 1);
            format!("{}.{ext}", truncate_chars(stem, available))
        }
        None => truncate_chars(trimmed, MAX_FILENAME_LENGTH).to_string(),
    }
}

fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
