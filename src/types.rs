//! Core types for media-relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Title used when the extraction backend reports none
pub const DEFAULT_TITLE: &str = "No Title";

/// Opaque identifier of a remote media resource (usually a URL)
///
/// Surrounding whitespace is trimmed on construction and an empty reference is
/// rejected. The value is never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceReference(String);

impl SourceReference {
    /// Create a new SourceReference from raw user input
    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidSource("empty source reference".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Get the reference as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the reference parses as an absolute http(s) URL
    pub fn is_url(&self) -> bool {
        url::Url::parse(&self.0)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false)
    }
}

impl std::fmt::Display for SourceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for SourceReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Kind of the operation currently in flight
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Extracting and downloading media from the source
    Downloading,
    /// Sending the cached artifact to the destination
    Uploading,
}

impl OperationKind {
    /// Lowercase name used in status text
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Downloading => "downloading",
            OperationKind::Uploading => "uploading",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of one begun operation
///
/// Used so that a stale owner can never end an operation begun after its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only view of the current operation, for status reporting
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    /// Operation identifier
    pub id: OperationId,
    /// What the operation is doing right now
    pub kind: OperationKind,
    /// When the operation was begun
    pub started_at: DateTime<Utc>,
    /// Whether cancellation has been requested
    pub cancel_requested: bool,
}

/// Metadata returned by the media-extraction backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Backend-specific media identifier
    pub id: String,
    /// Human-readable title, if the backend knows one
    pub title: Option<String>,
    /// File extension of the downloaded media
    pub ext: String,
    /// Local file produced by a download, if bytes were downloaded
    pub local_path: Option<PathBuf>,
    /// Thumbnail URL advertised by the backend
    pub thumbnail_url: Option<String>,
}

impl MediaInfo {
    /// Title with the default substituted for a missing or blank one
    pub fn title_or_default(&self) -> String {
        match self.title.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => DEFAULT_TITLE.to_string(),
        }
    }
}

/// The single cached downloaded artifact
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedArtifact {
    /// Local media file
    pub path: PathBuf,
    /// Size of the media file in bytes
    pub size_bytes: u64,
    /// Cached thumbnail, if one was retrieved
    pub thumbnail: Option<PathBuf>,
    /// Source reference the artifact was fetched from (absent when the
    /// marker is missing but the media file survived)
    pub source: Option<SourceReference>,
    /// Media title
    pub title: String,
    /// Backend media identifier (thumbnail names derive from it)
    pub media_id: String,
}

impl CachedArtifact {
    /// File name used when sending the artifact
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media".to_string())
    }

    /// Size in mebibytes, for human-readable messages
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Progress and lifecycle events delivered to a progress sink
///
/// Events for one operation arrive in chronological order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    /// A fresh download from the source has started
    Downloading {
        /// Source being downloaded
        source: SourceReference,
    },

    /// The cached artifact matched the source, nothing was downloaded
    CacheHit {
        /// Title of the cached artifact
        title: String,
    },

    /// Download finished and the artifact was cached
    Downloaded {
        /// Title of the new artifact
        title: String,
        /// Size in bytes
        size_bytes: u64,
    },

    /// An upload attempt is starting
    AttemptStarted {
        /// 1-based attempt number
        attempt: u32,
        /// Maximum attempts for this upload
        max_attempts: u32,
        /// Size of the payload in bytes
        size_bytes: u64,
    },

    /// Byte-level upload progress (large payloads only, coalesced)
    Progress {
        /// 1-based attempt number
        attempt: u32,
        /// Bytes handed to the transport so far
        bytes_sent: u64,
        /// Total payload size
        total_bytes: u64,
        /// Percentage (0.0 to 100.0)
        percent: f32,
    },

    /// An attempt failed and another one will follow
    AttemptFailed {
        /// 1-based attempt number that failed
        attempt: u32,
        /// Error message
        error: String,
    },

    /// The upload reached the destination
    Succeeded {
        /// Attempts used
        attempts: u32,
    },

    /// All attempts were exhausted
    Failed {
        /// Attempts used
        attempts: u32,
        /// Last error message
        error: String,
    },

    /// The operation was cancelled by the operator
    Cancelled {
        /// What was running when cancelled
        kind: OperationKind,
    },
}

/// Outcome of a successful upload call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    /// Always true for a returned result; failures are errors
    pub ok: bool,
    /// Attempts used, including the successful one
    pub attempts: u32,
}

/// Human-readable result of a command, plus a success flag
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    /// Text shown to the operator
    pub text: String,
    /// Whether the command succeeded
    pub ok: bool,
}

impl CommandReply {
    /// A successful reply
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ok: true,
        }
    }

    /// A failed reply
    pub fn failure(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ok: false,
        }
    }
}
