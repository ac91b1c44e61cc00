//! Error types for media-relay
//!
//! One crate-wide [`Error`] enum carries every failure the core can surface:
//! - fetch failures ([`FetchError`]), never retried automatically
//! - single-flight conflicts, reported without mutating state
//! - transfer failures after the retry budget is exhausted
//! - operator cancellation, reported distinctly from genuine failures
//! - missing cached artifacts on manual re-upload
//!
//! [`Error::user_message`] renders the operator-facing text used at the
//! command boundary.

use crate::types::OperationKind;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for media-relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for media-relay
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "BOT_TOKEN")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The source reference could not be used
    #[error("invalid source: {0}")]
    InvalidSource(String),

    /// Extraction or download failed
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Another operation is already in flight
    #[error("another operation is already in progress ({active})")]
    Conflict {
        /// Kind of the operation that holds the slot
        active: OperationKind,
    },

    /// Upload failed after exhausting every attempt
    #[error("upload failed after {attempts} attempts: {message}")]
    Transfer {
        /// Attempts made
        attempts: u32,
        /// Message of the last underlying error
        message: String,
    },

    /// The operator stopped the current operation
    #[error("{kind} operation cancelled")]
    Cancelled {
        /// What was running when the cancellation was observed
        kind: OperationKind,
    },

    /// Requested artifact does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Telegram Bot API returned an error envelope
    #[error("telegram API error {code}: {description}")]
    Telegram {
        /// `error_code` from the API (HTTP-like)
        code: u16,
        /// `description` from the API
        description: String,
        /// Seconds to wait before retrying, when rate limited
        retry_after: Option<u64>,
    },

    /// The destination transport failed mid-transmission
    #[error("transmission error: {0}")]
    Transmission(String),

    /// Keep-alive HTTP server failed
    #[error("keep-alive server error: {0}")]
    Server(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Fetch-related errors (extraction, download, thumbnail-independent)
#[derive(Debug, Error)]
pub enum FetchError {
    /// The extraction backend is not installed or not runnable
    #[error("extraction backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Metadata extraction failed
    #[error("extraction failed for {reference}: {reason}")]
    ExtractionFailed {
        /// The source reference being extracted
        reference: String,
        /// Backend message
        reason: String,
    },

    /// Media bytes could not be downloaded
    #[error("download failed for {reference}: {reason}")]
    DownloadFailed {
        /// The source reference being downloaded
        reference: String,
        /// Backend message
        reason: String,
    },

    /// The backend reported success but no media file was produced
    #[error("downloaded file not found in {dir}")]
    OutputMissing {
        /// Directory that was searched
        dir: PathBuf,
    },

    /// Backend metadata could not be parsed
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
}

impl Error {
    /// Shorthand for a configuration error tied to one key
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Whether this error represents operator cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Machine-readable error code, used in structured logs
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::InvalidSource(_) => "invalid_source",
            Error::Fetch(_) => "fetch_error",
            Error::Conflict { .. } => "conflict",
            Error::Transfer { .. } => "transfer_error",
            Error::Cancelled { .. } => "cancelled",
            Error::NotFound(_) => "not_found",
            Error::Telegram { .. } => "telegram_error",
            Error::Transmission(_) => "transmission_error",
            Error::Server(_) => "server_error",
            Error::Other(_) => "internal_error",
        }
    }

    /// Operator-facing text for this error
    pub fn user_message(&self) -> String {
        match self {
            Error::Fetch(e) => format!("❌ Download failed: {e}"),
            Error::Conflict { active } => {
                format!("⏳ Another operation is already in progress ({active}). Use /end to stop it.")
            }
            Error::Transfer { message, .. } => format!("❌ Upload failed: {message}"),
            Error::Cancelled { kind } => format!("🛑 Stopped {kind} operation"),
            Error::NotFound(_) => {
                "❌ No downloaded video found. Try sending a URL first.".to_string()
            }
            Error::InvalidSource(reason) => format!("❌ Invalid link: {reason}"),
            other => format!("❌ Operation failed: {other}"),
        }
    }
}
