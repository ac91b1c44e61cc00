//! Configuration types for media-relay

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

/// Telegram transport settings (bot credentials and the destination channel)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot authentication token (required)
    pub bot_token: String,

    /// Destination channel or chat identifier, e.g. `@my_channel` or `-100123` (required)
    pub channel_id: String,

    /// Bot API base URL (default: "https://api.telegram.org")
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Long-poll timeout for `getUpdates` (default: 30 seconds)
    #[serde(default = "default_poll_timeout", with = "duration_serde")]
    pub poll_timeout: Duration,

    /// Telegram user ids allowed to command the bot (empty = anyone)
    #[serde(default)]
    pub operator_ids: Vec<i64>,
}

/// Local cache layout
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the cached media, thumbnail and marker (default: ".")
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// File stem of the cached media file (default: "downloaded_video")
    #[serde(default = "default_media_stem")]
    pub media_stem: String,

    /// Name of the last-source marker file (default: "last_downloaded_url.txt")
    #[serde(default = "default_marker_file")]
    pub marker_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            media_stem: default_media_stem(),
            marker_file: default_marker_file(),
        }
    }
}

/// Connect/read/write timeouts for one payload size tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// TCP/TLS connect timeout
    #[serde(with = "duration_serde")]
    pub connect: Duration,

    /// Time allowed waiting for the response once the request is written
    #[serde(with = "duration_serde")]
    pub read: Duration,

    /// Time allowed for writing the request body
    ///
    /// The HTTP client has no per-write timer. This budget is added to `read`
    /// to form one whole-request deadline, see [`Self::request_deadline`].
    #[serde(with = "duration_serde")]
    pub write: Duration,
}

impl TimeoutConfig {
    /// Tier for ordinary payloads (connect 5 min, read/write 20 min)
    pub fn standard() -> Self {
        Self {
            connect: Duration::from_secs(300),
            read: Duration::from_secs(1200),
            write: Duration::from_secs(1200),
        }
    }

    /// Tier for payloads above the large-file threshold (connect 1 min, read/write 2 h)
    pub fn large() -> Self {
        Self {
            connect: Duration::from_secs(60),
            read: Duration::from_secs(7200),
            write: Duration::from_secs(7200),
        }
    }

    /// Deadline for one whole request (body write followed by response read)
    pub fn request_deadline(&self) -> Duration {
        self.write + self.read
    }
}

/// Retry configuration for upload attempts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt (default: 2 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between attempts (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Upload pipeline settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Retry policy for upload attempts
    #[serde(default)]
    pub retry: RetryConfig,

    /// Payloads above this size use the large timeout tier and report
    /// byte-level progress (default: 50 MiB)
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,

    /// Minimum interval between progress events (default: 500 ms)
    #[serde(default = "default_progress_interval", with = "millis_serde")]
    pub progress_interval: Duration,

    /// Timeouts for payloads at or below the threshold
    #[serde(default = "TimeoutConfig::standard")]
    pub standard_timeouts: TimeoutConfig,

    /// Timeouts for payloads above the threshold
    #[serde(default = "TimeoutConfig::large")]
    pub large_timeouts: TimeoutConfig,

    /// Caption attached to uploaded documents; `{size}` expands to the size in MB
    #[serde(default = "default_caption")]
    pub caption: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            large_file_threshold: default_large_file_threshold(),
            progress_interval: default_progress_interval(),
            standard_timeouts: TimeoutConfig::standard(),
            large_timeouts: TimeoutConfig::large(),
            caption: default_caption(),
        }
    }
}

impl TransferConfig {
    /// Whether a payload of this size counts as large
    pub fn is_large(&self, size_bytes: u64) -> bool {
        size_bytes > self.large_file_threshold
    }

    /// Timeout tier for a payload of this size
    pub fn timeouts_for(&self, size_bytes: u64) -> TimeoutConfig {
        if self.is_large(size_bytes) {
            self.large_timeouts
        } else {
            self.standard_timeouts
        }
    }
}

/// yt-dlp extraction backend settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Path to the yt-dlp executable (searched in PATH if None)
    #[serde(default)]
    pub ytdlp_path: Option<PathBuf>,

    /// Format selector (default: "bestvideo+bestaudio/best")
    #[serde(default = "default_format")]
    pub format: String,

    /// Container the streams are merged into (default: "mp4")
    #[serde(default = "default_merge_format")]
    pub merge_output_format: String,

    /// Thumbnail URL used when the backend advertises none; `{id}` expands to the media id
    #[serde(default = "default_thumbnail_template")]
    pub thumbnail_url_template: String,

    /// Timeout for fetching the thumbnail (default: 30 seconds)
    #[serde(default = "default_thumbnail_timeout", with = "duration_serde")]
    pub thumbnail_timeout: Duration,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: None,
            format: default_format(),
            merge_output_format: default_merge_format(),
            thumbnail_url_template: default_thumbnail_template(),
            thumbnail_timeout: default_thumbnail_timeout(),
        }
    }
}

/// Keep-alive HTTP server settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    /// Serve the keep-alive endpoint (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address (default: 0.0.0.0:8080)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
        }
    }
}

/// Main configuration for the relay bot
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Telegram credentials and destination
    pub telegram: TelegramConfig,

    /// Cache layout
    #[serde(default)]
    pub storage: StorageConfig,

    /// Upload pipeline
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Extraction backend
    #[serde(default)]
    pub extractor: ExtractorConfig,

    /// Keep-alive server
    #[serde(default)]
    pub keepalive: KeepAliveConfig,
}

impl Config {
    /// Build a configuration with defaults around the two required settings
    pub fn new(bot_token: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            telegram: TelegramConfig {
                bot_token: bot_token.into(),
                channel_id: channel_id.into(),
                api_url: default_api_url(),
                poll_timeout: default_poll_timeout(),
                operator_ids: Vec::new(),
            },
            storage: StorageConfig::default(),
            transfer: TransferConfig::default(),
            extractor: ExtractorConfig::default(),
            keepalive: KeepAliveConfig::default(),
        }
    }

    /// Load configuration from the process environment
    ///
    /// `BOT_TOKEN` and `CHANNEL_ID` are required; their absence is a startup
    /// error. Optional: `CACHE_DIR`, `YTDLP_PATH`, `TELEGRAM_API_URL`,
    /// `OPERATOR_IDS` (comma separated), `KEEPALIVE_ENABLED`, `KEEPALIVE_ADDR`,
    /// `MAX_UPLOAD_ATTEMPTS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::config(format!("{key} must be set"), key))
        };

        let mut config = Self::new(required("BOT_TOKEN")?, required("CHANNEL_ID")?);

        if let Some(dir) = lookup("CACHE_DIR") {
            config.storage.cache_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("YTDLP_PATH") {
            config.extractor.ytdlp_path = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("TELEGRAM_API_URL") {
            config.telegram.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(ids) = lookup("OPERATOR_IDS") {
            config.telegram.operator_ids = ids
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse::<i64>().map_err(|_| {
                        Error::config(format!("invalid operator id '{s}'"), "OPERATOR_IDS")
                    })
                })
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(enabled) = lookup("KEEPALIVE_ENABLED") {
            config.keepalive.enabled = parse_bool(&enabled)
                .ok_or_else(|| Error::config("expected true or false", "KEEPALIVE_ENABLED"))?;
        }
        if let Some(addr) = lookup("KEEPALIVE_ADDR") {
            config.keepalive.bind_address = addr
                .parse()
                .map_err(|_| Error::config(format!("invalid address '{addr}'"), "KEEPALIVE_ADDR"))?;
        }
        if let Some(attempts) = lookup("MAX_UPLOAD_ATTEMPTS") {
            config.transfer.retry.max_attempts = attempts.trim().parse().map_err(|_| {
                Error::config(format!("invalid attempt count '{attempts}'"), "MAX_UPLOAD_ATTEMPTS")
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(Error::config("bot token must not be empty", "BOT_TOKEN"));
        }
        if self.telegram.channel_id.trim().is_empty() {
            return Err(Error::config("channel id must not be empty", "CHANNEL_ID"));
        }
        if self.transfer.retry.max_attempts == 0 {
            return Err(Error::config(
                "at least one upload attempt is required",
                "MAX_UPLOAD_ATTEMPTS",
            ));
        }
        if self.storage.media_stem.is_empty() || self.storage.marker_file.is_empty() {
            return Err(Error::config("cache file names must not be empty", "storage"));
        }
        if self.transfer.progress_interval.is_zero() {
            return Err(Error::config(
                "progress interval must be positive",
                "progress_interval",
            ));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// Default value functions
fn default_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_media_stem() -> String {
    "downloaded_video".to_string()
}

fn default_marker_file() -> String {
    "last_downloaded_url.txt".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_large_file_threshold() -> u64 {
    50 * 1024 * 1024
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_caption() -> String {
    "📤 Video file ({size}MB)".to_string()
}

fn default_format() -> String {
    "bestvideo+bestaudio/best".to_string()
}

fn default_merge_format() -> String {
    "mp4".to_string()
}

fn default_thumbnail_template() -> String {
    "https://img.youtube.com/vi/{id}/maxresdefault.jpg".to_string()
}

fn default_thumbnail_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn missing_token_is_a_startup_error() {
        let err = Config::from_lookup(lookup_from(&[("CHANNEL_ID", "@chan")])).unwrap_err();
        match err {
            Error::Config { key, .. } => assert_eq!(key.as_deref(), Some("BOT_TOKEN")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_channel_is_a_startup_error() {
        let err = Config::from_lookup(lookup_from(&[("BOT_TOKEN", "123:abc")])).unwrap_err();
        match err {
            Error::Config { key, .. } => assert_eq!(key.as_deref(), Some("CHANNEL_ID")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn blank_required_value_counts_as_missing() {
        let err = Config::from_lookup(lookup_from(&[("BOT_TOKEN", "  "), ("CHANNEL_ID", "@c")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn defaults_follow_the_documented_values() {
        let config =
            Config::from_lookup(lookup_from(&[("BOT_TOKEN", "t"), ("CHANNEL_ID", "@c")])).unwrap();
        assert_eq!(config.transfer.retry.max_attempts, 3);
        assert_eq!(config.transfer.large_file_threshold, 50 * 1024 * 1024);
        assert_eq!(config.transfer.progress_interval, Duration::from_millis(500));
        assert_eq!(config.storage.media_stem, "downloaded_video");
        assert_eq!(config.storage.marker_file, "last_downloaded_url.txt");
        assert!(config.telegram.operator_ids.is_empty());
        assert!(config.keepalive.enabled);
    }

    #[test]
    fn request_deadline_covers_write_and_read() {
        assert_eq!(
            TimeoutConfig::standard().request_deadline(),
            Duration::from_secs(2400)
        );
        assert_eq!(
            TimeoutConfig::large().request_deadline(),
            Duration::from_secs(14400)
        );
    }

    #[test]
    fn optional_values_are_applied() {
        let config = Config::from_lookup(lookup_from(&[
            ("BOT_TOKEN", "t"),
            ("CHANNEL_ID", "@c"),
            ("CACHE_DIR", "/tmp/relay"),
            ("OPERATOR_IDS", "42, 7"),
            ("KEEPALIVE_ENABLED", "off"),
            ("KEEPALIVE_ADDR", "127.0.0.1:9000"),
            ("MAX_UPLOAD_ATTEMPTS", "5"),
            ("TELEGRAM_API_URL", "http://localhost:8081/"),
        ]))
        .unwrap();
        assert_eq!(config.storage.cache_dir, PathBuf::from("/tmp/relay"));
        assert_eq!(config.telegram.operator_ids, vec![42, 7]);
        assert!(!config.keepalive.enabled);
        assert_eq!(config.keepalive.bind_address.port(), 9000);
        assert_eq!(config.transfer.retry.max_attempts, 5);
        assert_eq!(config.telegram.api_url, "http://localhost:8081");
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("BOT_TOKEN", "t"),
            ("CHANNEL_ID", "@c"),
            ("MAX_UPLOAD_ATTEMPTS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn invalid_operator_id_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("BOT_TOKEN", "t"),
            ("CHANNEL_ID", "@c"),
            ("OPERATOR_IDS", "42,bob"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("bob"));
    }

    #[test]
    fn timeout_tier_depends_on_threshold() {
        let transfer = TransferConfig::default();
        let threshold = transfer.large_file_threshold;
        assert_eq!(transfer.timeouts_for(threshold), TimeoutConfig::standard());
        assert_eq!(transfer.timeouts_for(threshold + 1), TimeoutConfig::large());
        assert!(TimeoutConfig::large().read > TimeoutConfig::standard().read);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config::new("t", "@c");
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.transfer.standard_timeouts, config.transfer.standard_timeouts);
        assert_eq!(back.transfer.progress_interval, config.transfer.progress_interval);
    }
}
