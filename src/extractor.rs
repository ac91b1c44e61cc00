//! Media-extraction backend
//!
//! [`MediaExtractor`] resolves a source reference to metadata and, on request,
//! downloads the media bytes. [`YtDlpExtractor`] implements it on top of the
//! `yt-dlp` executable.

use crate::config::ExtractorConfig;
use crate::error::{Error, FetchError, Result};
use crate::types::{MediaInfo, SourceReference};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// What an extraction call should do
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtractMode {
    /// Metadata lookup only; no media bytes are transferred
    MetadataOnly,
    /// Download the media using this output template (`<dir>/<stem>.%(ext)s`)
    Download {
        /// yt-dlp style output template
        output_template: PathBuf,
    },
}

/// Resolves source references to media metadata and files
///
/// Dropping the returned future must abort any work in flight; the fetcher
/// relies on this for cancellation.
#[async_trait]
pub trait MediaExtractor: Send + Sync {
    /// Extract metadata, downloading the media when `mode` asks for it
    ///
    /// In [`ExtractMode::Download`] the returned [`MediaInfo::local_path`] must
    /// point at the downloaded file.
    async fn extract(&self, source: &SourceReference, mode: ExtractMode) -> Result<MediaInfo>;
}

/// `yt-dlp` subprocess backend
#[derive(Clone, Debug)]
pub struct YtDlpExtractor {
    config: ExtractorConfig,
}

impl YtDlpExtractor {
    /// Create a backend from configuration
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    /// Locate the yt-dlp executable (configured path first, then PATH)
    pub fn binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.ytdlp_path {
            return Ok(path.clone());
        }
        which::which("yt-dlp").map_err(|e| {
            Error::Fetch(FetchError::BackendUnavailable(format!(
                "yt-dlp not found in PATH: {e}"
            )))
        })
    }

    fn args(&self, source: &SourceReference, mode: &ExtractMode) -> Vec<String> {
        let mut args = vec![
            "--dump-json".to_string(),
            "--no-warnings".to_string(),
            "--no-playlist".to_string(),
        ];
        if let ExtractMode::Download { output_template } = mode {
            args.extend([
                "--no-simulate".to_string(),
                "--no-progress".to_string(),
                "--force-overwrites".to_string(),
                "-f".to_string(),
                self.config.format.clone(),
                "--merge-output-format".to_string(),
                self.config.merge_output_format.clone(),
                "-o".to_string(),
                output_template.to_string_lossy().into_owned(),
            ]);
        }
        args.push("--".to_string());
        args.push(source.as_str().to_string());
        args
    }
}

#[async_trait]
impl MediaExtractor for YtDlpExtractor {
    async fn extract(&self, source: &SourceReference, mode: ExtractMode) -> Result<MediaInfo> {
        let binary = self.binary()?;
        let args = self.args(source, &mode);
        tracing::debug!(binary = ?binary, ?mode, source = %source, "running yt-dlp");

        let output = tokio::process::Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                Error::Fetch(FetchError::BackendUnavailable(format!(
                    "failed to run {}: {e}",
                    binary.display()
                )))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = last_error_line(&stderr)
                .unwrap_or_else(|| format!("yt-dlp exited with {}", output.status));
            let reference = source.to_string();
            return Err(match mode {
                ExtractMode::MetadataOnly => FetchError::ExtractionFailed { reference, reason },
                ExtractMode::Download { .. } => FetchError::DownloadFailed { reference, reason },
            }
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let json_line = stdout
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with('{'))
            .ok_or_else(|| FetchError::InvalidMetadata("yt-dlp printed no JSON".to_string()))?;
        let json: serde_json::Value = serde_json::from_str(json_line)
            .map_err(|e| FetchError::InvalidMetadata(format!("yt-dlp returned invalid JSON: {e}")))?;

        let mut info = parse_info(&json)?;

        if let ExtractMode::Download { output_template } = &mode {
            let path = find_downloaded_file(output_template).await?;
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                info.ext = ext.to_string();
            }
            info.local_path = Some(path);
        }

        Ok(info)
    }
}

/// Build [`MediaInfo`] from a yt-dlp info JSON object
pub fn parse_info(json: &serde_json::Value) -> Result<MediaInfo> {
    let id = match json.get("id") {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => {
            return Err(FetchError::InvalidMetadata("missing media id".to_string()).into());
        }
    };
    let title = json
        .get("title")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let ext = json
        .get("ext")
        .and_then(|v| v.as_str())
        .unwrap_or("mp4")
        .to_string();
    let thumbnail_url = json
        .get("thumbnail")
        .and_then(|v| v.as_str())
        .filter(|s| s.starts_with("http"))
        .map(|s| s.to_string());

    Ok(MediaInfo {
        id,
        title,
        ext,
        local_path: None,
        thumbnail_url,
    })
}

/// Newest complete file matching `<stem>.<ext>` next to the output template
async fn find_downloaded_file(output_template: &Path) -> Result<PathBuf> {
    let dir = output_template
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    let stem = output_template
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('.').next())
        .unwrap_or_default()
        .to_string();

    let mut best: Option<(PathBuf, std::time::SystemTime)> = None;
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(ext) = name
            .strip_prefix(stem.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
        else {
            continue;
        };
        if ext.is_empty() || ext.contains('.') || ext == "part" || ext == "ytdl" {
            continue;
        }
        if let Ok(meta) = entry.metadata().await
            && meta.is_file()
            && let Ok(modified) = meta.modified()
        {
            match &best {
                Some((_, best_time)) if modified <= *best_time => {}
                _ => best = Some((path, modified)),
            }
        }
    }

    best.map(|(path, _)| path)
        .ok_or_else(|| FetchError::OutputMissing { dir }.into())
}

/// Last `ERROR:` line of yt-dlp stderr, or the last non-empty line
fn last_error_line(stderr: &str) -> Option<String> {
    let lines: Vec<&str> = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines
        .iter()
        .rev()
        .find_map(|l| l.strip_prefix("ERROR:").map(|s| s.trim().to_string()))
        .or_else(|| lines.last().map(|l| l.to_string()))
}
