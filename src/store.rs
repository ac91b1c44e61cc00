//! Single-slot artifact cache on local storage
//!
//! Layout inside the cache directory:
//! - `<stem>.<ext>` the cached media file (at most one)
//! - `thumb_<media id>.jpg` the cached thumbnail (at most one)
//! - the marker file holding the raw source reference of the cached media
//!
//! The marker is the cache key: [`ArtifactStore::get_cached`] only returns the
//! artifact when the marker equals the requested reference and the media file
//! still exists. Anything else under `<stem>.` (yt-dlp `.part`, `.ytdl` and
//! per-format intermediates) counts as partial output.

use crate::config::StorageConfig;
use crate::error::Result;
use crate::types::{CachedArtifact, DEFAULT_TITLE, SourceReference};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tracing::{debug, info, warn};

const THUMB_PREFIX: &str = "thumb_";
const THUMB_SUFFIX: &str = ".jpg";

/// Outcome of a best-effort cache clear
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClearReport {
    /// Files that were removed
    pub removed: Vec<PathBuf>,
    /// Files that could not be removed, with the error message
    pub failed: Vec<(PathBuf, String)>,
}

impl ClearReport {
    /// Whether every targeted file was removed
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Classification of a directory entry belonging to the cache
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Entry {
    Media,
    Partial,
    Thumbnail,
    Marker,
}

/// Manages the one cached artifact, its thumbnail and the last-source marker
#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    media_stem: String,
    marker_file: String,
    /// Last artifact stored by this process; keeps the title without a lookup
    remembered: Mutex<Option<CachedArtifact>>,
}

impl ArtifactStore {
    /// Create a store over the configured cache directory
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            dir: config.cache_dir.clone(),
            media_stem: config.media_stem.clone(),
            marker_file: config.marker_file.clone(),
            remembered: Mutex::new(None),
        }
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the cache directory if needed
    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Path of the last-source marker
    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(&self.marker_file)
    }

    /// Output template handed to the extraction backend (`<stem>.%(ext)s`)
    pub fn output_template(&self) -> PathBuf {
        self.dir.join(format!("{}.%(ext)s", self.media_stem))
    }

    /// Path the thumbnail for `media_id` is stored at
    pub fn thumbnail_path(&self, media_id: &str) -> PathBuf {
        self.dir
            .join(format!("{THUMB_PREFIX}{}{THUMB_SUFFIX}", sanitize_id(media_id)))
    }

    /// Raw content of the marker, if present
    pub async fn last_source(&self) -> Result<Option<String>> {
        match fs::read_to_string(self.marker_path()).await {
            Ok(content) => {
                let trimmed = content.trim();
                Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The cached artifact, only if it was fetched from `source`
    ///
    /// Reads the filesystem but never mutates it.
    pub async fn get_cached(&self, source: &SourceReference) -> Result<Option<CachedArtifact>> {
        match self.last_source().await? {
            Some(last) if last == source.as_str() => {}
            _ => return Ok(None),
        }
        self.latest().await
    }

    /// The cached artifact regardless of which source produced it
    pub async fn latest(&self) -> Result<Option<CachedArtifact>> {
        let Some(path) = self.find_media().await? else {
            return Ok(None);
        };
        let size_bytes = fs::metadata(&path).await?.len();
        let source = self
            .last_source()
            .await?
            .and_then(|raw| SourceReference::new(raw).ok());

        let remembered = self.remembered().filter(|a| a.path == path && a.source == source);
        if let Some(mut artifact) = remembered {
            artifact.size_bytes = size_bytes;
            if let Some(thumb) = &artifact.thumbnail
                && fs::metadata(thumb).await.is_err()
            {
                artifact.thumbnail = None;
            }
            return Ok(Some(artifact));
        }

        let thumbnail = self.find_thumbnail().await?;
        let media_id = thumbnail
            .as_deref()
            .and_then(media_id_from_thumbnail)
            .unwrap_or_default();

        Ok(Some(CachedArtifact {
            path,
            size_bytes,
            thumbnail,
            source,
            title: DEFAULT_TITLE.to_string(),
            media_id,
        }))
    }

    /// Record `artifact` as the cached one, superseding everything else
    ///
    /// Other media files, partial output and other thumbnails are removed; the
    /// marker is replaced atomically.
    pub async fn put(&self, artifact: &CachedArtifact) -> Result<()> {
        self.ensure_dir().await?;

        for (path, entry) in self.entries().await? {
            let superseded = match entry {
                Entry::Media => path != artifact.path,
                Entry::Partial => true,
                Entry::Thumbnail => artifact.thumbnail.as_ref() != Some(&path),
                Entry::Marker => false,
            };
            if superseded && let Err(e) = fs::remove_file(&path).await {
                warn!(path = ?path, error = %e, "failed to remove superseded cache file");
            }
        }

        if let Some(source) = &artifact.source {
            let marker = self.marker_path();
            let staging = marker.with_extension("tmp");
            fs::write(&staging, source.as_str()).await?;
            fs::rename(&staging, &marker).await?;
        } else {
            self.invalidate().await?;
        }

        *self.remembered_slot() = Some(artifact.clone());
        info!(path = ?artifact.path, size_bytes = artifact.size_bytes, "artifact cached");
        Ok(())
    }

    /// Forget which source the cached bytes belong to
    ///
    /// Called before a fresh download so a failed download can never leave
    /// the marker pointing at older bytes.
    pub async fn invalidate(&self) -> Result<()> {
        *self.remembered_slot() = None;
        match fs::remove_file(self.marker_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the media file, partials and thumbnails, keeping the directory
    ///
    /// Runs before a fresh download: the extraction backend skips output
    /// files that already exist, so stale bytes must be gone first. A file
    /// that cannot be removed is an error.
    pub async fn discard_media(&self) -> Result<usize> {
        *self.remembered_slot() = None;
        let mut removed = 0;
        for (path, entry) in self.entries().await? {
            if entry == Entry::Marker {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = ?path, "removed previous cache file");
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    /// Remove partial download output; returns how many files were removed
    pub async fn remove_partials(&self) -> usize {
        let entries = match self.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to list cache directory for partial cleanup");
                return 0;
            }
        };

        let mut removed = 0;
        for (path, entry) in entries {
            if entry != Entry::Partial {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = ?path, "removed partial file");
                    removed += 1;
                }
                Err(e) => warn!(path = ?path, error = %e, "failed to remove partial file"),
            }
        }
        removed
    }

    /// Delete the media file, partials, every thumbnail and the marker
    ///
    /// Idempotent and best-effort: a failure on one file is recorded and the
    /// remaining files are still attempted.
    pub async fn clear(&self) -> ClearReport {
        *self.remembered_slot() = None;
        let mut report = ClearReport::default();

        let entries = match self.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = ?self.dir, error = %e, "failed to list cache directory");
                report.failed.push((self.dir.clone(), e.to_string()));
                return report;
            }
        };

        for (path, _) in entries {
            match fs::remove_file(&path).await {
                Ok(()) => report.removed.push(path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = ?path, error = %e, "failed to remove cache file");
                    report.failed.push((path, e.to_string()));
                }
            }
        }

        info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "cache cleared"
        );
        report
    }

    /// Most recently modified complete media file
    async fn find_media(&self) -> Result<Option<PathBuf>> {
        self.newest(Entry::Media).await
    }

    /// Most recently modified thumbnail
    async fn find_thumbnail(&self) -> Result<Option<PathBuf>> {
        self.newest(Entry::Thumbnail).await
    }

    async fn newest(&self, wanted: Entry) -> Result<Option<PathBuf>> {
        let mut best: Option<(PathBuf, std::time::SystemTime)> = None;
        for (path, entry) in self.entries().await? {
            if entry != wanted {
                continue;
            }
            let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            match &best {
                Some((_, best_time)) if modified <= *best_time => {}
                _ => best = Some((path, modified)),
            }
        }
        Ok(best.map(|(path, _)| path))
    }

    /// Every file in the cache directory that belongs to the cache
    async fn entries(&self) -> Result<Vec<(PathBuf, Entry)>> {
        let mut read_dir = match fs::read_dir(&self.dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(kind) = self.classify(name) {
                entries.push((path, kind));
            }
        }
        Ok(entries)
    }

    fn classify(&self, name: &str) -> Option<Entry> {
        if name == self.marker_file || name == format!("{}.tmp", marker_stem(&self.marker_file))
        {
            return Some(Entry::Marker);
        }
        if name.starts_with(THUMB_PREFIX) && name.ends_with(THUMB_SUFFIX) {
            return Some(Entry::Thumbnail);
        }
        let rest = name.strip_prefix(&self.media_stem)?.strip_prefix('.')?;
        if rest.is_empty() {
            return None;
        }
        if rest.contains('.') || rest == "part" || rest == "ytdl" {
            Some(Entry::Partial)
        } else {
            Some(Entry::Media)
        }
    }

    fn remembered(&self) -> Option<CachedArtifact> {
        self.remembered_slot().clone()
    }

    fn remembered_slot(&self) -> std::sync::MutexGuard<'_, Option<CachedArtifact>> {
        self.remembered.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn marker_stem(marker_file: &str) -> &str {
    Path::new(marker_file)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(marker_file)
}

/// Keep media ids safe for use inside a file name
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn media_id_from_thumbnail(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix(THUMB_PREFIX)?.strip_suffix(THUMB_SUFFIX)?;
    (!id.is_empty()).then(|| id.to_string())
}
