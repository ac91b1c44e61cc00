//! Source reference to cached artifact
//!
//! A reference that matches the cached marker is served from the store
//! without downloading. Anything else invalidates the marker, deletes the
//! previous media and runs a full extraction through the [`MediaExtractor`].

use crate::config::ExtractorConfig;
use crate::error::{Error, FetchError, Result};
use crate::extractor::{ExtractMode, MediaExtractor};
use crate::operation::OperationHandle;
use crate::store::ArtifactStore;
use crate::transfer::ProgressSink;
use crate::types::{
    CachedArtifact, DEFAULT_TITLE, MediaInfo, OperationKind, SourceReference, TransferEvent,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Fetches media into the artifact store
#[derive(Clone)]
pub struct Fetcher {
    store: Arc<ArtifactStore>,
    extractor: Arc<dyn MediaExtractor>,
    http: reqwest::Client,
    thumbnail_url_template: String,
}

impl Fetcher {
    /// Create a fetcher over `store` using `extractor` for metadata and downloads
    pub fn new(
        store: Arc<ArtifactStore>,
        extractor: Arc<dyn MediaExtractor>,
        config: &ExtractorConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.thumbnail_timeout)
            .build()?;
        Ok(Self {
            store,
            extractor,
            http,
            thumbnail_url_template: config.thumbnail_url_template.clone(),
        })
    }

    /// Store the fetcher writes to
    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Resolve `source` to a local artifact, downloading only on a cache miss
    ///
    /// # Errors
    ///
    /// - [`Error::Fetch`] when extraction or download fails
    /// - [`Error::Cancelled`] when the operation is stopped mid-download
    pub async fn fetch(
        &self,
        source: &SourceReference,
        operation: &OperationHandle,
        sink: &ProgressSink,
    ) -> Result<CachedArtifact> {
        if let Some(artifact) = self.store.get_cached(source).await? {
            tracing::info!(source = %source, path = ?artifact.path, "cache hit, skipping download");
            let artifact = self.refresh_title(source, artifact).await;
            sink.emit(TransferEvent::CacheHit {
                title: artifact.title.clone(),
            });
            return Ok(artifact);
        }

        operation.check_cancelled()?;
        operation.set_kind(OperationKind::Downloading);
        sink.emit(TransferEvent::Downloading {
            source: source.clone(),
        });
        tracing::info!(operation_id = operation.id().0, source = %source, "downloading");

        self.store.ensure_dir().await?;
        self.store.invalidate().await?;
        let discarded = self.store.discard_media().await?;
        if discarded > 0 {
            tracing::debug!(discarded, "removed previous artifact before download");
        }

        let mode = ExtractMode::Download {
            output_template: self.store.output_template(),
        };
        let outcome = tokio::select! {
            biased;
            _ = operation.token().cancelled() => None,
            result = self.extractor.extract(source, mode) => Some(result),
        };

        let info = match outcome {
            None => {
                // The extraction future is dropped, which kills the subprocess
                let removed = self.store.remove_partials().await;
                tracing::info!(source = %source, removed, "download cancelled");
                sink.emit(TransferEvent::Cancelled {
                    kind: OperationKind::Downloading,
                });
                return Err(Error::Cancelled {
                    kind: OperationKind::Downloading,
                });
            }
            Some(Err(e)) => {
                self.store.remove_partials().await;
                tracing::error!(source = %source, error = %e, "download failed");
                return Err(e);
            }
            Some(Ok(info)) => info,
        };

        let path = info.local_path.clone().ok_or_else(|| FetchError::OutputMissing {
            dir: self.store.dir().to_path_buf(),
        })?;
        let size_bytes = tokio::fs::metadata(&path)
            .await
            .map_err(|_| FetchError::OutputMissing {
                dir: self.store.dir().to_path_buf(),
            })?
            .len();

        let thumbnail = self.fetch_thumbnail(&info).await;
        let artifact = CachedArtifact {
            path,
            size_bytes,
            thumbnail,
            source: Some(source.clone()),
            title: info.title_or_default(),
            media_id: info.id.clone(),
        };
        self.store.put(&artifact).await?;

        sink.emit(TransferEvent::Downloaded {
            title: artifact.title.clone(),
            size_bytes,
        });
        Ok(artifact)
    }

    /// Look the title up again when the cache no longer knows it
    async fn refresh_title(&self, source: &SourceReference, mut artifact: CachedArtifact) -> CachedArtifact {
        if artifact.title != DEFAULT_TITLE {
            return artifact;
        }
        match self.extractor.extract(source, ExtractMode::MetadataOnly).await {
            Ok(info) => {
                artifact.title = info.title_or_default();
                if artifact.media_id.is_empty() {
                    artifact.media_id = info.id;
                }
            }
            Err(e) => {
                tracing::warn!(source = %source, error = %e, "metadata refresh failed, keeping cached title");
            }
        }
        artifact
    }

    /// Download the thumbnail next to the media; any failure yields `None`
    async fn fetch_thumbnail(&self, info: &MediaInfo) -> Option<PathBuf> {
        let url = match &info.thumbnail_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ if !info.id.is_empty() => self.thumbnail_url_template.replace("{id}", &info.id),
            _ => return None,
        };

        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "thumbnail request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::warn!(url = %url, status = %response.status(), "thumbnail not available");
            return None;
        }
        let bytes = match response.bytes().await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "thumbnail download interrupted");
                return None;
            }
        };

        let path = self.store.thumbnail_path(&info.id);
        match tokio::fs::write(&path, &bytes).await {
            Ok(()) => {
                tracing::debug!(path = ?path, bytes = bytes.len(), "thumbnail saved");
                Some(path)
            }
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "failed to save thumbnail");
                None
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::operation::OperationTracker;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Extractor that writes a fake media file instead of running yt-dlp
    #[derive(Default)]
    struct FakeExtractor {
        downloads: AtomicU32,
        lookups: AtomicU32,
        thumbnail_url: Mutex<Option<String>>,
        download_delay: Option<Duration>,
        fail_lookups: bool,
    }

    impl FakeExtractor {
        fn media_id(source: &SourceReference) -> String {
            source.as_str().rsplit('/').next().unwrap_or("x").to_string()
        }
    }

    #[async_trait]
    impl MediaExtractor for FakeExtractor {
        async fn extract(&self, source: &SourceReference, mode: ExtractMode) -> Result<MediaInfo> {
            let id = Self::media_id(source);
            let mut info = MediaInfo {
                id: id.clone(),
                title: Some(format!("Title {id}")),
                ext: "mp4".into(),
                local_path: None,
                thumbnail_url: self.thumbnail_url.lock().unwrap().clone(),
            };
            match mode {
                ExtractMode::MetadataOnly => {
                    self.lookups.fetch_add(1, Ordering::SeqCst);
                    if self.fail_lookups {
                        return Err(FetchError::ExtractionFailed {
                            reference: source.to_string(),
                            reason: "offline".into(),
                        }
                        .into());
                    }
                }
                ExtractMode::Download { output_template } => {
                    self.downloads.fetch_add(1, Ordering::SeqCst);
                    let ext = if id == "xyz" { "webm" } else { "mp4" };
                    let template = output_template.to_string_lossy().into_owned();
                    let partial = PathBuf::from(template.replace("%(ext)s", "f137.mp4.part"));
                    tokio::fs::write(&partial, b"partial").await?;
                    if let Some(delay) = self.download_delay {
                        tokio::time::sleep(delay).await;
                    }
                    tokio::fs::remove_file(&partial).await?;
                    let target = PathBuf::from(template.replace("%(ext)s", ext));
                    // Like yt-dlp, an existing output file counts as already downloaded
                    if !target.exists() {
                        tokio::fs::write(&target, format!("media for {id}")).await?;
                    }
                    info.ext = ext.into();
                    info.local_path = Some(target);
                }
            }
            Ok(info)
        }
    }

    fn setup(extractor: FakeExtractor) -> (tempfile::TempDir, Fetcher, Arc<FakeExtractor>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::new(&StorageConfig {
            cache_dir: dir.path().to_path_buf(),
            ..StorageConfig::default()
        }));
        let extractor = Arc::new(extractor);
        let config = ExtractorConfig {
            // Unroutable template keeps tests offline unless a mock URL is set
            thumbnail_url_template: "http://127.0.0.1:9/{id}.jpg".into(),
            thumbnail_timeout: Duration::from_secs(2),
            ..ExtractorConfig::default()
        };
        let fetcher = Fetcher::new(store, extractor.clone(), &config).unwrap();
        (dir, fetcher, extractor)
    }

    fn source(raw: &str) -> SourceReference {
        SourceReference::new(raw).unwrap()
    }

    #[tokio::test]
    async fn same_reference_is_downloaded_once() {
        let (dir, fetcher, extractor) = setup(FakeExtractor::default());
        let tracker = OperationTracker::new();
        let sink = ProgressSink::disabled();

        let handle = tracker.begin(OperationKind::Downloading).unwrap();
        let first = fetcher.fetch(&source("https://v/abc"), &handle, &sink).await.unwrap();
        handle.end();

        let handle = tracker.begin(OperationKind::Downloading).unwrap();
        let second = fetcher.fetch(&source("https://v/abc"), &handle, &sink).await.unwrap();
        handle.end();

        assert_eq!(extractor.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(first.path, second.path);
        assert_eq!(second.title, "Title abc");
        assert_eq!(extractor.lookups.load(Ordering::SeqCst), 0, "title was remembered");

        let handle = tracker.begin(OperationKind::Downloading).unwrap();
        let third = fetcher.fetch(&source("https://v/xyz"), &handle, &sink).await.unwrap();
        handle.end();

        assert_eq!(extractor.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(third.path, dir.path().join("downloaded_video.webm"));
        assert!(!dir.path().join("downloaded_video.mp4").exists(), "old media superseded");
        assert_eq!(
            fetcher.store().last_source().await.unwrap().as_deref(),
            Some("https://v/xyz")
        );
    }

    #[tokio::test]
    async fn new_reference_never_reuses_previous_bytes() {
        let (dir, fetcher, extractor) = setup(FakeExtractor::default());
        let tracker = OperationTracker::new();
        let sink = ProgressSink::disabled();

        let handle = tracker.begin(OperationKind::Downloading).unwrap();
        fetcher.fetch(&source("https://v/abc"), &handle, &sink).await.unwrap();
        handle.end();
        tokio::fs::write(fetcher.store().thumbnail_path("abc"), b"jpg")
            .await
            .unwrap();

        // Same extension, so the output path collides with the cached file
        let handle = tracker.begin(OperationKind::Downloading).unwrap();
        let next = fetcher.fetch(&source("https://v/abd"), &handle, &sink).await.unwrap();
        handle.end();

        assert_eq!(extractor.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(next.path, dir.path().join("downloaded_video.mp4"));
        assert_eq!(std::fs::read_to_string(&next.path).unwrap(), "media for abd");
        assert_eq!(next.size_bytes, "media for abd".len() as u64);
        assert!(!fetcher.store().thumbnail_path("abc").exists());
    }

    #[tokio::test]
    async fn cache_hit_emits_event_without_downloading() {
        let (_dir, fetcher, _extractor) = setup(FakeExtractor::default());
        let tracker = OperationTracker::new();

        let handle = tracker.begin(OperationKind::Downloading).unwrap();
        fetcher
            .fetch(&source("https://v/abc"), &handle, &ProgressSink::disabled())
            .await
            .unwrap();
        handle.end();

        let (sink, mut rx) = ProgressSink::channel();
        let handle = tracker.begin(OperationKind::Downloading).unwrap();
        fetcher.fetch(&source("https://v/abc"), &handle, &sink).await.unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            TransferEvent::CacheHit {
                title: "Title abc".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn title_is_refreshed_when_unknown() {
        let (_dir, fetcher, extractor) = setup(FakeExtractor::default());
        let tracker = OperationTracker::new();
        let handle = tracker.begin(OperationKind::Downloading).unwrap();
        fetcher
            .fetch(&source("https://v/abc"), &handle, &ProgressSink::disabled())
            .await
            .unwrap();
        handle.end();

        // A fresh store over the same directory has lost the in-process title
        let store = Arc::new(ArtifactStore::new(&StorageConfig {
            cache_dir: fetcher.store().dir().to_path_buf(),
            ..StorageConfig::default()
        }));
        let fresh = Fetcher::new(store, extractor.clone(), &ExtractorConfig::default()).unwrap();

        let handle = tracker.begin(OperationKind::Downloading).unwrap();
        let artifact = fresh
            .fetch(&source("https://v/abc"), &handle, &ProgressSink::disabled())
            .await
            .unwrap();
        assert_eq!(artifact.title, "Title abc");
        assert_eq!(extractor.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(extractor.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_title_lookup_keeps_cached_artifact() {
        let (_dir, fetcher, extractor) = setup(FakeExtractor {
            fail_lookups: true,
            ..Default::default()
        });
        let tracker = OperationTracker::new();
        let handle = tracker.begin(OperationKind::Downloading).unwrap();
        fetcher
            .fetch(&source("https://v/abc"), &handle, &ProgressSink::disabled())
            .await
            .unwrap();
        handle.end();

        let store = Arc::new(ArtifactStore::new(&StorageConfig {
            cache_dir: fetcher.store().dir().to_path_buf(),
            ..StorageConfig::default()
        }));
        let fresh = Fetcher::new(store, extractor.clone(), &ExtractorConfig::default()).unwrap();
        let handle = tracker.begin(OperationKind::Downloading).unwrap();
        let artifact = fresh
            .fetch(&source("https://v/abc"), &handle, &ProgressSink::disabled())
            .await
            .unwrap();
        assert_eq!(artifact.title, DEFAULT_TITLE);
        assert_eq!(extractor.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn thumbnail_is_fetched_from_advertised_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/thumb.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"JPEG".to_vec()))
            .mount(&server)
            .await;

        let extractor = FakeExtractor::default();
        *extractor.thumbnail_url.lock().unwrap() = Some(format!("{}/thumb.jpg", server.uri()));
        let (dir, fetcher, _extractor) = setup(extractor);
        let tracker = OperationTracker::new();
        let handle = tracker.begin(OperationKind::Downloading).unwrap();

        let artifact = fetcher
            .fetch(&source("https://v/abc"), &handle, &ProgressSink::disabled())
            .await
            .unwrap();
        let thumb = artifact.thumbnail.unwrap();
        assert_eq!(thumb, dir.path().join("thumb_abc.jpg"));
        assert_eq!(std::fs::read(thumb).unwrap(), b"JPEG");
    }

    #[tokio::test]
    async fn missing_thumbnail_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let extractor = FakeExtractor::default();
        *extractor.thumbnail_url.lock().unwrap() = Some(format!("{}/none.jpg", server.uri()));
        let (_dir, fetcher, _extractor) = setup(extractor);
        let tracker = OperationTracker::new();
        let handle = tracker.begin(OperationKind::Downloading).unwrap();

        let artifact = fetcher
            .fetch(&source("https://v/abc"), &handle, &ProgressSink::disabled())
            .await
            .unwrap();
        assert!(artifact.thumbnail.is_none());
    }

    #[tokio::test]
    async fn cancellation_mid_download_cleans_partials() {
        let (dir, fetcher, _extractor) = setup(FakeExtractor {
            download_delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let tracker = OperationTracker::new();
        let handle = tracker.begin(OperationKind::Downloading).unwrap();
        let (sink, mut rx) = ProgressSink::channel();

        let task = tokio::spawn(async move {
            fetcher.fetch(&source("https://v/abc"), &handle, &sink).await
        });

        let partial = dir.path().join("downloaded_video.f137.mp4.part");
        while !partial.exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tracker.cancel();

        let err = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Cancelled {
                kind: OperationKind::Downloading
            }
        ));
        assert!(!partial.exists());
        assert!(!tracker.is_busy());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events.last(),
            Some(&TransferEvent::Cancelled {
                kind: OperationKind::Downloading
            })
        );
    }

    #[tokio::test]
    async fn different_reference_invalidates_marker_before_download() {
        let (_dir, fetcher, _extractor) = setup(FakeExtractor {
            download_delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let tracker = OperationTracker::new();

        // Seed the marker as though "abc" had been cached earlier
        let store = fetcher.store().clone();
        tokio::fs::write(store.marker_path(), "https://v/abc").await.unwrap();

        let handle = tracker.begin(OperationKind::Downloading).unwrap();
        let task = tokio::spawn({
            let fetcher = fetcher.clone();
            async move {
                fetcher
                    .fetch(&source("https://v/xyz"), &handle, &ProgressSink::disabled())
                    .await
            }
        });

        while store.marker_path().exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tracker.cancel();
        assert!(task.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(store.last_source().await.unwrap(), None);
    }
}
