//! In-memory stand-ins for the extraction backend and the destination

use async_trait::async_trait;
use futures::StreamExt;
use media_relay::config::Config;
use media_relay::extractor::{ExtractMode, MediaExtractor};
use media_relay::transfer::{Destination, SendAck, SendFile};
use media_relay::types::{MediaInfo, SourceReference};
use media_relay::{Error, FetchError, Relay, Result};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Extractor that writes a small file instead of downloading
///
/// Like yt-dlp it never overwrites an output file that already exists.
#[derive(Default)]
pub struct FakeExtractor {
    downloads: AtomicU32,
    lookups: AtomicU32,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeExtractor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Downloads performed so far
    pub fn downloads(&self) -> u32 {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Metadata-only lookups performed so far
    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Make every extraction of `source` fail
    pub fn fail_for(&self, source: &str) {
        self.failing.lock().unwrap().insert(source.to_string());
    }

    /// Sleep this long inside every download
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    fn media_id(source: &SourceReference) -> String {
        source
            .as_str()
            .rsplit('/')
            .next()
            .unwrap_or("media")
            .to_string()
    }
}

#[async_trait]
impl MediaExtractor for FakeExtractor {
    async fn extract(&self, source: &SourceReference, mode: ExtractMode) -> Result<MediaInfo> {
        let id = Self::media_id(source);
        if self.failing.lock().unwrap().contains(source.as_str()) {
            return Err(FetchError::DownloadFailed {
                reference: source.to_string(),
                reason: "ERROR: Unsupported URL".into(),
            }
            .into());
        }

        let mut info = MediaInfo {
            id: id.clone(),
            title: Some(format!("Video {id}")),
            ext: "mp4".into(),
            local_path: None,
            thumbnail_url: None,
        };

        match mode {
            ExtractMode::MetadataOnly => {
                self.lookups.fetch_add(1, Ordering::SeqCst);
            }
            ExtractMode::Download { output_template } => {
                self.downloads.fetch_add(1, Ordering::SeqCst);
                let delay = *self.delay.lock().unwrap();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let path =
                    PathBuf::from(output_template.to_string_lossy().replace("%(ext)s", "mp4"));
                // yt-dlp leaves an existing output file alone
                if !path.exists() {
                    tokio::fs::write(&path, format!("media bytes for {id}"))
                        .await
                        .map_err(Error::from)?;
                }
                info.local_path = Some(path);
            }
        }
        Ok(info)
    }
}

/// Scripted behaviour of one destination call
#[derive(Clone, Copy, Debug)]
pub enum Step {
    Succeed,
    Transient,
    Rejected(u16),
    /// Never answer
    Hang,
}

/// Destination that follows a script and records what it received
#[derive(Default)]
pub struct ScriptedDestination {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
    delivered: Mutex<Vec<(String, String, u64)>>,
}

impl ScriptedDestination {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        })
    }

    /// Calls received so far, including failed ones
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// (chat, file name, bytes) of every successful delivery
    pub fn delivered(&self) -> Vec<(String, String, u64)> {
        self.delivered.lock().unwrap().clone()
    }

    /// Append more scripted steps
    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }
}

#[async_trait]
impl Destination for ScriptedDestination {
    async fn send_file(&self, request: SendFile) -> Result<SendAck> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Succeed);

        let mut stream = request.file.stream;
        let mut bytes = 0u64;
        while let Some(chunk) = stream.next().await {
            bytes += chunk.map_err(|e| Error::Transmission(e.to_string()))?.len() as u64;
        }

        match step {
            Step::Succeed => {
                self.delivered
                    .lock()
                    .unwrap()
                    .push((request.chat_id, request.file_name, bytes));
                Ok(SendAck {
                    message_id: Some(1),
                })
            }
            Step::Transient => Err(Error::Transmission("connection reset by peer".into())),
            Step::Rejected(code) => Err(Error::Telegram {
                code,
                description: "Bad Request: chat not found".into(),
                retry_after: None,
            }),
            Step::Hang => futures::future::pending().await,
        }
    }
}

/// Configuration pointing at `dir`, with fast retries and no network
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::new("123:TEST", "@relay_channel");
    config.storage.cache_dir = dir.to_path_buf();
    config.extractor.thumbnail_url_template = "http://127.0.0.1:9/{id}.jpg".into();
    config.extractor.thumbnail_timeout = Duration::from_secs(1);
    config.transfer.retry.initial_delay = Duration::from_millis(1);
    config.transfer.retry.max_delay = Duration::from_millis(5);
    config.transfer.retry.jitter = false;
    config.keepalive.enabled = false;
    config
}

/// Relay wired to the fakes
pub fn build_relay(
    dir: &Path,
    extractor: Arc<FakeExtractor>,
    destination: Arc<ScriptedDestination>,
) -> Relay {
    Relay::new(&test_config(dir), extractor, destination).unwrap()
}
