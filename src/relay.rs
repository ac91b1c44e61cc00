//! The command facade
//!
//! Every operator command lands here. Each operation returns a
//! [`CommandReply`]; errors never escape, they are logged and rendered with
//! [`Error::user_message`].

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extractor::MediaExtractor;
use crate::fetcher::Fetcher;
use crate::operation::OperationTracker;
use crate::store::ArtifactStore;
use crate::transfer::{Destination, ProgressSink, TransferPipeline};
use crate::types::{CommandReply, OperationKind, OperationSnapshot, SourceReference, UploadResult};
use std::sync::Arc;

/// Core of the relay bot (cloneable, shared)
#[derive(Clone)]
pub struct Relay {
    tracker: OperationTracker,
    store: Arc<ArtifactStore>,
    fetcher: Fetcher,
    pipeline: TransferPipeline,
}

impl Relay {
    /// Assemble the relay from configuration and its two collaborators
    pub fn new(
        config: &Config,
        extractor: Arc<dyn MediaExtractor>,
        destination: Arc<dyn Destination>,
    ) -> Result<Self> {
        let store = Arc::new(ArtifactStore::new(&config.storage));
        let fetcher = Fetcher::new(store.clone(), extractor, &config.extractor)?;
        let pipeline = TransferPipeline::new(
            destination,
            config.transfer.clone(),
            config.telegram.channel_id.clone(),
        );
        Ok(Self {
            tracker: OperationTracker::new(),
            store,
            fetcher,
            pipeline,
        })
    }

    /// Operation tracker shared by every command
    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    /// Artifact store
    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Snapshot of the operation in flight, if any
    pub fn current_operation(&self) -> Option<OperationSnapshot> {
        self.tracker.current()
    }

    /// Fetch `raw` (downloading only if it differs from the cached source)
    /// and upload the artifact to the destination channel
    pub async fn fetch_and_upload(&self, raw: &str, sink: &ProgressSink) -> CommandReply {
        match self.run_fetch_and_upload(raw, sink).await {
            Ok(result) => {
                tracing::info!(attempts = result.attempts, "fetch and upload finished");
                CommandReply::success("✅ Uploaded!")
            }
            Err(e) => reply_for_error("fetch_and_upload", e),
        }
    }

    async fn run_fetch_and_upload(&self, raw: &str, sink: &ProgressSink) -> Result<UploadResult> {
        let source = SourceReference::new(raw)?;
        let operation = self.tracker.begin(OperationKind::Downloading)?;
        let artifact = self.fetcher.fetch(&source, &operation, sink).await?;
        let result = self.pipeline.upload(&artifact, &operation, sink).await?;
        operation.end();
        Ok(result)
    }

    /// Upload the cached artifact again without fetching
    pub async fn reupload_cached(&self, sink: &ProgressSink) -> CommandReply {
        match self.run_reupload(sink).await {
            Ok(result) => {
                tracing::info!(attempts = result.attempts, "re-upload finished");
                CommandReply::success("✅ Upload successful!")
            }
            Err(e) => reply_for_error("reupload_cached", e),
        }
    }

    async fn run_reupload(&self, sink: &ProgressSink) -> Result<UploadResult> {
        let operation = self.tracker.begin(OperationKind::Uploading)?;
        let artifact = self
            .store
            .latest()
            .await?
            .ok_or_else(|| Error::NotFound("no cached artifact".to_string()))?;
        let result = self.pipeline.upload(&artifact, &operation, sink).await?;
        operation.end();
        Ok(result)
    }

    /// Describe the cached artifact and the operation in flight
    pub async fn status(&self) -> CommandReply {
        let current = self.tracker.current();
        let artifact = match self.store.latest().await {
            Ok(artifact) => artifact,
            Err(e) => return reply_for_error("status", e),
        };

        let mut text = match &artifact {
            Some(artifact) => {
                let source = artifact
                    .source
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                format!(
                    "✅ Last downloaded video: {source}\n🎬 {} ({:.1}MB)",
                    artifact.title,
                    artifact.size_mb()
                )
            }
            None => "❌ No video currently downloaded".to_string(),
        };
        if let Some(op) = &current {
            text.push_str(&format!("\nCurrent operation: {}", op.kind));
            if op.cancel_requested {
                text.push_str(" (stopping)");
            }
        }

        if artifact.is_some() {
            CommandReply::success(text)
        } else {
            CommandReply::failure(text)
        }
    }

    /// Request cancellation of the operation in flight
    pub fn cancel_current(&self) -> CommandReply {
        match self.tracker.cancel() {
            Some(kind) => CommandReply::success(format!("🛑 Stopped {kind} operation")),
            None => CommandReply::failure("ℹ️ No operation in progress"),
        }
    }

    /// Delete every cached file; refused while an operation is running
    pub async fn clear_cache(&self) -> CommandReply {
        if let Some(active) = self.tracker.current() {
            return reply_for_error("clear_cache", Error::Conflict { active: active.kind });
        }

        let report = self.store.clear().await;
        if report.is_complete() {
            CommandReply::success("🧹 Cleared all downloaded files and thumbnails")
        } else {
            let failed: Vec<String> = report
                .failed
                .iter()
                .map(|(path, e)| format!("{}: {e}", path.display()))
                .collect();
            CommandReply::failure(format!(
                "⚠️ Removed {} files, {} could not be removed:\n{}",
                report.removed.len(),
                report.failed.len(),
                failed.join("\n")
            ))
        }
    }

    /// Stop whatever is running; used on process shutdown
    pub fn shutdown(&self) {
        if let Some(kind) = self.tracker.cancel() {
            tracing::info!(kind = %kind, "cancelled running operation for shutdown");
        }
    }
}

fn reply_for_error(command: &'static str, error: Error) -> CommandReply {
    if error.is_cancelled() {
        tracing::info!(command, "command cancelled by operator");
    } else {
        tracing::warn!(command, error = %error, error_code = error.error_code(), "command failed");
    }
    CommandReply::failure(error.user_message())
}
