//! Upload pipeline
//!
//! Sends the cached artifact to a [`Destination`] with a bounded number of
//! attempts. Each attempt re-opens the file and streams it from the start;
//! payloads above the large-file threshold get the long timeout tier and
//! coalesced byte-level progress. Cancellation is observed between attempts,
//! during the backoff sleep and while the body is streaming.

mod destination;
mod progress;


pub use destination::{BodyStream, Destination, SendAck, SendFile, UploadBody};
pub use progress::{ProgressSink, ProgressStream};

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::operation::OperationHandle;
use crate::retry::{Backoff, IsRetryable, sleep_or_cancel};
use crate::types::{CachedArtifact, OperationKind, TransferEvent, UploadResult};
use progress::{ProgressReporterParams, spawn_progress_reporter};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

/// Retrying, cancellable uploader bound to one destination chat
#[derive(Clone)]
pub struct TransferPipeline {
    destination: Arc<dyn Destination>,
    config: TransferConfig,
    chat_id: String,
}

impl TransferPipeline {
    /// Create a pipeline sending to `chat_id` through `destination`
    pub fn new(
        destination: Arc<dyn Destination>,
        config: TransferConfig,
        chat_id: impl Into<String>,
    ) -> Self {
        Self {
            destination,
            config,
            chat_id: chat_id.into(),
        }
    }

    /// Pipeline settings
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Upload `artifact`, retrying any failed transmission
    ///
    /// The operation switches to [`OperationKind::Uploading`] before the first
    /// attempt. Events reach `sink` in order: one `AttemptStarted` per attempt,
    /// `Progress` for large payloads, `AttemptFailed` between attempts and
    /// exactly one terminal `Succeeded`, `Failed` or `Cancelled`.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if the operator stopped the operation
    /// - [`Error::Io`] if the artifact cannot be opened (not retried)
    /// - [`Error::Transfer`] once the attempts are exhausted
    pub async fn upload(
        &self,
        artifact: &CachedArtifact,
        operation: &OperationHandle,
        sink: &ProgressSink,
    ) -> Result<UploadResult> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut backoff = Backoff::new(&self.config.retry);
        let file_name = artifact.file_name();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if operation.is_cancelled() {
                return Err(self.abort(operation, sink, &file_name).await);
            }
            operation.set_kind(OperationKind::Uploading);

            tracing::info!(
                operation_id = operation.id().0,
                attempt,
                max_attempts,
                size_bytes = artifact.size_bytes,
                file = %file_name,
                "upload attempt started"
            );
            sink.emit(TransferEvent::AttemptStarted {
                attempt,
                max_attempts,
                size_bytes: artifact.size_bytes,
            });

            let file = match tokio::fs::File::open(&artifact.path).await {
                Ok(file) => file,
                Err(e) => return Err(fatal(sink, attempt, e.into())),
            };
            let size_bytes = match file.metadata().await {
                Ok(meta) => meta.len(),
                Err(e) => return Err(fatal(sink, attempt, e.into())),
            };
            let large = self.config.is_large(size_bytes);
            let timeouts = self.config.timeouts_for(size_bytes);

            tracing::debug!(
                operation_id = operation.id().0,
                size_bytes,
                large,
                timeout_secs = timeouts.request_deadline().as_secs(),
                "timeout tier selected"
            );

            let sent = Arc::new(AtomicU64::new(0));
            let body = ProgressStream::new(file, sent.clone(), operation.token().clone());
            let request = SendFile {
                chat_id: self.chat_id.clone(),
                file: UploadBody::new(body, size_bytes),
                file_name: file_name.clone(),
                caption: self.caption(size_bytes),
                thumbnail: read_thumbnail(artifact).await,
                timeouts,
            };

            let reporter = large.then(|| {
                spawn_progress_reporter(ProgressReporterParams {
                    attempt,
                    total_bytes: size_bytes,
                    sent: sent.clone(),
                    interval: self.config.progress_interval,
                    sink: sink.clone(),
                })
            });

            let outcome = tokio::select! {
                biased;
                _ = operation.token().cancelled() => None,
                result = self.destination.send_file(request) => Some(result),
            };

            if let Some(reporter) = reporter {
                reporter.stop().await;
            }

            let error = match outcome {
                None => return Err(self.abort(operation, sink, &file_name).await),
                Some(Ok(ack)) => {
                    tracing::info!(
                        operation_id = operation.id().0,
                        attempt,
                        message_id = ?ack.message_id,
                        "upload succeeded"
                    );
                    sink.emit(TransferEvent::Succeeded { attempts: attempt });
                    return Ok(UploadResult {
                        ok: true,
                        attempts: attempt,
                    });
                }
                // The body stream fails with Interrupted once the token fires
                Some(Err(_)) if operation.is_cancelled() => {
                    return Err(self.abort(operation, sink, &file_name).await);
                }
                Some(Err(e)) => e,
            };

            let message = error.to_string();
            if attempt >= max_attempts {
                tracing::error!(
                    operation_id = operation.id().0,
                    attempt,
                    error = %error,
                    error_code = error.error_code(),
                    retryable = error.is_retryable(),
                    "upload failed"
                );
                sink.emit(TransferEvent::Failed {
                    attempts: attempt,
                    error: message.clone(),
                });
                return Err(Error::Transfer {
                    attempts: attempt,
                    message,
                });
            }

            let mut delay = backoff.next_delay();
            if let Error::Telegram {
                retry_after: Some(secs),
                ..
            } = &error
            {
                delay = delay.max(Duration::from_secs(*secs));
            }
            tracing::warn!(
                operation_id = operation.id().0,
                attempt,
                max_attempts,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "upload attempt failed, retrying"
            );
            sink.emit(TransferEvent::AttemptFailed {
                attempt,
                error: message,
            });

            if !sleep_or_cancel(delay, operation.token()).await {
                return Err(self.abort(operation, sink, &file_name).await);
            }
        }
    }

    fn caption(&self, size_bytes: u64) -> String {
        let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
        self.config.caption.replace("{size}", &format!("{size_mb:.1}"))
    }

    async fn abort(&self, operation: &OperationHandle, sink: &ProgressSink, file_name: &str) -> Error {
        let kind = OperationKind::Uploading;
        tracing::info!(operation_id = operation.id().0, "upload cancelled");
        sink.emit(TransferEvent::Cancelled { kind });
        if let Err(e) = self.destination.discard_partial(file_name).await {
            tracing::warn!(error = %e, file = %file_name, "failed to discard partial upload");
        }
        Error::Cancelled { kind }
    }
}

/// Report a failure that no further attempt could fix
fn fatal(sink: &ProgressSink, attempt: u32, error: Error) -> Error {
    tracing::error!(attempt, error = %error, "artifact unreadable, giving up");
    sink.emit(TransferEvent::Failed {
        attempts: attempt,
        error: error.to_string(),
    });
    error
}

/// Load the cached thumbnail; a missing or unreadable one is skipped
async fn read_thumbnail(artifact: &CachedArtifact) -> Option<UploadBody> {
    let path = artifact.thumbnail.as_ref()?;
    match tokio::fs::read(path).await {
        Ok(bytes) if !bytes.is_empty() => Some(UploadBody::from_bytes(bytes)),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, path = %path.display(), "thumbnail unavailable, sending without");
            None
        }
    }
}
