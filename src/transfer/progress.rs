//! Progress plumbing: the event sink, the byte-counting body stream and the
//! coalescing reporter task.

use crate::types::TransferEvent;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

/// Where progress events go
///
/// Emitting never blocks and never waits for acknowledgement; a sink whose
/// receiver is gone silently drops events.
#[derive(Clone, Debug, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl ProgressSink {
    /// A sink plus the receiver that observes its events in order
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Deliver an event
    pub fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.tx {
            tx.send(event).ok();
        }
    }
}

/// Body stream over the artifact file that counts bytes handed to the
/// transport and checks cancellation before yielding each chunk
pub struct ProgressStream {
    inner: ReaderStream<tokio::fs::File>,
    sent: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl ProgressStream {
    /// Wrap an opened file
    pub fn new(file: tokio::fs::File, sent: Arc<AtomicU64>, cancel: CancellationToken) -> Self {
        Self {
            inner: ReaderStream::new(file),
            sent,
            cancel,
        }
    }
}

impl Stream for ProgressStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "upload cancelled",
            ))));
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// Parameters for spawning a progress reporter background task
pub(crate) struct ProgressReporterParams {
    /// Attempt the reports belong to
    pub attempt: u32,
    /// Total payload size in bytes
    pub total_bytes: u64,
    /// Counter updated by [`ProgressStream`]
    pub sent: Arc<AtomicU64>,
    /// Minimum time between two reports
    pub interval: Duration,
    /// Destination of the reports
    pub sink: ProgressSink,
}

/// Running reporter; stop it before emitting the attempt's outcome so no
/// progress event can trail the outcome
pub(crate) struct ProgressReporter {
    stop: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ProgressReporter {
    /// Stop the reporter and wait for it to exit
    pub(crate) async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "progress reporter task failed");
        }
    }
}

/// Spawn a task that reports byte-level progress at most once per interval,
/// and only when at least one more percentage point has been sent
pub(crate) fn spawn_progress_reporter(params: ProgressReporterParams) -> ProgressReporter {
    let ProgressReporterParams {
        attempt,
        total_bytes,
        sent,
        interval,
        sink,
    } = params;
    let stop = CancellationToken::new();
    let stopped = stop.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_whole_percent: Option<u64> = None;

        loop {
            tokio::select! {
                biased;
                _ = stopped.cancelled() => break,
                _ = ticker.tick() => {
                    let bytes_sent = sent.load(Ordering::Relaxed).min(total_bytes);
                    let whole_percent = if total_bytes > 0 {
                        bytes_sent * 100 / total_bytes
                    } else {
                        100
                    };
                    if last_whole_percent.is_some_and(|last| whole_percent <= last) {
                        continue;
                    }
                    if last_whole_percent.is_none() && bytes_sent == 0 {
                        continue;
                    }
                    last_whole_percent = Some(whole_percent);
                    let percent = if total_bytes > 0 {
                        (bytes_sent as f32 / total_bytes as f32) * 100.0
                    } else {
                        100.0
                    };
                    sink.emit(TransferEvent::Progress {
                        attempt,
                        bytes_sent,
                        total_bytes,
                        percent,
                    });
                }
            }
        }
    });

    ProgressReporter { stop, task }
}
