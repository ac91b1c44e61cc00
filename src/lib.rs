//! # media-relay
//!
//! Single-operator Telegram bot that downloads media by URL and republishes it
//! to a fixed channel.
//!
//! ## Design
//!
//! - **One slot** - at most one cached artifact and at most one operation in
//!   flight; overlapping requests are rejected, never queued
//! - **Fetch once** - a link that matches the cached source is never
//!   downloaded again
//! - **Bounded retries** - uploads get a fixed number of attempts, with a long
//!   timeout tier for large payloads
//! - **Cancellable** - `/end` stops a download or upload at its next
//!   suspension point and cleans up partial output
//!
//! ## Quick Start
//!
//! ```no_run
//! use media_relay::{Config, run_with_shutdown};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!
//!     // Runs the bot until SIGTERM or Ctrl+C
//!     run_with_shutdown(config).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Telegram command surface
pub mod bot;
/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Media-extraction backend
pub mod extractor;
/// Source reference to cached artifact
pub mod fetcher;
/// Keep-alive HTTP endpoint
pub mod keepalive;
/// Single-flight operation tracking
pub mod operation;
/// Command facade
pub mod relay;
/// Retry classification and backoff
pub mod retry;
/// Single-slot artifact cache
pub mod store;
/// Telegram Bot API client
pub mod telegram;
/// Upload pipeline
pub mod transfer;
/// Core types
pub mod types;

pub use config::Config;
pub use error::{Error, FetchError, Result};
pub use operation::{OperationHandle, OperationTracker};
pub use relay::Relay;
pub use transfer::{ProgressSink, TransferPipeline};
pub use types::{CachedArtifact, CommandReply, OperationKind, SourceReference, TransferEvent};

use extractor::YtDlpExtractor;
use std::sync::Arc;
use telegram::TelegramClient;
use tokio_util::sync::CancellationToken;

/// Run the bot until a termination signal arrives
///
/// On SIGTERM or SIGINT (Ctrl+C elsewhere) the running operation is cancelled,
/// the poll loop stops and the keep-alive server shuts down.
pub async fn run_with_shutdown(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signalled = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signalled.cancel();
    });
    run_until(config, shutdown).await
}

/// Run the bot until `shutdown` fires
pub async fn run_until(config: Config, shutdown: CancellationToken) -> Result<()> {
    config.validate()?;

    let client = Arc::new(TelegramClient::new(&config.telegram, &config.transfer)?);
    let extractor = YtDlpExtractor::new(config.extractor.clone());
    if let Err(e) = extractor.binary() {
        tracing::warn!(error = %e, "yt-dlp is not available, downloads will fail");
    }

    let relay = Relay::new(&config, Arc::new(extractor), client.clone())?;
    relay.store().ensure_dir().await?;
    let leftovers = relay.store().remove_partials().await;
    if leftovers > 0 {
        tracing::info!(removed = leftovers, "removed partial downloads from a previous run");
    }

    let keepalive = config.keepalive.enabled.then(|| {
        let keepalive_config = config.keepalive.clone();
        let tracker = relay.tracker().clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = keepalive::serve(&keepalive_config, tracker, shutdown).await {
                tracing::error!(error = %e, "keep-alive server failed");
            }
        })
    });

    tracing::info!(
        channel = %config.telegram.channel_id,
        cache_dir = ?config.storage.cache_dir,
        "media relay started"
    );
    let bot = bot::Bot::new(client, relay, config.telegram.operator_ids.clone());
    bot.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Some(handle) = keepalive
        && let Err(e) = handle.await
    {
        tracing::warn!(error = %e, "keep-alive task failed");
    }
    tracing::info!("media relay stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
