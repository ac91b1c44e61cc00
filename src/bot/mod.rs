//! Telegram command surface
//!
//! Long-polls for messages, parses them into [`Command`]s and forwards them
//! to the [`Relay`]. Fetches and uploads run in spawned tasks so `/status` and
//! `/end` keep being served while a transfer is in flight; each of those
//! tasks owns a live status message fed by its progress sink.

mod commands;
mod status;

pub use commands::{Command, HELP_TEXT};
pub use status::{StatusOutcome, drive_status, render};

use crate::error::Result;
use crate::relay::Relay;
use crate::retry::sleep_or_cancel;
use crate::telegram::{Message, TelegramClient, Update};
use crate::transfer::ProgressSink;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long running operations get to wind down after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Longest pause between failed polls
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

/// Chat operations the command surface needs
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Long-poll for updates after `offset`
    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>>;

    /// Post a message; returns its identifier
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<i64>;

    /// Replace the text of an earlier message
    async fn edit_message(&self, chat_id: &str, message_id: i64, text: &str) -> Result<()>;
}

#[async_trait]
impl ChatApi for TelegramClient {
    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>> {
        TelegramClient::get_updates(self, offset).await
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<i64> {
        Ok(TelegramClient::send_message(self, chat_id, text).await?.message_id)
    }

    async fn edit_message(&self, chat_id: &str, message_id: i64, text: &str) -> Result<()> {
        self.edit_message_text(chat_id, message_id, text).await
    }
}

/// Long-running work spawned off the poll loop
#[derive(Clone, Debug)]
enum Job {
    Fetch(String),
    Reupload,
}

/// The polling bot
pub struct Bot {
    api: Arc<dyn ChatApi>,
    relay: Relay,
    operators: Vec<i64>,
}

impl Bot {
    /// Create a bot; an empty `operators` list accepts every sender
    pub fn new(api: Arc<dyn ChatApi>, relay: Relay, operators: Vec<i64>) -> Self {
        Self {
            api,
            relay,
            operators,
        }
    }

    /// Poll and dispatch until `shutdown` fires
    ///
    /// On shutdown the running operation is cancelled and given a short grace
    /// period to clean up.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(operators = self.operators.len(), "bot started");
        let mut offset: Option<i64> = None;
        let mut tasks = JoinSet::new();
        let mut consecutive_failures = 0u32;

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    warn!(error = %e, "operation task failed");
                }
            }

            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                polled = self.api.get_updates(offset) => polled,
            };

            match polled {
                Ok(updates) => {
                    consecutive_failures = 0;
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        if let Some(message) = update.message {
                            self.dispatch(message, &mut tasks).await;
                        }
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    let delay = poll_backoff(consecutive_failures);
                    warn!(error = %e, attempt = consecutive_failures, delay_secs = delay.as_secs(), "polling failed");
                    if !sleep_or_cancel(delay, &shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("bot shutting down");
        self.relay.shutdown();
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "operation task failed during shutdown");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("operations did not stop in time, aborting");
            tasks.abort_all();
        }
    }

    fn is_operator(&self, user_id: Option<i64>) -> bool {
        self.operators.is_empty() || user_id.is_some_and(|id| self.operators.contains(&id))
    }

    async fn dispatch(&self, message: Message, tasks: &mut JoinSet<()>) {
        let Some(text) = message.text.as_deref() else {
            return;
        };
        let user_id = message.from.as_ref().map(|u| u.id);
        if !self.is_operator(user_id) {
            debug!(user_id = ?user_id, "ignoring message from non-operator");
            return;
        }
        let Some(command) = Command::parse(text) else {
            return;
        };

        let chat_id = message.chat.id.to_string();
        debug!(chat_id = %chat_id, ?command, "dispatching command");
        match command {
            Command::Start => self.reply(&chat_id, HELP_TEXT).await,
            Command::Status => {
                let reply = self.relay.status().await;
                self.reply(&chat_id, &reply.text).await;
            }
            Command::End => {
                let reply = self.relay.cancel_current();
                self.reply(&chat_id, &reply.text).await;
            }
            Command::ClearCache => {
                let reply = self.relay.clear_cache().await;
                self.reply(&chat_id, &reply.text).await;
            }
            Command::Unknown(name) => {
                self.reply(&chat_id, &format!("❓ Unknown command /{name}\n\n{HELP_TEXT}"))
                    .await;
            }
            Command::Upload => {
                tasks.spawn(run_job(self.api.clone(), self.relay.clone(), chat_id, Job::Reupload));
            }
            Command::Fetch(raw) => {
                tasks.spawn(run_job(self.api.clone(), self.relay.clone(), chat_id, Job::Fetch(raw)));
            }
        }
    }

    async fn reply(&self, chat_id: &str, text: &str) {
        if let Err(e) = self.api.send_message(chat_id, text).await {
            warn!(error = %e, "failed to send reply");
        }
    }
}

/// Run one fetch or re-upload, keeping a status message current
async fn run_job(api: Arc<dyn ChatApi>, relay: Relay, chat_id: String, job: Job) {
    let (sink, events) = ProgressSink::channel();
    let status = tokio::spawn(drive_status(api.clone(), chat_id.clone(), events));

    let reply = match job {
        Job::Fetch(raw) => relay.fetch_and_upload(&raw, &sink).await,
        Job::Reupload => relay.reupload_cached(&sink).await,
    };
    drop(sink);

    let outcome = match status.await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(error = %e, "status updater failed");
            StatusOutcome::default()
        }
    };
    if outcome.terminal_shown {
        return;
    }

    // Errors raised before or outside the upload have no terminal event
    let delivered = match outcome.message_id {
        Some(id) => api.edit_message(&chat_id, id, &reply.text).await,
        None => api.send_message(&chat_id, &reply.text).await.map(|_| ()),
    };
    if let Err(e) = delivered {
        warn!(error = %e, "failed to deliver command result");
    }
}

fn poll_backoff(consecutive_failures: u32) -> Duration {
    let secs = 1u64 << consecutive_failures.min(5);
    Duration::from_secs(secs).min(MAX_POLL_BACKOFF)
}
