//! Live status message for one operation
//!
//! Progress events are rendered to text and shown in a single chat message:
//! the first event posts it, later events edit it. Events are applied one at
//! a time, so the message always reflects the latest event.

use super::ChatApi;
use crate::types::TransferEvent;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

const MIB: f64 = 1024.0 * 1024.0;

/// What the status message ended up showing
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusOutcome {
    /// Identifier of the status message, if one was posted
    pub message_id: Option<i64>,
    /// Whether a terminal event (success, failure, cancellation) was shown
    pub terminal_shown: bool,
}

/// Text for one event
pub fn render(event: &TransferEvent) -> String {
    match event {
        TransferEvent::Downloading { source } => format!("📥 Downloading: {source}"),
        TransferEvent::CacheHit { title } => format!("♻️ Using cached video: {title}"),
        TransferEvent::Downloaded { title, size_bytes } => {
            format!("✅ Downloaded: {title} ({:.1}MB)", *size_bytes as f64 / MIB)
        }
        TransferEvent::AttemptStarted {
            attempt,
            max_attempts,
            size_bytes,
        } => format!(
            "📤 Uploading {:.1}MB... (Attempt {attempt}/{max_attempts})",
            *size_bytes as f64 / MIB
        ),
        TransferEvent::Progress {
            attempt,
            bytes_sent,
            total_bytes,
            percent,
        } => format!(
            "📤 Uploading... {percent:.0}% ({:.1}/{:.1}MB, attempt {attempt})",
            *bytes_sent as f64 / MIB,
            *total_bytes as f64 / MIB
        ),
        TransferEvent::AttemptFailed { attempt, error } => {
            format!("⚠️ Upload attempt {attempt} failed, retrying...\n{error}")
        }
        TransferEvent::Succeeded { .. } => "✅ Uploaded!".to_string(),
        TransferEvent::Failed { error, .. } => format!("❌ Upload failed: {error}"),
        TransferEvent::Cancelled { kind } => format!("🛑 Stopped {kind} operation"),
    }
}

fn is_terminal(event: &TransferEvent) -> bool {
    matches!(
        event,
        TransferEvent::Succeeded { .. } | TransferEvent::Failed { .. } | TransferEvent::Cancelled { .. }
    )
}

/// Apply events to the status message until the sink side closes
///
/// Chat failures are logged and skipped; they never affect the operation.
pub async fn drive_status(
    api: Arc<dyn ChatApi>,
    chat_id: String,
    mut events: UnboundedReceiver<TransferEvent>,
) -> StatusOutcome {
    let mut outcome = StatusOutcome::default();
    let mut last_text = String::new();

    while let Some(event) = events.recv().await {
        let text = render(&event);
        outcome.terminal_shown |= is_terminal(&event);
        if text == last_text {
            continue;
        }

        match outcome.message_id {
            None => match api.send_message(&chat_id, &text).await {
                Ok(id) => outcome.message_id = Some(id),
                Err(e) => tracing::warn!(error = %e, "failed to post status message"),
            },
            Some(id) => {
                if let Err(e) = api.edit_message(&chat_id, id, &text).await {
                    tracing::debug!(error = %e, message_id = id, "failed to update status message");
                }
            }
        }
        last_text = text;
    }

    outcome
}
