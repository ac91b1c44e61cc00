//! Telegram Bot API client
//!
//! A thin reqwest wrapper over the handful of Bot API methods the relay needs.
//! Two HTTP clients are kept, one per timeout tier, because connect and read
//! timeouts are fixed when a reqwest client is built. Every call decodes the
//! Bot API envelope and maps `ok = false` to [`Error::Telegram`].

use crate::config::{TelegramConfig, TimeoutConfig, TransferConfig};
use crate::error::{Error, Result};
use crate::transfer::{Destination, SendAck, SendFile, UploadBody};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Extra time allowed on top of the long-poll timeout before giving up on `getUpdates`
const POLL_GRACE: Duration = Duration::from_secs(10);

/// Deadline for small JSON calls (`sendMessage`, `editMessageText`)
const SHORT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Incoming update from `getUpdates`
#[derive(Clone, Debug, Deserialize)]
pub struct Update {
    /// Monotonic update identifier
    pub update_id: i64,
    /// New incoming message, if this update carries one
    #[serde(default)]
    pub message: Option<Message>,
}

/// Message object (only the fields the relay reads)
#[derive(Clone, Debug, Deserialize)]
pub struct Message {
    /// Message identifier within its chat
    pub message_id: i64,
    /// Chat the message belongs to
    pub chat: Chat,
    /// Sender, absent for channel posts
    #[serde(default)]
    pub from: Option<User>,
    /// Text of a text message
    #[serde(default)]
    pub text: Option<String>,
}

/// Chat object
#[derive(Clone, Debug, Deserialize)]
pub struct Chat {
    /// Chat identifier
    pub id: i64,
}

/// User object
#[derive(Clone, Debug, Deserialize)]
pub struct User {
    /// User identifier
    pub id: i64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Serialize)]
struct EditMessageTextRequest<'a> {
    chat_id: &'a str,
    message_id: i64,
    text: &'a str,
}

#[derive(Serialize)]
struct GetUpdatesRequest {
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: [&'static str; 1],
}

/// Bot API client
#[derive(Clone, Debug)]
pub struct TelegramClient {
    base_url: String,
    poll_timeout: Duration,
    standard: reqwest::Client,
    large: reqwest::Client,
    large_timeouts: TimeoutConfig,
}

impl TelegramClient {
    /// Build a client for the configured bot and timeout tiers
    pub fn new(telegram: &TelegramConfig, transfer: &TransferConfig) -> Result<Self> {
        Ok(Self {
            base_url: format!(
                "{}/bot{}",
                telegram.api_url.trim_end_matches('/'),
                telegram.bot_token
            ),
            poll_timeout: telegram.poll_timeout,
            standard: build_client(&transfer.standard_timeouts)?,
            large: build_client(&transfer.large_timeouts)?,
            large_timeouts: transfer.large_timeouts,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    fn client_for(&self, timeouts: &TimeoutConfig) -> &reqwest::Client {
        if *timeouts == self.large_timeouts {
            &self.large
        } else {
            &self.standard
        }
    }

    /// Post a text message
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<Message> {
        let request = self
            .standard
            .post(self.method_url("sendMessage"))
            .timeout(SHORT_CALL_TIMEOUT)
            .json(&SendMessageRequest {
                chat_id,
                text,
                disable_web_page_preview: true,
            });
        self.call("sendMessage", request).await
    }

    /// Replace the text of a message the bot sent earlier
    ///
    /// Telegram rejects edits that leave the text unchanged; that case is
    /// treated as success.
    pub async fn edit_message_text(&self, chat_id: &str, message_id: i64, text: &str) -> Result<()> {
        let request = self
            .standard
            .post(self.method_url("editMessageText"))
            .timeout(SHORT_CALL_TIMEOUT)
            .json(&EditMessageTextRequest {
                chat_id,
                message_id,
                text,
            });
        match self.call::<serde_json::Value>("editMessageText", request).await {
            Ok(_) => Ok(()),
            Err(Error::Telegram { description, .. })
                if description.contains("message is not modified") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Long-poll for new messages after `offset`
    pub async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>> {
        let request = self
            .standard
            .post(self.method_url("getUpdates"))
            .timeout(self.poll_timeout + POLL_GRACE)
            .json(&GetUpdatesRequest {
                offset,
                timeout: self.poll_timeout.as_secs(),
                allowed_updates: ["message"],
            });
        self.call("getUpdates", request).await
    }

    /// Upload a document with `sendDocument`
    pub async fn send_document(&self, request: SendFile) -> Result<Message> {
        let SendFile {
            chat_id,
            file,
            file_name,
            caption,
            thumbnail,
            timeouts,
        } = request;

        let mime = mime_for(&file_name);
        let mut form = Form::new()
            .text("chat_id", chat_id)
            .text("caption", caption)
            .text("disable_content_type_detection", "true")
            .part("document", body_part(file).file_name(file_name).mime_str(mime)?);
        if let Some(thumbnail) = thumbnail {
            form = form.part(
                "thumbnail",
                body_part(thumbnail)
                    .file_name("thumbnail.jpg")
                    .mime_str("image/jpeg")?,
            );
        }

        let request = self
            .client_for(&timeouts)
            .post(self.method_url("sendDocument"))
            .timeout(timeouts.request_deadline())
            .multipart(form);
        self.call("sendDocument", request).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        decode_envelope(method, status.as_u16(), &body)
    }
}

#[async_trait]
impl Destination for TelegramClient {
    async fn send_file(&self, request: SendFile) -> Result<SendAck> {
        let message = self.send_document(request).await?;
        Ok(SendAck {
            message_id: Some(message.message_id),
        })
    }
}

fn build_client(timeouts: &TimeoutConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .connect_timeout(timeouts.connect)
        .read_timeout(timeouts.read)
        .build()?)
}

fn body_part(body: UploadBody) -> Part {
    Part::stream_with_length(reqwest::Body::wrap_stream(body.stream), body.len)
}

fn mime_for(file_name: &str) -> &'static str {
    let ext = std::path::Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("mov") => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// Decode a Bot API envelope, mapping `ok = false` to [`Error::Telegram`]
fn decode_envelope<T: DeserializeOwned>(method: &str, status: u16, body: &str) -> Result<T> {
    let envelope: ApiResponse<T> = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(method, status, error = %e, "undecodable Bot API response");
            return Err(Error::Telegram {
                code: status,
                description: body.chars().take(200).collect(),
                retry_after: None,
            });
        }
    };

    match envelope {
        ApiResponse {
            ok: true,
            result: Some(result),
            ..
        } => Ok(result),
        ApiResponse {
            error_code,
            description,
            parameters,
            ..
        } => {
            let code = error_code.unwrap_or(status);
            let description = description.unwrap_or_else(|| "no description".to_string());
            tracing::debug!(method, code, description = %description, "Bot API call rejected");
            Err(Error::Telegram {
                code,
                description,
                retry_after: parameters.and_then(|p| p.retry_after),
            })
        }
    }
}
