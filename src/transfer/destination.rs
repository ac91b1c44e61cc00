//! The destination seam: whatever accepts a finished artifact

use crate::config::TimeoutConfig;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use futures::stream;
use std::pin::Pin;

/// Boxed chunk stream that can be handed to any HTTP client
pub type BodyStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static>>;

/// Streaming request body with a known length
pub struct UploadBody {
    /// Chunks of the payload
    pub stream: BodyStream,
    /// Total length in bytes
    pub len: u64,
}

impl UploadBody {
    /// Wrap a stream of known total length
    pub fn new<S>(stream: S, len: u64) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
    {
        Self {
            stream: Box::pin(stream),
            len,
        }
    }

    /// Body made of one in-memory buffer
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        Self::new(stream::once(async move { Ok(bytes) }), len)
    }
}

impl std::fmt::Debug for UploadBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadBody").field("len", &self.len).finish()
    }
}

/// One document send request
#[derive(Debug)]
pub struct SendFile {
    /// Destination chat or channel
    pub chat_id: String,
    /// Document body
    pub file: UploadBody,
    /// File name presented to recipients
    pub file_name: String,
    /// Caption shown under the document
    pub caption: String,
    /// Optional thumbnail image
    pub thumbnail: Option<UploadBody>,
    /// Timeout tier selected for this payload
    pub timeouts: TimeoutConfig,
}

/// Acknowledgement from the destination
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendAck {
    /// Identifier of the created message, when the destination reports one
    pub message_id: Option<i64>,
}

/// Remote endpoint artifacts are relayed to
#[async_trait]
pub trait Destination: Send + Sync {
    /// Transmit one document
    ///
    /// Dropping the returned future aborts the transmission.
    async fn send_file(&self, request: SendFile) -> Result<SendAck>;

    /// Best-effort cleanup after an aborted transmission
    async fn discard_partial(&self, _file_name: &str) -> Result<()> {
        Ok(())
    }
}
