//! Per-message context handed to handlers.
//!
//! A [`Responder`] remembers which inbound message it belongs to and provides
//! the ways to answer it:
//! - `answer` - send a fully built response with the same id
//! - `respond` - build and send a response from a command and payload
//! - `acknowledge` - send `success`
//! - `defer` - promise an answer later, from outside the reader loop
//!
//! # Example
//!
//! ```ignore
//! channel.register_command("outer_request", |_msg, responder| async move {
//!     responder.defer()?;
//!     tokio::spawn(async move {
//!         let inner = responder.channel().request("inner_request", None, decode).await?;
//!         let value = inner.get().await?;
//!         responder.respond("outer_response", encode(value)).await
//!     });
//!     Ok(())
//! })?;
//! ```

use bytes::Bytes;

use crate::client::Channel;
use crate::error::{ChannelError, Result};
use crate::message::{Message, MessageId};

/// Context passed to handlers for one inbound message.
///
/// `Responder` is `Clone` and can be moved into spawned tasks, which is how a
/// deferred request gets its answer.
#[derive(Clone)]
pub struct Responder {
    id: MessageId,
    command: String,
    is_request: bool,
    channel: Channel,
}

impl Responder {
    pub(crate) fn new(message: &Message, channel: Channel) -> Self {
        Self {
            id: message.id(),
            command: message.command().to_string(),
            is_request: message.is_request(),
            channel,
        }
    }

    /// Id of the inbound message.
    #[inline]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Command of the inbound message.
    #[inline]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Check if the inbound message is owed an answer.
    #[inline]
    pub fn is_request(&self) -> bool {
        self.is_request
    }

    /// The channel the message arrived on, for issuing further calls.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Answer the request with a prepared response.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::IdMismatch`] if `response` carries a different id
    /// - [`ChannelError::RequestNotOutstanding`] if the message was not a
    ///   request or has already been answered
    pub async fn answer(&self, response: Message) -> Result<()> {
        if response.id() != self.id {
            return Err(ChannelError::IdMismatch {
                original: self.id,
                response: response.id(),
            });
        }
        self.channel.answer_id(self.id, response).await
    }

    /// Answer the request with `command` and an optional payload.
    pub async fn respond(&self, command: &str, payload: impl Into<Option<Bytes>>) -> Result<()> {
        let response = Message::new(self.id, command)?.with_optional_payload(payload.into());
        self.answer(response).await
    }

    /// Send a `success` acknowledgement.
    ///
    /// Answers the request if the message was one; otherwise sends `success`
    /// as a plain message, which is how non-request calls are confirmed.
    pub async fn acknowledge(&self) -> Result<()> {
        let success = Message::success(self.id);
        if self.is_request {
            self.answer(success).await
        } else {
            self.channel.send_message(success).await
        }
    }

    /// Hand the answer off to a later point.
    ///
    /// The request stays owed exactly one answer, but the reader loop no
    /// longer expects it before the handler returns. Use this to await a
    /// nested call from a spawned task instead of blocking the reader loop.
    pub fn defer(&self) -> Result<()> {
        self.channel.defer_answer(self.id)
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("is_request", &self.is_request)
            .finish()
    }
}
