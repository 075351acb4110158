//! Error types for kernelwire.

use thiserror::Error;

use crate::message::MessageId;

/// Main error type for all channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed message envelope (illegal metacharacter, missing id/command).
    ///
    /// The stream should be considered desynchronized; do not retry.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Payload did not match the positional layout the reader expected.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Framing or protocol error (bad lengths, duplicate request ids, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No handler accepted an inbound message.
    #[error("Message {id} was not handled, command: {command}")]
    UnhandledCommand {
        /// Id of the unhandled message.
        id: MessageId,
        /// Command of the unhandled message.
        command: String,
    },

    /// An inbound request left dispatch without being answered or deferred.
    #[error("Request {id} was not answered, command: {command}")]
    UnansweredRequest {
        /// Id of the dropped request.
        id: MessageId,
        /// Command of the dropped request.
        command: String,
    },

    /// `answer` was called for a request that is not owed an answer
    /// (never tracked, or already answered).
    #[error("Request {0} is not awaiting an answer (answered twice or never received)")]
    RequestNotOutstanding(MessageId),

    /// Response id differs from the id of the request it answers.
    #[error("Response id {response} does not match request id {original}")]
    IdMismatch {
        /// Id of the request being answered.
        original: MessageId,
        /// Id carried by the response.
        response: MessageId,
    },

    /// A handler is already registered for this command.
    #[error("Handler already registered for command: {0}")]
    DuplicateHandler(String),

    /// A timed wait elapsed before the response arrived.
    #[error("Timed out waiting for response")]
    Timeout,

    /// The call was cancelled locally.
    #[error("Call cancelled")]
    Cancelled,

    /// The channel closed before the operation could complete.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The reader loop stopped on a fatal error.
    #[error("Channel aborted: {0}")]
    Aborted(String),
}

/// Result type alias using ChannelError.
pub type Result<T> = std::result::Result<T, ChannelError>;
