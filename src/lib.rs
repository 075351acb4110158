//! # kernelwire
//!
//! Bidirectional command/response messaging between a host process and a
//! companion interpreter over one local byte stream.
//!
//! Either side may send requests, answer requests, and send plain messages.
//! Outgoing calls are correlated with their responses by message id.
//!
//! ## Layers
//!
//! - **Framing** ([`protocol`], [`reader`], [`writer`]): length-prefixed
//!   `header | payload` frames
//! - **Messages** ([`message`]): `@key=value` headers with id, command and
//!   request flag
//! - **Payloads** ([`codec`]): positional strings, byte arrays and ints
//! - **Correlation** ([`pending`]): one-shot response handles with timeout and
//!   cancellation
//! - **Dispatch** ([`handler`]): command table plus ordered handlers, with
//!   exactly-once answers for inbound requests
//! - **Commands** ([`commands`]): the typed verbs of the companion interpreter
//!
//! ## Example
//!
//! ```ignore
//! use kernelwire::transport::{generate_socket_path, SocketListener};
//! use kernelwire::Channel;
//!
//! #[tokio::main]
//! async fn main() -> kernelwire::Result<()> {
//!     let path = generate_socket_path();
//!     let listener = SocketListener::bind(&path).await?;
//!     // ...start the companion with `path`...
//!     let channel = Channel::builder().accept(&listener).await?;
//!
//!     let commands = channel.commands();
//!     let output = commands.execute("print(1 + 1)").await?.get().await?;
//!     println!("{}", output.stdout);
//!
//!     commands.shutdown().await?.get().await?;
//!     channel.join().await
//! }
//! ```

pub mod codec;
pub mod commands;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod pending;
pub mod protocol;
pub mod reader;
pub mod transport;
pub mod writer;

mod client;
mod dispatcher;

pub use client::{Channel, ChannelBuilder};
pub use commands::{Commands, ExecuteOutput};
pub use config::ChannelConfig;
pub use error::{ChannelError, Result};
pub use handler::Responder;
pub use message::{Message, MessageId, SUCCESS_COMMAND};
pub use pending::{ResponseHandle, ResponseRegistry};
