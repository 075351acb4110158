//! Handler module - inbound message handling.
//!
//! Provides:
//! - [`HandlerRegistry`] - command table plus ordered open-ended handlers
//! - [`Responder`] - lets a handler answer, acknowledge, or defer
//!
//! # Example
//!
//! ```ignore
//! use kernelwire::Channel;
//!
//! let channel = Channel::builder()
//!     .command("execute", |msg, responder| async move {
//!         let source = PayloadDecoder::new(msg.payload_or_empty()).next_string()?;
//!         let (stdout, stderr) = run(&source);
//!         responder.respond("execute_response", encode(stdout, stderr)).await
//!     })
//!     .start_stream(stream)?;
//! ```

mod context;
mod registry;

pub use context::Responder;
pub use registry::{
    BoxFuture, FnHandler, Handler, HandlerId, HandlerRegistry, HandlerResult, MessageHandler,
};
