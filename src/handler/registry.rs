//! Handler registry for inbound messages.
//!
//! Two kinds of handlers are kept:
//! - command handlers, keyed by command string (one per command)
//! - open-ended [`MessageHandler`]s, tried in registration order after the
//!   command table; the first one that accepts a message wins
//!
//! Handlers can be added and removed while the reader loop is dispatching.
//! Dispatch works on a snapshot, so a handler registered during dispatch
//! sees the next message, not the current one.
//!
//! # Example
//!
//! ```ignore
//! use kernelwire::handler::HandlerRegistry;
//!
//! let registry = HandlerRegistry::new();
//!
//! registry.register_command("getpid", |msg, responder| async move {
//!     responder.respond("getpid", pid_payload()).await
//! })?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::Responder;
use crate::error::{ChannelError, Result};
use crate::message::Message;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handler bound to a single command.
pub trait Handler: Send + Sync + 'static {
    /// Handle a message whose command this handler was registered for.
    fn call(&self, message: Message, responder: Responder) -> BoxFuture<'static, HandlerResult>;
}

/// Handler that decides per message whether it is responsible.
pub trait MessageHandler: Send + Sync + 'static {
    /// Return `None` if the message is not for this handler, otherwise the
    /// future that processes it.
    fn try_handle(
        &self,
        message: &Message,
        responder: &Responder,
    ) -> Option<BoxFuture<'static, HandlerResult>>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F, Fut>
where
    F: Fn(Message, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Message, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Wrap a closure.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Handler for FnHandler<F, Fut>
where
    F: Fn(Message, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, message: Message, responder: Responder) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(message, responder))
    }
}

/// Identifies a registration so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Tables {
    commands: HashMap<String, (HandlerId, Arc<dyn Handler>)>,
    handlers: Vec<(HandlerId, Arc<dyn MessageHandler>)>,
}

/// Registry of inbound message handlers.
pub struct HandlerRegistry {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an async closure for a command.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::DuplicateHandler`] if the command already has
    /// a handler.
    pub fn register_command<F, Fut>(&self, command: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(Message, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_command_handler(command, Arc::new(FnHandler::new(handler)))
    }

    /// Register a [`Handler`] for a command.
    pub fn register_command_handler(
        &self,
        command: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<HandlerId> {
        let mut tables = self.write();
        if tables.commands.contains_key(command) {
            return Err(ChannelError::DuplicateHandler(command.to_string()));
        }

        let id = self.next_handler_id();
        tables.commands.insert(command.to_string(), (id, handler));
        Ok(id)
    }

    /// Append an open-ended handler to the ordered list.
    pub fn register_handler<H: MessageHandler>(&self, handler: H) -> HandlerId {
        let id = self.next_handler_id();
        self.write().handlers.push((id, Arc::new(handler)));
        id
    }

    /// Remove a registration. Returns `false` if it was not registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut tables = self.write();

        let before = tables.commands.len() + tables.handlers.len();
        tables.commands.retain(|_, (handler_id, _)| *handler_id != id);
        tables.handlers.retain(|(handler_id, _)| *handler_id != id);
        before != tables.commands.len() + tables.handlers.len()
    }

    /// Check if a command handler is registered.
    pub fn has_command(&self, command: &str) -> bool {
        self.read().commands.contains_key(command)
    }

    /// Number of registrations of both kinds.
    pub fn len(&self) -> usize {
        let tables = self.read();
        tables.commands.len() + tables.handlers.len()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the handler for a message.
    ///
    /// The command table is consulted first, then the ordered list. Returns
    /// `None` when nobody accepts the message.
    pub fn dispatch(
        &self,
        message: &Message,
        responder: &Responder,
    ) -> Option<BoxFuture<'static, HandlerResult>> {
        let (command_handler, handlers) = {
            let tables = self.read();
            let command_handler = tables
                .commands
                .get(message.command())
                .map(|(_, handler)| handler.clone());
            let handlers: Vec<_> = tables.handlers.iter().map(|(_, h)| h.clone()).collect();
            (command_handler, handlers)
        };

        if let Some(handler) = command_handler {
            return Some(handler.call(message.clone(), responder.clone()));
        }

        handlers
            .iter()
            .find_map(|handler| handler.try_handle(message, responder))
    }

    fn next_handler_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
