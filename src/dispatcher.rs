//! Routing of inbound messages and exactly-once answer tracking.
//!
//! Every inbound message is offered, in order, to:
//! 1. the acknowledgement registry (`success` responses to our calls)
//! 2. the call registry (typed responses to our calls)
//! 3. the handler registry (command table, then ordered handlers)
//!
//! Inbound requests are tracked as unanswered before their handler runs.
//! Each must receive exactly one answer; leaving dispatch without answering
//! or deferring is fatal, as is finding no handler at all.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::error::{ChannelError, Result};
use crate::handler::{HandlerRegistry, Responder};
use crate::message::{Message, MessageId};
use crate::pending::ResponseRegistry;

/// Inbound request still owed an answer.
#[derive(Debug)]
struct Unanswered {
    command: String,
    /// Handed off by its handler; may be answered after dispatch returns.
    deferred: bool,
}

pub(crate) struct Dispatcher {
    pub(crate) calls: ResponseRegistry,
    pub(crate) acks: ResponseRegistry,
    pub(crate) handlers: HandlerRegistry,
    unanswered: Mutex<HashMap<MessageId, Unanswered>>,
}

impl Dispatcher {
    pub(crate) fn new(handlers: HandlerRegistry) -> Self {
        Self {
            calls: ResponseRegistry::new(),
            acks: ResponseRegistry::acknowledgements(),
            handlers,
            unanswered: Mutex::new(HashMap::new()),
        }
    }

    /// Route one inbound message.
    ///
    /// Handlers run to completion here. An `Err` is fatal to the channel.
    pub(crate) async fn dispatch(&self, message: Message, responder: Responder) -> Result<()> {
        if self.acks.try_complete(&message) || self.calls.try_complete(&message) {
            tracing::debug!(id = message.id(), command = message.command(), "response delivered");
            return Ok(());
        }

        let id = message.id();
        if message.is_request() {
            self.track(&message)?;
        }

        let handler = self.handlers.dispatch(&message, &responder).ok_or_else(|| {
            ChannelError::UnhandledCommand {
                id,
                command: message.command().to_string(),
            }
        })?;
        handler.await?;

        if message.is_request() {
            let mut unanswered = self.lock();
            if unanswered.get(&id).is_some_and(|entry| !entry.deferred) {
                unanswered.remove(&id);
                return Err(ChannelError::UnansweredRequest {
                    id,
                    command: message.command().to_string(),
                });
            }
        }

        Ok(())
    }

    /// Start tracking an inbound request.
    fn track(&self, message: &Message) -> Result<()> {
        let mut unanswered = self.lock();
        if let Some(existing) = unanswered.get(&message.id()) {
            return Err(ChannelError::Protocol(format!(
                "Request id {} ({}) reused while request {} is unanswered",
                message.id(),
                message.command(),
                existing.command
            )));
        }

        unanswered.insert(
            message.id(),
            Unanswered {
                command: message.command().to_string(),
                deferred: false,
            },
        );
        Ok(())
    }

    /// Claim the single answer owed to request `id`.
    pub(crate) fn take(&self, id: MessageId) -> Result<()> {
        self.lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(ChannelError::RequestNotOutstanding(id))
    }

    /// Allow request `id` to be answered after its dispatch returns.
    pub(crate) fn defer(&self, id: MessageId) -> Result<()> {
        let mut unanswered = self.lock();
        let entry = unanswered
            .get_mut(&id)
            .ok_or(ChannelError::RequestNotOutstanding(id))?;
        entry.deferred = true;
        Ok(())
    }

    /// Number of inbound requests still owed an answer.
    pub(crate) fn unanswered_count(&self) -> usize {
        self.lock().len()
    }

    /// End every outstanding call after the reader loop stops.
    pub(crate) fn close(&self, reason: Option<String>) {
        self.calls.close(reason.clone());
        self.acks.close(reason);

        let dropped: Vec<_> = self.lock().drain().collect();
        for (id, entry) in dropped {
            tracing::debug!(id, command = %entry.command, "request left unanswered at close");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MessageId, Unanswered>> {
        self.unanswered.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
