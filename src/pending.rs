//! Correlation of outgoing calls with their responses.
//!
//! Every outgoing call that expects an answer registers a pending entry keyed
//! by its id. When the reader loop sees a response carrying that id, the entry
//! is removed, the payload decoded, and every waiter on the matching
//! [`ResponseHandle`] woken.
//!
//! A registry only ever matches responses (messages without the request
//! flag). Ids are allocated per sender, so an inbound request may carry the
//! same number as one of our own calls; it belongs to the handlers, not here.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use crate::error::{ChannelError, Result};
use crate::message::{Message, MessageId, SUCCESS_COMMAND};

/// State of a single outgoing call.
#[derive(Debug, Clone)]
enum CallState<T> {
    Pending,
    Completed(T),
    /// The response payload could not be decoded.
    Failed(String),
    Cancelled,
    /// The channel ended first; carries the fatal reason, if any.
    Closed(Option<String>),
}

impl<T: Clone> CallState<T> {
    fn outcome(&self) -> Option<Result<T>> {
        match self {
            CallState::Pending => None,
            CallState::Completed(value) => Some(Ok(value.clone())),
            CallState::Failed(reason) => Some(Err(ChannelError::InvalidPayload(reason.clone()))),
            CallState::Cancelled => Some(Err(ChannelError::Cancelled)),
            CallState::Closed(None) => Some(Err(ChannelError::ConnectionClosed)),
            CallState::Closed(Some(reason)) => Some(Err(ChannelError::Aborted(reason.clone()))),
        }
    }
}

type StateCell<T> = Arc<watch::Sender<CallState<T>>>;

/// Set a final state unless one is already set.
fn settle<T>(cell: &StateCell<T>, next: CallState<T>) -> bool {
    cell.send_if_modified(|state| {
        if matches!(state, CallState::Pending) {
            *state = next;
            true
        } else {
            false
        }
    })
}

/// Handle to the result of an outgoing call.
///
/// Waiting does not consume the handle, so a timed-out wait can be retried.
pub struct ResponseHandle<T> {
    id: MessageId,
    state: StateCell<T>,
}

impl<T: Clone> ResponseHandle<T> {
    /// Id of the call.
    #[inline]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Wait until the call completes, is cancelled, or the channel closes.
    pub async fn get(&self) -> Result<T> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, CallState::Pending))
            .await
            .map_err(|_| ChannelError::ConnectionClosed)?;

        match state.outcome() {
            Some(outcome) => outcome,
            None => Err(ChannelError::ConnectionClosed),
        }
    }

    /// Wait at most `timeout` for the call to finish.
    ///
    /// On [`ChannelError::Timeout`] the call stays pending; its response may
    /// still arrive and can be awaited again.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<T> {
        tokio::time::timeout(timeout, self.get())
            .await
            .map_err(|_| ChannelError::Timeout)?
    }

    /// Cancel the call locally and wake all waiters.
    ///
    /// Does not reach the remote side. A response that arrives later is
    /// decoded and discarded. Returns `false` if the call had already
    /// finished.
    pub fn cancel(&self) -> bool {
        settle(&self.state, CallState::Cancelled)
    }

    /// Check if the call has finished in any way.
    pub fn is_done(&self) -> bool {
        !matches!(*self.state.borrow(), CallState::Pending)
    }

    /// Check if the call was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.state.borrow(), CallState::Cancelled)
    }
}

impl<T> fmt::Debug for ResponseHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle").field("id", &self.id).finish()
    }
}

/// Type-erased registry entry.
trait PendingEntry: Send {
    /// Decode the response and complete the call.
    fn resolve(self: Box<Self>, message: &Message);

    /// End the call because the channel closed.
    fn abandon(self: Box<Self>, reason: Option<String>);
}

struct Entry<T, D> {
    state: StateCell<T>,
    /// Taken when the response is decoded.
    decode: Option<D>,
}

/// An entry dropped while still pending (a panicking decoder, or a call
/// removed after its frame could not be queued) must not leave waiters hanging.
impl<T, D> Drop for Entry<T, D> {
    fn drop(&mut self) {
        settle(
            &self.state,
            CallState::Closed(Some("response was not delivered".to_string())),
        );
    }
}

impl<T, D> PendingEntry for Entry<T, D>
where
    T: Send + Sync + 'static,
    D: FnOnce(Bytes) -> Result<T> + Send + 'static,
{
    fn resolve(mut self: Box<Self>, message: &Message) {
        let Some(decode) = self.decode.take() else {
            return;
        };
        let next = match decode(message.payload_or_empty()) {
            Ok(value) => CallState::Completed(value),
            Err(e) => {
                tracing::warn!(id = message.id(), command = message.command(), error = %e, "failed to decode response");
                CallState::Failed(e.to_string())
            }
        };

        if !settle(&self.state, next) {
            tracing::warn!(id = message.id(), command = message.command(), "discarding late response");
        }
    }

    fn abandon(self: Box<Self>, reason: Option<String>) {
        settle(&self.state, CallState::Closed(reason));
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<MessageId, Box<dyn PendingEntry>>,
    /// Set once the channel has ended; holds the fatal reason, if any.
    closed: Option<Option<String>>,
}

/// Table of outgoing calls awaiting a response.
///
/// The channel keeps two: one for calls answered with a typed payload, and an
/// acknowledgement view that only matches `success` responses.
pub struct ResponseRegistry {
    acks_only: bool,
    state: Mutex<RegistryState>,
}

impl ResponseRegistry {
    /// Registry matching responses of any command.
    pub fn new() -> Self {
        Self {
            acks_only: false,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Registry matching only `success` acknowledgements.
    pub fn acknowledgements() -> Self {
        Self {
            acks_only: true,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Register a pending call.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::ConnectionClosed`] once the registry has been closed
    /// - [`ChannelError::Protocol`] if `id` is already pending
    pub fn register<T, D>(&self, id: MessageId, decode: D) -> Result<ResponseHandle<T>>
    where
        T: Send + Sync + 'static,
        D: FnOnce(Bytes) -> Result<T> + Send + 'static,
    {
        let mut state = self.lock();
        if state.closed.is_some() {
            return Err(ChannelError::ConnectionClosed);
        }
        if state.entries.contains_key(&id) {
            return Err(ChannelError::Protocol(format!("Call id {} is already pending", id)));
        }

        let (tx, _) = watch::channel(CallState::Pending);
        let cell = Arc::new(tx);
        state.entries.insert(
            id,
            Box::new(Entry {
                state: cell.clone(),
                decode: Some(decode),
            }),
        );

        Ok(ResponseHandle { id, state: cell })
    }

    /// Drop a registration whose frame could not be sent.
    pub fn remove(&self, id: MessageId) -> bool {
        self.lock().entries.remove(&id).is_some()
    }

    /// Complete the call matching `message`, if any.
    ///
    /// Returns `true` if the message was consumed. The entry is removed
    /// whether the call was still waiting or had been cancelled.
    pub fn try_complete(&self, message: &Message) -> bool {
        if message.is_request() || (self.acks_only && message.command() != SUCCESS_COMMAND) {
            return false;
        }

        let entry = self.lock().entries.remove(&message.id());
        match entry {
            Some(entry) => {
                entry.resolve(message);
                true
            }
            None => false,
        }
    }

    /// Close the registry, ending every outstanding call.
    ///
    /// Calls resolve to [`ChannelError::ConnectionClosed`] when `reason` is
    /// `None`, otherwise to [`ChannelError::Aborted`]. Later registrations
    /// fail.
    pub fn close(&self, reason: Option<String>) {
        let entries: Vec<_> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.clone());
            }
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        for entry in entries {
            entry.abandon(reason.clone());
        }
    }

    /// Check if the registry has been closed.
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ResponseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResponseRegistry {
    fn drop(&mut self) {
        self.close(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PayloadDecoder, PayloadEncoder};

    fn decode_int(payload: Bytes) -> Result<i32> {
        PayloadDecoder::new(payload).next_int()
    }

    fn int_response(id: MessageId, value: i32) -> Message {
        let mut encoder = PayloadEncoder::new();
        encoder.put_int(value);
        Message::new(id, "getpid").unwrap().with_payload(encoder.finish())
    }

    #[tokio::test]
    async fn test_register_and_complete() {
        let registry = ResponseRegistry::new();
        let handle = registry.register(3, decode_int).unwrap();
        assert_eq!(registry.pending_count(), 1);
        assert!(!handle.is_done());

        assert!(registry.try_complete(&int_response(3, 4242)));
        assert_eq!(handle.get().await.unwrap(), 4242);
        assert!(handle.is_done());
        assert_eq!(registry.pending_count(), 0);

        // Resolved handles can be read again.
        assert_eq!(handle.get().await.unwrap(), 4242);
    }

    #[tokio::test]
    async fn test_unknown_id_not_consumed() {
        let registry = ResponseRegistry::new();
        let _handle = registry.register(1, decode_int).unwrap();

        assert!(!registry.try_complete(&int_response(2, 0)));
        assert_eq!(registry.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_requests_never_match() {
        let registry = ResponseRegistry::new();
        let handle = registry.register(5, decode_int).unwrap();

        let inbound = int_response(5, 1).into_request();
        assert!(!registry.try_complete(&inbound));
        assert!(!handle.is_done());
    }

    #[tokio::test]
    async fn test_acknowledgement_view_only_matches_success() {
        let acks = ResponseRegistry::acknowledgements();
        let handle = acks.register(8, |_| Ok(())).unwrap();

        assert!(!acks.try_complete(&Message::new(8, "getTable").unwrap()));
        assert!(acks.try_complete(&Message::success(8)));
        handle.get().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_then_late_response() {
        let registry = ResponseRegistry::new();
        let handle = registry.register(1, decode_int).unwrap();

        let result = handle.get_timeout(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ChannelError::Timeout)));
        assert!(!handle.is_done());

        assert!(registry.try_complete(&int_response(1, 7)));
        assert_eq!(handle.get_timeout(Duration::from_secs(1)).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter_and_discards_late_response() {
        let registry = Arc::new(ResponseRegistry::new());
        let handle = Arc::new(registry.register(9, decode_int).unwrap());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.get().await })
        };
        tokio::task::yield_now().await;

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(matches!(waiter.await.unwrap(), Err(ChannelError::Cancelled)));
        assert!(handle.is_cancelled());

        // Entry stays until its response shows up, then is removed.
        assert_eq!(registry.pending_count(), 1);
        assert!(registry.try_complete(&int_response(9, 1)));
        assert_eq!(registry.pending_count(), 0);
        assert!(matches!(handle.get().await, Err(ChannelError::Cancelled)));
    }

    #[tokio::test]
    async fn test_decode_failure_is_call_local() {
        let registry = ResponseRegistry::new();
        let handle = registry.register(2, decode_int).unwrap();

        let empty = Message::new(2, "getpid").unwrap();
        assert!(registry.try_complete(&empty));
        assert!(matches!(handle.get().await, Err(ChannelError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_close_ends_outstanding_calls() {
        let registry = ResponseRegistry::new();
        let handle = registry.register(1, decode_int).unwrap();

        registry.close(None);
        assert!(matches!(handle.get().await, Err(ChannelError::ConnectionClosed)));
        assert!(registry.is_closed());
        assert!(matches!(
            registry.register(2, decode_int),
            Err(ChannelError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_with_reason_aborts() {
        let registry = ResponseRegistry::new();
        let handle = registry.register(1, decode_int).unwrap();

        registry.close(Some("bad header".to_string()));
        match handle.get().await {
            Err(ChannelError::Aborted(reason)) => assert_eq!(reason, "bad header"),
            other => panic!("expected Aborted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panicking_decoder_ends_call() {
        let registry = Arc::new(ResponseRegistry::new());
        let handle = registry
            .register(3, |_: Bytes| -> Result<i32> { panic!("decoder bug") })
            .unwrap();

        let completing = registry.clone();
        let outcome = tokio::spawn(async move {
            completing.try_complete(&Message::new(3, "getpid").unwrap());
        })
        .await;
        assert!(outcome.is_err());

        assert!(matches!(handle.get().await, Err(ChannelError::Aborted(_))));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_registry_ends_outstanding_calls() {
        let registry = ResponseRegistry::new();
        let handle = registry.register(1, decode_int).unwrap();

        drop(registry);
        assert!(matches!(handle.get().await, Err(ChannelError::ConnectionClosed)));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = ResponseRegistry::new();
        let _first = registry.register(4, decode_int).unwrap();

        assert!(matches!(
            registry.register(4, decode_int),
            Err(ChannelError::Protocol(_))
        ));
        assert!(registry.remove(4));
        assert!(registry.register(4, decode_int).is_ok());
    }
}
