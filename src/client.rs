//! Channel builder and runtime loop.
//!
//! The [`ChannelBuilder`] provides a fluent API for configuring handlers and
//! limits. [`ChannelBuilder::start`] spawns two tasks over a byte stream:
//! - a writer task that owns the write half (see [`crate::writer`])
//! - a reader task that reads frames and dispatches them one at a time
//!
//! The returned [`Channel`] is a cheap, cloneable handle used to issue calls,
//! answer requests, and stop or join the reader loop.
//!
//! The reader task only holds a weak reference to the channel between
//! frames. Dropping every `Channel` (and every `Responder` holding one)
//! closes the write half and ends the reader loop; pending calls then
//! resolve to [`ChannelError::ConnectionClosed`].
//!
//! The channel ends on the first I/O failure in either direction. A failed
//! write stops the reader loop just like a failed read.
//!
//! # Example
//!
//! ```ignore
//! use kernelwire::{Channel, codec::PayloadDecoder};
//!
//! #[tokio::main]
//! async fn main() -> kernelwire::Result<()> {
//!     let stream = kernelwire::transport::connect(&path).await?;
//!     let channel = Channel::builder()
//!         .command("getpid", |_msg, responder| async move {
//!             let mut payload = PayloadEncoder::new();
//!             payload.put_int(std::process::id() as i32);
//!             responder.respond("getpid", payload.finish()).await
//!         })
//!         .start_stream(stream)?;
//!
//!     channel.join().await
//! }
//! ```
//!
//! # Handlers and nested calls
//!
//! Handlers run on the reader task. A handler that issues a call and awaits
//! its result inline can never see that result, because the reader task is
//! busy running the handler. Such a handler must call
//! [`Responder::defer`](crate::Responder::defer) and await the nested call
//! from a spawned task.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::commands::Commands;
use crate::config::ChannelConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ChannelError, Result};
use crate::handler::{HandlerId, HandlerRegistry, HandlerResult, MessageHandler, Responder};
use crate::message::{Message, MessageId};
use crate::pending::{ResponseHandle, ResponseRegistry};
use crate::protocol::Frame;
use crate::reader::FrameReader;
use crate::transport::{self, SocketListener};
use crate::writer::{spawn_writer_task, OutboundFrame, WriteFailure, WriterHandle};

/// Builder for configuring and starting a [`Channel`].
pub struct ChannelBuilder {
    config: ChannelConfig,
    handlers: HandlerRegistry,
    /// First registration error, reported by `start`.
    error: Option<ChannelError>,
}

impl ChannelBuilder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ChannelConfig::default(),
            handlers: HandlerRegistry::new(),
            error: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the outgoing frame queue capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Set the size of each read from the stream.
    ///
    /// Default: 64 KB
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Set the largest accepted inbound header.
    ///
    /// Default: 64 KB
    pub fn max_header_size(mut self, size: u32) -> Self {
        self.config.max_header_size = size;
        self
    }

    /// Set the largest accepted inbound payload.
    ///
    /// Default: 1 GB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Register a handler for a command.
    ///
    /// A second handler for the same command makes `start` fail with
    /// [`ChannelError::DuplicateHandler`].
    pub fn command<F, Fut>(mut self, command: &str, handler: F) -> Self
    where
        F: Fn(Message, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if let Err(e) = self.handlers.register_command(command, handler) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Append an open-ended handler, tried after the command table.
    pub fn handler<H: MessageHandler>(self, handler: H) -> Self {
        self.handlers.register_handler(handler);
        self
    }

    /// Start the channel over separate read and write halves.
    ///
    /// Must be called within a tokio runtime.
    pub fn start<R, W>(self, reader: R, writer: W) -> Result<Channel>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.config.validate()?;

        let (writer, writer_task) = spawn_writer_task(writer, self.config.channel_capacity);
        let write_failure = writer.failure();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);

        let channel = Channel {
            shared: Arc::new(Shared {
                next_id: Mutex::new(0),
                writer,
                dispatcher: Dispatcher::new(self.handlers),
                stop: stop_tx,
                closed: closed_tx,
                shutdown_initiated: AtomicBool::new(false),
                reader_task: std::sync::Mutex::new(None),
                _writer_task: writer_task,
            }),
        };

        let frames = FrameReader::with_limits(
            reader,
            self.config.read_buffer_size,
            self.config.max_header_size,
            self.config.max_payload_size,
        );
        let task = tokio::spawn(read_loop(
            Arc::downgrade(&channel.shared),
            frames,
            stop_rx,
            write_failure,
        ));
        *channel.lock_reader_task() = Some(task);

        tracing::debug!("channel started");
        Ok(channel)
    }

    /// Start the channel over a bidirectional stream.
    pub fn start_stream<S>(self, stream: S) -> Result<Channel>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.start(reader, writer)
    }

    /// Accept one connection on `listener` and start the channel over it.
    pub async fn accept(self, listener: &SocketListener) -> Result<Channel> {
        let stream = listener.accept().await?;
        tracing::debug!(path = listener.path(), "companion connected");
        self.start_stream(stream)
    }

    /// Connect to a listening socket and start the channel over it.
    pub async fn connect(self, path: &str) -> Result<Channel> {
        let stream = transport::connect(path).await?;
        tracing::debug!(path, "connected");
        self.start_stream(stream)
    }
}

impl Default for ChannelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every clone of a [`Channel`].
struct Shared {
    /// Next outgoing id. Held across allocate, register and enqueue so ids
    /// reach the wire in order and no response can beat its registration.
    next_id: Mutex<MessageId>,
    writer: WriterHandle,
    dispatcher: Dispatcher,
    stop: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    shutdown_initiated: AtomicBool,
    reader_task: std::sync::Mutex<Option<JoinHandle<Result<()>>>>,
    _writer_task: JoinHandle<Result<()>>,
}

/// A running command/response channel.
///
/// Cloning is cheap; all clones share the same connection.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    /// Create a new channel builder.
    pub fn builder() -> ChannelBuilder {
        ChannelBuilder::new()
    }

    /// Typed command surface over this channel.
    pub fn commands(&self) -> Commands {
        Commands::new(self.clone())
    }

    /// Send a request and register for its typed response.
    ///
    /// `decode` runs on the reader task when the response arrives.
    pub async fn request<T, D>(
        &self,
        command: &str,
        payload: Option<Bytes>,
        decode: D,
    ) -> Result<ResponseHandle<T>>
    where
        T: Send + Sync + 'static,
        D: FnOnce(Bytes) -> Result<T> + Send + 'static,
    {
        let registry = &self.shared.dispatcher.calls;
        self.call(registry, command, payload, true, decode).await
    }

    /// Send a message that the remote side confirms with `success`.
    pub async fn send_acknowledged(
        &self,
        command: &str,
        payload: Option<Bytes>,
        is_request: bool,
    ) -> Result<ResponseHandle<()>> {
        let registry = &self.shared.dispatcher.acks;
        self.call(registry, command, payload, is_request, |_| Ok(()))
            .await
    }

    /// Send a message that expects no response. Returns its id.
    pub async fn notify(&self, command: &str, payload: Option<Bytes>) -> Result<MessageId> {
        self.ensure_open()?;

        let mut next_id = self.shared.next_id.lock().await;
        let id = *next_id;
        let message = Message::new(id, command)?.with_optional_payload(payload);
        let frame = OutboundFrame::from_message(&message)?;

        self.shared.writer.send(frame).await?;
        *next_id = id.wrapping_add(1);

        tracing::debug!(id, command, "notification sent");
        Ok(id)
    }

    /// Answer an inbound request.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::IdMismatch`] if the ids differ
    /// - [`ChannelError::RequestNotOutstanding`] if `original` is not owed an
    ///   answer (never received as a request, or already answered)
    pub async fn answer(&self, original: &Message, response: Message) -> Result<()> {
        if response.id() != original.id() {
            return Err(ChannelError::IdMismatch {
                original: original.id(),
                response: response.id(),
            });
        }
        self.answer_id(original.id(), response).await
    }

    /// Queue a prebuilt message as is.
    ///
    /// No id is allocated and nothing is registered; use it for replies that
    /// are not tracked as answers, such as `success` for a plain message.
    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.ensure_open()?;
        let frame = OutboundFrame::from_message(&message)?;
        self.shared.writer.send(frame).await
    }

    /// Register a handler for a command on the running channel.
    pub fn register_command<F, Fut>(&self, command: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(Message, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.shared.dispatcher.handlers.register_command(command, handler)
    }

    /// Append an open-ended handler on the running channel.
    pub fn register_handler<H: MessageHandler>(&self, handler: H) -> HandlerId {
        self.shared.dispatcher.handlers.register_handler(handler)
    }

    /// Remove a handler registration.
    pub fn unregister(&self, id: HandlerId) -> bool {
        self.shared.dispatcher.handlers.unregister(id)
    }

    /// Number of outgoing calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.shared.dispatcher.calls.pending_count() + self.shared.dispatcher.acks.pending_count()
    }

    /// Number of inbound requests still owed an answer.
    pub fn unanswered_requests(&self) -> usize {
        self.shared.dispatcher.unanswered_count()
    }

    /// Ask the reader loop to stop.
    ///
    /// The loop ends cleanly; a read error racing with the stop is not
    /// reported.
    pub fn stop(&self) {
        self.shared.stop.send_replace(true);
    }

    /// Check if the reader loop has ended.
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Check if `shutdown` has been sent on this channel.
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shared.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Wait for the reader loop to end and return how it ended.
    ///
    /// Only the first caller receives the loop's error; later callers wait
    /// for closure and get `Ok(())`.
    pub async fn join(&self) -> Result<()> {
        let task = self.lock_reader_task().take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| ChannelError::Aborted(format!("reader task failed: {}", e)))?,
            None => {
                let mut closed = self.shared.closed.subscribe();
                let _ = closed.wait_for(|closed| *closed).await;
                Ok(())
            }
        }
    }

    /// Treat a failing read from now on as expected closure.
    pub(crate) fn mark_shutdown_initiated(&self) {
        self.shared.shutdown_initiated.store(true, Ordering::Release);
    }

    /// Send the single answer owed to request `id`.
    pub(crate) async fn answer_id(&self, id: MessageId, response: Message) -> Result<()> {
        let frame = OutboundFrame::from_message(&response)?;

        let _guard = self.shared.next_id.lock().await;
        self.shared.dispatcher.take(id)?;
        self.shared.writer.send(frame).await?;

        tracing::debug!(id, command = response.command(), "request answered");
        Ok(())
    }

    pub(crate) fn defer_answer(&self, id: MessageId) -> Result<()> {
        self.shared.dispatcher.defer(id)?;
        tracing::debug!(id, "answer deferred");
        Ok(())
    }

    /// Allocate an id, register the pending call, and queue the frame as one
    /// step.
    async fn call<T, D>(
        &self,
        registry: &ResponseRegistry,
        command: &str,
        payload: Option<Bytes>,
        is_request: bool,
        decode: D,
    ) -> Result<ResponseHandle<T>>
    where
        T: Send + Sync + 'static,
        D: FnOnce(Bytes) -> Result<T> + Send + 'static,
    {
        let mut next_id = self.shared.next_id.lock().await;
        let id = *next_id;

        let mut message = Message::new(id, command)?.with_optional_payload(payload);
        if is_request {
            message = message.into_request();
        }
        let frame = OutboundFrame::from_message(&message)?;

        let handle = registry.register(id, decode)?;
        if let Err(e) = self.shared.writer.send(frame).await {
            registry.remove(id);
            return Err(e);
        }
        *next_id = id.wrapping_add(1);

        tracing::debug!(id, command, "call sent");
        Ok(handle)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::ConnectionClosed);
        }
        Ok(())
    }

    fn stop_requested(&self) -> bool {
        *self.shared.stop.borrow() || self.is_shutdown_initiated()
    }

    fn lock_reader_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<Result<()>>>> {
        self.shared
            .reader_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn handle_frame(&self, frame: Frame) -> Result<()> {
        let message = Message::from_frame(frame)?;
        tracing::debug!(
            id = message.id(),
            command = message.command(),
            request = message.is_request(),
            "message received"
        );

        let responder = Responder::new(&message, self.clone());
        self.shared.dispatcher.dispatch(message, responder).await
    }
}

/// Closes the channel when the reader task ends, including by panic.
struct ReaderExit {
    shared: Weak<Shared>,
    /// Replaced with the loop's outcome on a normal exit.
    reason: Option<String>,
}

impl Drop for ReaderExit {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.dispatcher.close(self.reason.take());
            shared.closed.send_replace(true);
        }
    }
}

/// Main read loop - reads frames and dispatches them in arrival order.
///
/// Ends on EOF, on `stop`, when the last `Channel` is dropped, on a failed
/// read or write, or on a fatal dispatch error.
async fn read_loop<R>(
    shared: Weak<Shared>,
    mut frames: FrameReader<R>,
    mut stop: watch::Receiver<bool>,
    mut write_failure: WriteFailure,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut exit = ReaderExit {
        shared: shared.clone(),
        reason: Some("reader task panicked".to_string()),
    };

    let result = loop {
        let read = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break Ok(()),
            e = write_failure.wait() => break io_failure(&shared, e),
            read = frames.read_frame() => read,
        };

        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break io_failure(&shared, e),
        };
        let Some(channel) = shared.upgrade().map(|shared| Channel { shared }) else {
            break Ok(());
        };

        let handled = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break Ok(()),
            e = write_failure.wait() => break io_failure(&shared, e),
            handled = channel.handle_frame(frame) => handled,
        };
        if let Err(e) = handled {
            break Err(e);
        }
    };

    exit.reason = result.as_ref().err().map(ToString::to_string);
    match &exit.reason {
        Some(reason) => tracing::error!(%reason, "reader loop stopped"),
        None => tracing::debug!("reader loop finished"),
    }

    drop(exit);
    result
}

/// Decide whether a failed read or write ends the loop with an error.
///
/// After `stop` or `shutdown` the failure is the expected closure.
fn io_failure(shared: &Weak<Shared>, error: ChannelError) -> Result<()> {
    let expected = shared
        .upgrade()
        .map_or(true, |shared| Channel { shared }.stop_requested());
    if expected {
        tracing::debug!(error = %error, "stream failed after shutdown");
        return Ok(());
    }
    Err(error)
}

/// Resolve once a stop has been requested or every `Channel` is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.is_closed())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}
