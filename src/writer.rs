//! Dedicated writer task for outgoing frames.
//!
//! All outgoing frames go through a single writer task that owns the write
//! half of the stream. Producers hand it fully built frames through a bounded
//! mpsc queue, so a frame is always written whole and frames from different
//! callers never interleave on the wire.
//!
//! # Architecture
//!
//! ```text
//! Caller 1 ─┐
//! Handler  ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Stream
//! Caller N ─┘
//! ```
//!
//! Frames that are ready together are written in one vectored write and
//! flushed once. A failed write stops the task and is published through
//! [`WriteFailure`], which the reader loop watches to end the channel.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{ChannelError, Result};
use crate::message::Message;
use crate::protocol::{FramePrefix, PREFIX_SIZE};

/// Default capacity of the outgoing frame queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the stream.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Pre-encoded length prefix.
    pub prefix: [u8; PREFIX_SIZE],
    /// Header text bytes.
    pub header: Bytes,
    /// Payload bytes (empty when the message carries no payload).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Build a frame from raw header and payload bytes.
    pub fn new(header: Bytes, payload: Bytes) -> Result<Self> {
        let prefix = FramePrefix::for_lengths(header.len(), payload.len())?;
        Ok(Self {
            prefix: prefix.encode(),
            header,
            payload,
        })
    }

    /// Serialize a message into a frame.
    pub fn from_message(message: &Message) -> Result<Self> {
        Self::new(Bytes::from(message.header()), message.payload_or_empty())
    }

    /// Total size of this frame on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        PREFIX_SIZE + self.header.len() + self.payload.len()
    }

    fn parts(&self) -> [&[u8]; 3] {
        [&self.prefix, &self.header, &self.payload]
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across callers and handlers.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    failure: watch::Receiver<Option<FailedWrite>>,
}

/// Kind and text of the error that stopped the writer task.
type FailedWrite = (std::io::ErrorKind, String);

impl WriterHandle {
    /// Queue a frame for writing.
    ///
    /// Waits while the queue is full. Fails with
    /// [`ChannelError::ConnectionClosed`] once the writer task has stopped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ChannelError::ConnectionClosed)
    }

    /// Check if the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Watch for a failed write.
    ///
    /// The returned watcher does not keep the writer task alive.
    pub fn failure(&self) -> WriteFailure {
        WriteFailure {
            rx: self.failure.clone(),
        }
    }
}

/// Observer of the writer task's first failed write.
#[derive(Clone)]
pub struct WriteFailure {
    rx: watch::Receiver<Option<FailedWrite>>,
}

impl WriteFailure {
    /// Resolve with the write error once the writer task fails.
    ///
    /// Never resolves if the task ends cleanly.
    pub async fn wait(&mut self) -> ChannelError {
        let failed = self
            .rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|failed| failed.clone());

        match failed {
            Some((kind, message)) => ChannelError::Io(std::io::Error::new(kind, message)),
            None => std::future::pending().await,
        }
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly once every [`WriterHandle`] is dropped, or with an
/// error on the first failed write.
pub fn spawn_writer_task<W>(writer: W, capacity: usize) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (failure_tx, failure_rx) = watch::channel(None);
    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "writer task stopped");
            let failed = match e {
                ChannelError::Io(io) => (io.kind(), io.to_string()),
                other => (std::io::ErrorKind::Other, other.to_string()),
            };
            failure_tx.send_replace(Some(failed));
        }
        result
    });

    (
        WriterHandle {
            tx,
            failure: failure_rx,
        },
        task,
    )
}

/// Write one frame and flush.
///
/// Used by the writer task and by anything that owns a stream outright, such
/// as a scripted peer in tests.
pub async fn write_frame<W>(writer: &mut W, frame: &OutboundFrame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_batch(writer, std::slice::from_ref(frame)).await
}

/// Main writer loop - receives frames and writes them to the stream.
async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
        batch.clear();
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O, then flush.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 3);
    let mut offset = 0;

    for part in batch.iter().flat_map(OutboundFrame::parts) {
        let end = offset + part.len();
        if !part.is_empty() && skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&part[start..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameBuffer;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn frame(header: &'static str, payload: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(Bytes::from_static(header.as_bytes()), Bytes::from_static(payload)).unwrap()
    }

    #[test]
    fn test_outbound_frame_from_message() {
        let msg = Message::new(42, "execute")
            .unwrap()
            .with_payload(Bytes::from_static(b"hello"))
            .into_request();
        let frame = OutboundFrame::from_message(&msg).unwrap();

        assert_eq!(&frame.header[..], b"@id=42@command=execute@request=true");
        assert_eq!(frame.prefix[..4], (frame.header.len() as i32).to_be_bytes());
        assert_eq!(frame.prefix[4..], 5i32.to_be_bytes());
        assert_eq!(frame.size(), PREFIX_SIZE + frame.header.len() + 5);
    }

    #[test]
    fn test_outbound_frame_without_payload() {
        let frame = OutboundFrame::from_message(&Message::success(1)).unwrap();

        assert!(frame.payload.is_empty());
        assert_eq!(frame.prefix[4..], [0, 0, 0, 0]);
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let batch = vec![frame("head", b"hello")];
        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 3);
    }

    #[test]
    fn test_build_remaining_slices_partial_prefix() {
        let batch = vec![frame("head", b"hello")];

        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].len(), PREFIX_SIZE - 5);
        assert_eq!(slices[1].len(), 4);
        assert_eq!(slices[2].len(), 5);
    }

    #[test]
    fn test_build_remaining_slices_skips_empty_payload() {
        let batch = vec![frame("head", b""), frame("next", b"xy")];

        let slices = build_remaining_slices(&batch, PREFIX_SIZE + 2);
        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0].len(), 2);
        assert_eq!(slices[1].len(), PREFIX_SIZE);
    }

    #[tokio::test]
    async fn test_write_frame_is_readable() {
        let mut buf = Cursor::new(Vec::new());
        write_frame(&mut buf, &frame("@id=1@command=getpid", b"")).await.unwrap();

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&buf.into_inner()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header_str().unwrap(), "@id=1@command=getpid");
        assert!(frames[0].payload.is_none());
    }

    #[tokio::test]
    async fn test_writer_batching() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(client, DEFAULT_CHANNEL_CAPACITY);

        for i in 0..10 {
            let msg = Message::new(i, "putTable")
                .unwrap()
                .with_payload(Bytes::copy_from_slice(&i.to_be_bytes()));
            handle.send(OutboundFrame::from_message(&msg).unwrap()).await.unwrap();
        }

        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 4096];
        while frames.len() < 10 {
            let n = tokio::time::timeout(Duration::from_secs(1), server.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            frames.extend(buffer.push(&buf[..n]).unwrap());
        }

        for (i, frame) in frames.iter().enumerate() {
            let msg = Message::from_frame(frame.clone()).unwrap();
            assert_eq!(msg.id(), i as i32);
        }
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, 8);

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());

        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_after_writer_failure() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task(client, 8);

        let _ = handle.send(frame("@id=1@command=x", b"data")).await;
        assert!(task.await.unwrap().is_err());

        let result = handle.send(frame("@id=2@command=x", b"")).await;
        assert!(matches!(result, Err(ChannelError::ConnectionClosed)));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_failure_reports_write_error() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, _task) = spawn_writer_task(client, 8);
        let mut failure = handle.failure();

        handle.send(frame("@id=1@command=x", b"data")).await.unwrap();

        let error = tokio::time::timeout(Duration::from_secs(1), failure.wait())
            .await
            .unwrap();
        assert!(matches!(error, ChannelError::Io(_)));
    }

    #[tokio::test]
    async fn test_failure_pends_after_clean_close() {
        let (client, _server) = duplex(64);
        let (handle, task) = spawn_writer_task(client, 8);
        let mut failure = handle.failure();

        drop(handle);
        task.await.unwrap().unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(50), failure.wait()).await;
        assert!(waited.is_err());
    }
}
