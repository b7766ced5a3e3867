//! Dedicated writer task for one connection.
//!
//! Every connection owns a writer task that receives encoded frames via an
//! mpsc channel. Handlers replying to uploads and the command dispatcher
//! share the same [`WriterHandle`], so frames for one socket are never
//! interleaved mid-frame and bursts are coalesced into single syscalls.
//!
//! # Architecture
//!
//! ```text
//! Frame handlers    ─┐
//! CommandDispatcher ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► TcpStream
//! Time sync replies ─┘
//! ```
//!
//! A frame may carry a completion channel. It is notified once the frame
//! has been flushed, or with the error kind if the write failed. Dropping
//! the writer with frames still queued drops their completion senders,
//! which callers observe as a failed write.

use std::io::{self, IoSlice};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{GatewayError, Result};
use crate::protocol::{encode, Frame};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Outcome reported on a frame's completion channel.
pub type WriteOutcome = std::result::Result<(), io::ErrorKind>;

/// An encoded frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Encoded wire bytes.
    pub bytes: Bytes,
    done: Option<oneshot::Sender<WriteOutcome>>,
}

impl OutboundFrame {
    /// Create an outbound frame from already-encoded bytes.
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes, done: None }
    }

    /// Create an outbound frame and a receiver notified when it is written.
    pub fn with_completion(bytes: Bytes) -> (Self, oneshot::Receiver<WriteOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                bytes,
                done: Some(tx),
            },
            rx,
        )
    }

    /// Encode a frame.
    ///
    /// # Errors
    ///
    /// Returns `PayloadOutOfRange` if the payload does not fit the length field.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Ok(Self::new(encode(frame)?))
    }

    /// Size of the encoded frame.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn complete(&mut self, outcome: WriteOutcome) {
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<OutboundFrame>, pending: Arc<AtomicUsize>) -> Self {
        Self { tx, pending }
    }

    /// Queue a frame, waiting for channel capacity.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            GatewayError::ConnectionClosed
        })
    }

    /// Queue a frame without waiting.
    ///
    /// A full queue is reported as [`GatewayError::SlowConsumer`].
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            match e {
                mpsc::error::TrySendError::Full(_) => GatewayError::SlowConsumer,
                mpsc::error::TrySendError::Closed(_) => GatewayError::ConnectionClosed,
            }
        })
    }

    /// Check if the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Get the number of queued frames not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends when every handle is dropped or a write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(tx, pending.clone());
    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Spawn the writer task with default configuration.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
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

        let batch_size = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch_size, Ordering::AcqRel);

        match result {
            Ok(()) => {
                for mut frame in batch.drain(..) {
                    frame.complete(Ok(()));
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, frames = batch_size, "Connection write failed");
                let kind = e.kind();
                for mut frame in batch.drain(..) {
                    frame.complete(Err(kind));
                }
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        total_written += written;
    }

    writer.flush().await
}

/// Build IoSlice array for remaining data after a partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let start = offset;
        let end = offset + frame.size();
        if skip_bytes < end && !frame.bytes.is_empty() {
            let start_in_frame = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&frame.bytes[start_in_frame..]));
        }
        offset = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Address, ControlCode, FrameBuffer, Sequence};
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn heartbeat_reply(seq: u16) -> Frame {
        Frame::new(
            Address::new([1, 2, 3, 4]),
            Sequence::from_counter(seq),
            ControlCode::HeartbeatReply,
            Bytes::new(),
        )
    }

    #[test]
    fn test_outbound_frame_from_frame() {
        let frame = OutboundFrame::from_frame(&heartbeat_reply(1)).unwrap();
        assert_eq!(frame.size(), 13);
        assert_eq!(frame.bytes[0], 0x68);
    }

    #[test]
    fn test_outbound_frame_rejects_oversized_payload() {
        let frame = Frame::new(
            Address::default(),
            Sequence::default(),
            0x0Cu8,
            Bytes::from(vec![0u8; 70_000]),
        );
        assert!(matches!(
            OutboundFrame::from_frame(&frame),
            Err(GatewayError::PayloadOutOfRange(70_000))
        ));
    }

    #[test]
    fn test_writer_config_default() {
        assert_eq!(
            WriterConfig::default().channel_capacity,
            DEFAULT_CHANNEL_CAPACITY
        );
    }

    #[tokio::test]
    async fn test_encoded_frame_reaches_peer() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        handle
            .send(OutboundFrame::from_frame(&heartbeat_reply(7)).unwrap())
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();

        let mut frames = FrameBuffer::new();
        assert_eq!(frames.push(&buf[..n]), vec![heartbeat_reply(7)]);
    }

    #[tokio::test]
    async fn test_completion_notified_after_write() {
        let (client, _server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        let bytes = encode(&heartbeat_reply(1)).unwrap();
        let (frame, done) = OutboundFrame::with_completion(bytes);
        handle.send(frame).await.unwrap();

        assert_eq!(done.await.unwrap(), Ok(()));
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_completion_reports_failure_when_peer_gone() {
        let (client, server) = duplex(64);
        drop(server);
        let (handle, task) = spawn_writer_task_default(client);

        let bytes = encode(&heartbeat_reply(1)).unwrap();
        let (frame, done) = OutboundFrame::with_completion(bytes);
        handle.send(frame).await.unwrap();

        assert!(done.await.unwrap().is_err());
        assert!(task.await.unwrap().is_err());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_aborted_writer_drops_completions() {
        let (client, _server) = duplex(16);
        let (handle, task) = spawn_writer_task_default(client);
        task.abort();
        let _ = task.await;

        let bytes = encode(&heartbeat_reply(1)).unwrap();
        let (frame, done) = OutboundFrame::with_completion(bytes);
        // Either the send fails or the completion is dropped unanswered
        if handle.send(frame).await.is_ok() {
            assert!(done.await.is_err());
        }
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_writer_batching() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task_default(client);

        for seq in 0..10u16 {
            handle
                .send(OutboundFrame::from_frame(&heartbeat_reply(seq)).unwrap())
                .await
                .unwrap();
        }

        let mut frames = FrameBuffer::new();
        let mut received = Vec::new();
        let mut buf = vec![0u8; 1024];
        while received.len() < 10 {
            let n = tokio::time::timeout(Duration::from_secs(1), server.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            received.extend(frames.push(&buf[..n]));
        }

        let expected: Vec<_> = (0..10u16).map(heartbeat_reply).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_try_send_on_closed_writer() {
        let (tx, rx) = mpsc::channel::<OutboundFrame>(1);
        drop(rx);
        let handle = WriterHandle::new(tx, Arc::new(AtomicUsize::new(0)));

        let result = handle.try_send(OutboundFrame::new(Bytes::from_static(b"x")));
        assert!(matches!(result, Err(GatewayError::ConnectionClosed)));
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_try_send_on_full_queue() {
        let (tx, _rx) = mpsc::channel::<OutboundFrame>(1);
        let handle = WriterHandle::new(tx, Arc::new(AtomicUsize::new(0)));

        handle
            .try_send(OutboundFrame::new(Bytes::from_static(b"a")))
            .unwrap();
        let result = handle.try_send(OutboundFrame::new(Bytes::from_static(b"b")));

        assert!(matches!(result, Err(GatewayError::SlowConsumer)));
        assert_eq!(handle.pending_count(), 1);
    }

    #[test]
    fn test_build_remaining_slices_no_skip() {
        let batch = vec![
            OutboundFrame::new(Bytes::from_static(b"hello")),
            OutboundFrame::new(Bytes::from_static(b"world!")),
        ];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_build_remaining_slices_partial_frame() {
        let batch = vec![
            OutboundFrame::new(Bytes::from_static(b"hello")),
            OutboundFrame::new(Bytes::from_static(b"world!")),
        ];

        let slices = build_remaining_slices(&batch, 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"lo");
        assert_eq!(slices[1].len(), 6);

        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"world!");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());

        let batch: Vec<_> = (0..5u16)
            .map(|seq| OutboundFrame::from_frame(&heartbeat_reply(seq)).unwrap())
            .collect();

        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner().len(), 5 * 13);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task_default(client);

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
