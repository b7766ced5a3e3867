//! Command dispatch engine.
//!
//! [`CommandDispatcher::send`] pushes a command frame to a logged-in device
//! and returns a [`PendingCommand`] that resolves when the device answers
//! with the same sequence, when the deadline passes, or when the write
//! fails. `send` itself never blocks and never performs I/O: the frame is
//! handed to the connection's writer task.
//!
//! # Resolution
//!
//! Each outstanding command owns one entry in a sharded pending table keyed
//! by `(DeviceId, Sequence)`. The entry holds the caller's result slot and
//! the backpressure slot. Whichever path removes the entry first (reply,
//! timer or write failure) resolves the command; the others find nothing to
//! remove and do nothing. The budget slot is released before the result is
//! delivered, so a caller observing the result also observes the freed slot.
//!
//! # Example
//!
//! ```no_run
//! # async fn run(dispatcher: meter_gateway::dispatch::CommandDispatcher) {
//! use bytes::Bytes;
//! use meter_gateway::device::DeviceId;
//!
//! let reply = dispatcher
//!     .send(&DeviceId::new("01020304"), 0x0Cu8, Bytes::from_static(&[0x00, 0x01]))
//!     .await;
//! match reply {
//!     Ok(frame) => println!("device answered with {} bytes", frame.payload_len()),
//!     Err(e) => eprintln!("command failed: {}", e),
//! }
//! # }
//! ```

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::backpressure::{BackpressureController, BackpressureGuard, DEFAULT_MAX_PENDING};
use crate::device::DeviceId;
use crate::error::CommandError;
use crate::protocol::{encode, Frame, Sequence, MAX_PAYLOAD_LEN};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::writer::OutboundFrame;

/// Default time a command waits for its reply.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Result delivered to the caller of [`CommandDispatcher::send`].
pub type CommandResult = Result<Frame, CommandError>;

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Time to wait for a matching reply.
    pub timeout: Duration,
    /// Global in-flight command budget.
    pub max_pending: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    device: DeviceId,
    sequence: Sequence,
}

struct PendingEntry {
    reply: oneshot::Sender<CommandResult>,
    slot: BackpressureGuard,
    // Dropped with the entry, which stops the command's timer task
    _timer: oneshot::Sender<()>,
}

struct Inner {
    registry: Arc<ConnectionRegistry>,
    pending: DashMap<PendingKey, PendingEntry>,
    budget: BackpressureController,
    timeout: Duration,
    next_sequence: AtomicU16,
    runtime: Handle,
}

impl Inner {
    /// Remove and resolve a pending entry. Returns false if it was already gone.
    fn resolve(&self, key: &PendingKey, result: CommandResult) -> bool {
        let Some((_, entry)) = self.pending.remove(key) else {
            return false;
        };
        let PendingEntry { reply, slot, .. } = entry;
        slot.release();
        // The caller may have stopped listening; the outcome still counts
        let _ = reply.send(result);
        true
    }

    /// Claim an unused sequence for `device` and insert its entry.
    fn insert_entry(&self, device: &DeviceId, entry: PendingEntry) -> Option<PendingKey> {
        for _ in 0..=u16::MAX as u32 {
            let value = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            let key = PendingKey {
                device: device.clone(),
                sequence: Sequence::from_counter(value),
            };
            match self.pending.entry(key.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(entry);
                    return Some(key);
                }
            }
        }
        // Every sequence is in flight for this device; dropping the
        // entry returns its slot
        None
    }
}

/// Sends commands to devices and correlates their replies.
///
/// Cheap to clone; clones share the pending table and budget.
#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<Inner>,
}

impl CommandDispatcher {
    /// Create a dispatcher that routes through `registry`.
    ///
    /// Timer and write tasks are spawned on `runtime`, so `send` may be
    /// called from threads outside the runtime.
    pub fn new(registry: Arc<ConnectionRegistry>, config: DispatchConfig, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                pending: DashMap::new(),
                budget: BackpressureController::new(config.max_pending),
                timeout: config.timeout,
                next_sequence: AtomicU16::new(1),
                runtime,
            }),
        }
    }

    /// Send a command to a device.
    ///
    /// Returns immediately. The returned future resolves with the device's
    /// reply frame or with the reason the command failed. Dropping the
    /// future does not cancel the command: its entry and timer run to
    /// completion.
    pub fn send(
        &self,
        device: &DeviceId,
        control_code: impl Into<u8>,
        payload: Bytes,
    ) -> PendingCommand {
        let slot = match self.inner.budget.try_reserve() {
            Ok(slot) => slot,
            Err(e) => {
                tracing::debug!(%device, "Command rejected, budget exhausted");
                return PendingCommand::failed(e);
            }
        };

        let Some(conn) = self.inner.registry.writable(device) else {
            return PendingCommand::failed(CommandError::ConnectionUnavailable(device.clone()));
        };

        if payload.len() > MAX_PAYLOAD_LEN {
            return PendingCommand::failed(CommandError::PayloadTooLarge(payload.len()));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let (timer_tx, timer_rx) = oneshot::channel();
        let entry = PendingEntry {
            reply: reply_tx,
            slot,
            _timer: timer_tx,
        };

        let Some(key) = self.inner.insert_entry(device, entry) else {
            return PendingCommand::failed(CommandError::QueueFull);
        };

        let frame = Frame::new(device.address(), key.sequence, control_code, payload);
        let bytes = match encode(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.inner
                    .resolve(&key, Err(CommandError::Transport(e.to_string())));
                return PendingCommand::waiting(reply_rx, key.sequence);
            }
        };

        tracing::debug!(
            %device,
            sequence = %key.sequence,
            control = %frame.control(),
            "Command issued"
        );

        let deadline = Instant::now() + self.inner.timeout;
        let inner = self.inner.clone();
        let sequence = key.sequence;
        self.inner
            .runtime
            .spawn(drive_command(inner, key, conn, bytes, deadline, timer_rx));

        PendingCommand::waiting(reply_rx, sequence)
    }

    /// Offer an inbound frame from an identified connection as a reply.
    ///
    /// `device` must be the identity the connection logged in with; the
    /// frame's own address bytes are not consulted. Returns true if the
    /// frame resolved a pending command.
    pub fn complete(&self, device: &DeviceId, frame: &Frame) -> bool {
        let key = PendingKey {
            device: device.clone(),
            sequence: frame.sequence(),
        };
        let matched = self.inner.resolve(&key, Ok(frame.clone()));
        if matched {
            tracing::debug!(%device, sequence = %frame.sequence(), "Command answered");
        }
        matched
    }

    /// Check if a command is outstanding for `(device, sequence)`.
    pub fn is_pending(&self, device: &DeviceId, sequence: Sequence) -> bool {
        self.inner.pending.contains_key(&PendingKey {
            device: device.clone(),
            sequence,
        })
    }

    /// Number of outstanding commands.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Remaining in-flight budget.
    pub fn available_budget(&self) -> usize {
        self.inner.budget.available_capacity()
    }

    /// Configured reply timeout.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Registry used for routing.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("pending", &self.inner.pending.len())
            .field("available_budget", &self.inner.budget.available_capacity())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

/// Write the frame, then wait out the deadline.
///
/// Ends early when the entry is resolved elsewhere (its timer sender drops).
async fn drive_command(
    inner: Arc<Inner>,
    key: PendingKey,
    conn: ConnectionHandle,
    bytes: Bytes,
    deadline: Instant,
    mut cancelled: oneshot::Receiver<()>,
) {
    let write = async {
        let (frame, done) = OutboundFrame::with_completion(bytes);
        conn.writer()
            .send(frame)
            .await
            .map_err(|e| e.to_string())?;
        match done.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(kind)) => Err(io::Error::from(kind).to_string()),
            Err(_) => Err("connection closed before the frame was written".to_string()),
        }
    };

    tokio::select! {
        _ = &mut cancelled => return,
        _ = tokio::time::sleep_until(deadline) => {
            expire(&inner, &key);
            return;
        }
        written = write => {
            if let Err(reason) = written {
                tracing::debug!(
                    device = %key.device,
                    sequence = %key.sequence,
                    %reason,
                    "Command write failed"
                );
                inner.resolve(&key, Err(CommandError::Transport(reason)));
                return;
            }
        }
    }

    tokio::select! {
        _ = cancelled => {}
        _ = tokio::time::sleep_until(deadline) => expire(&inner, &key),
    }
}

fn expire(inner: &Inner, key: &PendingKey) {
    if inner.resolve(key, Err(CommandError::Timeout(inner.timeout))) {
        tracing::debug!(
            device = %key.device,
            sequence = %key.sequence,
            "Command timed out"
        );
    }
}

/// A command awaiting its outcome.
///
/// Resolves exactly once with the reply frame or a [`CommandError`].
#[derive(Debug)]
pub struct PendingCommand {
    rx: oneshot::Receiver<CommandResult>,
    sequence: Option<Sequence>,
}

impl PendingCommand {
    fn failed(error: CommandError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { rx, sequence: None }
    }

    fn waiting(rx: oneshot::Receiver<CommandResult>, sequence: Sequence) -> Self {
        Self {
            rx,
            sequence: Some(sequence),
        }
    }

    /// Sequence assigned to the command, if it got as far as being issued.
    #[inline]
    pub fn sequence(&self) -> Option<Sequence> {
        self.sequence
    }
}

impl Future for PendingCommand {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(CommandError::Transport(
                    "dispatcher dropped the command".to_string(),
                ))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlCode, FrameBuffer};
    use crate::writer::spawn_writer_task_default;
    use std::net::SocketAddr;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn connect(registry: &ConnectionRegistry, device: &DeviceId, id: u64) -> DuplexStream {
        let (client, server) = duplex(64 * 1024);
        let (writer, _task) = spawn_writer_task_default(client);
        registry.register(device.clone(), ConnectionHandle::new(id, peer(), writer));
        server
    }

    fn dispatcher(timeout: Duration, max_pending: usize) -> (CommandDispatcher, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = CommandDispatcher::new(
            registry.clone(),
            DispatchConfig {
                timeout,
                max_pending,
            },
            Handle::current(),
        );
        (dispatcher, registry)
    }

    async fn read_frames(stream: &mut DuplexStream, count: usize) -> Vec<Frame> {
        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 4096];
        while frames.len() < count {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed");
            frames.extend(buffer.push(&buf[..n]));
        }
        frames
    }

    #[tokio::test]
    async fn test_reply_resolves_command() {
        let (dispatcher, registry) = dispatcher(Duration::from_secs(5), 10);
        let device = DeviceId::new("01020304");
        let mut peer = connect(&registry, &device, 1);

        let pending = dispatcher.send(&device, 0x0Cu8, Bytes::from_static(b"read"));
        let sequence = pending.sequence().unwrap();

        let sent = read_frames(&mut peer, 1).await.remove(0);
        assert_eq!(sent.address().as_bytes(), &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(sent.sequence(), sequence);
        assert_eq!(sent.control_code(), 0x0C);
        assert_eq!(sent.payload(), b"read");
        assert!(dispatcher.is_pending(&device, sequence));

        let reply = sent.reply(0x8Cu8, Bytes::from_static(b"value"));
        assert!(dispatcher.complete(&device, &reply));

        let result = pending.await.unwrap();
        assert_eq!(result.payload(), b"value");
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(dispatcher.available_budget(), 10);
    }

    #[tokio::test]
    async fn test_connection_unavailable() {
        let (dispatcher, _registry) = dispatcher(Duration::from_secs(5), 10);
        let device = DeviceId::new("0A0B0C0D");

        let result = dispatcher.send(&device, 0x0Cu8, Bytes::new()).await;

        assert_eq!(result.unwrap_err(), CommandError::ConnectionUnavailable(device));
        assert_eq!(dispatcher.available_budget(), 10);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closing_connection_is_unavailable() {
        let (dispatcher, registry) = dispatcher(Duration::from_secs(5), 10);
        let device = DeviceId::new("01020304");
        let _peer = connect(&registry, &device, 1);
        registry.get(&device).unwrap().close();

        let result = dispatcher.send(&device, 0x0Cu8, Bytes::new()).await;
        assert!(matches!(result, Err(CommandError::ConnectionUnavailable(_))));
        assert_eq!(dispatcher.available_budget(), 10);
    }

    #[tokio::test]
    async fn test_payload_too_large() {
        let (dispatcher, registry) = dispatcher(Duration::from_secs(5), 10);
        let device = DeviceId::new("01020304");
        let _peer = connect(&registry, &device, 1);

        let payload = Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1]);
        let result = dispatcher.send(&device, 0x0Cu8, payload).await;

        assert_eq!(
            result.unwrap_err(),
            CommandError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1)
        );
        assert_eq!(dispatcher.available_budget(), 10);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_configured_duration() {
        let timeout = Duration::from_millis(30_000);
        let (dispatcher, registry) = dispatcher(timeout, 10);
        let device = DeviceId::new("01020304");
        let _peer = connect(&registry, &device, 1);

        let started = Instant::now();
        let pending = dispatcher.send(&device, 0x0Cu8, Bytes::new());
        let sequence = pending.sequence().unwrap();

        let result = pending.await;
        let elapsed = started.elapsed();

        assert_eq!(result.unwrap_err(), CommandError::Timeout(timeout));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));
        assert!(!dispatcher.is_pending(&device, sequence));
        assert_eq!(dispatcher.available_budget(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_after_timeout_is_ignored() {
        let (dispatcher, registry) = dispatcher(Duration::from_secs(1), 4);
        let device = DeviceId::new("01020304");
        let mut peer = connect(&registry, &device, 1);

        let pending = dispatcher.send(&device, 0x0Cu8, Bytes::new());
        let sent = read_frames(&mut peer, 1).await.remove(0);

        assert!(matches!(pending.await, Err(CommandError::Timeout(_))));
        assert_eq!(dispatcher.available_budget(), 4);

        // The reply shows up after the deadline
        assert!(!dispatcher.complete(&device, &sent.reply(0x8Cu8, Bytes::new())));
        assert_eq!(dispatcher.available_budget(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_fails_fast() {
        let budget = 8;
        let (dispatcher, registry) = dispatcher(Duration::from_secs(30), budget);
        let device = DeviceId::new("01020304");
        let _peer = connect(&registry, &device, 1);

        let mut in_flight: Vec<_> = (0..budget)
            .map(|_| dispatcher.send(&device, 0x0Cu8, Bytes::new()))
            .collect();
        let overflow = dispatcher.send(&device, 0x0Cu8, Bytes::new());

        assert_eq!(overflow.await.unwrap_err(), CommandError::QueueFull);
        assert_eq!(dispatcher.available_budget(), 0);
        assert_eq!(dispatcher.pending_count(), budget);

        let mut timeouts = 0;
        for pending in in_flight.drain(..) {
            if let Err(CommandError::Timeout(_)) = pending.await {
                timeouts += 1;
            }
        }
        assert_eq!(timeouts, budget);
        assert_eq!(dispatcher.available_budget(), budget);
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_correlation_isolation_across_devices() {
        let (dispatcher, registry) = dispatcher(Duration::from_secs(5), 10);
        let dev_a = DeviceId::new("0000000A");
        let dev_b = DeviceId::new("0000000B");
        let mut peer_a = connect(&registry, &dev_a, 1);
        let mut peer_b = connect(&registry, &dev_b, 2);

        let pending_a = dispatcher.send(&dev_a, 0x0Cu8, Bytes::from_static(b"A"));
        let pending_b = dispatcher.send(&dev_b, 0x0Cu8, Bytes::from_static(b"B"));

        let sent_a = read_frames(&mut peer_a, 1).await.remove(0);
        let sent_b = read_frames(&mut peer_b, 1).await.remove(0);

        // Answer b first, echoing each command's payload
        assert!(dispatcher.complete(&dev_b, &sent_b.reply(0x8Cu8, sent_b.payload_bytes())));
        assert!(dispatcher.complete(&dev_a, &sent_a.reply(0x8Cu8, sent_a.payload_bytes())));

        assert_eq!(pending_a.await.unwrap().payload(), b"A");
        assert_eq!(pending_b.await.unwrap().payload(), b"B");
    }

    #[tokio::test]
    async fn test_reply_from_other_device_does_not_resolve() {
        let (dispatcher, registry) = dispatcher(Duration::from_secs(5), 10);
        let dev_a = DeviceId::new("0000000A");
        let dev_b = DeviceId::new("0000000B");
        let mut peer_a = connect(&registry, &dev_a, 1);

        let pending = dispatcher.send(&dev_a, 0x0Cu8, Bytes::new());
        let sent = read_frames(&mut peer_a, 1).await.remove(0);

        // Same sequence and even the same address bytes, but from b's connection
        assert!(!dispatcher.complete(&dev_b, &sent.reply(0x8Cu8, Bytes::new())));
        assert!(dispatcher.is_pending(&dev_a, sent.sequence()));

        assert!(dispatcher.complete(&dev_a, &sent.reply(0x8Cu8, Bytes::new())));
        assert!(pending.await.is_ok());
    }

    #[tokio::test]
    async fn test_transport_error_when_peer_gone() {
        let (dispatcher, registry) = dispatcher(Duration::from_secs(5), 10);
        let device = DeviceId::new("01020304");
        let peer = connect(&registry, &device, 1);
        drop(peer);

        let result = dispatcher.send(&device, 0x0Cu8, Bytes::new()).await;

        assert!(matches!(result, Err(CommandError::Transport(_))));
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(dispatcher.available_budget(), 10);
    }

    #[tokio::test]
    async fn test_abandoned_command_still_releases_budget() {
        let (dispatcher, registry) = dispatcher(Duration::from_secs(5), 10);
        let device = DeviceId::new("01020304");
        let mut peer = connect(&registry, &device, 1);

        let pending = dispatcher.send(&device, ControlCode::Unknown(0x0C), Bytes::new());
        drop(pending);
        assert_eq!(dispatcher.available_budget(), 9);

        let sent = read_frames(&mut peer, 1).await.remove(0);
        assert!(dispatcher.complete(&device, &sent.reply(0x8Cu8, Bytes::new())));
        assert_eq!(dispatcher.available_budget(), 10);
    }

    #[tokio::test]
    async fn test_sequences_are_distinct() {
        let (dispatcher, registry) = dispatcher(Duration::from_secs(5), 100);
        let device = DeviceId::new("01020304");
        let _peer = connect(&registry, &device, 1);

        let pending: Vec<_> = (0..50)
            .map(|_| dispatcher.send(&device, 0x0Cu8, Bytes::new()))
            .collect();
        let mut sequences: Vec<_> = pending.iter().map(|p| p.sequence().unwrap()).collect();
        sequences.sort_by_key(|s| *s.as_bytes());
        sequences.dedup();

        assert_eq!(sequences.len(), 50);
        assert_eq!(dispatcher.pending_count(), 50);
    }

    #[tokio::test]
    async fn test_send_from_outside_runtime_thread() {
        let (dispatcher, registry) = dispatcher(Duration::from_secs(5), 10);
        let device = DeviceId::new("01020304");
        let mut peer = connect(&registry, &device, 1);

        let remote = dispatcher.clone();
        let remote_device = device.clone();
        let pending = std::thread::spawn(move || remote.send(&remote_device, 0x0Cu8, Bytes::new()))
            .join()
            .unwrap();

        let sent = read_frames(&mut peer, 1).await.remove(0);
        assert!(dispatcher.complete(&device, &sent.reply(0x8Cu8, Bytes::new())));
        assert!(pending.await.is_ok());
    }
}
