//! Per-connection session.
//!
//! One session task runs for every accepted socket. It owns the read half,
//! the [`FrameBuffer`] and the [`LivenessMonitor`], and spawns a writer
//! task for the write half. For each decoded frame it:
//!
//! 1. feeds the liveness monitor
//! 2. identifies the connection on login and registers it
//! 3. offers the frame to the dispatcher as a command reply
//! 4. otherwise dispatches it to the handler for its control code
//!
//! Any error while processing one connection closes that connection only.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;

use crate::config::GatewayConfig;
use crate::device::DeviceId;
use crate::dispatch::CommandDispatcher;
use crate::error::{GatewayError, Result};
use crate::handler::{FrameContext, HandlerRegistry};
use crate::liveness::{LivenessMonitor, LivenessState};
use crate::protocol::{ControlCode, Frame, FrameBuffer};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::writer::spawn_writer_task;

/// State shared by every session of one gateway.
#[derive(Debug, Clone)]
pub struct SessionShared {
    /// Live connections by device.
    pub registry: Arc<ConnectionRegistry>,
    /// Command dispatcher (reply correlation).
    pub dispatcher: CommandDispatcher,
    /// Control-code handlers.
    pub handlers: Arc<HandlerRegistry>,
    /// Gateway settings.
    pub config: Arc<GatewayConfig>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the socket.
    PeerClosed,
    /// Too many idle periods without a heartbeat.
    LivenessExpired,
    /// Close requested through the connection handle (e.g. evicted by a
    /// newer login for the same device).
    Requested,
    /// The gateway is shutting down.
    Shutdown,
    /// A frame broke session rules.
    ProtocolViolation,
    /// The peer stopped reading and the writer queue filled up.
    SlowConsumer,
    /// Reading from the socket failed.
    ReadError,
}

/// A running connection.
pub struct Session {
    conn: ConnectionHandle,
    device: Option<DeviceId>,
    liveness: LivenessMonitor,
    frames: FrameBuffer,
    shared: SessionShared,
}

impl Session {
    /// Drive a connection until it closes.
    ///
    /// Returns once the peer disconnects, liveness expires, a close is
    /// requested, a protocol violation occurs or `shutdown` flips to true.
    /// The registry entry is removed on the way out if it still points at
    /// this connection.
    pub async fn run<S>(
        stream: S,
        id: u64,
        peer: SocketAddr,
        shared: SessionShared,
        mut shutdown: watch::Receiver<bool>,
    ) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, shared.config.writer_config());
        let conn = ConnectionHandle::new(id, peer, writer);

        let config = shared.config.clone();
        let mut session = Session {
            conn: conn.clone(),
            device: None,
            liveness: LivenessMonitor::new(config.max_missed_heartbeats),
            frames: FrameBuffer::with_capacity_and_max_payload(
                config.read_buffer_size,
                config.max_payload_len,
            ),
            shared,
        };

        tracing::info!(conn = id, %peer, "Connection opened");

        let mut buf = vec![0u8; config.read_buffer_size];
        let reason = loop {
            let read = tokio::select! {
                _ = conn.closed() => break CloseReason::Requested,
                _ = shutdown_requested(&mut shutdown) => break CloseReason::Shutdown,
                read = tokio::time::timeout(config.idle_period, reader.read(&mut buf)) => read,
            };

            let n = match read {
                Err(_idle) => {
                    if session.liveness.on_read_idle() == LivenessState::Closing {
                        break CloseReason::LivenessExpired;
                    }
                    continue;
                }
                Ok(Ok(0)) => break CloseReason::PeerClosed,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    tracing::debug!(conn = id, error = %e, "Read failed");
                    break CloseReason::ReadError;
                }
            };

            // Handlers may wait; a close or shutdown still wins.
            let processed = tokio::select! {
                _ = conn.closed() => break CloseReason::Requested,
                _ = shutdown_requested(&mut shutdown) => break CloseReason::Shutdown,
                processed = session.on_bytes(&buf[..n]) => processed,
            };

            if let Err(e) = processed {
                tracing::error!(conn = id, %peer, error = %e, "Closing connection");
                break match e {
                    GatewayError::SlowConsumer => CloseReason::SlowConsumer,
                    _ => CloseReason::ProtocolViolation,
                };
            }
        };

        session.close(reason);
        writer_task.abort();
        reason
    }

    async fn on_bytes(&mut self, data: &[u8]) -> Result<()> {
        for frame in self.frames.push(data) {
            self.on_frame(frame).await?;
        }
        Ok(())
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<()> {
        self.liveness.observe(&frame);

        tracing::debug!(
            conn = self.conn.id(),
            control = %frame.control(),
            sequence = %frame.sequence(),
            len = frame.payload_len(),
            "Frame received"
        );

        let code = frame.control();
        if code == ControlCode::Login {
            self.identify(&frame)?;
        }

        if !matches!(code, ControlCode::Login | ControlCode::Heartbeat) {
            if let Some(device) = &self.device {
                if self.shared.dispatcher.complete(device, &frame) {
                    return Ok(());
                }
            }
        }

        let ctx = FrameContext::new(frame, self.device.clone(), self.conn.clone());
        match self.shared.handlers.dispatch(ctx).await {
            Ok(()) => Ok(()),
            Err(e @ (GatewayError::ProtocolViolation(_) | GatewayError::SlowConsumer)) => Err(e),
            Err(e) => {
                tracing::warn!(conn = self.conn.id(), %code, error = %e, "Handler failed");
                Ok(())
            }
        }
    }

    /// Bind this connection to the device named by a login frame.
    fn identify(&mut self, frame: &Frame) -> Result<()> {
        let device = DeviceId::from_address(frame.address());

        match &self.device {
            Some(current) if *current == device => return Ok(()),
            Some(current) => {
                return Err(GatewayError::ProtocolViolation(format!(
                    "connection logged in as {} sent login for {}",
                    current, device
                )))
            }
            None => {}
        }

        if let Some(previous) = self
            .shared
            .registry
            .register(device.clone(), self.conn.clone())
        {
            if previous.id() != self.conn.id() {
                tracing::warn!(
                    %device,
                    old_conn = previous.id(),
                    old_peer = %previous.peer(),
                    new_peer = %self.conn.peer(),
                    "Duplicate login, closing previous connection"
                );
                previous.close();
            }
        }

        tracing::info!(%device, conn = self.conn.id(), peer = %self.conn.peer(), "Device logged in");
        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self, reason: CloseReason) {
        self.conn.close();
        match &self.device {
            Some(device) => {
                self.shared
                    .registry
                    .unregister_connection(device, self.conn.id());
                if reason == CloseReason::LivenessExpired {
                    tracing::warn!(%device, missed = self.liveness.missed(), "Heartbeat lost");
                }
                tracing::info!(%device, conn = self.conn.id(), ?reason, "Device disconnected");
            }
            None => {
                tracing::info!(conn = self.conn.id(), peer = %self.conn.peer(), ?reason, "Connection closed");
            }
        }
    }
}

/// Resolves once shutdown is signalled or the gateway side is dropped.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
