//! Frame context for handlers.
//!
//! A [`FrameContext`] carries the decoded frame, the identity of the
//! connection it arrived on (once logged in) and the connection handle for
//! replies.
//!
//! # Example
//!
//! ```ignore
//! async fn ack(ctx: FrameContext) -> Result<()> {
//!     ctx.reply(0x0C, Bytes::new()).await
//! }
//! ```

use bytes::Bytes;

use crate::device::DeviceId;
use crate::error::Result;
use crate::protocol::Frame;
use crate::registry::ConnectionHandle;
use crate::writer::OutboundFrame;

/// Context passed to frame handlers.
///
/// `Clone` and safe to move into spawned tasks; replies go through the
/// connection's writer channel.
#[derive(Debug, Clone)]
pub struct FrameContext {
    frame: Frame,
    device: Option<DeviceId>,
    conn: ConnectionHandle,
}

impl FrameContext {
    /// Create a context for a frame received on `conn`.
    pub fn new(frame: Frame, device: Option<DeviceId>, conn: ConnectionHandle) -> Self {
        Self {
            frame,
            device,
            conn,
        }
    }

    /// The inbound frame.
    #[inline]
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Identity the connection logged in with, if it has.
    #[inline]
    pub fn device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    /// Connection the frame arrived on.
    #[inline]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.conn
    }

    /// Reply with the inbound frame's address and sequence.
    pub async fn reply(&self, control_code: impl Into<u8>, payload: Bytes) -> Result<()> {
        self.send(&self.frame.reply(control_code, payload)).await
    }

    /// Send an arbitrary frame on this connection.
    ///
    /// Never waits for queue space. A full writer queue fails with
    /// [`GatewayError::SlowConsumer`](crate::error::GatewayError::SlowConsumer),
    /// which closes the connection when returned from a handler.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        self.conn.writer().try_send(OutboundFrame::from_frame(frame)?)
    }
}
