//! Built-in handlers for the codes every meter sends.

use bytes::Bytes;

use super::{FrameContext, HandlerResult};
use crate::codec::bcd;
use crate::protocol::ControlCode;

/// Answer a heartbeat.
///
/// An empty heartbeat gets an empty reply. A heartbeat carrying data asks
/// for the time, so the reply carries the current clock in BCD.
pub async fn heartbeat(ctx: FrameContext) -> HandlerResult {
    let payload = if ctx.frame().payload().is_empty() {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(&bcd::encode_now())
    };
    tracing::debug!(
        device = ?ctx.device(),
        time_sync = !payload.is_empty(),
        "Heartbeat"
    );
    ctx.reply(ControlCode::HeartbeatReply, payload).await
}

/// Acknowledge a login.
pub async fn login(ctx: FrameContext) -> HandlerResult {
    ctx.reply(ControlCode::LoginReply, Bytes::new()).await
}

/// Log and drop a frame with no handler.
pub async fn unknown(ctx: FrameContext) -> HandlerResult {
    tracing::warn!(
        device = ?ctx.device(),
        peer = %ctx.connection().peer(),
        control = %ctx.frame().control(),
        len = ctx.frame().payload_len(),
        "Unhandled control code"
    );
    Ok(())
}
