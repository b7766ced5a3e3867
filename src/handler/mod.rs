//! Handler module - control-code dispatch for inbound frames.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps control codes to handlers, with a fallback
//! - [`FrameContext`] - the frame plus the connection it arrived on
//! - built-in heartbeat and login handlers
//!
//! Replies to gateway commands never reach handlers: the session offers
//! them to the [`CommandDispatcher`](crate::dispatch::CommandDispatcher)
//! first.

mod builtin;
mod context;
mod registry;

pub use builtin::{heartbeat, login, unknown};
pub use context::FrameContext;
pub use registry::{BoxFuture, FnHandler, FrameHandler, HandlerRegistry, HandlerResult};
