//! Handler registry for dispatching frames by control code.
//!
//! Known codes map to handlers; anything else goes to the fallback, which
//! by default logs the code at `warn` and drops the frame.
//!
//! # Example
//!
//! ```
//! use meter_gateway::handler::{FrameContext, HandlerRegistry};
//! use meter_gateway::protocol::ControlCode;
//!
//! let mut registry = HandlerRegistry::with_defaults();
//! registry.register(ControlCode::Unknown(0x8C), |ctx: FrameContext| async move {
//!     tracing::info!(len = ctx.frame().payload_len(), "Meter reading");
//!     Ok(())
//! });
//! assert!(registry.contains(ControlCode::Heartbeat));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::{builtin, FrameContext};
use crate::error::Result;
use crate::protocol::ControlCode;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for frame handlers.
pub trait FrameHandler: Send + Sync + 'static {
    /// Handle one decoded frame.
    fn call(&self, ctx: FrameContext) -> BoxFuture<'static, HandlerResult>;
}

/// Adapter turning an async closure into a [`FrameHandler`].
pub struct FnHandler<F> {
    handler: F,
}

impl<F> FnHandler<F> {
    /// Wrap a closure.
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> FrameHandler for FnHandler<F>
where
    F: Fn(FrameContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: FrameContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(ctx))
    }
}

/// Registry mapping control codes to handlers.
pub struct HandlerRegistry {
    handlers: HashMap<ControlCode, Box<dyn FrameHandler>>,
    fallback: Box<dyn FrameHandler>,
}

impl HandlerRegistry {
    /// Create a registry with no code handlers and the logging fallback.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Box::new(FnHandler::new(builtin::unknown)),
        }
    }

    /// Create a registry with the heartbeat and login handlers installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ControlCode::Heartbeat, builtin::heartbeat);
        registry.register(ControlCode::Login, builtin::login);
        registry
    }

    /// Register a closure for a control code, replacing any existing one.
    pub fn register<F, Fut>(&mut self, code: ControlCode, handler: F)
    where
        F: Fn(FrameContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(code, FnHandler::new(handler));
    }

    /// Register a [`FrameHandler`] implementation for a control code.
    ///
    /// `Unknown(b)` for a byte with a named variant is stored under that
    /// variant.
    pub fn register_handler(&mut self, code: ControlCode, handler: impl FrameHandler) {
        self.handlers.insert(canonical(code), Box::new(handler));
    }

    /// Replace the handler for codes with no registered handler.
    pub fn set_fallback<F, Fut>(&mut self, handler: F)
    where
        F: Fn(FrameContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.fallback = Box::new(FnHandler::new(handler));
    }

    /// Check if a code has its own handler.
    pub fn contains(&self, code: ControlCode) -> bool {
        self.handlers.contains_key(&canonical(code))
    }

    /// Get the handler for a code, or the fallback.
    pub fn get(&self, code: ControlCode) -> &dyn FrameHandler {
        self.handlers
            .get(&canonical(code))
            .map(|h| h.as_ref())
            .unwrap_or(self.fallback.as_ref())
    }

    /// Dispatch a frame to its handler.
    pub async fn dispatch(&self, ctx: FrameContext) -> HandlerResult {
        let code = ctx.frame().control();
        self.get(code).call(ctx).await
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut codes: Vec<_> = self.handlers.keys().map(|c| c.as_u8()).collect();
        codes.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("codes", &codes)
            .finish_non_exhaustive()
    }
}

fn canonical(code: ControlCode) -> ControlCode {
    ControlCode::from(code.as_u8())
}
