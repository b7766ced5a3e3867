//! Transport module - TCP socket handling.
//!
//! Provides listener binding and per-socket options for meter connections.

mod tcp;

pub use tcp::{bind_listener, configure_stream};
