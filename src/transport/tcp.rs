//! TCP listener and stream setup.
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> meter_gateway::error::Result<()> {
//! use meter_gateway::transport::{bind_listener, configure_stream};
//!
//! let listener = bind_listener("127.0.0.1:9000".parse().unwrap()).await?;
//! let (stream, _peer) = listener.accept().await?;
//! configure_stream(&stream)?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;

/// Bind a TCP listener.
pub async fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    tracing::debug!(addr = %listener.local_addr()?, "Listener bound");
    Ok(listener)
}

/// Apply socket options to an accepted stream (`TCP_NODELAY`).
pub fn configure_stream(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    Ok(())
}
