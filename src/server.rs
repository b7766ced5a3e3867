//! Gateway builder and accept loops.
//!
//! The [`GatewayBuilder`] provides a fluent API for configuring handlers
//! and settings. The [`Gateway`] manages the lifecycle:
//! 1. Bind the TCP listener
//! 2. Run one accept loop per configured acceptor
//! 3. Spawn a [`Session`] per accepted socket
//! 4. Expose [`Gateway::send`] for commands to logged-in devices
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use meter_gateway::{DeviceId, Gateway, GatewayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::builder()
//!         .config(GatewayConfig::from_env_or_file()?)
//!         .bind()
//!         .await?;
//!
//!     let reply = gateway
//!         .send(&DeviceId::new("01020304"), 0x0Cu8, Bytes::new())
//!         .await;
//!     println!("{:?}", reply);
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::GatewayConfig;
use crate::connection::{Session, SessionShared};
use crate::device::DeviceId;
use crate::dispatch::{CommandDispatcher, PendingCommand};
use crate::error::Result;
use crate::handler::{FrameContext, FrameHandler, HandlerRegistry, HandlerResult};
use crate::protocol::ControlCode;
use crate::registry::ConnectionRegistry;
use crate::transport::{bind_listener, configure_stream};

/// Builder for configuring and starting a gateway.
pub struct GatewayBuilder {
    config: GatewayConfig,
    handlers: HandlerRegistry,
}

impl GatewayBuilder {
    /// Create a builder with default settings and the built-in handlers.
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            handlers: HandlerRegistry::with_defaults(),
        }
    }

    /// Replace all settings.
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the listen address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind = addr;
        self
    }

    /// Set the command reply timeout.
    ///
    /// Default: 30 seconds
    pub fn command_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Set the global in-flight command budget.
    ///
    /// Default: 100000
    pub fn max_pending_commands(mut self, limit: usize) -> Self {
        self.config.max_pending_commands = limit;
        self
    }

    /// Set the liveness idle period and missed-heartbeat threshold.
    pub fn liveness(mut self, idle_period: std::time::Duration, max_missed: u32) -> Self {
        self.config.idle_period = idle_period;
        self.config.max_missed_heartbeats = max_missed;
        self
    }

    /// Register a handler for a control code.
    ///
    /// Replaces the built-in handler if the code has one.
    pub fn handle<F, Fut>(mut self, code: ControlCode, handler: F) -> Self
    where
        F: Fn(FrameContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register(code, handler);
        self
    }

    /// Register a [`FrameHandler`] implementation for a control code.
    pub fn handler(mut self, code: ControlCode, handler: impl FrameHandler) -> Self {
        self.handlers.register_handler(code, handler);
        self
    }

    /// Replace the handler for codes with no registered handler.
    pub fn fallback<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(FrameContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.set_fallback(handler);
        self
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn bind(self) -> Result<Gateway> {
        Gateway::start(self.config, self.handlers).await
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running gateway.
///
/// Dropping it without calling [`Gateway::shutdown`] also stops the accept
/// loops and closes every session.
pub struct Gateway {
    local_addr: SocketAddr,
    shared: SessionShared,
    shutdown_tx: watch::Sender<bool>,
    acceptors: Vec<JoinHandle<()>>,
}

impl Gateway {
    /// Create a new gateway builder.
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    async fn start(config: GatewayConfig, handlers: HandlerRegistry) -> Result<Self> {
        config.validate()?;

        let listener = Arc::new(bind_listener(config.bind).await?);
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher =
            CommandDispatcher::new(registry.clone(), config.dispatch_config(), Handle::current());
        let acceptor_count = config.acceptor_threads;
        let shared = SessionShared {
            registry,
            dispatcher,
            handlers: Arc::new(handlers),
            config: Arc::new(config),
        };

        let (shutdown_tx, _) = watch::channel(false);
        let next_id = Arc::new(AtomicU64::new(1));
        let acceptors = (0..acceptor_count)
            .map(|_| {
                tokio::spawn(accept_loop(
                    listener.clone(),
                    shared.clone(),
                    next_id.clone(),
                    shutdown_tx.subscribe(),
                ))
            })
            .collect();

        tracing::info!(addr = %local_addr, acceptors = acceptor_count, "Gateway listening");

        Ok(Self {
            local_addr,
            shared,
            shutdown_tx,
            acceptors,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a command to a logged-in device.
    ///
    /// See [`CommandDispatcher::send`].
    pub fn send(
        &self,
        device: &DeviceId,
        control_code: impl Into<u8>,
        payload: Bytes,
    ) -> PendingCommand {
        self.shared.dispatcher.send(device, control_code, payload)
    }

    /// The command dispatcher. Clone it to send from other tasks or threads.
    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.shared.dispatcher
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.registry
    }

    /// Number of logged-in devices.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.count()
    }

    /// Stop accepting and close every connection.
    ///
    /// Outstanding commands are not cancelled; they resolve through their
    /// normal timeout or write-failure paths.
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);
        self.shared.registry.close_all();
        for acceptor in self.acceptors {
            let _ = acceptor.await;
        }
        tracing::info!(addr = %self.local_addr, "Gateway stopped");
    }
}

async fn accept_loop(
    listener: Arc<TcpListener>,
    shared: SessionShared,
    next_id: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                continue;
            }
        };

        if let Err(e) = configure_stream(&stream) {
            tracing::warn!(%peer, error = %e, "Failed to set socket options");
        }

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(Session::run(
            stream,
            id,
            peer,
            shared.clone(),
            shutdown.clone(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_builder_settings() {
        let builder = Gateway::builder()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .command_timeout(Duration::from_secs(2))
            .max_pending_commands(5)
            .liveness(Duration::from_secs(1), 2)
            .handle(ControlCode::Unknown(0x8C), |_ctx| async { Ok(()) })
            .fallback(|_ctx| async { Ok(()) });

        assert_eq!(builder.config.bind.port(), 0);
        assert_eq!(builder.config.command_timeout, Duration::from_secs(2));
        assert_eq!(builder.config.max_pending_commands, 5);
        assert_eq!(builder.config.max_missed_heartbeats, 2);
        assert!(builder.handlers.contains(ControlCode::Unknown(0x8C)));
        assert!(builder.handlers.contains(ControlCode::Login));
    }

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let gateway = Gateway::builder()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .bind()
            .await
            .unwrap();

        assert_ne!(gateway.local_addr().port(), 0);
        assert_eq!(gateway.connection_count(), 0);

        tokio::time::timeout(Duration::from_secs(5), gateway.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = GatewayConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            worker_threads: 0,
            ..GatewayConfig::default()
        };
        assert!(Gateway::builder().config(config).bind().await.is_err());
    }
}
