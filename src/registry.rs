//! Connection registry.
//!
//! Maps each logged-in [`DeviceId`] to the handle of its live connection.
//! Lookups are lock-free reads on a sharded map and are safe to call from
//! any task.
//!
//! A device has at most one registered connection. Registering a second
//! one replaces the first and hands the old handle back to the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::device::DeviceId;
use crate::writer::WriterHandle;

/// Handle to one live connection.
///
/// Cheap to clone. All clones refer to the same socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    peer: SocketAddr,
    writer: WriterHandle,
    close_tx: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    /// Create a handle for a connection's writer.
    pub fn new(id: u64, peer: SocketAddr, writer: WriterHandle) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            id,
            peer,
            writer,
            close_tx: Arc::new(close_tx),
        }
    }

    /// Process-unique connection id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote address.
    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Writer for this connection.
    #[inline]
    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    /// Check if frames can still be written to this connection.
    pub fn is_writable(&self) -> bool {
        !self.writer.is_closed() && !self.is_closing()
    }

    /// Check if a close has been requested.
    #[inline]
    pub fn is_closing(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Ask the session owning this connection to shut it down.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Wait until a close is requested.
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        // The sender lives as long as self, so this only ends on close
        let _ = rx.wait_for(|closing| *closing).await;
    }
}

/// Registry of live connections by device.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<DeviceId, ConnectionHandle>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for a device, returning the replaced handle.
    pub fn register(&self, device: DeviceId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let previous = self.connections.insert(device.clone(), handle);
        if let Some(prev) = &previous {
            tracing::debug!(%device, old_conn = prev.id(), "Replaced device connection");
        }
        previous
    }

    /// Remove a device. No-op if it is not registered.
    pub fn unregister(&self, device: &DeviceId) -> Option<ConnectionHandle> {
        self.connections.remove(device).map(|(_, handle)| handle)
    }

    /// Remove a device only if it is still bound to connection `conn_id`.
    ///
    /// Used on disconnect so a session that was replaced does not remove
    /// its successor.
    pub fn unregister_connection(&self, device: &DeviceId, conn_id: u64) -> bool {
        self.connections
            .remove_if(device, |_, handle| handle.id() == conn_id)
            .is_some()
    }

    /// Look up a device's connection.
    pub fn get(&self, device: &DeviceId) -> Option<ConnectionHandle> {
        self.connections.get(device).map(|entry| entry.value().clone())
    }

    /// Look up a device's connection if it can still be written to.
    pub fn writable(&self, device: &DeviceId) -> Option<ConnectionHandle> {
        self.get(device).filter(ConnectionHandle::is_writable)
    }

    /// Check if a device is registered.
    pub fn contains(&self, device: &DeviceId) -> bool {
        self.connections.contains_key(device)
    }

    /// Number of registered devices.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of registered device ids.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Request every registered connection to close.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
    }
}
