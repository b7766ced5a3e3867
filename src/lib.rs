//! # meter-gateway
//!
//! TCP gateway for electricity meters.
//!
//! Meters open a long-lived TCP connection, log in with their 4-byte
//! address and then exchange binary frames with the gateway. The gateway
//! answers logins and heartbeats on its own and lets application code send
//! commands to any logged-in meter, awaiting the reply asynchronously.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): `0x68 | addr | seq | 0x68 | ctrl | len | payload | cs | 0x16`
//! - **Sessions** ([`connection`]): one task per socket, reading, decoding and routing frames
//! - **Registry** ([`registry`]): device address to live connection
//! - **Dispatch** ([`dispatch`]): sequence correlation, timeouts and a global in-flight budget
//! - **Liveness** ([`liveness`]): connections that stop heartbeating are closed
//!
//! ## Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use meter_gateway::{DeviceId, Gateway};
//!
//! #[tokio::main]
//! async fn main() -> meter_gateway::Result<()> {
//!     let gateway = Gateway::builder()
//!         .bind_addr("0.0.0.0:9000".parse().unwrap())
//!         .bind()
//!         .await?;
//!
//!     match gateway.send(&DeviceId::new("01020304"), 0x0Cu8, Bytes::new()).await {
//!         Ok(reply) => println!("reply: {:?}", reply.payload()),
//!         Err(e) => eprintln!("command failed: {}", e),
//!     }
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod backpressure;
pub mod codec;
pub mod config;
pub mod connection;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod liveness;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod writer;

mod server;

pub use config::GatewayConfig;
pub use device::DeviceId;
pub use dispatch::{CommandDispatcher, PendingCommand};
pub use error::{CommandError, GatewayError, Result};
pub use handler::FrameContext;
pub use protocol::{ControlCode, Frame};
pub use server::{Gateway, GatewayBuilder};
