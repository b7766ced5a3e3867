//! Codec module - payload encodings used by the built-in handlers.
//!
//! - [`bcd`] - packed binary-coded decimal, used for the clock payload of
//!   heartbeat replies
//!
//! # Example
//!
//! ```
//! use meter_gateway::codec::bcd;
//!
//! assert_eq!(bcd::to_bcd(59), 0x59);
//! assert_eq!(bcd::from_bcd(0x59), Some(59));
//! ```

pub mod bcd;
