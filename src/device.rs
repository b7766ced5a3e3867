//! Device identity.
//!
//! A [`DeviceId`] is the key used to route commands to a live connection.
//! It is established when a device logs in and is kept separate from the
//! raw address bytes carried in each frame.

use std::fmt;
use std::sync::Arc;

use crate::protocol::Address;

/// Logical device identifier.
///
/// Cheap to clone (shared string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    /// Create a device id from any string.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Derive the identity of a device from its terminal address.
    ///
    /// The id is the upper-case hex rendering of the four address bytes.
    ///
    /// ```
    /// use meter_gateway::device::DeviceId;
    /// use meter_gateway::protocol::Address;
    ///
    /// let id = DeviceId::from_address(Address::new([0x01, 0x02, 0xAB, 0xCD]));
    /// assert_eq!(id.as_str(), "0102ABCD");
    /// ```
    pub fn from_address(address: Address) -> Self {
        Self::new(address.to_string())
    }

    /// Get the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Terminal address to put in frames sent to this device.
    ///
    /// Ids of exactly eight hex digits are parsed back into bytes. Any other
    /// id contributes its first four bytes, zero-padded.
    pub fn address(&self) -> Address {
        if let Some(address) = parse_hex_address(&self.0) {
            return address;
        }
        let mut bytes = [0u8; 4];
        let raw = self.0.as_bytes();
        let n = raw.len().min(4);
        bytes[..n].copy_from_slice(&raw[..n]);
        Address::new(bytes)
    }
}

fn parse_hex_address(s: &str) -> Option<Address> {
    if s.len() != 8 || !s.is_ascii() {
        return None;
    }
    let mut bytes = [0u8; 4];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(Address::new(bytes))
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}
