//! Control codes.
//!
//! The control byte selects the meaning of a frame. Device uploads have
//! the high bit set; the gateway's replies clear it.

use std::fmt;

/// Control code of a frame.
///
/// Known codes get their own variant; anything else is carried in
/// [`ControlCode::Unknown`] so dispatch always has an explicit fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCode {
    /// Device heartbeat (`0xA4`). A non-empty payload requests time sync.
    Heartbeat,
    /// Gateway reply to a heartbeat (`0x24`).
    HeartbeatReply,
    /// Device login (`0xA1`). Identifies the connection.
    Login,
    /// Gateway reply to a login (`0x21`).
    LoginReply,
    /// Any other code.
    Unknown(u8),
}

impl ControlCode {
    /// Raw heartbeat code.
    pub const HEARTBEAT: u8 = 0xA4;
    /// Raw heartbeat reply code.
    pub const HEARTBEAT_REPLY: u8 = 0x24;
    /// Raw login code.
    pub const LOGIN: u8 = 0xA1;
    /// Raw login reply code.
    pub const LOGIN_REPLY: u8 = 0x21;

    /// Get the raw byte.
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            ControlCode::Heartbeat => Self::HEARTBEAT,
            ControlCode::HeartbeatReply => Self::HEARTBEAT_REPLY,
            ControlCode::Login => Self::LOGIN,
            ControlCode::LoginReply => Self::LOGIN_REPLY,
            ControlCode::Unknown(code) => code,
        }
    }

    /// Check if this is the heartbeat code.
    #[inline]
    pub fn is_heartbeat(self) -> bool {
        self == ControlCode::Heartbeat
    }
}

impl From<u8> for ControlCode {
    fn from(code: u8) -> Self {
        match code {
            Self::HEARTBEAT => ControlCode::Heartbeat,
            Self::HEARTBEAT_REPLY => ControlCode::HeartbeatReply,
            Self::LOGIN => ControlCode::Login,
            Self::LOGIN_REPLY => ControlCode::LoginReply,
            other => ControlCode::Unknown(other),
        }
    }
}

impl From<ControlCode> for u8 {
    fn from(code: ControlCode) -> Self {
        code.as_u8()
    }
}

impl fmt::Display for ControlCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.as_u8())
    }
}
