//! Packed BCD encoding.
//!
//! Each byte holds two decimal digits, tens in the high nibble.

use chrono::{Datelike, NaiveDateTime, Timelike};

/// Length of the clock payload sent in heartbeat replies.
pub const CLOCK_LEN: usize = 8;

/// Encode a value in `0..=99` as one BCD byte.
///
/// Values above 99 keep only their last two digits.
#[inline]
pub fn to_bcd(value: u8) -> u8 {
    let value = value % 100;
    ((value / 10) << 4) | (value % 10)
}

/// Decode one BCD byte, or `None` if either nibble is above 9.
#[inline]
pub fn from_bcd(byte: u8) -> Option<u8> {
    let (tens, ones) = (byte >> 4, byte & 0x0F);
    if tens > 9 || ones > 9 {
        return None;
    }
    Some(tens * 10 + ones)
}

/// Encode a wall-clock time as the 8-byte clock payload.
///
/// Layout: second, minute, hour, day, month, year (two digits), then two
/// zero bytes.
///
/// ```
/// use chrono::NaiveDate;
/// use meter_gateway::codec::bcd::encode_clock;
///
/// let at = NaiveDate::from_ymd_opt(2024, 3, 9)
///     .unwrap()
///     .and_hms_opt(17, 45, 8)
///     .unwrap();
/// assert_eq!(encode_clock(&at), [0x08, 0x45, 0x17, 0x09, 0x03, 0x24, 0x00, 0x00]);
/// ```
pub fn encode_clock(at: &NaiveDateTime) -> [u8; CLOCK_LEN] {
    [
        to_bcd(at.second() as u8),
        to_bcd(at.minute() as u8),
        to_bcd(at.hour() as u8),
        to_bcd(at.day() as u8),
        to_bcd(at.month() as u8),
        to_bcd(at.year().rem_euclid(100) as u8),
        0x00,
        0x00,
    ]
}

/// Encode the current local time as the clock payload.
pub fn encode_now() -> [u8; CLOCK_LEN] {
    encode_clock(&chrono::Local::now().naive_local())
}
