//! Per-connection heartbeat liveness.
//!
//! The session calls [`LivenessMonitor::on_read_idle`] each time a full
//! idle period passes with no inbound data and [`LivenessMonitor::observe`]
//! for every decoded frame. Once more than `max_missed` consecutive idle
//! periods pass without a heartbeat the monitor moves to
//! [`LivenessState::Closing`] and stays there.
//!
//! ```
//! use meter_gateway::liveness::{LivenessMonitor, LivenessState};
//!
//! let mut monitor = LivenessMonitor::new(3);
//! for _ in 0..3 {
//!     assert_eq!(monitor.on_read_idle(), LivenessState::Alive);
//! }
//! assert_eq!(monitor.on_read_idle(), LivenessState::Closing);
//! ```

use std::time::Duration;

use crate::protocol::Frame;

/// Default number of idle periods tolerated without a heartbeat.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// Default length of one read-idle period.
pub const DEFAULT_IDLE_PERIOD: Duration = Duration::from_secs(60);

/// Liveness of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    /// Heartbeats are arriving often enough.
    Alive,
    /// Too many idle periods passed. The connection must be closed.
    Closing,
}

/// Missed-heartbeat counter for one connection.
///
/// Owned by the session task; not shared.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    missed: u32,
    max_missed: u32,
    state: LivenessState,
}

impl LivenessMonitor {
    /// Create a monitor that closes after more than `max_missed` idle periods.
    pub fn new(max_missed: u32) -> Self {
        Self {
            missed: 0,
            max_missed,
            state: LivenessState::Alive,
        }
    }

    /// Record one idle period with no inbound data.
    pub fn on_read_idle(&mut self) -> LivenessState {
        if self.state == LivenessState::Closing {
            return self.state;
        }
        self.missed = self.missed.saturating_add(1);
        if self.missed > self.max_missed {
            self.state = LivenessState::Closing;
        }
        self.state
    }

    /// Record an inbound frame. Heartbeats reset the missed counter.
    pub fn observe(&mut self, frame: &Frame) -> LivenessState {
        if frame.is_heartbeat() && self.state == LivenessState::Alive {
            self.missed = 0;
        }
        self.state
    }

    /// Current state.
    #[inline]
    pub fn state(&self) -> LivenessState {
        self.state
    }

    /// Consecutive idle periods since the last heartbeat.
    #[inline]
    pub fn missed(&self) -> u32 {
        self.missed
    }
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MISSED_HEARTBEATS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Address, ControlCode, Sequence};
    use bytes::Bytes;

    fn frame(code: ControlCode) -> Frame {
        Frame::new(Address::default(), Sequence::default(), code, Bytes::new())
    }

    #[test]
    fn test_closes_only_after_threshold_exceeded() {
        let mut monitor = LivenessMonitor::default();

        assert_eq!(monitor.on_read_idle(), LivenessState::Alive);
        assert_eq!(monitor.on_read_idle(), LivenessState::Alive);
        assert_eq!(monitor.on_read_idle(), LivenessState::Alive);
        assert_eq!(monitor.missed(), 3);
        assert_eq!(monitor.on_read_idle(), LivenessState::Closing);
    }

    #[test]
    fn test_heartbeat_resets_counter() {
        let mut monitor = LivenessMonitor::new(3);

        monitor.on_read_idle();
        monitor.on_read_idle();
        monitor.on_read_idle();
        assert_eq!(monitor.observe(&frame(ControlCode::Heartbeat)), LivenessState::Alive);
        assert_eq!(monitor.missed(), 0);

        for _ in 0..3 {
            assert_eq!(monitor.on_read_idle(), LivenessState::Alive);
        }
    }

    #[test]
    fn test_other_frames_do_not_reset() {
        let mut monitor = LivenessMonitor::new(1);

        monitor.on_read_idle();
        monitor.observe(&frame(ControlCode::Login));
        monitor.observe(&frame(ControlCode::Unknown(0x8C)));
        assert_eq!(monitor.missed(), 1);
        assert_eq!(monitor.on_read_idle(), LivenessState::Closing);
    }

    #[test]
    fn test_closing_is_terminal() {
        let mut monitor = LivenessMonitor::new(0);

        assert_eq!(monitor.on_read_idle(), LivenessState::Closing);
        assert_eq!(
            monitor.observe(&frame(ControlCode::Heartbeat)),
            LivenessState::Closing
        );
        assert_eq!(monitor.on_read_idle(), LivenessState::Closing);
        assert_eq!(monitor.state(), LivenessState::Closing);
    }
}
