//! Global in-flight command budget.
//!
//! Every outstanding command holds one slot from a process-wide budget.
//! Reservation never waits: when the budget is exhausted the caller gets
//! [`CommandError::QueueFull`] immediately.
//!
//! # Usage
//!
//! The [`BackpressureController`] hands out [`BackpressureGuard`]s. The
//! [`CommandDispatcher`](crate::dispatch::CommandDispatcher) stores the
//! guard in the pending entry, so whichever path resolves the command
//! (reply, timeout or transport failure) returns the slot exactly once.
//!
//! ```
//! use meter_gateway::backpressure::BackpressureController;
//!
//! let ctrl = BackpressureController::new(1);
//! let guard = ctrl.try_reserve().unwrap();
//! assert!(ctrl.try_reserve().is_err());
//!
//! drop(guard);
//! assert_eq!(ctrl.available_capacity(), 1);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::CommandError;

/// Default maximum number of in-flight commands.
pub const DEFAULT_MAX_PENDING: usize = 100_000;

/// Lock-free counter of reserved slots.
///
/// Clones share the same counter.
#[derive(Debug, Clone)]
pub struct BackpressureController {
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

impl BackpressureController {
    /// Create a new controller with the given budget.
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending,
        }
    }

    /// Get current reserved count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Get the budget.
    #[inline]
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Get available capacity.
    #[inline]
    pub fn available_capacity(&self) -> usize {
        self.max_pending.saturating_sub(self.pending_count())
    }

    /// Try to reserve a slot without waiting.
    ///
    /// The check and the increment are one atomic step, so concurrent
    /// callers can never overshoot the budget.
    pub fn try_reserve(&self) -> Result<BackpressureGuard, CommandError> {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_pending).then_some(current + 1)
            })
            .map_err(|_| CommandError::QueueFull)?;

        Ok(BackpressureGuard {
            controller: self.clone(),
            released: false,
        })
    }

    #[inline]
    fn release(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING)
    }
}

/// A reserved slot. Released on drop.
#[derive(Debug)]
pub struct BackpressureGuard {
    controller: BackpressureController,
    released: bool,
}

impl BackpressureGuard {
    /// Release the slot now.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.controller.release();
            self.released = true;
        }
    }
}

impl Drop for BackpressureGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}
