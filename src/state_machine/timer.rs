use std::time::Duration;

use crate::position::Timestamp;

/// A cancel-and-restart deadline driven entirely by the timestamps it is given.
///
/// Arming an armed timer replaces the deadline rather than extending it. Cancelling an unarmed
/// timer is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebounceTimer {
    deadline: Option<Timestamp>,
}

impl DebounceTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer to expire `duration` after `now`, discarding any previous deadline.
    pub fn arm(&mut self, now: Timestamp, duration: Duration) {
        self.deadline = Some(now.saturating_add(duration));
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    /// Disarm and return the deadline if it has been reached at `now`.
    pub fn fire(&mut self, now: Timestamp) -> Option<Timestamp> {
        match self.deadline {
            Some(deadline) if now >= deadline => self.deadline.take(),
            _ => None,
        }
    }
}
