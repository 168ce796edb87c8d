use tokio::time::Instant;

use crate::position::Timestamp;

/// Maps between sample time and the runtime clock.
///
/// Anchored on the first sample of a session so that classifier deadlines, which are expressed
/// in the source's timestamps, can be slept on with tokio timers.
#[derive(Debug, Clone, Copy)]
pub(super) struct SampleClock {
    origin: Timestamp,
    anchored: Instant,
}

impl SampleClock {
    pub fn anchor(origin: Timestamp) -> Self {
        Self {
            origin,
            anchored: Instant::now(),
        }
    }

    /// The current time in sample time.
    pub fn now(&self) -> Timestamp {
        self.origin.saturating_add(self.anchored.elapsed())
    }

    /// The runtime instant at which sample time reaches `at`. Times before the anchor map to
    /// the anchor itself.
    pub fn instant_at(&self, at: Timestamp) -> Instant {
        self.anchored + at.saturating_since(self.origin)
    }
}
