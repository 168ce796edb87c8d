//! Error types for position sampling.

/// Failures reported by a location source or the sampler wrapping it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    /// The user or platform refused access to location.
    #[error("location permission denied")]
    PermissionDenied,

    /// A source is present but produced no fix.
    #[error("location unavailable: {reason}")]
    Unavailable { reason: String },

    /// The sampler already holds the location source for another subscription.
    #[error("location source already has an active subscription")]
    SourceBusy,
}

impl LocationError {
    /// Whether the error ends the current broadcasting or tracking session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LocationError::PermissionDenied | LocationError::Unavailable { .. }
        )
    }
}
