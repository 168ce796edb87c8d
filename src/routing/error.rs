//! Error types for route estimation.

/// Reasons a route request did not produce a usable estimate.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouteError {
    /// The routing provider could not be reached or answered with an error.
    #[error("route computation failed: {0}")]
    ComputationFailed(String),

    /// The provider was reachable but found no road path between the endpoints.
    #[error("no route found between the requested endpoints")]
    NoRouteFound,

    /// A newer request was issued before this one resolved, so its result was ignored.
    #[error("route request {sequence} was superseded by request {current}")]
    Superseded { sequence: u64, current: u64 },

    /// The local task awaiting the provider was cancelled.
    #[error("route request {sequence} was cancelled")]
    Cancelled { sequence: u64 },
}

impl RouteError {
    /// Whether the error is a soft warning about the current request, as opposed to a stale or
    /// cancelled request that the caller can ignore.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            RouteError::ComputationFailed(_) | RouteError::NoRouteFound
        )
    }
}
