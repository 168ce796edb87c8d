//! Road-network route estimation between a broadcaster and a rider.
//!
//! A [`RouteProvider`] computes road-snapped routes. The [`RouteEstimator`] wraps it with
//! sequence-number arbitration (see [`RouteArbiter`](crate::state_machine::route::RouteArbiter))
//! so that only the freshest request can update the stored [`RouteEstimate`].

pub mod config;
pub mod error;
mod estimator;
pub mod osrm;

use futures::future::BoxFuture;
use serde::Serialize;

use self::error::RouteError;
use crate::position::Position;

pub use config::{OsrmConfig, RouteConfig};
pub use estimator::{PendingRoute, RouteEstimator};

/// Last accepted road distance and travel time. Both are never negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RouteEstimate {
    pub distance_m: f64,
    pub eta_s: f64,
}

impl RouteEstimate {
    /// Construct an estimate, clamping negative inputs to zero.
    pub fn new(distance_m: f64, eta_s: f64) -> Self {
        Self {
            distance_m: distance_m.max(0.0),
            eta_s: eta_s.max(0.0),
        }
    }

    /// Distance in kilometres, rounded to one decimal.
    pub fn distance_km(&self) -> f64 {
        (self.distance_m / 100.0).round() / 10.0
    }

    /// Travel time in whole minutes, rounded up.
    pub fn eta_minutes(&self) -> u64 {
        (self.eta_s / 60.0).ceil() as u64
    }
}

/// A route request as issued to the provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteRequest {
    pub start: Position,
    pub destination: Position,
    pub sequence: u64,
}

/// Raw figures returned by a [`RouteProvider`], validated into a [`RouteEstimate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteSummary {
    pub distance_m: f64,
    pub duration_s: f64,
}

impl TryFrom<RouteSummary> for RouteEstimate {
    type Error = RouteError;

    fn try_from(summary: RouteSummary) -> Result<Self, Self::Error> {
        if !summary.distance_m.is_finite() || !summary.duration_s.is_finite() {
            return Err(RouteError::ComputationFailed(format!(
                "provider returned non-finite summary ({} m, {} s)",
                summary.distance_m, summary.duration_s
            )));
        }

        Ok(RouteEstimate::new(summary.distance_m, summary.duration_s))
    }
}

/// A road-network routing backend.
///
/// The returned future is `'static` so the estimator can drive it on its own task.
pub trait RouteProvider: Send + Sync + 'static {
    fn compute_route(
        &self,
        start: Position,
        destination: Position,
    ) -> BoxFuture<'static, Result<RouteSummary, RouteError>>;
}
