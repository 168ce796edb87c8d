use std::time::Duration;

use bon::Builder;

/// Configuration for the [`RouteEstimator`](super::RouteEstimator).
#[derive(Debug, Clone, Builder)]
pub struct RouteConfig {
    /// Minimum degree-space movement of either endpoint before a new route is requested.
    #[builder(default = 5e-5)]
    pub min_delta_deg: f64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for the [`OsrmRouteProvider`](super::osrm::OsrmRouteProvider).
#[derive(Debug, Clone, Builder)]
pub struct OsrmConfig {
    /// Base URL of the OSRM service, without the `/route/v1` suffix.
    #[builder(default = "https://router.project-osrm.org".to_string())]
    pub endpoint: String,

    /// Routing profile segment of the request path.
    #[builder(default = "driving".to_string())]
    pub profile: String,

    /// Per-request HTTP timeout.
    #[builder(default = Duration::from_secs(10))]
    pub timeout: Duration,
}

impl Default for OsrmConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
