//! Route provider backed by an OSRM HTTP endpoint.

use futures::future::BoxFuture;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::config::OsrmConfig;
use super::error::RouteError;
use super::{RouteProvider, RouteSummary};
use crate::position::Position;

/// Calls `GET {endpoint}/route/v1/{profile}/{lon},{lat};{lon},{lat}` and reports the first
/// route's distance and duration.
#[derive(Debug, Clone)]
pub struct OsrmRouteProvider {
    client: Client,
    base: Url,
    profile: String,
}

impl OsrmRouteProvider {
    pub fn new(config: OsrmConfig) -> Result<Self, RouteError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| {
                RouteError::ComputationFailed(format!("failed to build client: {err}"))
            })?;

        let base = Url::parse(config.endpoint.trim_end_matches('/')).map_err(|err| {
            RouteError::ComputationFailed(format!("invalid OSRM endpoint: {err}"))
        })?;

        Ok(Self {
            client,
            base,
            profile: config.profile,
        })
    }

    /// Build the request URL for a start/destination pair.
    pub fn route_url(&self, start: Position, destination: Position) -> Result<Url, RouteError> {
        let path = format!(
            "route/v1/{}/{:.6},{:.6};{:.6},{:.6}",
            self.profile,
            start.longitude,
            start.latitude,
            destination.longitude,
            destination.latitude
        );

        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RouteError::ComputationFailed("OSRM endpoint cannot be a base".into()))?
            .pop_if_empty()
            .extend(path.split('/'));
        url.query_pairs_mut()
            .append_pair("overview", "false")
            .append_pair("alternatives", "false")
            .append_pair("steps", "false");

        Ok(url)
    }
}

impl RouteProvider for OsrmRouteProvider {
    fn compute_route(
        &self,
        start: Position,
        destination: Position,
    ) -> BoxFuture<'static, Result<RouteSummary, RouteError>> {
        let client = self.client.clone();
        let url = self.route_url(start, destination);

        Box::pin(async move {
            let url = url?;
            debug!(url = %url, "Querying OSRM");

            let response = client
                .get(url)
                .send()
                .await
                .map_err(|err| RouteError::ComputationFailed(err.to_string()))?;

            let parsed: OsrmRouteResponse = response
                .json()
                .await
                .map_err(|err| RouteError::ComputationFailed(err.to_string()))?;

            parse_route_response(parsed)
        })
    }
}

#[derive(Debug, Deserialize)]
struct OsrmRouteResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    distance: f64,
    duration: f64,
}

fn parse_route_response(response: OsrmRouteResponse) -> Result<RouteSummary, RouteError> {
    match response.code.as_str() {
        "Ok" => response
            .routes
            .first()
            .map(|route| RouteSummary {
                distance_m: route.distance,
                duration_s: route.duration,
            })
            .ok_or(RouteError::NoRouteFound),
        "NoRoute" | "NoSegment" => Err(RouteError::NoRouteFound),
        code => Err(RouteError::ComputationFailed(match response.message {
            Some(message) => format!("OSRM returned {code}: {message}"),
            None => format!("OSRM returned {code}"),
        })),
    }
}
