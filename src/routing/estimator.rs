use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::RouteConfig;
use super::error::RouteError;
use super::{RouteEstimate, RouteProvider, RouteRequest};
use crate::position::Position;
use crate::state_machine::StateMachine;
use crate::state_machine::route::{RouteArbiter, RouteInput, RouteOutput};

/// Issues route requests to a [`RouteProvider`] and keeps the freshest accepted estimate.
///
/// Requests run on their own tasks so callers never block on the provider. Each request carries
/// a sequence number; when it resolves, the shared [`RouteArbiter`] decides whether the result
/// may replace the stored estimate. Observers follow accepted estimates through
/// [`estimates`](Self::estimates).
pub struct RouteEstimator {
    provider: Arc<dyn RouteProvider>,
    arbiter: Arc<Mutex<RouteArbiter>>,
    estimates: Arc<watch::Sender<Option<RouteEstimate>>>,
}

impl std::fmt::Debug for RouteEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteEstimator")
            .field("provider", &"<RouteProvider>")
            .field("arbiter", &self.arbiter)
            .finish()
    }
}

impl RouteEstimator {
    pub fn new(provider: Arc<dyn RouteProvider>, config: RouteConfig) -> Self {
        let (estimates, _) = watch::channel(None);
        Self {
            provider,
            arbiter: Arc::new(Mutex::new(RouteArbiter::new(config.min_delta_deg))),
            estimates: Arc::new(estimates),
        }
    }

    /// Request a route unconditionally, superseding any request still in flight.
    pub fn request_route(&self, start: Position, destination: Position) -> PendingRoute {
        let sequence = {
            let mut arbiter = self.lock();
            arbiter.process_input(RouteInput::Request { start, destination });
            drain(&mut arbiter);
            arbiter.last_issued()
        };

        self.spawn(RouteRequest {
            start,
            destination,
            sequence,
        })
    }

    /// Request a route only if either endpoint moved by more than the configured minimum delta
    /// since the last request.
    pub fn update_endpoints(&self, start: Position, destination: Position) -> Option<PendingRoute> {
        let request = {
            let mut arbiter = self.lock();
            let before = arbiter.last_issued();
            arbiter.process_input(RouteInput::Endpoints { start, destination });
            drain(&mut arbiter);

            (arbiter.last_issued() != before).then(|| RouteRequest {
                start,
                destination,
                sequence: arbiter.last_issued(),
            })
        };

        request.map(|request| self.spawn(request))
    }

    /// Drop the stored estimate because an endpoint became unavailable. Requests in flight are
    /// ignored when they resolve.
    pub fn clear(&self) {
        let mut arbiter = self.lock();
        arbiter.process_input(RouteInput::Clear);
        drain(&mut arbiter);
        self.estimates.send_replace(None);
        debug!("Route estimate cleared");
    }

    /// The last accepted estimate.
    pub fn estimate(&self) -> Option<RouteEstimate> {
        self.lock().estimate()
    }

    pub fn estimates(&self) -> watch::Receiver<Option<RouteEstimate>> {
        self.estimates.subscribe()
    }

    fn spawn(&self, request: RouteRequest) -> PendingRoute {
        let provider = Arc::clone(&self.provider);
        let arbiter = Arc::clone(&self.arbiter);
        let estimates = Arc::clone(&self.estimates);
        let sequence = request.sequence;

        info!(
            sequence,
            start = %request.start,
            destination = %request.destination,
            "Requesting route"
        );

        let handle = tokio::spawn(async move {
            let result = provider
                .compute_route(request.start, request.destination)
                .await
                .and_then(RouteEstimate::try_from);

            resolve(&arbiter, &estimates, sequence, result)
        });

        PendingRoute { sequence, handle }
    }

    fn lock(&self) -> MutexGuard<'_, RouteArbiter> {
        self.arbiter.lock().expect("route arbiter lock poisoned")
    }
}

/// Feed a provider result into the arbiter and translate its verdict for the caller.
///
/// The estimate watch is updated while the arbiter lock is held so that observers can never see
/// an older accepted estimate after a newer one.
fn resolve(
    arbiter: &Mutex<RouteArbiter>,
    estimates: &watch::Sender<Option<RouteEstimate>>,
    sequence: u64,
    result: Result<RouteEstimate, RouteError>,
) -> Result<RouteEstimate, RouteError> {
    let mut arbiter = arbiter.lock().expect("route arbiter lock poisoned");
    arbiter.process_input(RouteInput::Resolved { sequence, result });

    let mut resolution = None;
    for output in drain(&mut arbiter) {
        match output {
            RouteOutput::Accepted { estimate, .. } => {
                debug!(
                    sequence,
                    distance_m = estimate.distance_m,
                    eta_s = estimate.eta_s,
                    "Route estimate accepted"
                );
                estimates.send_replace(Some(estimate));
                resolution = Some(Ok(estimate));
            }
            RouteOutput::Failed { error, .. } => {
                warn!(sequence, error = %error, "Route request failed, keeping previous estimate");
                resolution = Some(Err(error));
            }
            RouteOutput::Discarded { current, .. } => {
                resolution = Some(Err(RouteError::Superseded { sequence, current }));
            }
            RouteOutput::Dispatch(_) | RouteOutput::Cleared => {}
        }
    }

    resolution.unwrap_or(Err(RouteError::Superseded {
        sequence,
        current: arbiter.last_issued(),
    }))
}

fn drain(arbiter: &mut RouteArbiter) -> Vec<RouteOutput> {
    std::iter::from_fn(|| arbiter.poll_output()).collect()
}

/// A route request in flight.
///
/// Resolves to the accepted estimate, the provider's failure, or
/// [`RouteError::Superseded`] when a newer request made this one stale.
/// [`cancel`](Self::cancel) is advisory: it stops the local task, and a late result would have
/// been discarded by sequence anyway.
#[derive(Debug)]
pub struct PendingRoute {
    sequence: u64,
    handle: JoinHandle<Result<RouteEstimate, RouteError>>,
}

impl PendingRoute {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Future for PendingRoute {
    type Output = Result<RouteEstimate, RouteError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let sequence = self.sequence;
        Pin::new(&mut self.handle)
            .poll(cx)
            .map(|joined| joined.unwrap_or(Err(RouteError::Cancelled { sequence })))
    }
}
