use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::{CoreSnapshot, Destination};
use crate::position::Position;
use crate::routing::error::RouteError;
use crate::routing::{RouteEstimate, RouteEstimator};
use crate::sampler::SampleSubscription;
use crate::session::SessionGuard;
use crate::sync::error::SyncError;
use crate::sync::{Listener, ListenerConnectivity, ListenerEvent};

/// A running tracking session: broadcaster records and the rider's own fixes into the route
/// estimator.
pub(super) struct TrackingSession {
    pub destination: Destination,
    pub listener: Listener,
    pub subscription: SampleSubscription,
    pub estimator: Arc<RouteEstimator>,
    pub snapshot: Arc<watch::Sender<CoreSnapshot>>,
    pub guard: SessionGuard,
}

#[derive(Debug, Default)]
struct Endpoints {
    broadcaster: Option<Position>,
    rider: Option<Position>,
}

impl TrackingSession {
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let (routes_tx, mut routes) = mpsc::unbounded_channel();
        let mut endpoints = Endpoints::default();

        info!(
            entity_id = %self.listener.entity_id(),
            session_id = %self.guard.session_id(),
            "Tracking session running"
        );

        let fault = loop {
            tokio::select! {
                _ = &mut stop => break None,

                event = self.listener.next() => match event {
                    Some(ListenerEvent::Record(record)) => {
                        endpoints.broadcaster = Some(record.position);
                        self.snapshot.send_modify(|snapshot| {
                            snapshot.broadcaster_position = Some(record.position);
                            snapshot.status = record.status;
                        });
                        self.request_route(&endpoints, &routes_tx);
                    }
                    Some(ListenerEvent::Connectivity(connectivity)) => {
                        self.snapshot.send_modify(|snapshot| snapshot.channel = connectivity);
                        if connectivity == ListenerConnectivity::Disconnected {
                            self.drop_estimate(self.disconnected("subscription lost"));
                        }
                    }
                    None => break Some(self.disconnected("subscription ended")),
                },

                event = self.subscription.next() => match event {
                    Some(Ok(sample)) => {
                        endpoints.rider = Some(sample.position);
                        self.snapshot.send_modify(|snapshot| {
                            snapshot.rider_position = Some(sample.position);
                        });
                        self.request_route(&endpoints, &routes_tx);
                    }
                    Some(Err(err)) if err.is_terminal() => break Some(err.to_string()),
                    Some(Err(err)) => {
                        warn!(error = %err, "Rider location update failed");
                        self.snapshot
                            .send_modify(|snapshot| snapshot.warning = Some(err.to_string()));
                    }
                    None => break Some("location source closed".to_string()),
                },

                Some(result) = routes.recv() => self.apply_route(result),
            }
        };

        self.listener.unsubscribe();
        self.subscription.stop();
        self.estimator.clear();

        match &fault {
            Some(reason) => warn!(
                entity_id = %self.listener.entity_id(),
                reason,
                "Tracking session ended"
            ),
            None => info!(entity_id = %self.listener.entity_id(), "Tracking session ended"),
        }

        self.snapshot.send_modify(|snapshot| {
            snapshot.active = false;
            snapshot.estimate = None;
            snapshot.fault = fault;
        });
    }

    /// Ask for a new route once both ends are known. Route requests need the rider's position
    /// even when heading for a fixed stop.
    fn request_route(
        &self,
        endpoints: &Endpoints,
        routes: &mpsc::UnboundedSender<Result<RouteEstimate, RouteError>>,
    ) {
        let (Some(start), Some(rider)) = (endpoints.broadcaster, endpoints.rider) else {
            return;
        };

        let destination = match self.destination {
            Destination::Fixed(stop) => stop,
            Destination::Rider => rider,
        };

        if let Some(pending) = self.estimator.update_endpoints(start, destination) {
            let routes = routes.clone();
            tokio::spawn(async move {
                let _ = routes.send(pending.await);
            });
        }
    }

    fn apply_route(&self, result: Result<RouteEstimate, RouteError>) {
        match result {
            Ok(estimate) => self.snapshot.send_modify(|snapshot| {
                snapshot.estimate = Some(estimate);
                snapshot.warning = None;
            }),
            Err(err) if err.is_warning() => {
                self.snapshot
                    .send_modify(|snapshot| snapshot.warning = Some(err.to_string()));
            }
            Err(err) => debug!(error = %err, "Ignoring route result"),
        }
    }

    fn drop_estimate(&self, warning: String) {
        self.estimator.clear();
        self.snapshot.send_modify(|snapshot| {
            snapshot.estimate = None;
            snapshot.warning = Some(warning);
        });
    }

    fn disconnected(&self, reason: &str) -> String {
        SyncError::ChannelDisconnected {
            entity_id: self.listener.entity_id().clone(),
            reason: reason.to_string(),
        }
        .to_string()
    }
}
