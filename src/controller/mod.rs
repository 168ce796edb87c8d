//! Role selection and the broadcasting and tracking sessions behind it.
//!
//! A device is either the vehicle sharing its position (the broadcaster) or a rider following it
//! (the listener). The [`ModeController`] owns the collaborators for both, runs at most one
//! session at a time, and exposes everything the presentation layer shows through
//! [`CoreSnapshot`]s.

mod broadcast;
mod clock;
pub mod config;
pub mod error;
mod tracking;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{info, warn};

use self::broadcast::BroadcastSession;
use self::tracking::TrackingSession;
use crate::position::{MovementStatus, Position};
use crate::routing::{RouteEstimate, RouteEstimator, RouteProvider};
use crate::sampler::PositionSampler;
use crate::session::SessionRegistry;
use crate::sync::{BroadcasterLink, ListenerConnectivity, RealtimeStore, SyncChannel};

pub use self::config::CoreConfig;
pub use self::error::ControllerError;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Shares this device's position as the vehicle.
    Broadcaster,
    /// Follows a broadcaster and estimates its arrival.
    Listener,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Broadcaster => f.write_str("broadcaster"),
            Role::Listener => f.write_str("listener"),
        }
    }
}

/// Where a listener wants the broadcaster to arrive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Destination {
    /// A fixed stop.
    Fixed(Position),
    /// The rider's own live position.
    Rider,
}

/// Everything the presentation layer renders, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoreSnapshot {
    pub role: Option<Role>,
    /// Whether a broadcasting or tracking session is running.
    pub active: bool,
    pub status: MovementStatus,
    pub broadcaster_position: Option<Position>,
    pub rider_position: Option<Position>,
    pub estimate: Option<RouteEstimate>,
    /// Outcome of the broadcaster's latest publish.
    pub link: BroadcasterLink,
    /// State of the listener's subscription.
    pub channel: ListenerConnectivity,
    /// Soft problem worth showing, e.g. a failed route request.
    pub warning: Option<String>,
    /// Why the last session ended on its own.
    pub fault: Option<String>,
}

struct RunningSession {
    role: Role,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ModeController {
    config: CoreConfig,
    channel: SyncChannel,
    sampler: Arc<PositionSampler>,
    estimator: Arc<RouteEstimator>,
    registry: SessionRegistry,
    snapshot: Arc<watch::Sender<CoreSnapshot>>,
    role: Option<Role>,
    session: Option<RunningSession>,
}

impl fmt::Debug for ModeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeController")
            .field("entity_id", &self.config.entity_id)
            .field("role", &self.role)
            .field("session", &self.session.as_ref().map(|session| session.role))
            .finish()
    }
}

impl ModeController {
    pub fn new(
        config: CoreConfig,
        sampler: PositionSampler,
        store: Arc<dyn RealtimeStore>,
        provider: Arc<dyn RouteProvider>,
    ) -> Self {
        let channel = SyncChannel::new(store, config.table.as_str());
        let estimator = RouteEstimator::new(provider, config.route.clone());
        let (snapshot, _) = watch::channel(CoreSnapshot::default());

        Self {
            config,
            channel,
            sampler: Arc::new(sampler),
            estimator: Arc::new(estimator),
            registry: SessionRegistry::new(),
            snapshot: Arc::new(snapshot),
            role: None,
            session: None,
        }
    }

    /// Share session bookkeeping with other controllers in the same process.
    pub fn with_registry(mut self, registry: SessionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn is_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.handle.is_finished())
    }

    pub fn snapshot(&self) -> CoreSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Every snapshot from now on, starting with the current one.
    pub fn snapshots(&self) -> WatchStream<CoreSnapshot> {
        WatchStream::new(self.snapshot.subscribe())
    }

    /// Switch to `role`, stopping whatever session the previous role was running.
    pub async fn select_role(&mut self, role: Role) {
        if self.role == Some(role) {
            return;
        }

        self.stop_session().await;
        self.role = Some(role);
        self.snapshot.send_replace(CoreSnapshot {
            role: Some(role),
            ..CoreSnapshot::default()
        });
        info!(entity_id = %self.config.entity_id, role = %role, "Role selected");
    }

    /// Leave the current role, stopping its session.
    pub async fn clear_role(&mut self) {
        self.stop_session().await;
        self.role = None;
        self.snapshot.send_replace(CoreSnapshot::default());
        info!(entity_id = %self.config.entity_id, "Role cleared");
    }

    /// Start sharing this device's position.
    pub fn start_broadcasting(&mut self) -> Result<(), ControllerError> {
        self.require_role(Role::Broadcaster)?;
        self.reap_finished();

        let guard = self
            .registry
            .create_session(&self.config.entity_id, Role::Broadcaster)?;
        let subscription = self.sampler.start()?;

        self.snapshot.send_modify(|snapshot| {
            snapshot.active = true;
            snapshot.status = MovementStatus::Idle;
            snapshot.link = BroadcasterLink::Unknown;
            snapshot.warning = None;
            snapshot.fault = None;
        });

        let session = BroadcastSession {
            entity_id: self.config.entity_id.clone(),
            channel: self.channel.clone(),
            movement: self.config.movement.clone(),
            snapshot: Arc::clone(&self.snapshot),
            subscription,
            guard,
        };

        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(session.run(stopped));
        self.session = Some(RunningSession {
            role: Role::Broadcaster,
            stop,
            handle,
        });

        info!(entity_id = %self.config.entity_id, "Broadcasting started");
        Ok(())
    }

    /// Stop sharing. Publishes a final idle record before returning. A no-op when not
    /// broadcasting.
    pub async fn stop_broadcasting(&mut self) {
        if self.running_role() == Some(Role::Broadcaster) {
            self.stop_session().await;
        }
    }

    /// Start following the configured broadcaster towards `destination`.
    pub async fn start_tracking(
        &mut self,
        destination: Destination,
    ) -> Result<(), ControllerError> {
        self.require_role(Role::Listener)?;
        self.reap_finished();

        let guard = self
            .registry
            .create_session(&self.config.entity_id, Role::Listener)?;
        let listener = self.channel.subscribe(&self.config.entity_id).await?;
        let subscription = self.sampler.start()?;

        self.snapshot.send_modify(|snapshot| {
            snapshot.active = true;
            snapshot.channel = ListenerConnectivity::Unknown;
            snapshot.estimate = None;
            snapshot.warning = None;
            snapshot.fault = None;
        });

        let session = TrackingSession {
            destination,
            listener,
            subscription,
            estimator: Arc::clone(&self.estimator),
            snapshot: Arc::clone(&self.snapshot),
            guard,
        };

        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(session.run(stopped));
        self.session = Some(RunningSession {
            role: Role::Listener,
            stop,
            handle,
        });

        info!(entity_id = %self.config.entity_id, ?destination, "Tracking started");
        Ok(())
    }

    /// Stop following. A no-op when not tracking.
    pub async fn stop_tracking(&mut self) {
        if self.running_role() == Some(Role::Listener) {
            self.stop_session().await;
        }
    }

    fn require_role(&self, expected: Role) -> Result<(), ControllerError> {
        if self.role == Some(expected) {
            Ok(())
        } else {
            Err(ControllerError::RoleNotSelected { expected })
        }
    }

    fn running_role(&self) -> Option<Role> {
        self.session.as_ref().map(|session| session.role)
    }

    fn reap_finished(&mut self) {
        if self
            .session
            .as_ref()
            .is_some_and(|session| session.handle.is_finished())
        {
            self.session = None;
        }
    }

    async fn stop_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let _ = session.stop.send(());
        if let Err(err) = session.handle.await {
            warn!(role = %session.role, error = %err, "Session task ended abnormally");
        }
        info!(entity_id = %self.config.entity_id, role = %session.role, "Session stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::StreamExt;
    use futures::future::{self, BoxFuture};

    use super::*;
    use crate::entity::EntityId;
    use crate::position::Timestamp;
    use crate::routing::RouteSummary;
    use crate::routing::error::RouteError;
    use crate::sampler::scripted::{ScriptStep, ScriptedSource};
    use crate::sampler::{LocationError, SamplerOptions};
    use crate::sync::memory::MemoryStore;

    const TABLE: &str = "bus_locations";
    const DEPOT: Position = Position::new(5.6037, -0.1870);
    const JUNCTION: Position = Position::new(5.6043, -0.1870);
    const NEAR_JUNCTION: Position = Position::new(5.60431, -0.1870);
    const RIDER: Position = Position::new(5.6100, -0.1800);
    const STOP: Position = Position::new(5.6080, -0.1820);

    /// Answers every request with the same result and remembers the endpoints it was asked for.
    struct RecordingProvider {
        result: Result<RouteSummary, RouteError>,
        requests: Mutex<Vec<(Position, Position)>>,
    }

    impl RecordingProvider {
        fn new(result: Result<RouteSummary, RouteError>) -> Arc<Self> {
            Arc::new(Self {
                result,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<(Position, Position)> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl RouteProvider for RecordingProvider {
        fn compute_route(
            &self,
            start: Position,
            destination: Position,
        ) -> BoxFuture<'static, Result<RouteSummary, RouteError>> {
            self.requests.lock().unwrap().push((start, destination));
            Box::pin(future::ready(self.result.clone()))
        }
    }

    fn ok_route() -> Arc<RecordingProvider> {
        RecordingProvider::new(Ok(RouteSummary {
            distance_m: 1_250.0,
            duration_s: 240.0,
        }))
    }

    fn fix(at_ms: u64, position: Position) -> ScriptStep {
        ScriptStep::fix(Duration::from_millis(at_ms), position)
    }

    fn controller(
        store: &Arc<MemoryStore>,
        provider: Arc<RecordingProvider>,
        steps: Vec<ScriptStep>,
    ) -> ModeController {
        let sampler = PositionSampler::new(
            Arc::new(ScriptedSource::new(steps)),
            SamplerOptions::default(),
        );
        ModeController::new(CoreConfig::default(), sampler, store.clone(), provider)
    }

    fn bus() -> EntityId {
        EntityId::try_from("bus-1").unwrap()
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_session_publishes_status_timeline() {
        let store = Arc::new(MemoryStore::new());
        let mut controller = controller(
            &store,
            ok_route(),
            vec![
                fix(0, DEPOT),
                fix(500, JUNCTION),
                fix(1_000, NEAR_JUNCTION),
                fix(60_000, NEAR_JUNCTION),
            ],
        );

        controller.select_role(Role::Broadcaster).await;
        controller.start_broadcasting().unwrap();

        advance(700).await;
        let snapshot = controller.snapshot();
        assert!(snapshot.active);
        assert_eq!(snapshot.status, MovementStatus::Moving);
        assert_eq!(snapshot.link, BroadcasterLink::Connected);
        assert_eq!(snapshot.broadcaster_position, Some(JUNCTION));
        assert_eq!(store.latest(TABLE, &bus()).unwrap().status, MovementStatus::Moving);

        advance(5_000).await;
        assert_eq!(controller.snapshot().status, MovementStatus::Moving);

        advance(500).await;
        assert_eq!(controller.snapshot().status, MovementStatus::Stopped);
        assert_eq!(store.latest(TABLE, &bus()).unwrap().status, MovementStatus::Stopped);

        controller.stop_broadcasting().await;
        let snapshot = controller.snapshot();
        assert!(!snapshot.active);
        assert_eq!(snapshot.status, MovementStatus::Idle);
        assert_eq!(snapshot.fault, None);

        let last = store.latest(TABLE, &bus()).unwrap();
        assert_eq!(last.status, MovementStatus::Idle);
        assert_eq!(last.position, NEAR_JUNCTION);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_location_error_ends_session() {
        let store = Arc::new(MemoryStore::new());
        let mut controller = controller(
            &store,
            ok_route(),
            vec![
                fix(0, DEPOT),
                fix(500, JUNCTION),
                ScriptStep::fail(Duration::from_millis(800), LocationError::PermissionDenied),
            ],
        );

        controller.select_role(Role::Broadcaster).await;
        controller.start_broadcasting().unwrap();
        advance(1_000).await;

        let snapshot = controller.snapshot();
        assert!(!snapshot.active);
        assert!(!controller.is_active());
        assert_eq!(snapshot.status, MovementStatus::Idle);
        assert_eq!(
            snapshot.fault,
            Some(LocationError::PermissionDenied.to_string())
        );
        assert_eq!(store.latest(TABLE, &bus()).unwrap().status, MovementStatus::Idle);

        controller.start_broadcasting().unwrap();
        assert!(controller.snapshot().active);
        assert_eq!(controller.snapshot().fault, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_flags_link_only() {
        let store = Arc::new(MemoryStore::new());
        store.set_rejecting(true);
        let mut controller = controller(
            &store,
            ok_route(),
            vec![fix(0, DEPOT), fix(500, JUNCTION), fix(1_000, DEPOT), fix(60_000, DEPOT)],
        );

        controller.select_role(Role::Broadcaster).await;
        controller.start_broadcasting().unwrap();

        advance(700).await;
        let snapshot = controller.snapshot();
        assert!(snapshot.active);
        assert_eq!(snapshot.link, BroadcasterLink::Disconnected);
        assert_eq!(snapshot.status, MovementStatus::Moving);
        assert_eq!(snapshot.channel, ListenerConnectivity::Unknown);

        store.set_rejecting(false);
        advance(500).await;
        assert_eq!(controller.snapshot().link, BroadcasterLink::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_require_matching_role() {
        let store = Arc::new(MemoryStore::new());
        let mut controller = controller(&store, ok_route(), vec![fix(0, DEPOT)]);

        assert!(matches!(
            controller.start_broadcasting(),
            Err(ControllerError::RoleNotSelected {
                expected: Role::Broadcaster
            })
        ));

        controller.select_role(Role::Broadcaster).await;
        assert!(matches!(
            controller.start_tracking(Destination::Rider).await,
            Err(ControllerError::RoleNotSelected {
                expected: Role::Listener
            })
        ));

        controller.stop_tracking().await;
        controller.stop_broadcasting().await;
        assert!(!controller.snapshot().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_role_stops_broadcast() {
        let store = Arc::new(MemoryStore::new());
        let mut controller = controller(
            &store,
            ok_route(),
            vec![fix(0, DEPOT), fix(500, JUNCTION), fix(60_000, JUNCTION)],
        );

        controller.select_role(Role::Broadcaster).await;
        controller.start_broadcasting().unwrap();
        advance(700).await;

        controller.select_role(Role::Listener).await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.role, Some(Role::Listener));
        assert!(!snapshot.active);
        assert_eq!(store.latest(TABLE, &bus()).unwrap().status, MovementStatus::Idle);

        controller.clear_role().await;
        assert_eq!(controller.snapshot(), CoreSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_broadcast_session_per_entity() {
        let store = Arc::new(MemoryStore::new());
        let registry = SessionRegistry::new();
        let mut first = controller(&store, ok_route(), vec![fix(0, DEPOT), fix(60_000, DEPOT)])
            .with_registry(registry.clone());
        let mut second = controller(&store, ok_route(), vec![fix(0, DEPOT), fix(60_000, DEPOT)])
            .with_registry(registry.clone());

        first.select_role(Role::Broadcaster).await;
        second.select_role(Role::Broadcaster).await;
        first.start_broadcasting().unwrap();

        assert!(matches!(
            second.start_broadcasting(),
            Err(ControllerError::SessionActive(_))
        ));

        first.stop_broadcasting().await;
        assert!(!registry.has_active_session(&bus(), Role::Broadcaster));
        assert!(second.start_broadcasting().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_estimates_route_to_rider() {
        let store = Arc::new(MemoryStore::new());
        let provider = ok_route();
        let channel = SyncChannel::new(store.clone(), TABLE);
        channel
            .publish_at(&bus(), DEPOT, MovementStatus::Moving, Timestamp::from_millis(1))
            .await
            .unwrap();

        let mut controller = controller(
            &store,
            provider.clone(),
            vec![fix(0, RIDER), fix(60_000, RIDER)],
        );
        controller.select_role(Role::Listener).await;
        controller.start_tracking(Destination::Rider).await.unwrap();
        advance(100).await;

        let snapshot = controller.snapshot();
        assert!(snapshot.active);
        assert_eq!(snapshot.channel, ListenerConnectivity::Connected);
        assert_eq!(snapshot.status, MovementStatus::Moving);
        assert_eq!(snapshot.broadcaster_position, Some(DEPOT));
        assert_eq!(snapshot.rider_position, Some(RIDER));
        assert_eq!(snapshot.estimate, Some(RouteEstimate::new(1_250.0, 240.0)));
        assert_eq!(provider.requests(), vec![(DEPOT, RIDER)]);

        channel
            .publish_at(&bus(), JUNCTION, MovementStatus::Moving, Timestamp::from_millis(2))
            .await
            .unwrap();
        advance(100).await;
        assert_eq!(controller.snapshot().broadcaster_position, Some(JUNCTION));
        assert_eq!(provider.requests(), vec![(DEPOT, RIDER), (JUNCTION, RIDER)]);

        controller.stop_tracking().await;
        let snapshot = controller.snapshot();
        assert!(!snapshot.active);
        assert_eq!(snapshot.estimate, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_fixed_stop_waits_for_rider_fix() {
        let store = Arc::new(MemoryStore::new());
        let provider = ok_route();
        let channel = SyncChannel::new(store.clone(), TABLE);
        channel
            .publish_at(&bus(), DEPOT, MovementStatus::Stopped, Timestamp::from_millis(1))
            .await
            .unwrap();

        let mut controller = controller(
            &store,
            provider.clone(),
            vec![fix(1_000, RIDER), fix(60_000, RIDER)],
        );
        controller.select_role(Role::Listener).await;
        controller
            .start_tracking(Destination::Fixed(STOP))
            .await
            .unwrap();

        advance(500).await;
        assert!(provider.requests().is_empty());
        assert_eq!(controller.snapshot().estimate, None);

        advance(1_000).await;
        assert_eq!(provider.requests(), vec![(DEPOT, STOP)]);
        assert!(controller.snapshot().estimate.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_failure_is_a_warning() {
        let store = Arc::new(MemoryStore::new());
        let channel = SyncChannel::new(store.clone(), TABLE);
        channel
            .publish_at(&bus(), DEPOT, MovementStatus::Moving, Timestamp::from_millis(1))
            .await
            .unwrap();

        let mut controller = controller(
            &store,
            RecordingProvider::new(Err(RouteError::NoRouteFound)),
            vec![fix(0, RIDER), fix(60_000, RIDER)],
        );
        controller.select_role(Role::Listener).await;
        controller.start_tracking(Destination::Rider).await.unwrap();
        advance(100).await;

        let snapshot = controller.snapshot();
        assert!(snapshot.active);
        assert_eq!(snapshot.warning, Some(RouteError::NoRouteFound.to_string()));
        assert_eq!(snapshot.fault, None);
        assert_eq!(snapshot.estimate, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_loss_clears_estimate() {
        let store = Arc::new(MemoryStore::new());
        let channel = SyncChannel::new(store.clone(), TABLE);
        channel
            .publish_at(&bus(), DEPOT, MovementStatus::Moving, Timestamp::from_millis(1))
            .await
            .unwrap();

        let mut controller = controller(
            &store,
            ok_route(),
            vec![fix(0, RIDER), fix(60_000, RIDER)],
        );
        let mut snapshots = controller.snapshots();
        controller.select_role(Role::Listener).await;
        controller.start_tracking(Destination::Rider).await.unwrap();
        advance(100).await;
        assert!(controller.snapshot().estimate.is_some());

        store.disconnect_all("relay restarted");
        advance(100).await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.channel, ListenerConnectivity::Disconnected);
        assert_eq!(snapshot.estimate, None);
        assert!(!snapshot.active);
        assert!(snapshot.fault.is_some());

        let latest = snapshots.next().await.unwrap();
        assert_eq!(latest, snapshot);
    }
}
