use futures::Stream;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{BroadcastRecord, StoreEvent, StoreSubscription, SubscriptionStatus};
use crate::entity::EntityId;

/// Whether a listener's subscription is currently live.
///
/// `Unknown` means the store has not yet confirmed the subscription. It is never reported as
/// `Disconnected`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerConnectivity {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

/// What a listener currently believes about the broadcaster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListenerState {
    pub connectivity: ListenerConnectivity,
    pub record: Option<BroadcastRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Connectivity(ListenerConnectivity),
    Record(BroadcastRecord),
}

/// A subscription to one broadcaster's records.
///
/// Records older than the one held are dropped and exact repeats are skipped, so the sequence of
/// [`ListenerEvent::Record`]s is ordered by `updated_at`.
#[derive(Debug)]
pub struct Listener {
    entity_id: EntityId,
    subscription: Option<StoreSubscription>,
    state: ListenerState,
}

impl Listener {
    pub(super) fn new(entity_id: EntityId, subscription: StoreSubscription) -> Self {
        Self {
            entity_id,
            subscription: Some(subscription),
            state: ListenerState::default(),
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn state(&self) -> &ListenerState {
        &self.state
    }

    /// Wait for the next change in connectivity or record.
    ///
    /// Returns `None` after [`unsubscribe`](Self::unsubscribe), or once the store ends the
    /// subscription and the resulting disconnect has been reported. Cancel safe.
    pub async fn next(&mut self) -> Option<ListenerEvent> {
        loop {
            let subscription = self.subscription.as_mut()?;

            let Some(event) = subscription.events.recv().await else {
                self.subscription = None;
                return self.set_connectivity(ListenerConnectivity::Disconnected);
            };

            let update = match event {
                StoreEvent::Status(SubscriptionStatus::Subscribed) => {
                    self.set_connectivity(ListenerConnectivity::Connected)
                }
                StoreEvent::Status(SubscriptionStatus::Error(reason)) => {
                    warn!(entity_id = %self.entity_id, reason, "Subscription error");
                    self.set_connectivity(ListenerConnectivity::Disconnected)
                }
                StoreEvent::Status(SubscriptionStatus::Closed) => {
                    self.set_connectivity(ListenerConnectivity::Disconnected)
                }
                StoreEvent::Change(record) => self.apply(record),
            };

            if update.is_some() {
                return update;
            }
        }
    }

    /// Release the subscription. Calling this more than once is a no-op.
    pub fn unsubscribe(&mut self) {
        if self.subscription.take().is_some() {
            info!(entity_id = %self.entity_id, "Unsubscribed from broadcaster");
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn into_stream(mut self) -> impl Stream<Item = ListenerEvent> + Send {
        async_stream::stream! {
            while let Some(event) = self.next().await {
                yield event;
            }
        }
    }

    fn set_connectivity(&mut self, connectivity: ListenerConnectivity) -> Option<ListenerEvent> {
        if self.state.connectivity == connectivity {
            return None;
        }

        info!(
            entity_id = %self.entity_id,
            connectivity = ?connectivity,
            "Listener connectivity changed"
        );
        self.state.connectivity = connectivity;
        Some(ListenerEvent::Connectivity(connectivity))
    }

    fn apply(&mut self, record: BroadcastRecord) -> Option<ListenerEvent> {
        if record.entity_id != self.entity_id {
            return None;
        }

        if let Some(held) = &self.state.record {
            if record.updated_at < held.updated_at {
                debug!(
                    entity_id = %self.entity_id,
                    updated_at = %record.updated_at,
                    held = %held.updated_at,
                    "Dropping stale record"
                );
                return None;
            }
            if *held == record {
                return None;
            }
        }

        self.state.record = Some(record.clone());
        Some(ListenerEvent::Record(record))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::sync::mpsc;

    use super::*;
    use crate::position::{MovementStatus, Position, Timestamp};

    fn record(updated_at: u64, status: MovementStatus) -> BroadcastRecord {
        BroadcastRecord {
            entity_id: EntityId::try_from("bus-1").unwrap(),
            position: Position::new(5.6037, -0.1870),
            status,
            updated_at: Timestamp::from_millis(updated_at),
        }
    }

    fn listener() -> (mpsc::UnboundedSender<StoreEvent>, Listener) {
        let (tx, events) = mpsc::unbounded_channel();
        let listener = Listener::new(
            EntityId::try_from("bus-1").unwrap(),
            StoreSubscription { events },
        );
        (tx, listener)
    }

    #[tokio::test]
    async fn test_unknown_until_subscribed() {
        let (tx, mut listener) = listener();
        assert_eq!(listener.state().connectivity, ListenerConnectivity::Unknown);

        tx.send(StoreEvent::Change(record(1, MovementStatus::Moving)))
            .unwrap();
        assert!(matches!(listener.next().await, Some(ListenerEvent::Record(_))));
        assert_eq!(listener.state().connectivity, ListenerConnectivity::Unknown);

        tx.send(StoreEvent::Status(SubscriptionStatus::Subscribed))
            .unwrap();
        assert_eq!(
            listener.next().await,
            Some(ListenerEvent::Connectivity(ListenerConnectivity::Connected))
        );
    }

    #[tokio::test]
    async fn test_error_and_reconnect() {
        let (tx, mut listener) = listener();
        tx.send(StoreEvent::Status(SubscriptionStatus::Subscribed))
            .unwrap();
        tx.send(StoreEvent::Status(SubscriptionStatus::Error("relay gone".into())))
            .unwrap();
        tx.send(StoreEvent::Status(SubscriptionStatus::Error("relay gone".into())))
            .unwrap();
        tx.send(StoreEvent::Status(SubscriptionStatus::Subscribed))
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(listener.next().await.unwrap());
        }

        assert_eq!(
            seen,
            vec![
                ListenerEvent::Connectivity(ListenerConnectivity::Connected),
                ListenerEvent::Connectivity(ListenerConnectivity::Disconnected),
                ListenerEvent::Connectivity(ListenerConnectivity::Connected),
            ]
        );
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_records_are_dropped() {
        let (tx, listener) = listener();
        tx.send(StoreEvent::Change(record(200, MovementStatus::Moving)))
            .unwrap();
        tx.send(StoreEvent::Change(record(100, MovementStatus::Stopped)))
            .unwrap();
        tx.send(StoreEvent::Change(record(200, MovementStatus::Moving)))
            .unwrap();
        tx.send(StoreEvent::Change(record(300, MovementStatus::Stopped)))
            .unwrap();
        drop(tx);

        let events: Vec<_> = listener.into_stream().collect().await;

        assert_eq!(
            events,
            vec![
                ListenerEvent::Record(record(200, MovementStatus::Moving)),
                ListenerEvent::Record(record(300, MovementStatus::Stopped)),
                ListenerEvent::Connectivity(ListenerConnectivity::Disconnected),
            ]
        );
    }

    #[tokio::test]
    async fn test_other_entities_are_ignored() {
        let (tx, mut listener) = listener();
        let mut other = record(1, MovementStatus::Moving);
        other.entity_id = EntityId::try_from("bus-2").unwrap();
        tx.send(StoreEvent::Change(other)).unwrap();
        tx.send(StoreEvent::Change(record(2, MovementStatus::Idle)))
            .unwrap();

        assert_eq!(
            listener.next().await,
            Some(ListenerEvent::Record(record(2, MovementStatus::Idle)))
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (tx, mut listener) = listener();
        listener.unsubscribe();
        listener.unsubscribe();

        assert!(!listener.is_subscribed());
        assert!(tx.is_closed());
        assert_eq!(listener.next().await, None);
    }
}
