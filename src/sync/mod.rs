//! Publish/subscribe mirroring of a broadcaster's position and status to listeners.
//!
//! The [`SyncChannel`] sits on top of an injected [`RealtimeStore`]. Broadcasters
//! [`publish`](SyncChannel::publish) records keyed by entity id; listeners
//! [`subscribe`](SyncChannel::subscribe) to one entity and receive its records together with a
//! connectivity signal.
//!
//! Each role has its own connectivity signal and the two are never merged: a broadcaster tracks
//! [`BroadcasterLink`] from the outcome of its publishes, a listener tracks
//! [`ListenerConnectivity`] from its subscription.

pub mod error;
mod listener;
pub mod memory;
pub mod moq;
pub mod wire;

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use self::error::{StoreError, SyncError};
use crate::entity::EntityId;
use crate::position::{MovementStatus, Position, Timestamp};
use crate::state_machine::wrappers::input::SystemResource;

pub use listener::{Listener, ListenerConnectivity, ListenerEvent, ListenerState};

/// The single row a broadcaster publishes and its listeners consume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BroadcastRecord {
    #[serde(serialize_with = "serialize_entity_id")]
    pub entity_id: EntityId,
    pub position: Position,
    pub status: MovementStatus,
    pub updated_at: Timestamp,
}

fn serialize_entity_id<S: serde::Serializer>(id: &EntityId, ser: S) -> Result<S::Ok, S::Error> {
    ser.serialize_str(id.as_str())
}

/// Which rows a subscription wants to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityFilter {
    All,
    Entity(EntityId),
}

impl EntityFilter {
    pub fn matches(&self, entity_id: &EntityId) -> bool {
        match self {
            EntityFilter::All => true,
            EntityFilter::Entity(wanted) => wanted == entity_id,
        }
    }
}

/// Status of a store subscription as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// The store acknowledged the subscription as active.
    Subscribed,
    /// The subscription failed or was lost.
    Error(String),
    /// The store closed the subscription.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Status(SubscriptionStatus),
    Change(BroadcastRecord),
}

/// Receiving end of a store subscription. Dropping it ends the subscription.
#[derive(Debug)]
pub struct StoreSubscription {
    pub events: mpsc::UnboundedReceiver<StoreEvent>,
}

/// A realtime data store with upsert and change subscriptions.
///
/// Returned futures are `'static` so callers can drive them on separate tasks.
pub trait RealtimeStore: Send + Sync + 'static {
    fn upsert(
        &self,
        table: &str,
        record: &BroadcastRecord,
    ) -> BoxFuture<'static, Result<(), StoreError>>;

    fn subscribe(
        &self,
        table: &str,
        filter: EntityFilter,
    ) -> BoxFuture<'static, Result<StoreSubscription, StoreError>>;
}

/// Broadcaster-side connectivity, derived from the outcome of publishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcasterLink {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

/// A named topic over a [`RealtimeStore`].
///
/// Cloning is cheap and clones share the per-entity `updated_at` watermark, so every publish for
/// an entity through any clone is stamped no earlier than the previous one.
#[derive(Clone)]
pub struct SyncChannel {
    store: Arc<dyn RealtimeStore>,
    table: Arc<str>,
    stamps: Arc<DashMap<EntityId, Timestamp, ahash::RandomState>>,
}

impl std::fmt::Debug for SyncChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncChannel")
            .field("store", &"<RealtimeStore>")
            .field("table", &self.table)
            .finish()
    }
}

impl SyncChannel {
    pub fn new(store: Arc<dyn RealtimeStore>, table: impl Into<Arc<str>>) -> Self {
        Self {
            store,
            table: table.into(),
            stamps: Arc::new(DashMap::default()),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Publish the broadcaster's current position and status, stamped with the wall clock.
    pub async fn publish(
        &self,
        entity_id: &EntityId,
        position: Position,
        status: MovementStatus,
    ) -> Result<BroadcastRecord, SyncError> {
        self.publish_at(entity_id, position, status, Timestamp::generate())
            .await
    }

    /// Publish with an explicit clock reading. The record's `updated_at` is `now`, or the last
    /// stamp for this entity if the clock went backwards.
    pub async fn publish_at(
        &self,
        entity_id: &EntityId,
        position: Position,
        status: MovementStatus,
        now: Timestamp,
    ) -> Result<BroadcastRecord, SyncError> {
        let record = BroadcastRecord {
            entity_id: entity_id.clone(),
            position,
            status,
            updated_at: self.stamp(entity_id, now),
        };

        self.store
            .upsert(&self.table, &record)
            .await
            .map_err(|source| SyncError::BroadcastFailed {
                entity_id: entity_id.clone(),
                source,
            })?;

        debug!(
            entity_id = %entity_id,
            status = %record.status,
            updated_at = %record.updated_at,
            "Published broadcast record"
        );

        Ok(record)
    }

    /// Subscribe to the records of one entity.
    pub async fn subscribe(&self, entity_id: &EntityId) -> Result<Listener, SyncError> {
        let subscription = self
            .store
            .subscribe(&self.table, EntityFilter::Entity(entity_id.clone()))
            .await
            .map_err(|source| SyncError::SubscribeFailed {
                entity_id: entity_id.clone(),
                source,
            })?;

        Ok(Listener::new(entity_id.clone(), subscription))
    }

    fn stamp(&self, entity_id: &EntityId, now: Timestamp) -> Timestamp {
        let mut stamp = self.stamps.entry(entity_id.clone()).or_insert(now);
        if *stamp < now {
            *stamp = now;
        }
        *stamp
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;

    const TABLE: &str = "bus_locations";

    fn channel() -> (Arc<MemoryStore>, SyncChannel) {
        let store = Arc::new(MemoryStore::new());
        let channel = SyncChannel::new(store.clone(), TABLE);
        (store, channel)
    }

    #[tokio::test]
    async fn test_updated_at_never_decreases() {
        let (_, channel) = channel();
        let bus = EntityId::try_from("bus-1").unwrap();
        let here = Position::new(5.6037, -0.1870);

        let first = channel
            .publish_at(&bus, here, MovementStatus::Moving, Timestamp::from_millis(2_000))
            .await
            .unwrap();
        let second = channel
            .publish_at(&bus, here, MovementStatus::Moving, Timestamp::from_millis(1_000))
            .await
            .unwrap();

        assert_eq!(first.updated_at, Timestamp::from_millis(2_000));
        assert_eq!(second.updated_at, Timestamp::from_millis(2_000));
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported() {
        let (store, channel) = channel();
        store.set_rejecting(true);

        let result = channel
            .publish(
                &EntityId::try_from("bus-1").unwrap(),
                Position::new(5.6037, -0.1870),
                MovementStatus::Idle,
            )
            .await;

        assert!(matches!(result, Err(SyncError::BroadcastFailed { .. })));
    }

    #[tokio::test]
    async fn test_listener_receives_published_records() {
        let (_, channel) = channel();
        let bus = EntityId::try_from("bus-1").unwrap();
        let mut listener = channel.subscribe(&bus).await.unwrap();

        assert_eq!(
            listener.next().await,
            Some(ListenerEvent::Connectivity(ListenerConnectivity::Connected))
        );

        let record = channel
            .publish_at(
                &bus,
                Position::new(5.6043, -0.1870),
                MovementStatus::Moving,
                Timestamp::from_millis(500),
            )
            .await
            .unwrap();

        assert_eq!(listener.next().await, Some(ListenerEvent::Record(record.clone())));
        assert_eq!(listener.state().record, Some(record));
    }

    #[tokio::test]
    async fn test_multiple_listeners_and_entity_filtering() {
        let (_, channel) = channel();
        let bus = EntityId::try_from("bus-1").unwrap();
        let other = EntityId::try_from("bus-2").unwrap();

        let mut first = channel.subscribe(&bus).await.unwrap();
        let mut second = channel.subscribe(&bus).await.unwrap();
        let _ = first.next().await;
        let _ = second.next().await;

        channel
            .publish_at(
                &other,
                Position::new(1.0, 1.0),
                MovementStatus::Moving,
                Timestamp::from_millis(1),
            )
            .await
            .unwrap();
        let record = channel
            .publish_at(
                &bus,
                Position::new(5.6037, -0.1870),
                MovementStatus::Stopped,
                Timestamp::from_millis(2),
            )
            .await
            .unwrap();

        assert_eq!(first.next().await, Some(ListenerEvent::Record(record.clone())));
        assert_eq!(second.next().await, Some(ListenerEvent::Record(record)));
    }

    #[tokio::test]
    async fn test_republishing_same_state_only_moves_updated_at() {
        let (_, channel) = channel();
        let bus = EntityId::try_from("bus-1").unwrap();
        let here = Position::new(5.6037, -0.1870);
        let mut listener = channel.subscribe(&bus).await.unwrap();
        let _ = listener.next().await;

        channel
            .publish_at(&bus, here, MovementStatus::Stopped, Timestamp::from_millis(1_000))
            .await
            .unwrap();
        let _ = listener.next().await;
        let before = listener.state().clone();

        channel
            .publish_at(&bus, here, MovementStatus::Stopped, Timestamp::from_millis(2_000))
            .await
            .unwrap();
        let _ = listener.next().await;
        let after = listener.state().clone();

        let before_record = before.record.unwrap();
        let after_record = after.record.unwrap();
        assert_eq!(before.connectivity, after.connectivity);
        assert_eq!(before_record.position, after_record.position);
        assert_eq!(before_record.status, after_record.status);
        assert_eq!(after_record.updated_at, Timestamp::from_millis(2_000));
    }
}
