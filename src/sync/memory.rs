//! In-process [`RealtimeStore`] used by tests and by single-process demos.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use futures::future::{self, BoxFuture};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::error::StoreError;
use super::{
    BroadcastRecord, EntityFilter, RealtimeStore, StoreEvent, StoreSubscription,
    SubscriptionStatus,
};
use crate::entity::EntityId;

const CHANGE_CAPACITY: usize = 256;

type Change = (Arc<str>, BroadcastRecord);

/// Keeps the latest row per `(table, entity)` and fans changes out to subscribers.
///
/// New subscriptions are acknowledged immediately and replay the rows they match.
#[derive(Debug)]
pub struct MemoryStore {
    rows: DashMap<(Arc<str>, EntityId), BroadcastRecord, ahash::RandomState>,
    changes: broadcast::Sender<Change>,
    faults: broadcast::Sender<String>,
    rejecting: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let (faults, _) = broadcast::channel(8);
        Self {
            rows: DashMap::default(),
            changes,
            faults,
            rejecting: AtomicBool::new(false),
        }
    }

    /// Make every upsert fail until switched back.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::Release);
    }

    /// Drop every live subscription with an error.
    pub fn disconnect_all(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason, "Disconnecting all subscriptions");
        let _ = self.faults.send(reason);
    }

    pub fn latest(&self, table: &str, entity_id: &EntityId) -> Option<BroadcastRecord> {
        self.rows
            .get(&(Arc::from(table), entity_id.clone()))
            .map(|row| row.value().clone())
    }

    fn replay(&self, table: &str, filter: &EntityFilter) -> Vec<BroadcastRecord> {
        self.rows
            .iter()
            .filter(|row| &*row.key().0 == table && filter.matches(&row.key().1))
            .map(|row| row.value().clone())
            .collect()
    }
}

impl RealtimeStore for MemoryStore {
    fn upsert(
        &self,
        table: &str,
        record: &BroadcastRecord,
    ) -> BoxFuture<'static, Result<(), StoreError>> {
        if self.rejecting.load(Ordering::Acquire) {
            return Box::pin(future::ready(Err(StoreError::Rejected(
                "store is rejecting writes".into(),
            ))));
        }

        let table: Arc<str> = Arc::from(table);
        self.rows
            .insert((Arc::clone(&table), record.entity_id.clone()), record.clone());
        // No receivers just means nobody is subscribed yet.
        let _ = self.changes.send((table, record.clone()));

        Box::pin(future::ready(Ok(())))
    }

    fn subscribe(
        &self,
        table: &str,
        filter: EntityFilter,
    ) -> BoxFuture<'static, Result<StoreSubscription, StoreError>> {
        let table: Arc<str> = Arc::from(table);
        let mut changes = self.changes.subscribe();
        let mut faults = self.faults.subscribe();
        let replay = self.replay(&table, &filter);

        Box::pin(async move {
            let (tx, events) = mpsc::unbounded_channel();
            let _ = tx.send(StoreEvent::Status(SubscriptionStatus::Subscribed));
            for record in replay {
                let _ = tx.send(StoreEvent::Change(record));
            }

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        change = changes.recv() => match change {
                            Ok((changed, record)) => {
                                if changed == table && filter.matches(&record.entity_id) {
                                    let _ = tx.send(StoreEvent::Change(record));
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!(skipped, "Subscriber lagged behind store changes");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                let _ = tx.send(StoreEvent::Status(SubscriptionStatus::Closed));
                                break;
                            }
                        },
                        fault = faults.recv() => {
                            if let Ok(reason) = fault {
                                let status = SubscriptionStatus::Error(reason);
                                let _ = tx.send(StoreEvent::Status(status));
                            }
                            break;
                        }
                        _ = tx.closed() => break,
                    }
                }
            });

            Ok(StoreSubscription { events })
        })
    }
}
