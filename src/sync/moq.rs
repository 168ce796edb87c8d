//! [`RealtimeStore`] over a MoQ relay.
//!
//! Each entity gets its own broadcast at `{table}/{entity_id}` carrying a single track of
//! [`wire`](super::wire)-encoded records, one frame per upsert. Subscribers watch the table's
//! announcements and read the track of every matching broadcast. An announcement acknowledges
//! the subscription; an unannounce or the end of the record track reports it lost.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use moq_lite::{
    Broadcast, BroadcastConsumer, BroadcastProducer, OriginConsumer, OriginProducer, Track,
    TrackProducer,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::StoreError;
use super::wire::{decode_record, encode_record};
use super::{
    BroadcastRecord, EntityFilter, RealtimeStore, StoreEvent, StoreSubscription,
    SubscriptionStatus,
};
use crate::broadcast_path;
use crate::entity::EntityId;

pub const RECORD_TRACK: &str = "record";

struct Publication {
    // Dropped first, so readers see the broadcast closed before the track.
    _broadcast: BroadcastProducer,
    track: TrackProducer,
}

pub struct MoqStore {
    producer: Mutex<Publisher>,
    consumer: Mutex<OriginConsumer>,
}

struct Publisher {
    origin: OriginProducer,
    publications: HashMap<String, Publication, ahash::RandomState>,
}

impl std::fmt::Debug for MoqStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let publications = self
            .producer
            .lock()
            .map(|publisher| publisher.publications.len())
            .unwrap_or_default();
        f.debug_struct("MoqStore")
            .field("publications", &publications)
            .finish()
    }
}

impl MoqStore {
    /// Wrap the origin pair of a relay session, as returned by
    /// [`connect_bidirectional`](crate::connect_bidirectional).
    pub fn new(producer: OriginProducer, consumer: OriginConsumer) -> Self {
        Self {
            producer: Mutex::new(Publisher {
                origin: producer,
                publications: HashMap::default(),
            }),
            consumer: Mutex::new(consumer),
        }
    }

    /// Unannounce an entity's broadcast. Listeners see the subscription lost until the entity
    /// publishes again. Returns whether a broadcast was live.
    pub fn retire(&self, table: &str, entity_id: &EntityId) -> bool {
        let path = broadcast_path(table, entity_id.as_str());
        let retired = self
            .producer
            .lock()
            .expect("publisher lock poisoned")
            .publications
            .remove(&path);

        match retired {
            Some(publication) => {
                info!(path = %path, "Retired broadcast");
                drop(publication);
                true
            }
            None => false,
        }
    }

    fn write(&self, table: &str, record: &BroadcastRecord) -> Result<(), StoreError> {
        let path = broadcast_path(table, record.entity_id.as_str());
        let mut publisher = self.producer.lock().expect("publisher lock poisoned");
        let Publisher {
            origin,
            publications,
        } = &mut *publisher;

        if !publications.contains_key(&path) {
            // The track exists before the broadcast is announced.
            let mut broadcast = Broadcast::produce();
            let track = broadcast.producer.create_track(Track::new(RECORD_TRACK));
            if !origin.publish_broadcast(path.as_str(), broadcast.consumer) {
                return Err(StoreError::Rejected(format!(
                    "broadcast path '{path}' not authorized"
                )));
            }
            info!(path = %path, "Created broadcast");
            publications.insert(
                path.clone(),
                Publication {
                    _broadcast: broadcast.producer,
                    track,
                },
            );
        }

        let publication = publications
            .get_mut(&path)
            .ok_or_else(|| StoreError::Rejected(format!("broadcast '{path}' vanished")))?;
        publication.track.write_frame(encode_record(record));
        Ok(())
    }
}

impl RealtimeStore for MoqStore {
    fn upsert(
        &self,
        table: &str,
        record: &BroadcastRecord,
    ) -> BoxFuture<'static, Result<(), StoreError>> {
        Box::pin(future::ready(self.write(table, record)))
    }

    fn subscribe(
        &self,
        table: &str,
        filter: EntityFilter,
    ) -> BoxFuture<'static, Result<StoreSubscription, StoreError>> {
        let table = table.to_string();
        let announcements = self
            .consumer
            .lock()
            .expect("origin consumer lock poisoned")
            .with_root(table.as_str())
            .ok_or_else(|| StoreError::Subscribe(format!("table '{table}' not authorized")));

        Box::pin(async move {
            let announcements = announcements?;
            let (tx, events) = mpsc::unbounded_channel();
            info!(table = %table, "Watching announcements");
            tokio::spawn(watch_announcements(announcements, filter, tx));
            Ok(StoreSubscription { events })
        })
    }
}

async fn watch_announcements(
    mut announcements: OriginConsumer,
    filter: EntityFilter,
    tx: mpsc::UnboundedSender<StoreEvent>,
) {
    loop {
        let announced = tokio::select! {
            announced = announcements.announced() => announced,
            _ = tx.closed() => return,
        };

        let Some((path, broadcast)) = announced else {
            let _ = tx.send(StoreEvent::Status(SubscriptionStatus::Closed));
            return;
        };

        let entity_id = match EntityId::try_from(path.as_str()) {
            Ok(entity_id) if filter.matches(&entity_id) => entity_id,
            Ok(_) => continue,
            Err(err) => {
                debug!(path = %path.as_str(), error = %err, "Ignoring announcement");
                continue;
            }
        };

        match broadcast {
            Some(broadcast) => {
                debug!(entity_id = %entity_id, "Broadcaster announced");
                if tx
                    .send(StoreEvent::Status(SubscriptionStatus::Subscribed))
                    .is_err()
                {
                    return;
                }
                tokio::spawn(forward_records(entity_id, broadcast, tx.clone()));
            }
            None => {
                debug!(entity_id = %entity_id, "Broadcaster unannounced");
                let reason = format!("broadcaster '{entity_id}' unannounced");
                let _ = tx.send(StoreEvent::Status(SubscriptionStatus::Error(reason)));
            }
        }
    }
}

async fn forward_records(
    entity_id: EntityId,
    broadcast: BroadcastConsumer,
    tx: mpsc::UnboundedSender<StoreEvent>,
) {
    let mut track = broadcast.subscribe_track(&Track::new(RECORD_TRACK));

    let ended = loop {
        let group = tokio::select! {
            group = track.next_group() => group,
            _ = tx.closed() => return,
        };

        match group {
            Ok(Some(mut group)) => {
                while let Ok(Some(frame)) = group.read_frame().await {
                    match decode_record(frame.as_ref()) {
                        Ok(record) if record.entity_id == entity_id => {
                            if tx.send(StoreEvent::Change(record)).is_err() {
                                return;
                            }
                        }
                        Ok(record) => {
                            warn!(
                                entity_id = %entity_id,
                                record_entity = %record.entity_id,
                                "Record published under another entity's path"
                            );
                        }
                        Err(err) => {
                            warn!(entity_id = %entity_id, error = %err, "Dropping malformed frame");
                        }
                    }
                }
            }
            Ok(None) => break "record track ended".to_string(),
            Err(err) => break err.to_string(),
        }
    };

    // A closed broadcast is reported through its unannounce.
    if broadcast.closed().now_or_never().is_some() {
        debug!(entity_id = %entity_id, "Record track closed with its broadcast");
        return;
    }

    warn!(entity_id = %entity_id, reason = %ended, "Record track lost");
    let _ = tx.send(StoreEvent::Status(SubscriptionStatus::Error(ended)));
}
