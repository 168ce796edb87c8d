use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::CoreSnapshot;
use super::clock::SampleClock;
use crate::entity::EntityId;
use crate::position::{MovementStatus, Position, Timestamp};
use crate::sampler::{LocationError, SampleSubscription};
use crate::session::SessionGuard;
use crate::state_machine::StateMachine;
use crate::state_machine::movement::{MovementClassifier, MovementConfig, MovementInput, WakeAt};
use crate::state_machine::wrappers::input::{SystemInput, SystemResource};
use crate::sync::error::SyncError;
use crate::sync::{BroadcastRecord, BroadcasterLink, SyncChannel};

/// How long a stopping session waits for queued publishes, including the final idle record.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
struct Update {
    position: Position,
    status: MovementStatus,
}

/// A running broadcast: sampler into classifier into the sync channel.
pub(super) struct BroadcastSession {
    pub entity_id: EntityId,
    pub channel: SyncChannel,
    pub movement: MovementConfig,
    pub snapshot: Arc<watch::Sender<CoreSnapshot>>,
    pub subscription: SampleSubscription,
    pub guard: SessionGuard,
}

impl BroadcastSession {
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        let mut classifier = MovementClassifier::new(self.movement.clone());
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let (results_tx, mut results) = mpsc::unbounded_channel();
        let mut publisher = spawn_publisher(
            self.channel.clone(),
            self.entity_id.clone(),
            updates_rx,
            results_tx,
        );

        let mut clock: Option<SampleClock> = None;
        let mut wake: Option<Instant> = None;
        let mut position: Option<Position> = None;

        info!(
            entity_id = %self.entity_id,
            session_id = %self.guard.session_id(),
            "Broadcast session running"
        );

        let fault = loop {
            tokio::select! {
                _ = &mut stop => break None,

                event = self.subscription.next() => match event {
                    Some(Ok(sample)) => {
                        let clock =
                            *clock.get_or_insert_with(|| SampleClock::anchor(sample.captured_at));
                        position = Some(sample.position);
                        self.snapshot.send_modify(|snapshot| {
                            snapshot.broadcaster_position = Some(sample.position);
                        });

                        classifier.process_input(SystemInput::Input(MovementInput::Sample(sample)));
                        wake = self.drain(&mut classifier, &clock).1;

                        let _ = updates.send(Update {
                            position: sample.position,
                            status: classifier.status(),
                        });
                    }
                    Some(Err(err)) if err.is_terminal() => break Some(err),
                    Some(Err(err)) => {
                        warn!(entity_id = %self.entity_id, error = %err, "Location update failed");
                        self.snapshot
                            .send_modify(|snapshot| snapshot.warning = Some(err.to_string()));
                    }
                    None => {
                        break Some(LocationError::Unavailable {
                            reason: "location source closed".into(),
                        });
                    }
                },

                _ = tokio::time::sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => {
                    let Some(clock) = clock else {
                        wake = None;
                        continue;
                    };

                    classifier.process_input(SystemInput::System(clock.now()));
                    let (changed, next) = self.drain(&mut classifier, &clock);
                    wake = next;

                    if let (true, Some(position)) = (changed, position) {
                        let _ = updates.send(Update {
                            position,
                            status: classifier.status(),
                        });
                    }
                }

                Some(result) = results.recv() => self.record_link(result),
            }
        };

        self.subscription.stop();

        let at = clock.map_or_else(Timestamp::generate, |clock| clock.now());
        classifier.process_input(SystemInput::Input(MovementInput::Teardown(at)));
        let clock = clock.unwrap_or_else(|| SampleClock::anchor(at));
        self.drain(&mut classifier, &clock);

        if let Some(position) = position {
            let _ = updates.send(Update {
                position,
                status: MovementStatus::Idle,
            });
        }
        drop(updates);
        if tokio::time::timeout(FLUSH_TIMEOUT, &mut publisher)
            .await
            .is_err()
        {
            warn!(entity_id = %self.entity_id, "Abandoning unsent broadcast records");
            publisher.abort();
        }
        while let Ok(result) = results.try_recv() {
            self.record_link(result);
        }

        if let Some(err) = &fault {
            warn!(entity_id = %self.entity_id, error = %err, "Broadcast session ended");
        } else {
            info!(entity_id = %self.entity_id, "Broadcast session ended");
        }

        self.snapshot.send_modify(|snapshot| {
            snapshot.active = false;
            snapshot.status = MovementStatus::Idle;
            snapshot.fault = fault.map(|err| err.to_string());
        });
    }

    /// Push pending status changes into the snapshot. Returns whether the status changed and
    /// when the classifier next wants a tick.
    fn drain(
        &self,
        classifier: &mut MovementClassifier,
        clock: &SampleClock,
    ) -> (bool, Option<Instant>) {
        let mut changed = false;

        loop {
            match classifier.poll_output() {
                Some(Ok(change)) => {
                    info!(
                        entity_id = %self.entity_id,
                        status = %change.status,
                        at = %change.at,
                        "Movement status changed"
                    );
                    self.snapshot
                        .send_modify(|snapshot| snapshot.status = change.status);
                    changed = true;
                }
                Some(Err(WakeAt(deadline))) => return (changed, Some(clock.instant_at(deadline))),
                None => return (changed, None),
            }
        }
    }

    fn record_link(&self, result: Result<BroadcastRecord, SyncError>) {
        let link = match result {
            Ok(record) => {
                debug!(
                    entity_id = %self.entity_id,
                    updated_at = %record.updated_at,
                    "Publish confirmed"
                );
                BroadcasterLink::Connected
            }
            Err(err) => {
                warn!(entity_id = %self.entity_id, error = %err, "Publish failed");
                BroadcasterLink::Disconnected
            }
        };

        self.snapshot.send_if_modified(|snapshot| {
            let modified = snapshot.link != link;
            snapshot.link = link;
            modified
        });
    }
}

/// Publishes updates one at a time, in order, off the session loop.
fn spawn_publisher(
    channel: SyncChannel,
    entity_id: EntityId,
    mut updates: mpsc::UnboundedReceiver<Update>,
    results: mpsc::UnboundedSender<Result<BroadcastRecord, SyncError>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            let result = channel
                .publish(&entity_id, update.position, update.status)
                .await;
            let _ = results.send(result);
        }
    })
}
