//! A replayable [`LocationSource`] that plays back a fixed script of fixes and failures.
//!
//! Used by the tests and by the demo binaries in place of platform location hardware.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::{LocationError, LocationEvent, LocationSource, SamplerOptions, WatchId};
use crate::position::{Position, Sample, Timestamp};
use crate::state_machine::wrappers::input::SystemResource;

/// One step of a script, delivered `at` after the watch starts.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptStep {
    pub at: Duration,
    pub event: ScriptEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptEvent {
    /// A fix captured `captured` after the script origin.
    Fix {
        position: Position,
        captured: Duration,
    },
    Fail(LocationError),
}

impl ScriptStep {
    /// A fix delivered and captured at the same offset.
    pub fn fix(at: Duration, position: Position) -> Self {
        Self::fix_captured(at, at, position)
    }

    /// A fix delivered at `at` but captured at `captured`, e.g. a late cached fix.
    pub fn fix_captured(at: Duration, captured: Duration, position: Position) -> Self {
        Self {
            at,
            event: ScriptEvent::Fix { position, captured },
        }
    }

    pub fn fail(at: Duration, error: LocationError) -> Self {
        Self {
            at,
            event: ScriptEvent::Fail(error),
        }
    }
}

/// Plays its script once per watch. Each watch runs on its own task that ends when the script
/// is exhausted, which closes the subscription.
#[derive(Debug)]
pub struct ScriptedSource {
    steps: Vec<ScriptStep>,
    origin: Option<Timestamp>,
    next_watch: AtomicU64,
    watches: DashMap<WatchId, JoinHandle<()>, ahash::RandomState>,
}

impl ScriptedSource {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            origin: None,
            next_watch: AtomicU64::new(1),
            watches: DashMap::default(),
        }
    }

    /// Evenly spaced fixes along `track`, one every `interval`.
    pub fn from_track(track: impl IntoIterator<Item = Position>, interval: Duration) -> Self {
        let steps = track
            .into_iter()
            .enumerate()
            .map(|(index, position)| ScriptStep::fix(interval * index as u32, position))
            .collect();
        Self::new(steps)
    }

    /// Stamp fixes relative to a fixed origin instead of the wall clock at watch start.
    pub fn with_origin(mut self, origin: Timestamp) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Number of watches currently playing.
    pub fn active_watches(&self) -> usize {
        self.watches.len()
    }
}

impl LocationSource for ScriptedSource {
    fn watch(
        &self,
        options: &SamplerOptions,
        events: mpsc::UnboundedSender<LocationEvent>,
    ) -> Result<WatchId, LocationError> {
        let watch = WatchId(self.next_watch.fetch_add(1, Ordering::Relaxed));
        let origin = self.origin.unwrap_or_else(Timestamp::generate);
        let steps = self.steps.clone();
        let started = Instant::now();

        debug!(
            watch = watch.0,
            steps = steps.len(),
            high_accuracy = options.high_accuracy,
            "Scripted location watch registered"
        );

        let handle = tokio::spawn(async move {
            for step in steps {
                tokio::time::sleep_until(started + step.at).await;

                let event = match step.event {
                    ScriptEvent::Fix { position, captured } => {
                        LocationEvent::Fix(Sample::new(position, origin.saturating_add(captured)))
                    }
                    ScriptEvent::Fail(error) => LocationEvent::Failed(error),
                };

                if events.send(event).is_err() {
                    break;
                }
            }
        });

        self.watches.insert(watch, handle);
        Ok(watch)
    }

    fn clear_watch(&self, watch: WatchId) {
        if let Some((_, handle)) = self.watches.remove(&watch) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clear_watch_is_idempotent() {
        let source = ScriptedSource::from_track(
            [Position::new(5.6037, -0.1870), Position::new(5.6038, -0.1870)],
            Duration::from_secs(1),
        );
        let (events, _rx) = mpsc::unbounded_channel();

        let watch = source
            .watch(&SamplerOptions::default(), events)
            .unwrap();
        assert_eq!(source.active_watches(), 1);

        source.clear_watch(watch);
        source.clear_watch(watch);
        assert_eq!(source.active_watches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_from_track_spaces_fixes() {
        let source = ScriptedSource::from_track(
            [
                Position::new(5.6037, -0.1870),
                Position::new(5.6038, -0.1870),
                Position::new(5.6039, -0.1870),
            ],
            Duration::from_millis(500),
        )
        .with_origin(Timestamp::from_millis(1_000));
        let (events, mut rx) = mpsc::unbounded_channel();
        source.watch(&SamplerOptions::default(), events).unwrap();

        let mut stamps = Vec::new();
        while let Some(LocationEvent::Fix(sample)) = rx.recv().await {
            stamps.push(sample.captured_at.as_millis());
        }

        assert_eq!(stamps, vec![1_000, 1_500, 2_000]);
    }
}
