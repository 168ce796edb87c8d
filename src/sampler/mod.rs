//! Live position sampling on top of a platform location source.
//!
//! A [`LocationSource`] pushes raw [`LocationEvent`]s into a channel. The [`PositionSampler`]
//! turns that into a [`SampleSubscription`]: an ordered sequence of samples and de-duplicated
//! failures that the owning session consumes from a single dispatch loop.

pub mod config;
pub mod error;
pub mod scripted;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::position::{Sample, Timestamp};

pub use self::config::SamplerOptions;
pub use self::error::LocationError;

/// Handle of a watch registered with a [`LocationSource`].
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct WatchId(pub u64);

/// A raw event pushed by a location source.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationEvent {
    Fix(Sample),
    Failed(LocationError),
}

/// A continuous platform location source.
///
/// `clear_watch` must tolerate ids that were already cleared.
pub trait LocationSource: Send + Sync + 'static {
    fn watch(
        &self,
        options: &SamplerOptions,
        events: mpsc::UnboundedSender<LocationEvent>,
    ) -> Result<WatchId, LocationError>;

    fn clear_watch(&self, watch: WatchId);
}

/// Owns access to a [`LocationSource`] and hands out at most one live subscription at a time.
pub struct PositionSampler {
    source: Arc<dyn LocationSource>,
    options: SamplerOptions,
    held: Arc<AtomicBool>,
}

impl std::fmt::Debug for PositionSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionSampler")
            .field("source", &"<LocationSource>")
            .field("options", &self.options)
            .field("held", &self.held.load(Ordering::Acquire))
            .finish()
    }
}

impl PositionSampler {
    pub fn new(source: Arc<dyn LocationSource>, options: SamplerOptions) -> Self {
        Self {
            source,
            options,
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start watching the source.
    ///
    /// Fails with [`LocationError::SourceBusy`] while another subscription from this sampler is
    /// still live, or with whatever the source reports when registering the watch.
    pub fn start(&self) -> Result<SampleSubscription, LocationError> {
        if self.held.swap(true, Ordering::AcqRel) {
            return Err(LocationError::SourceBusy);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let watch = match self.source.watch(&self.options, events_tx) {
            Ok(watch) => watch,
            Err(err) => {
                self.held.store(false, Ordering::Release);
                return Err(err);
            }
        };

        info!(
            watch = watch.0,
            high_accuracy = self.options.high_accuracy,
            "Location watch started"
        );

        Ok(SampleSubscription {
            source: Arc::clone(&self.source),
            watch: Some(watch),
            events: events_rx,
            timeout: self.options.timeout,
            last_error: None,
            last_captured: None,
            held: Arc::clone(&self.held),
        })
    }

    /// Whether a subscription currently holds the source.
    pub fn is_active(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// A live, non-restartable sequence of samples from a [`PositionSampler`].
///
/// Each distinct failure is reported once; repeats are suppressed until a good sample arrives.
/// Samples older than the last one yielded are dropped. Stopping is idempotent and also happens
/// on drop.
pub struct SampleSubscription {
    source: Arc<dyn LocationSource>,
    watch: Option<WatchId>,
    events: mpsc::UnboundedReceiver<LocationEvent>,
    timeout: Option<std::time::Duration>,
    last_error: Option<LocationError>,
    last_captured: Option<Timestamp>,
    held: Arc<AtomicBool>,
}

impl SampleSubscription {
    /// Wait for the next sample or failure. Returns `None` once stopped or when the source ends.
    ///
    /// Cancel safe: no state changes until an event has been received.
    pub async fn next(&mut self) -> Option<Result<Sample, LocationError>> {
        loop {
            if self.watch.is_none() {
                return None;
            }

            let event = match self.timeout {
                Some(timeout) => match tokio::time::timeout(timeout, self.events.recv()).await {
                    Ok(event) => event,
                    Err(_) => Some(LocationEvent::Failed(LocationError::Unavailable {
                        reason: format!("no fix within {}ms", timeout.as_millis()),
                    })),
                },
                None => self.events.recv().await,
            }?;

            match event {
                LocationEvent::Fix(sample) => {
                    if self
                        .last_captured
                        .is_some_and(|last| sample.captured_at < last)
                    {
                        debug!(captured_at = %sample.captured_at, "Dropping out-of-order sample");
                        continue;
                    }

                    self.last_error = None;
                    self.last_captured = Some(sample.captured_at);
                    return Some(Ok(sample));
                }
                LocationEvent::Failed(err) => {
                    if self.last_error.as_ref() == Some(&err) {
                        continue;
                    }

                    self.last_error = Some(err.clone());
                    return Some(Err(err));
                }
            }
        }
    }

    /// Release the location source. Calling this more than once is a no-op.
    pub fn stop(&mut self) {
        if let Some(watch) = self.watch.take() {
            self.source.clear_watch(watch);
            self.events.close();
            self.held.store(false, Ordering::Release);
            info!(watch = watch.0, "Location watch stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.watch.is_some()
    }
}

impl Drop for SampleSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}
