use std::collections::VecDeque;
use std::time::Duration;

use bon::Builder;
use tracing::debug;

use super::StateMachine;
use super::timer::DebounceTimer;
use super::wrappers::input::SystemInput;
use super::wrappers::output::WrappedOutput;
use crate::position::{MovementStatus, Sample, Timestamp};

/// Tuning for [`MovementClassifier`].
#[derive(Debug, Clone, Builder)]
pub struct MovementConfig {
    /// Degree-space displacement at or above which a sample counts as movement.
    /// The default is roughly 5 metres at mid latitudes.
    #[builder(default = 5e-5)]
    pub threshold_deg: f64,

    /// Quiet period without movement after which the vehicle is considered stopped.
    #[builder(default = Duration::from_millis(5_000))]
    pub stop_debounce: Duration,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Classifies a stream of position samples into [`MovementStatus`] transitions.
///
/// The first sample only establishes the reference position, so the status stays
/// [`MovementStatus::Idle`] until a second sample makes displacement computable. From then on:
///
/// - a displacement of at least `threshold_deg` moves to [`MovementStatus::Moving`] immediately
///   and cancels any pending stop timer;
/// - a smaller displacement (re)arms the stop timer for `stop_debounce` from the sample's capture
///   time, and the machine moves to [`MovementStatus::Stopped`] once it is ticked at or after
///   the deadline. The transition is stamped with the deadline, not the tick time.
///
/// Every sample becomes the new reference. Overdue timers are also fired by the next sample, so
/// the status timeline depends only on the sample timestamps and the ticks provided.
pub struct MovementClassifier {
    config: MovementConfig,
    status: MovementStatus,
    reference: Option<Sample>,
    stop_timer: DebounceTimer,
    pending: VecDeque<StatusChange>,
}

/// A transition of the classifier to `status` at time `at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub status: MovementStatus,
    pub at: Timestamp,
}

/// Wait value returned while no transition is pending but the stop timer is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeAt(pub Timestamp);

#[derive(Debug, Clone, PartialEq)]
pub enum MovementInput {
    Sample(Sample),
    /// The broadcasting session ended at the given time.
    Teardown(Timestamp),
}

impl MovementClassifier {
    pub fn new(config: MovementConfig) -> Self {
        Self {
            config,
            status: MovementStatus::Idle,
            reference: None,
            stop_timer: DebounceTimer::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn status(&self) -> MovementStatus {
        self.status
    }

    /// The last accepted sample, if any.
    pub fn reference(&self) -> Option<&Sample> {
        self.reference.as_ref()
    }

    pub fn stop_deadline(&self) -> Option<Timestamp> {
        self.stop_timer.deadline()
    }

    fn process_sample(&mut self, sample: Sample) {
        self.process_tick(sample.captured_at);

        if let Some(reference) = self.reference {
            let displacement = sample.position.displacement_deg(&reference.position);

            if displacement >= self.config.threshold_deg {
                self.stop_timer.cancel();
                self.transition(MovementStatus::Moving, sample.captured_at);
            } else {
                self.stop_timer
                    .arm(sample.captured_at, self.config.stop_debounce);
            }
        }

        self.reference = Some(sample);
    }

    fn process_tick(&mut self, now: Timestamp) {
        if let Some(deadline) = self.stop_timer.fire(now) {
            self.transition(MovementStatus::Stopped, deadline);
        }
    }

    fn process_teardown(&mut self, at: Timestamp) {
        self.stop_timer.cancel();
        self.reference = None;
        self.transition(MovementStatus::Idle, at);
    }

    fn transition(&mut self, status: MovementStatus, at: Timestamp) {
        if self.status == status {
            return;
        }

        debug!(from = %self.status, to = %status, at = %at, "Movement status changed");
        self.status = status;
        self.pending.push_back(StatusChange { status, at });
    }
}

impl Default for MovementClassifier {
    fn default() -> Self {
        Self::new(MovementConfig::default())
    }
}

impl StateMachine for MovementClassifier {
    type Input = SystemInput<MovementInput, Timestamp>;
    type Output = WrappedOutput<StatusChange, WakeAt>;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            SystemInput::Input(MovementInput::Sample(sample)) => self.process_sample(sample),
            SystemInput::Input(MovementInput::Teardown(at)) => self.process_teardown(at),
            SystemInput::System(now) => self.process_tick(now),
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        if let Some(change) = self.pending.pop_front() {
            return Some(Ok(change));
        }

        self.stop_timer.deadline().map(|deadline| Err(WakeAt(deadline)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;

    fn sample(lat: f64, lon: f64, at_ms: u64) -> SystemInput<MovementInput, Timestamp> {
        SystemInput::Input(MovementInput::Sample(Sample::new(
            Position::new(lat, lon),
            Timestamp::from_millis(at_ms),
        )))
    }

    fn tick(at_ms: u64) -> SystemInput<MovementInput, Timestamp> {
        SystemInput::System(Timestamp::from_millis(at_ms))
    }

    fn drain_changes(machine: &mut MovementClassifier) -> Vec<StatusChange> {
        let mut changes = Vec::new();
        while let Some(Ok(change)) = machine.poll_output() {
            changes.push(change);
        }
        changes
    }

    fn change(status: MovementStatus, at_ms: u64) -> StatusChange {
        StatusChange {
            status,
            at: Timestamp::from_millis(at_ms),
        }
    }

    #[test]
    fn test_first_sample_stays_idle() {
        let mut machine = MovementClassifier::default();

        machine.process_input(sample(5.6037, -0.1870, 0));

        assert_eq!(machine.status(), MovementStatus::Idle);
        assert!(machine.reference().is_some());
        assert!(machine.poll_output().is_none());
    }

    #[test]
    fn test_small_displacement_stops_after_debounce() {
        let mut machine = MovementClassifier::default();

        machine.process_input(sample(5.6037, -0.1870, 0));
        machine.process_input(sample(5.60371, -0.1870, 1_000));

        assert_eq!(machine.status(), MovementStatus::Idle);
        assert_eq!(
            machine.poll_output(),
            Some(Err(WakeAt(Timestamp::from_millis(6_000))))
        );

        machine.process_input(tick(5_999));
        assert_eq!(machine.status(), MovementStatus::Idle);

        machine.process_input(tick(6_500));
        assert_eq!(
            drain_changes(&mut machine),
            vec![change(MovementStatus::Stopped, 6_000)]
        );
        assert!(machine.poll_output().is_none());
    }

    #[test]
    fn test_large_displacement_moves_immediately() {
        let mut machine = MovementClassifier::default();

        machine.process_input(sample(5.6037, -0.1870, 0));
        machine.process_input(sample(5.6043, -0.1870, 500));

        assert_eq!(
            drain_changes(&mut machine),
            vec![change(MovementStatus::Moving, 500)]
        );
        assert_eq!(machine.status(), MovementStatus::Moving);
    }

    #[test]
    fn test_movement_cancels_timer_near_expiry() {
        let mut machine = MovementClassifier::default();

        machine.process_input(sample(5.6037, -0.1870, 0));
        machine.process_input(sample(5.6037, -0.1870, 1_000));
        machine.process_input(sample(5.6045, -0.1870, 5_999));

        assert_eq!(machine.stop_deadline(), None);
        machine.process_input(tick(10_000));
        assert_eq!(
            drain_changes(&mut machine),
            vec![change(MovementStatus::Moving, 5_999)]
        );
    }

    #[test]
    fn test_quiet_samples_reset_rather_than_accumulate() {
        let mut machine = MovementClassifier::default();

        machine.process_input(sample(5.6037, -0.1870, 0));
        machine.process_input(sample(5.6037, -0.1870, 1_000));
        machine.process_input(sample(5.6037, -0.1870, 4_000));

        assert_eq!(machine.stop_deadline(), Some(Timestamp::from_millis(9_000)));
        machine.process_input(tick(6_000));
        assert_eq!(machine.status(), MovementStatus::Idle);

        machine.process_input(tick(9_000));
        assert_eq!(
            drain_changes(&mut machine),
            vec![change(MovementStatus::Stopped, 9_000)]
        );
    }

    #[test]
    fn test_stopped_is_emitted_once() {
        let mut machine = MovementClassifier::default();

        machine.process_input(sample(5.6037, -0.1870, 0));
        machine.process_input(sample(5.6037, -0.1870, 1_000));
        machine.process_input(tick(6_000));
        machine.process_input(sample(5.6037, -0.1870, 7_000));
        machine.process_input(tick(12_000));

        assert_eq!(
            drain_changes(&mut machine),
            vec![change(MovementStatus::Stopped, 6_000)]
        );
    }

    #[test]
    fn test_overdue_timer_fires_on_next_sample() {
        let mut machine = MovementClassifier::default();

        machine.process_input(sample(5.6037, -0.1870, 0));
        machine.process_input(sample(5.6037, -0.1870, 1_000));
        // No tick was delivered; the next movement sample arrives well after the deadline.
        machine.process_input(sample(5.6050, -0.1870, 8_000));

        assert_eq!(
            drain_changes(&mut machine),
            vec![
                change(MovementStatus::Stopped, 6_000),
                change(MovementStatus::Moving, 8_000),
            ]
        );
    }

    #[test]
    fn test_teardown_resets_to_idle() {
        let mut machine = MovementClassifier::default();

        machine.process_input(sample(5.6037, -0.1870, 0));
        machine.process_input(sample(5.6043, -0.1870, 500));
        machine.process_input(sample(5.6043, -0.1870, 1_000));
        let _ = drain_changes(&mut machine);

        machine.process_input(SystemInput::Input(MovementInput::Teardown(
            Timestamp::from_millis(2_000),
        )));

        assert_eq!(
            drain_changes(&mut machine),
            vec![change(MovementStatus::Idle, 2_000)]
        );
        assert!(machine.reference().is_none());
        assert!(machine.poll_output().is_none());
    }

    #[test]
    fn test_identical_sequences_are_deterministic() {
        let inputs = || {
            vec![
                sample(5.6037, -0.1870, 0),
                sample(5.6040, -0.1870, 1_000),
                sample(5.60401, -0.1870, 2_000),
                tick(7_000),
                sample(5.6050, -0.1875, 9_000),
            ]
        };

        let run = || {
            let mut machine = MovementClassifier::default();
            let mut changes = Vec::new();
            for input in inputs() {
                machine.process_input(input);
                changes.extend(drain_changes(&mut machine));
            }
            changes
        };

        assert_eq!(run(), run());
        assert_eq!(
            run(),
            vec![
                change(MovementStatus::Moving, 1_000),
                change(MovementStatus::Stopped, 7_000),
                change(MovementStatus::Moving, 9_000),
            ]
        );
    }

    #[test]
    fn test_custom_threshold() {
        let config = MovementConfig::builder()
            .threshold_deg(1e-3)
            .stop_debounce(Duration::from_millis(100))
            .build();
        let mut machine = MovementClassifier::new(config);

        machine.process_input(sample(5.6037, -0.1870, 0));
        machine.process_input(sample(5.6043, -0.1870, 50));
        assert_eq!(machine.status(), MovementStatus::Idle);

        machine.process_input(tick(150));
        assert_eq!(machine.status(), MovementStatus::Stopped);
    }
}
