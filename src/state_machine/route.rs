use std::collections::VecDeque;

use tracing::debug;

use super::StateMachine;
use crate::position::Position;
use crate::routing::error::RouteError;
use crate::routing::{RouteEstimate, RouteRequest};

/// Sequence-number arbitration for route requests.
///
/// Each issued request gets the next sequence number. A response is only allowed to update the
/// stored estimate if its sequence equals the highest one issued and the arbiter has not been
/// cleared since. Responses may arrive in any order; older ones are discarded.
///
/// Failures of the current request keep the previous estimate, preferring stale-but-available
/// over an empty display.
#[derive(Debug)]
pub struct RouteArbiter {
    min_delta_deg: f64,
    last_issued: u64,
    current: Option<u64>,
    last_endpoints: Option<(Position, Position)>,
    estimate: Option<RouteEstimate>,
    pending: VecDeque<RouteOutput>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteInput {
    /// Issue a request unconditionally.
    Request {
        start: Position,
        destination: Position,
    },
    /// Issue a request only if an endpoint moved by more than the configured minimum delta.
    Endpoints {
        start: Position,
        destination: Position,
    },
    /// The provider answered the request with the given sequence.
    Resolved {
        sequence: u64,
        result: Result<RouteEstimate, RouteError>,
    },
    /// An endpoint became unavailable.
    Clear,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutput {
    Dispatch(RouteRequest),
    Accepted {
        sequence: u64,
        estimate: RouteEstimate,
    },
    Failed {
        sequence: u64,
        error: RouteError,
    },
    Discarded {
        sequence: u64,
        current: u64,
    },
    Cleared,
}

impl RouteArbiter {
    pub fn new(min_delta_deg: f64) -> Self {
        Self {
            min_delta_deg,
            last_issued: 0,
            current: None,
            last_endpoints: None,
            estimate: None,
            pending: VecDeque::new(),
        }
    }

    pub fn estimate(&self) -> Option<RouteEstimate> {
        self.estimate
    }

    /// Highest sequence number issued so far, zero before the first request.
    pub fn last_issued(&self) -> u64 {
        self.last_issued
    }

    pub fn is_current(&self, sequence: u64) -> bool {
        self.current == Some(sequence)
    }

    fn issue(&mut self, start: Position, destination: Position) {
        self.last_issued += 1;
        self.current = Some(self.last_issued);
        self.last_endpoints = Some((start, destination));

        self.pending.push_back(RouteOutput::Dispatch(RouteRequest {
            start,
            destination,
            sequence: self.last_issued,
        }));
    }

    fn process_endpoints(&mut self, start: Position, destination: Position) {
        let moved = match self.last_endpoints {
            None => true,
            Some((last_start, last_destination)) => {
                start.displacement_deg(&last_start) > self.min_delta_deg
                    || destination.displacement_deg(&last_destination) > self.min_delta_deg
            }
        };

        if moved {
            self.issue(start, destination);
        }
    }

    fn process_resolved(&mut self, sequence: u64, result: Result<RouteEstimate, RouteError>) {
        if !self.is_current(sequence) {
            debug!(
                sequence,
                current = self.last_issued,
                "Discarding stale route response"
            );
            self.pending.push_back(RouteOutput::Discarded {
                sequence,
                current: self.last_issued,
            });
            return;
        }

        match result {
            Ok(estimate) => {
                self.estimate = Some(estimate);
                self.pending
                    .push_back(RouteOutput::Accepted { sequence, estimate });
            }
            Err(error) => {
                self.pending.push_back(RouteOutput::Failed { sequence, error });
            }
        }
    }

    fn process_clear(&mut self) {
        self.current = None;
        self.last_endpoints = None;
        self.estimate = None;
        self.pending.push_back(RouteOutput::Cleared);
    }
}

impl StateMachine for RouteArbiter {
    type Input = RouteInput;
    type Output = RouteOutput;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            RouteInput::Request { start, destination } => self.issue(start, destination),
            RouteInput::Endpoints { start, destination } => {
                self.process_endpoints(start, destination)
            }
            RouteInput::Resolved { sequence, result } => self.process_resolved(sequence, result),
            RouteInput::Clear => self.process_clear(),
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        self.pending.pop_front()
    }
}
