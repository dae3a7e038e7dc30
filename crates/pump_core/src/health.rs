//! Field-bus health supervision.
//!
//! Counts consecutive failed polls. Reaching `max_consecutive_failures`
//! opens a degraded episode: the control core fails safe and the loop driver
//! is asked, once, to reset the bus. After the reset the counter starts from
//! zero, so a second reset needs another full run of failures. The episode
//! (and `degraded`) ends only with a successful poll.

use std::time::Instant;

use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Success,
    Failure,
}

/// Snapshot handed to the control state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommHealthState {
    pub consecutive_failures: u32,
    pub last_success: Option<Instant>,
    pub degraded: bool,
}

#[derive(Debug)]
pub struct CommHealth {
    max_consecutive_failures: u32,
    state: CommHealthState,
    reset_pending: bool,
    resets: u32,
}

impl CommHealth {
    pub fn new(max_consecutive_failures: u32) -> Self {
        Self {
            max_consecutive_failures: max_consecutive_failures.max(1),
            state: CommHealthState {
                consecutive_failures: 0,
                last_success: None,
                degraded: false,
            },
            reset_pending: false,
            resets: 0,
        }
    }

    pub fn record(&mut self, outcome: PollOutcome, now: Instant) {
        match outcome {
            PollOutcome::Success => {
                if self.state.degraded {
                    info!(
                        "field bus recovered after {} failed polls",
                        self.state.consecutive_failures
                    );
                }
                self.state.consecutive_failures = 0;
                self.state.last_success = Some(now);
                self.state.degraded = false;
                self.reset_pending = false;
                self.resets = 0;
            }
            PollOutcome::Failure => {
                self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
                warn!(
                    "poll failed ({}/{})",
                    self.state.consecutive_failures, self.max_consecutive_failures
                );
                if self.state.consecutive_failures == self.max_consecutive_failures {
                    if !self.state.degraded {
                        warn!("field bus degraded: COMM_FAILURE");
                    }
                    self.state.degraded = true;
                    self.reset_pending = true;
                }
            }
        }
    }

    /// True once per run of `max_consecutive_failures` failures, until
    /// [`bus_reset_done`](Self::bus_reset_done) is called.
    pub fn should_reset_bus(&self) -> bool {
        self.reset_pending
    }

    pub fn bus_reset_done(&mut self) {
        self.reset_pending = false;
        self.state.consecutive_failures = 0;
        self.resets = self.resets.saturating_add(1);
    }

    /// Bus resets since the last successful poll.
    pub fn resets_since_success(&self) -> u32 {
        self.resets
    }

    pub fn degraded(&self) -> bool {
        self.state.degraded
    }

    pub fn snapshot(&self) -> CommHealthState {
        self.state
    }
}
