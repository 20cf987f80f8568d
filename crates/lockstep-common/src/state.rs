//! Clock lifecycle state machine.
//!
//! State transitions:
//! UNSTARTED → IDLE → RUNNING_BOUNDED | RUNNING_UNBOUNDED → IDLE → DISPOSED
//!
//! A stalled cycle moves a running clock to FAULTED, as does a failed start
//! of an UNSTARTED one. From FAULTED only disposal is possible. Disposal is reachable from every other state and
//! is terminal.

use crate::error::{ClockError, ClockResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Lifecycle states of a clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockState {
    /// Components may still be registered; no execution contexts exist.
    #[default]
    Unstarted,
    /// Execution contexts exist and are parked between runs.
    Idle,
    /// Executing a `run(n)` call.
    RunningBounded,
    /// Executing `run_forever()`.
    RunningUnbounded,
    /// A cycle stalled or the clock failed to start; contexts may be wedged.
    Faulted,
    /// All execution contexts have been released.
    Disposed,
}

impl fmt::Display for ClockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unstarted => write!(f, "UNSTARTED"),
            Self::Idle => write!(f, "IDLE"),
            Self::RunningBounded => write!(f, "RUNNING_BOUNDED"),
            Self::RunningUnbounded => write!(f, "RUNNING_UNBOUNDED"),
            Self::Faulted => write!(f, "FAULTED"),
            Self::Disposed => write!(f, "DISPOSED"),
        }
    }
}

impl ClockState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: ClockState) -> bool {
        use ClockState::{Disposed, Faulted, Idle, RunningBounded, RunningUnbounded, Unstarted};

        matches!(
            (self, target),
            (Unstarted, Idle | Faulted)
                | (Idle, RunningBounded | RunningUnbounded)
                | (RunningBounded | RunningUnbounded, Idle | Faulted)
                | (Unstarted | Idle | RunningBounded | RunningUnbounded | Faulted, Disposed)
        )
    }

    /// Returns true once execution contexts have been created.
    #[must_use]
    pub fn is_started(&self) -> bool {
        !matches!(self, Self::Unstarted)
    }

    /// Returns true while a run call is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::RunningBounded | Self::RunningUnbounded)
    }
}

/// State machine wrapper with transition history tracking.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: ClockState,
    previous: Option<ClockState>,
    transition_count: u64,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a new state machine starting in UNSTARTED.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ClockState::Unstarted,
            previous: None,
            transition_count: 0,
        }
    }

    /// Get the current state.
    #[must_use]
    pub fn state(&self) -> ClockState {
        self.current
    }

    /// Get the previous state (if any transition occurred).
    #[must_use]
    pub fn previous_state(&self) -> Option<ClockState> {
        self.previous
    }

    /// Get total number of transitions.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt a state transition.
    pub fn transition(&mut self, target: ClockState) -> ClockResult<()> {
        if self.current.can_transition_to(target) {
            trace!(from = %self.current, to = %target, "Clock state transition");
            self.previous = Some(self.current);
            self.current = target;
            self.transition_count += 1;
            Ok(())
        } else {
            Err(ClockError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            })
        }
    }

    /// Reject mutating operations on a disposed or faulted clock.
    pub fn ensure_usable(&self) -> ClockResult<()> {
        match self.current {
            ClockState::Disposed => Err(ClockError::Disposed),
            ClockState::Faulted => Err(ClockError::Faulted),
            _ => Ok(()),
        }
    }
}
