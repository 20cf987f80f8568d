use thiserror::Error;

/// Clock error types covering programming errors, component faults, and stalls.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClockError {
    /// An event was scheduled at or before the current cycle.
    #[error("cannot schedule event for cycle {requested}: current cycle is {current}")]
    ScheduleInPast {
        /// Requested target cycle.
        requested: u64,
        /// Cycle counter at the time of the request.
        current: u64,
    },

    /// Two components were registered at the same ordinal position.
    #[error("component position {0} is already registered")]
    DuplicatePosition(u32),

    /// Component registration was attempted after the clock started.
    #[error("components cannot be registered after the clock has started")]
    AlreadyStarted,

    /// A mutating operation was attempted on a disposed clock.
    #[error("clock has been disposed")]
    Disposed,

    /// The clock stalled earlier and can only be disposed.
    #[error("clock is faulted; dispose it")]
    Faulted,

    /// Invalid state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A component's run body failed or panicked.
    #[error("component '{name}' at position {position} faulted: {message}")]
    ComponentFault {
        /// Registration position of the component.
        position: u32,
        /// Diagnostic name of the component.
        name: String,
        /// Fault description.
        message: String,
    },

    /// A scheduled event callback panicked.
    #[error("event callback faulted at cycle {cycle}: {message}")]
    EventFault {
        /// Cycle at which the callback was firing.
        cycle: u64,
        /// Panic message.
        message: String,
    },

    /// A component did not reach its next tick within the stall timeout.
    #[error("cycle {cycle} stalled waiting on {waiting_on}")]
    Stalled {
        /// Cycle being executed when the stall was detected.
        cycle: u64,
        /// Description of the party that never arrived.
        waiting_on: String,
    },

    /// Failed to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(String),

    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for clock operations.
pub type ClockResult<T> = Result<T, ClockError>;
