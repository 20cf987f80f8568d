//! Fault history for postmortem diagnosis.
//!
//! Component faults, event-callback panics and stalls are captured here as
//! they happen. The clock drains the unreported records at every cycle
//! boundary to decide whether a run must fail, and the bounded history is
//! handed to the host in the [`ShutdownReport`](crate::ShutdownReport).

use lockstep_common::error::ClockError;
use lockstep_common::time::Cycle;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Default number of fault records to retain.
pub const DEFAULT_FAULT_HISTORY: usize = 64;

/// Where a fault originated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultSource {
    /// A component's `run` returned a fault or panicked.
    Component {
        /// Registration position.
        position: u32,
        /// Component name.
        name: String,
    },
    /// A scheduled event callback panicked.
    Event {
        /// Raw event id.
        id: u64,
    },
    /// The driver gave up waiting for a cycle to complete.
    Stall {
        /// The party that never arrived.
        waiting_on: String,
    },
    /// The strategy could not create every execution context.
    Startup,
}

impl fmt::Display for FaultSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Component { position, name } => write!(f, "component {name}@{position}"),
            Self::Event { id } => write!(f, "event#{id}"),
            Self::Stall { waiting_on } => write!(f, "stall on {waiting_on}"),
            Self::Startup => write!(f, "startup"),
        }
    }
}

/// One captured fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    /// Cycle counter when the fault was observed.
    pub cycle: Cycle,
    /// Origin of the fault.
    pub source: FaultSource,
    /// Human-readable description.
    pub message: String,
}

impl FaultRecord {
    /// Convert into the error a run reports for this fault.
    #[must_use]
    pub fn to_error(&self) -> ClockError {
        match &self.source {
            FaultSource::Component { position, name } => ClockError::ComponentFault {
                position: *position,
                name: name.clone(),
                message: self.message.clone(),
            },
            FaultSource::Event { .. } => ClockError::EventFault {
                cycle: self.cycle,
                message: self.message.clone(),
            },
            FaultSource::Stall { waiting_on } => ClockError::Stalled {
                cycle: self.cycle,
                waiting_on: waiting_on.clone(),
            },
            FaultSource::Startup => ClockError::Faulted,
        }
    }
}

/// Bounded fault history plus a queue of faults the clock has not acted on yet.
#[derive(Debug)]
pub struct FaultLog {
    history: VecDeque<FaultRecord>,
    capacity: usize,
    unreported: Vec<FaultRecord>,
    total: u64,
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::new(DEFAULT_FAULT_HISTORY)
    }
}

impl FaultLog {
    /// Create a log retaining at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            unreported: Vec::new(),
            total: 0,
        }
    }

    /// Capture a fault. The oldest record is evicted once the history is full.
    pub fn record(&mut self, record: FaultRecord) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());
        self.unreported.push(record);
        self.total += 1;
    }

    /// Retained records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<FaultRecord> {
        self.history.iter().cloned().collect()
    }

    /// Faults recorded since the previous call.
    pub fn take_unreported(&mut self) -> Vec<FaultRecord> {
        std::mem::take(&mut self.unreported)
    }

    /// Total faults recorded, including evicted ones.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Most recent record.
    #[must_use]
    pub fn last(&self) -> Option<&FaultRecord> {
        self.history.back()
    }
}
