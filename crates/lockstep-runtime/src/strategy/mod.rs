//! Pluggable synchronization strategies.
//!
//! A strategy owns the execution contexts of every registered component and
//! implements one operation: release exactly one step of every component and
//! return only once each of them has reached its next tick (or exited). The
//! clock advances the counter and fires due events before calling
//! [`SyncStrategy::step`], so components always observe the new cycle.
//!
//! | Kind | Contexts | Hand-off |
//! |------|----------|----------|
//! | `handoff` | thread per component | mutex token + condvar per component |
//! | `parked` | thread per component | atomic turn word + park/unpark |
//! | `spin` | thread per component | atomic turn word, busy spin |
//! | `yield` | thread per component | atomic turn word, `yield_now` |
//! | `hybrid` | thread per component | bounded spin, then park |
//! | `barrier` | thread per component | all parallel, two-phase barrier |
//! | `fiber` | driver thread only | stackful coroutine resume/yield |

mod barrier;
mod fiber;
mod handoff;
mod ring;

pub use barrier::BarrierStrategy;
pub use fiber::FiberStrategy;
pub use handoff::HandoffStrategy;
pub use ring::{RingStrategy, WaitMode};

use crate::fault_recorder::{FaultRecord, FaultSource};
use crate::handle::ClockShared;
use crate::tick::{ClockedComponent, TickPort, TickSlot};
use crate::worker;
use lockstep_common::config::{ClockConfig, StrategyKind};
use lockstep_common::error::ClockResult;
use lockstep_common::time::Cycle;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Grace period for worker threads to exit when no stall timeout is set.
pub(crate) const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How a component's execution context ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentOutcome {
    /// `run` returned `Ok(())`.
    Finished,
    /// `run` observed cancellation, or never started before disposal.
    Cancelled,
    /// `run` returned a fault or panicked.
    Faulted(String),
}

/// A registered component handed to a strategy at start.
pub struct ComponentSlot {
    position: u32,
    name: String,
    component: Box<dyn ClockedComponent>,
    tick: Arc<TickSlot>,
}

impl ComponentSlot {
    pub(crate) fn new(component: Box<dyn ClockedComponent>, tick: Arc<TickSlot>) -> Self {
        Self {
            position: tick.position(),
            name: component.name().to_string(),
            component,
            tick,
        }
    }

    /// Registration position.
    #[must_use]
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Component name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the suspension point the component's tick handle will use.
    ///
    /// Returns false if a port was already installed.
    pub fn install_port(&self, port: Box<dyn TickPort>) -> bool {
        self.tick.install(port)
    }

    /// Run the component body to completion, catching panics.
    pub fn run(&mut self) -> ComponentOutcome {
        worker::run_component(self.component.as_mut())
    }

    /// Diagnostic label, `name@position`.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.position)
    }
}

impl std::fmt::Debug for ComponentSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentSlot")
            .field("position", &self.position)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// What a strategy may see of the clock.
#[derive(Clone)]
pub struct StrategyContext {
    shared: Arc<ClockShared>,
    config: Arc<ClockConfig>,
}

impl StrategyContext {
    pub(crate) fn new(shared: Arc<ClockShared>, config: Arc<ClockConfig>) -> Self {
        Self { shared, config }
    }

    /// Clock configuration.
    #[must_use]
    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Current cycle number.
    #[must_use]
    pub fn current_cycle(&self) -> Cycle {
        self.shared.current_cycle()
    }

    /// How long to wait for workers to exit at shutdown.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        self.config.stall_timeout.unwrap_or(DEFAULT_SHUTDOWN_GRACE)
    }

    /// Record how a component's execution context ended.
    ///
    /// Must be called before the strategy lets the driver observe the
    /// component as retired, so the fault is visible at the cycle boundary.
    pub fn report_exit(&self, position: u32, name: &str, outcome: ComponentOutcome) {
        let exits = &self.shared.exits;
        let cycle = self.current_cycle();
        match outcome {
            ComponentOutcome::Finished => {
                exits.finished.fetch_add(1, Ordering::AcqRel);
                debug!(position, name, cycle, "Component finished");
            }
            ComponentOutcome::Cancelled => {
                exits.cancelled.fetch_add(1, Ordering::AcqRel);
                debug!(position, name, cycle, "Component cancelled");
            }
            ComponentOutcome::Faulted(message) => {
                exits.faulted.fetch_add(1, Ordering::AcqRel);
                warn!(position, name, cycle, %message, "Component faulted");
                self.shared.record_fault(FaultRecord {
                    cycle,
                    source: FaultSource::Component {
                        position,
                        name: name.to_string(),
                    },
                    message,
                });
            }
        }
    }
}

/// Mechanism that advances every component by one step per cycle.
pub trait SyncStrategy: Send {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    /// Create execution contexts for `components`, already sorted by position.
    ///
    /// No component may execute any of its body before the first `step`.
    fn start(&mut self, ctx: &StrategyContext, components: Vec<ComponentSlot>) -> ClockResult<()>;

    /// Release one step of every live component for `cycle` and wait for all
    /// of them to suspend again or exit.
    fn step(&mut self, cycle: Cycle) -> ClockResult<()>;

    /// Cancel every component and release execution contexts.
    ///
    /// Returns the number of contexts that could not be reclaimed.
    fn shutdown(&mut self) -> usize;
}

/// Instantiate the strategy named by `kind`.
#[must_use]
pub fn create(kind: StrategyKind) -> Box<dyn SyncStrategy> {
    match kind {
        StrategyKind::Handoff => Box::new(HandoffStrategy::new()),
        StrategyKind::Parked => Box::new(RingStrategy::new(WaitMode::Park)),
        StrategyKind::Spin => Box::new(RingStrategy::new(WaitMode::Spin)),
        StrategyKind::Yield => Box::new(RingStrategy::new(WaitMode::Yield)),
        StrategyKind::Hybrid => Box::new(RingStrategy::new(WaitMode::Hybrid)),
        StrategyKind::Barrier => Box::new(BarrierStrategy::new()),
        StrategyKind::Fiber => Box::new(FiberStrategy::new()),
    }
}
