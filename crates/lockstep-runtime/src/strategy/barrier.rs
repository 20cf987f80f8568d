//! Parallel execution gated by a reusable two-phase barrier.
//!
//! Every cycle has two barrier generations with the driver as an extra
//! party: the *go* phase releases all components at once, the *done* phase
//! holds the driver until every component has reached its next tick. The
//! counter increment and event firing for cycle N+1 happen on the driver
//! while all components are parked at the go phase, so effects a component
//! publishes during cycle N become visible to others only from N+1.

use super::{ComponentOutcome, ComponentSlot, StrategyContext, SyncStrategy};
use crate::tick::{Cancelled, TickPort};
use crate::worker::WorkerSet;
use lockstep_common::error::{ClockError, ClockResult};
use lockstep_common::time::Cycle;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateError {
    Cancelled,
    TimedOut,
}

struct GateState {
    parties: usize,
    arrived: usize,
    generation: u64,
    cancelled: bool,
}

impl GateState {
    fn trip(&mut self) {
        self.arrived = 0;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Barrier whose party count shrinks as components retire.
struct Gate {
    state: Mutex<GateState>,
    tripped: Condvar,
}

impl Gate {
    fn new(parties: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                parties,
                arrived: 0,
                generation: 0,
                cancelled: false,
            }),
            tripped: Condvar::new(),
        }
    }

    fn arrive(&self, deadline: Option<Instant>) -> Result<(), GateError> {
        let mut state = self.state.lock();
        if state.cancelled {
            return Err(GateError::Cancelled);
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived >= state.parties {
            state.trip();
            self.tripped.notify_all();
            return Ok(());
        }

        let waiting = |s: &mut GateState| s.generation == generation && !s.cancelled;
        match deadline {
            Some(deadline) => {
                if self
                    .tripped
                    .wait_while_until(&mut state, waiting, deadline)
                    .timed_out()
                {
                    return Err(GateError::TimedOut);
                }
            }
            None => self.tripped.wait_while(&mut state, waiting),
        }

        if state.generation != generation {
            Ok(())
        } else {
            Err(GateError::Cancelled)
        }
    }

    fn deregister(&self) {
        let mut state = self.state.lock();
        state.parties = state.parties.saturating_sub(1);
        if state.arrived > 0 && state.arrived >= state.parties {
            state.trip();
            self.tripped.notify_all();
        }
    }

    fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.tripped.notify_all();
    }
}

struct Crew {
    gate: Gate,
    completed: Vec<AtomicU64>,
    retired: Vec<AtomicBool>,
    labels: Vec<String>,
}

impl Crew {
    fn enter(&self) -> Result<(), Cancelled> {
        self.gate.arrive(None).map_err(|_| Cancelled)
    }

    fn retire(&self, index: usize) {
        self.retired[index].store(true, Ordering::Release);
        self.gate.deregister();
    }

    fn laggards(&self, steps: u64) -> String {
        let names: Vec<&str> = self
            .labels
            .iter()
            .enumerate()
            .filter(|&(i, _)| {
                !self.retired[i].load(Ordering::Acquire)
                    && self.completed[i].load(Ordering::Acquire) < steps
            })
            .map(|(_, label)| label.as_str())
            .collect();
        if names.is_empty() {
            String::from("barrier")
        } else {
            names.join(", ")
        }
    }
}

struct BarrierPort {
    crew: Arc<Crew>,
    index: usize,
}

impl TickPort for BarrierPort {
    fn wait_for_tick(&self) -> Result<(), Cancelled> {
        self.crew.completed[self.index].fetch_add(1, Ordering::AcqRel);
        // done phase for this cycle, then go phase for the next
        self.crew.enter()?;
        self.crew.enter()
    }
}

/// Parallel strategy releasing every component at once each cycle.
#[derive(Default)]
pub struct BarrierStrategy {
    crew: Option<Arc<Crew>>,
    workers: WorkerSet,
    stall_timeout: Option<Duration>,
    grace: Duration,
    steps: u64,
}

impl BarrierStrategy {
    /// Create an unstarted strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncStrategy for BarrierStrategy {
    fn name(&self) -> &'static str {
        "barrier"
    }

    fn start(&mut self, ctx: &StrategyContext, components: Vec<ComponentSlot>) -> ClockResult<()> {
        let count = components.len();
        let crew = Arc::new(Crew {
            gate: Gate::new(count + 1),
            completed: (0..count).map(|_| AtomicU64::new(0)).collect(),
            retired: (0..count).map(|_| AtomicBool::new(false)).collect(),
            labels: components.iter().map(ComponentSlot::label).collect(),
        });
        self.stall_timeout = ctx.config().stall_timeout;
        self.grace = ctx.shutdown_grace();
        self.crew = Some(Arc::clone(&crew));

        for (index, mut slot) in components.into_iter().enumerate() {
            slot.install_port(Box::new(BarrierPort {
                crew: Arc::clone(&crew),
                index,
            }));
            let crew = Arc::clone(&crew);
            let worker_ctx = ctx.clone();
            let position = slot.position();
            let name = slot.name().to_string();

            self.workers
                .spawn(&ctx.config().threads, index, position, &name, move || {
                    let outcome = match crew.enter() {
                        Ok(()) => slot.run(),
                        Err(Cancelled) => ComponentOutcome::Cancelled,
                    };
                    worker_ctx.report_exit(position, slot.name(), outcome);
                    crew.retire(index);
                })?;
        }

        debug!(components = count, "Barrier workers started");
        Ok(())
    }

    fn step(&mut self, cycle: Cycle) -> ClockResult<()> {
        let Some(crew) = &self.crew else {
            return Ok(());
        };
        self.steps += 1;
        let deadline = self.stall_timeout.map(|timeout| Instant::now() + timeout);

        for phase in ["go", "done"] {
            match crew.gate.arrive(deadline) {
                Ok(()) => {}
                Err(GateError::TimedOut) => {
                    let waiting_on = crew.laggards(self.steps);
                    error!(cycle, phase, %waiting_on, "Barrier stalled");
                    return Err(ClockError::Stalled { cycle, waiting_on });
                }
                Err(GateError::Cancelled) => return Err(ClockError::Disposed),
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) -> usize {
        if let Some(crew) = &self.crew {
            crew.gate.cancel();
        }
        self.workers.shutdown(self.grace)
    }
}
