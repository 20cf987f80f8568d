//! Token handoff through a mutex and one condition variable per component.
//!
//! A single token moves driver → component 0 → component 1 → … → driver.
//! Only the holder runs; every other context sleeps on its own condvar, so
//! each hop wakes exactly one thread.

use super::{ComponentOutcome, ComponentSlot, StrategyContext, SyncStrategy};
use crate::tick::{Cancelled, TickPort};
use crate::worker::WorkerSet;
use lockstep_common::error::{ClockError, ClockResult};
use lockstep_common::time::Cycle;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Driver,
    Component(usize),
}

struct Token {
    holder: Holder,
    retired: Vec<bool>,
    cancelled: bool,
}

struct Baton {
    token: Mutex<Token>,
    turns: Vec<Condvar>,
    driver: Condvar,
    labels: Vec<String>,
}

impl Baton {
    /// Give the token to the first live component after `from`, or back to the driver.
    fn pass_after(&self, token: &mut MutexGuard<'_, Token>, from: Option<usize>) {
        let start = from.map_or(0, |i| i + 1);
        match (start..token.retired.len()).find(|&j| !token.retired[j]) {
            Some(next) => {
                token.holder = Holder::Component(next);
                self.turns[next].notify_one();
            }
            None => {
                token.holder = Holder::Driver;
                self.driver.notify_one();
            }
        }
    }

    /// Block until `index` holds the token. Errors once cancelled.
    fn await_turn(&self, token: &mut MutexGuard<'_, Token>, index: usize) -> Result<(), Cancelled> {
        self.turns[index].wait_while(token, |t| {
            t.holder != Holder::Component(index) && !t.cancelled
        });
        if token.cancelled {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    fn retire(&self, index: usize) {
        let mut token = self.token.lock();
        token.retired[index] = true;
        if token.holder == Holder::Component(index) {
            self.pass_after(&mut token, Some(index));
        }
    }
}

struct HandoffPort {
    baton: Arc<Baton>,
    index: usize,
}

impl TickPort for HandoffPort {
    fn wait_for_tick(&self) -> Result<(), Cancelled> {
        let mut token = self.baton.token.lock();
        if token.cancelled {
            return Err(Cancelled);
        }
        self.baton.pass_after(&mut token, Some(self.index));
        self.baton.await_turn(&mut token, self.index)
    }
}

/// Sequential strategy passing a lock-protected token between threads.
#[derive(Default)]
pub struct HandoffStrategy {
    baton: Option<Arc<Baton>>,
    workers: WorkerSet,
    stall_timeout: Option<Duration>,
    grace: Duration,
}

impl HandoffStrategy {
    /// Create an unstarted strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncStrategy for HandoffStrategy {
    fn name(&self) -> &'static str {
        "handoff"
    }

    fn start(&mut self, ctx: &StrategyContext, components: Vec<ComponentSlot>) -> ClockResult<()> {
        let count = components.len();
        let baton = Arc::new(Baton {
            token: Mutex::new(Token {
                holder: Holder::Driver,
                retired: vec![false; count],
                cancelled: false,
            }),
            turns: (0..count).map(|_| Condvar::new()).collect(),
            driver: Condvar::new(),
            labels: components.iter().map(ComponentSlot::label).collect(),
        });
        self.stall_timeout = ctx.config().stall_timeout;
        self.grace = ctx.shutdown_grace();
        self.baton = Some(Arc::clone(&baton));

        for (index, mut slot) in components.into_iter().enumerate() {
            slot.install_port(Box::new(HandoffPort {
                baton: Arc::clone(&baton),
                index,
            }));
            let baton = Arc::clone(&baton);
            let worker_ctx = ctx.clone();
            let position = slot.position();
            let name = slot.name().to_string();

            self.workers
                .spawn(&ctx.config().threads, index, position, &name, move || {
                    let started = {
                        let mut token = baton.token.lock();
                        baton.await_turn(&mut token, index)
                    };
                    let outcome = match started {
                        Ok(()) => slot.run(),
                        Err(Cancelled) => ComponentOutcome::Cancelled,
                    };
                    worker_ctx.report_exit(position, slot.name(), outcome);
                    baton.retire(index);
                })?;
        }

        debug!(components = count, "Handoff workers started");
        Ok(())
    }

    fn step(&mut self, cycle: Cycle) -> ClockResult<()> {
        let Some(baton) = &self.baton else {
            return Ok(());
        };
        let mut token = baton.token.lock();
        baton.pass_after(&mut token, None);

        match self.stall_timeout {
            Some(timeout) => {
                let result =
                    baton
                        .driver
                        .wait_while_for(&mut token, |t| t.holder != Holder::Driver, timeout);
                if result.timed_out() {
                    let waiting_on = match token.holder {
                        Holder::Component(i) => baton.labels[i].clone(),
                        Holder::Driver => String::from("driver"),
                    };
                    error!(cycle, %waiting_on, "Handoff stalled");
                    return Err(ClockError::Stalled { cycle, waiting_on });
                }
            }
            None => baton
                .driver
                .wait_while(&mut token, |t| t.holder != Holder::Driver),
        }
        Ok(())
    }

    fn shutdown(&mut self) -> usize {
        if let Some(baton) = &self.baton {
            let mut token = baton.token.lock();
            token.cancelled = true;
            for turn in &baton.turns {
                turn.notify_all();
            }
            baton.driver.notify_all();
        }
        self.workers.shutdown(self.grace)
    }
}
