//! Token passing through a single atomic "whose turn" word.
//!
//! Ordering is identical to the handoff strategy, but the token is a
//! cache-padded `AtomicUsize` instead of a lock. What a context does while it
//! is not its turn is the [`WaitMode`]: park, busy-spin, yield the
//! timeslice, or spin briefly and then park.

use super::{ComponentOutcome, ComponentSlot, StrategyContext, SyncStrategy};
use crate::tick::{Cancelled, TickPort};
use crate::worker::WorkerSet;
use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::{Backoff, CachePadded};
use lockstep_common::error::{ClockError, ClockResult};
use lockstep_common::time::Cycle;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Turn value meaning the driver holds the token.
const DRIVER: usize = usize::MAX;

/// How a context waits for its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Block with `park`; woken by `unpark` from the previous holder.
    Park,
    /// Busy-wait with spin-loop hints, backing off to yields when oversubscribed.
    Spin,
    /// Re-check after `thread::yield_now`.
    Yield,
    /// Spin up to the configured limit, then park.
    Hybrid,
}

impl WaitMode {
    fn parks(self) -> bool {
        matches!(self, Self::Park | Self::Hybrid)
    }

    fn strategy_name(self) -> &'static str {
        match self {
            Self::Park => "parked",
            Self::Spin => "spin",
            Self::Yield => "yield",
            Self::Hybrid => "hybrid",
        }
    }
}

struct Ring {
    turn: CachePadded<AtomicUsize>,
    retired: Vec<AtomicBool>,
    cancelled: AtomicBool,
    threads: Vec<OnceLock<Thread>>,
    ready: Mutex<usize>,
    all_ready: Condvar,
    driver: Unparker,
    mode: WaitMode,
    spin_limit: u32,
    labels: Vec<String>,
}

impl Ring {
    fn wake(&self, next: usize) {
        self.turn.store(next, Ordering::SeqCst);
        if self.mode.parks() {
            if next == DRIVER {
                self.driver.unpark();
            } else if let Some(thread) = self.threads[next].get() {
                thread.unpark();
            }
        }
    }

    fn pass_after(&self, from: Option<usize>) {
        let start = from.map_or(0, |i| i + 1);
        let next = (start..self.retired.len())
            .find(|&j| !self.retired[j].load(Ordering::Acquire))
            .unwrap_or(DRIVER);
        self.wake(next);
    }

    fn await_turn(&self, index: usize) -> Result<(), Cancelled> {
        let backoff = Backoff::new();
        let mut spins = 0;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return Err(Cancelled);
            }
            if self.turn.load(Ordering::SeqCst) == index {
                return Ok(());
            }
            match self.mode {
                WaitMode::Spin => backoff.snooze(),
                WaitMode::Yield => thread::yield_now(),
                WaitMode::Park => thread::park(),
                WaitMode::Hybrid if spins < self.spin_limit => {
                    spins += 1;
                    backoff.spin();
                }
                WaitMode::Hybrid => thread::park(),
            }
        }
    }

    fn register(&self, index: usize) {
        let first = self.threads[index].set(thread::current()).is_ok();
        debug_assert!(first, "ring slot {index} registered twice");
        let mut ready = self.ready.lock();
        *ready += 1;
        self.all_ready.notify_all();
    }

    fn retire(&self, index: usize) {
        self.retired[index].store(true, Ordering::Release);
        if self.turn.load(Ordering::SeqCst) == index {
            self.pass_after(Some(index));
        }
    }

    fn waiting_on(&self) -> String {
        match self.turn.load(Ordering::SeqCst) {
            DRIVER => String::from("driver"),
            i => self.labels[i].clone(),
        }
    }
}

struct RingPort {
    ring: Arc<Ring>,
    index: usize,
}

impl TickPort for RingPort {
    fn wait_for_tick(&self) -> Result<(), Cancelled> {
        if self.ring.cancelled.load(Ordering::Acquire) {
            return Err(Cancelled);
        }
        self.ring.pass_after(Some(self.index));
        self.ring.await_turn(self.index)
    }
}

/// Sequential strategy passing an atomic turn word between threads.
pub struct RingStrategy {
    mode: WaitMode,
    ring: Option<Arc<Ring>>,
    parker: Parker,
    workers: WorkerSet,
    stall_timeout: Option<Duration>,
    stall_check_interval: u32,
    grace: Duration,
}

impl RingStrategy {
    /// Create an unstarted strategy using `mode` to wait.
    #[must_use]
    pub fn new(mode: WaitMode) -> Self {
        Self {
            mode,
            ring: None,
            parker: Parker::new(),
            workers: WorkerSet::new(),
            stall_timeout: None,
            stall_check_interval: 1,
            grace: super::DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Wait mode in use.
    #[must_use]
    pub fn mode(&self) -> WaitMode {
        self.mode
    }
}

impl SyncStrategy for RingStrategy {
    fn name(&self) -> &'static str {
        self.mode.strategy_name()
    }

    fn start(&mut self, ctx: &StrategyContext, components: Vec<ComponentSlot>) -> ClockResult<()> {
        let count = components.len();
        let config = ctx.config();
        let ring = Arc::new(Ring {
            turn: CachePadded::new(AtomicUsize::new(DRIVER)),
            retired: (0..count).map(|_| AtomicBool::new(false)).collect(),
            cancelled: AtomicBool::new(false),
            threads: (0..count).map(|_| OnceLock::new()).collect(),
            ready: Mutex::new(0),
            all_ready: Condvar::new(),
            driver: self.parker.unparker().clone(),
            mode: self.mode,
            spin_limit: config.spin.spin_limit,
            labels: components.iter().map(ComponentSlot::label).collect(),
        });
        self.stall_timeout = config.stall_timeout;
        self.stall_check_interval = config.spin.stall_check_interval.max(1);
        self.grace = ctx.shutdown_grace();
        self.ring = Some(Arc::clone(&ring));

        for (index, mut slot) in components.into_iter().enumerate() {
            slot.install_port(Box::new(RingPort {
                ring: Arc::clone(&ring),
                index,
            }));
            let ring = Arc::clone(&ring);
            let worker_ctx = ctx.clone();
            let position = slot.position();
            let name = slot.name().to_string();

            self.workers
                .spawn(&config.threads, index, position, &name, move || {
                    ring.register(index);
                    let outcome = match ring.await_turn(index) {
                        Ok(()) => slot.run(),
                        Err(Cancelled) => ComponentOutcome::Cancelled,
                    };
                    worker_ctx.report_exit(position, slot.name(), outcome);
                    ring.retire(index);
                })?;
        }

        // Every worker must be unparkable before the first hand-off.
        let mut ready = ring.ready.lock();
        ring.all_ready.wait_while(&mut ready, |ready| *ready < count);
        drop(ready);

        debug!(components = count, mode = ?self.mode, "Ring workers started");
        Ok(())
    }

    fn step(&mut self, cycle: Cycle) -> ClockResult<()> {
        let Some(ring) = &self.ring else {
            return Ok(());
        };
        ring.pass_after(None);

        let deadline = self.stall_timeout.map(|timeout| Instant::now() + timeout);
        let backoff = Backoff::new();
        let mut spins: u32 = 0;
        loop {
            if ring.turn.load(Ordering::SeqCst) == DRIVER {
                return Ok(());
            }

            spins = spins.wrapping_add(1);
            if let Some(deadline) = deadline {
                let check_now = self.mode.parks() || spins % self.stall_check_interval == 0;
                if check_now && Instant::now() >= deadline {
                    let waiting_on = ring.waiting_on();
                    error!(cycle, %waiting_on, mode = ?self.mode, "Ring stalled");
                    return Err(ClockError::Stalled { cycle, waiting_on });
                }
            }

            match self.mode {
                WaitMode::Spin => backoff.snooze(),
                WaitMode::Yield => thread::yield_now(),
                WaitMode::Hybrid if spins < ring.spin_limit => backoff.spin(),
                WaitMode::Park | WaitMode::Hybrid => match deadline {
                    Some(deadline) => self.parker.park_deadline(deadline),
                    None => self.parker.park(),
                },
            }
        }
    }

    fn shutdown(&mut self) -> usize {
        if let Some(ring) = &self.ring {
            ring.cancelled.store(true, Ordering::SeqCst);
            for thread in ring.threads.iter().filter_map(OnceLock::get) {
                thread.unpark();
            }
        }
        self.workers.shutdown(self.grace)
    }
}
