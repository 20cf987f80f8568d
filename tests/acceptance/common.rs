//! Common utilities for acceptance tests.
//!
//! Provides:
//! - Strategy iteration
//! - A scriptable component that runs a closure once per step
//! - Event firing recorders

#![allow(dead_code)] // Not every helper is used by every test module

use lockstep_common::config::StrategyKind;
use lockstep_common::time::Cycle;
use lockstep_runtime::{Clock, ClockedComponent, ComponentExit, ComponentResult, EventScope, TickHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound on one cycle so a broken strategy fails instead of hanging.
pub const TEST_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `test` once per strategy.
pub fn for_each_strategy(mut test: impl FnMut(StrategyKind)) {
    for kind in StrategyKind::ALL {
        test(kind);
    }
}

/// A clock using `kind` with a generous stall timeout.
pub fn clock_for(kind: StrategyKind) -> Clock {
    Clock::builder()
        .strategy(kind)
        .stall_timeout(TEST_STALL_TIMEOUT)
        .build()
}

type StepFn = Box<dyn FnMut(u64) -> ComponentResult + Send>;

/// Component that calls a closure with the 1-based step number, then ticks.
pub struct Stepper {
    name: String,
    tick: Option<TickHandle>,
    on_step: StepFn,
}

impl Stepper {
    pub fn new(name: &str, on_step: impl FnMut(u64) -> ComponentResult + Send + 'static) -> Self {
        Self {
            name: name.to_string(),
            tick: None,
            on_step: Box::new(on_step),
        }
    }
}

impl ClockedComponent for Stepper {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&mut self, tick: TickHandle) {
        self.tick = Some(tick);
    }

    fn run(&mut self) -> ComponentResult {
        let tick = self
            .tick
            .take()
            .ok_or_else(|| ComponentExit::fault("not bound"))?;
        let mut step = 0;
        loop {
            step += 1;
            (self.on_step)(step)?;
            tick.wait_for_tick()?;
        }
    }
}

/// A component counting its own steps.
pub fn counter(name: &str) -> (Stepper, Arc<AtomicU64>) {
    let count = Arc::new(AtomicU64::new(0));
    let inner = Arc::clone(&count);
    let stepper = Stepper::new(name, move |_| {
        inner.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });
    (stepper, count)
}

/// Shared log of firing cycles.
#[derive(Clone, Default)]
pub struct Firings(Arc<Mutex<Vec<Cycle>>>);

impl Firings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback appending the firing cycle to this log.
    pub fn recorder(&self) -> impl FnMut(&mut EventScope<'_>) + Send + 'static {
        let log = Arc::clone(&self.0);
        move |scope: &mut EventScope<'_>| log.lock().unwrap().push(scope.cycle())
    }

    pub fn push(&self, cycle: Cycle) {
        self.0.lock().unwrap().push(cycle);
    }

    pub fn cycles(&self) -> Vec<Cycle> {
        self.0.lock().unwrap().clone()
    }
}

/// Shared log of arbitrary labels in firing order.
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}
