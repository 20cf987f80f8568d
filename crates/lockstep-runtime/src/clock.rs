//! The global clock.
//!
//! Owns the cycle counter, the event queue and the active synchronization
//! strategy. One advancement is always:
//!
//! 1. increment the cycle counter (under the event-queue lock)
//! 2. fire every event due at or before the new cycle
//! 3. let the strategy release one step of every component
//! 4. record latency and act on faults captured during the cycle
//!
//! Components are registered before the first run; their execution contexts
//! are created lazily on first `run` and torn down by [`Clock::dispose`] or
//! when the clock is dropped.

use crate::events::{EventId, EventScope};
use crate::fault_recorder::{FaultRecord, FaultSource};
use crate::handle::{ClockHandle, ClockShared};
use crate::strategy::{self, ComponentSlot, StrategyContext, SyncStrategy};
use crate::tick::{ClockedComponent, ComponentHandle, TickHandle, TickSlot};
use lockstep_common::config::{ClockConfig, FaultPolicy, StrategyKind};
use lockstep_common::error::{ClockError, ClockResult};
use lockstep_common::metrics::CycleMetrics;
use lockstep_common::state::{ClockState, StateMachine};
use lockstep_common::time::Cycle;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Summary produced when a clock is disposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Strategy that drove the clock.
    pub strategy: &'static str,
    /// Cycle counter at disposal.
    pub cycles: Cycle,
    /// Components whose `run` returned normally.
    pub finished: usize,
    /// Components stopped by cancellation.
    pub cancelled: usize,
    /// Components that faulted.
    pub faulted: usize,
    /// Execution contexts that did not exit and were abandoned.
    pub detached: usize,
    /// Events still pending at disposal.
    pub dropped_events: usize,
    /// Captured faults, oldest first.
    pub faults: Vec<FaultRecord>,
}

impl ShutdownReport {
    /// No faults were captured and every context was reclaimed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty() && self.detached == 0
    }
}

/// Cycle-lockstep clock driving a set of components.
pub struct Clock {
    shared: Arc<ClockShared>,
    config: Arc<ClockConfig>,
    state: StateMachine,
    strategy: Box<dyn SyncStrategy>,
    pending: BTreeMap<u32, ComponentSlot>,
    components: BTreeMap<u32, ComponentHandle>,
    metrics: CycleMetrics,
    /// Components lost to a failed start; reported as cancelled.
    stranded: usize,
    detached: usize,
    report: Option<ShutdownReport>,
}

impl Clock {
    /// Create a clock using the strategy named in `config`.
    #[must_use]
    pub fn new(config: ClockConfig) -> Self {
        let strategy = strategy::create(config.strategy);
        Self::with_strategy(config, strategy)
    }

    /// Create a clock driven by a caller-supplied strategy.
    #[must_use]
    pub fn with_strategy(config: ClockConfig, strategy: Box<dyn SyncStrategy>) -> Self {
        let metrics = CycleMetrics::new(config.metrics.window, config.metrics.slow_cycle);
        Self {
            shared: ClockShared::new(config.fault_history),
            config: Arc::new(config),
            state: StateMachine::new(),
            strategy,
            pending: BTreeMap::new(),
            components: BTreeMap::new(),
            metrics,
            stranded: 0,
            detached: 0,
            report: None,
        }
    }

    /// Create a clock with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(ClockConfig::default())
    }

    /// Start building a clock.
    #[must_use]
    pub fn builder() -> ClockBuilder {
        ClockBuilder::new()
    }

    /// Capability handle for components, callbacks and other threads.
    #[must_use]
    pub fn handle(&self) -> ClockHandle {
        ClockHandle::from_shared(Arc::clone(&self.shared))
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ClockConfig {
        &self.config
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClockState {
        self.state.state()
    }

    /// Name of the active strategy.
    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Current cycle number.
    #[must_use]
    pub fn current_cycle(&self) -> Cycle {
        self.shared.current_cycle()
    }

    /// Cycle latency metrics.
    #[must_use]
    pub fn metrics(&self) -> &CycleMetrics {
        &self.metrics
    }

    /// Retained fault records, oldest first.
    #[must_use]
    pub fn faults(&self) -> Vec<FaultRecord> {
        self.shared.fault_records()
    }

    /// Registered components in position order.
    pub fn components(&self) -> impl Iterator<Item = &ComponentHandle> {
        self.components.values()
    }

    /// Component registered at `position`.
    #[must_use]
    pub fn component(&self, position: u32) -> Option<&ComponentHandle> {
        self.components.get(&position)
    }

    /// Register a component at a unique ordinal position.
    ///
    /// The component receives its [`TickHandle`] through `bind` before this
    /// returns. Components execute in ascending position order.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` after the first run, `DuplicatePosition` if the
    /// position is taken, `Disposed`/`Faulted` on an unusable clock.
    pub fn add_component<C>(&mut self, position: u32, mut component: C) -> ClockResult<ComponentHandle>
    where
        C: ClockedComponent,
    {
        self.state.ensure_usable()?;
        if self.state.state().is_started() {
            return Err(ClockError::AlreadyStarted);
        }
        if self.pending.contains_key(&position) {
            return Err(ClockError::DuplicatePosition(position));
        }

        let tick = TickSlot::new(position);
        component.bind(TickHandle::new(Arc::clone(&tick)));
        let handle = ComponentHandle::new(Arc::clone(&tick), component.name());
        debug!(position, name = component.name(), "Component registered");

        self.pending
            .insert(position, ComponentSlot::new(Box::new(component), tick));
        self.components.insert(position, handle.clone());
        Ok(handle)
    }

    /// Schedule `callback` to fire at `cycle`, which must be after the current cycle.
    ///
    /// # Errors
    ///
    /// `ScheduleInPast` if `cycle <= current_cycle()`, `Disposed` after disposal.
    pub fn schedule<F>(&self, cycle: Cycle, callback: F) -> ClockResult<EventId>
    where
        F: FnMut(&mut EventScope<'_>) + Send + 'static,
    {
        self.shared.schedule(cycle, Box::new(callback))
    }

    /// Cancel a pending event. `Ok(false)` if it already fired or is unknown.
    ///
    /// # Errors
    ///
    /// `Disposed` after disposal.
    pub fn cancel(&self, id: EventId) -> ClockResult<bool> {
        self.shared.cancel(id)
    }

    /// Atomically move a pending event to `cycle`.
    ///
    /// # Errors
    ///
    /// `ScheduleInPast` if `cycle <= current_cycle()`, `Disposed` after disposal.
    pub fn reschedule(&self, id: EventId, cycle: Cycle) -> ClockResult<bool> {
        self.shared.reschedule(id, cycle)
    }

    /// Whether the event will fire (again). While its callback runs, an
    /// event counts as pending only once it has been renewed or moved.
    #[must_use]
    pub fn is_pending(&self, id: EventId) -> bool {
        self.shared.is_pending(id)
    }

    /// Number of events waiting to fire.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.shared.pending_events()
    }

    /// Earliest cycle with a pending event.
    #[must_use]
    pub fn next_due(&self) -> Option<Cycle> {
        self.shared.next_due()
    }

    /// Create execution contexts for every registered component.
    ///
    /// Called implicitly by the first `run`; a no-op once started.
    ///
    /// # Errors
    ///
    /// Fails if the clock is unusable or a worker thread cannot be spawned.
    /// A failed start tears down the contexts created so far and faults the
    /// clock; only `dispose` is legal afterwards.
    pub fn start(&mut self) -> ClockResult<()> {
        self.state.ensure_usable()?;
        if self.state.state().is_started() {
            return Ok(());
        }

        let components: Vec<ComponentSlot> = std::mem::take(&mut self.pending).into_values().collect();
        let count = components.len();
        let ctx = StrategyContext::new(Arc::clone(&self.shared), Arc::clone(&self.config));
        if let Err(e) = self.strategy.start(&ctx, components) {
            self.abandon_start(count, &e);
            return Err(e);
        }
        self.state.transition(ClockState::Idle)?;

        info!(
            strategy = self.strategy.name(),
            components = count,
            stall_timeout = ?self.config.stall_timeout,
            "Clock started"
        );
        Ok(())
    }

    fn abandon_start(&mut self, count: usize, cause: &ClockError) {
        self.detached += self.strategy.shutdown();

        let exits = &self.shared.exits;
        let reported = exits.finished.load(Ordering::Acquire)
            + exits.cancelled.load(Ordering::Acquire)
            + exits.faulted.load(Ordering::Acquire);
        self.stranded = count.saturating_sub(reported + self.detached);

        error!(error = %cause, components = count, "Clock failed to start");
        self.shared.record_fault(FaultRecord {
            cycle: self.current_cycle(),
            source: FaultSource::Startup,
            message: cause.to_string(),
        });
        self.shared.take_unreported_faults();
        if let Err(e) = self.state.transition(ClockState::Faulted) {
            warn!(error = %e, "Unexpected state after failed start");
        }
    }

    /// Advance exactly `cycles` cycles, then return with all component state preserved.
    ///
    /// # Errors
    ///
    /// Returns the first event fault (or component fault under
    /// [`FaultPolicy::Abort`]) after finishing the cycle it occurred in; the
    /// clock returns to idle. A stall faults the clock.
    pub fn run(&mut self, cycles: u64) -> ClockResult<()> {
        self.state.ensure_usable()?;
        self.start()?;
        self.state.transition(ClockState::RunningBounded)?;

        let from = self.current_cycle();
        let started = Instant::now();
        let mut result = Ok(());
        for _ in 0..cycles {
            result = self.advance_one_cycle();
            if result.is_err() {
                break;
            }
        }
        self.finish_run(&result)?;

        debug!(
            from,
            to = self.current_cycle(),
            elapsed_us = started.elapsed().as_micros(),
            "Bounded run complete"
        );
        result
    }

    /// Run until [`ClockHandle::request_dispose`] is observed at a cycle
    /// boundary, then dispose.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Clock::run`]; the clock is not disposed on error.
    pub fn run_forever(&mut self) -> ClockResult<ShutdownReport> {
        self.state.ensure_usable()?;
        self.start()?;
        self.state.transition(ClockState::RunningUnbounded)?;
        info!(from = self.current_cycle(), "Running until disposed");

        let result = loop {
            if self.shared.dispose_requested() {
                break Ok(());
            }
            if let Err(e) = self.advance_one_cycle() {
                break Err(e);
            }
        };
        self.finish_run(&result)?;
        result?;
        Ok(self.dispose())
    }

    fn finish_run(&mut self, result: &ClockResult<()>) -> ClockResult<()> {
        match result {
            Err(ClockError::Stalled { .. }) => self.state.transition(ClockState::Faulted),
            _ => self.state.transition(ClockState::Idle),
        }
    }

    fn advance_one_cycle(&mut self) -> ClockResult<()> {
        let started = Instant::now();
        let cycle = self.shared.begin_cycle();
        let fired = self.shared.fire_due(cycle);

        if let Err(e) = self.strategy.step(cycle) {
            if let ClockError::Stalled { waiting_on, .. } = &e {
                error!(cycle, %waiting_on, "Cycle stalled; clock faulted");
                self.shared.record_fault(FaultRecord {
                    cycle,
                    source: FaultSource::Stall {
                        waiting_on: waiting_on.clone(),
                    },
                    message: e.to_string(),
                });
                self.shared.take_unreported_faults();
            }
            return Err(e);
        }

        if self.config.metrics.enabled {
            self.metrics.record(cycle, started.elapsed(), fired);
        }
        trace!(cycle, fired, "Cycle complete");
        self.check_faults()
    }

    fn check_faults(&mut self) -> ClockResult<()> {
        let abort_on_component = self.config.fault_policy == FaultPolicy::Abort;
        self.shared
            .take_unreported_faults()
            .into_iter()
            .find(|record| match record.source {
                FaultSource::Component { .. } => abort_on_component,
                FaultSource::Event { .. } | FaultSource::Stall { .. } | FaultSource::Startup => true,
            })
            .map_or(Ok(()), |record| Err(record.to_error()))
    }

    /// Cancel every component, release execution contexts and drop pending events.
    ///
    /// Idempotent: later calls return the same report.
    pub fn dispose(&mut self) -> ShutdownReport {
        if let Some(report) = &self.report {
            return report.clone();
        }

        self.shared.mark_disposed();
        let detached = self.detached + self.strategy.shutdown();
        let unstarted = self.pending.len() + self.stranded;
        self.pending.clear();
        let dropped_events = self.shared.clear_events();

        if let Err(e) = self.state.transition(ClockState::Disposed) {
            warn!(error = %e, "Unexpected state at dispose");
        }

        let exits = &self.shared.exits;
        let report = ShutdownReport {
            strategy: self.strategy.name(),
            cycles: self.current_cycle(),
            finished: exits.finished.load(Ordering::Acquire),
            cancelled: exits.cancelled.load(Ordering::Acquire) + unstarted,
            faulted: exits.faulted.load(Ordering::Acquire),
            detached,
            dropped_events,
            faults: self.shared.fault_records(),
        };

        if report.detached > 0 {
            warn!(detached = report.detached, "Execution contexts abandoned at dispose");
        }
        info!(
            cycles = report.cycles,
            finished = report.finished,
            cancelled = report.cancelled,
            faulted = report.faulted,
            dropped_events,
            "Clock disposed"
        );

        self.report = Some(report.clone());
        report
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("strategy", &self.strategy.name())
            .field("state", &self.state.state())
            .field("cycle", &self.current_cycle())
            .field("components", &self.components.len())
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a clock.
#[derive(Default)]
pub struct ClockBuilder {
    config: ClockConfig,
    strategy: Option<Box<dyn SyncStrategy>>,
}

impl ClockBuilder {
    /// Create a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a built-in strategy.
    #[must_use]
    pub fn strategy(mut self, kind: StrategyKind) -> Self {
        self.config.strategy = kind;
        self
    }

    /// Use a custom strategy implementation instead of a built-in one.
    #[must_use]
    pub fn custom_strategy(mut self, strategy: Box<dyn SyncStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Give up on a cycle that takes longer than `timeout` to complete.
    #[must_use]
    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.config.stall_timeout = Some(timeout);
        self
    }

    /// Set the component fault policy.
    #[must_use]
    pub fn fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.config.fault_policy = policy;
        self
    }

    /// Set the number of fault records retained.
    #[must_use]
    pub fn fault_history(mut self, records: usize) -> Self {
        self.config.fault_history = records;
        self
    }

    /// Set the full configuration.
    #[must_use]
    pub fn config(mut self, config: ClockConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the clock.
    #[must_use]
    pub fn build(self) -> Clock {
        match self.strategy {
            Some(strategy) => Clock::with_strategy(self.config, strategy),
            None => Clock::new(self.config),
        }
    }
}
