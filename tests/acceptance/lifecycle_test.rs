//! Clock lifecycle acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - Registration only before start, at unique positions
//! - No component body runs before the first cycle
//! - `dispose` cancels every component, drops their execution contexts, and
//!   is idempotent
//! - Every mutating operation fails after disposal
//! - `run_forever` stops at the cycle boundary after a dispose request
//! - A clock whose contexts cannot be created refuses every later run

use super::common::{clock_for, counter, for_each_strategy, Firings, Stepper};
use lockstep_common::config::{ClockConfig, StrategyKind};
use lockstep_common::error::ClockError;
use lockstep_common::state::ClockState;
use lockstep_runtime::{Clock, ClockedComponent, ComponentResult, EventScope, FaultSource, TickHandle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Sets a flag when dropped, i.e. when its execution context is gone.
struct DropFlag {
    dropped: Arc<AtomicBool>,
    tick: Option<TickHandle>,
}

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::Release);
    }
}

impl ClockedComponent for DropFlag {
    fn name(&self) -> &str {
        "drop-flag"
    }

    fn bind(&mut self, tick: TickHandle) {
        self.tick = Some(tick);
    }

    fn run(&mut self) -> ComponentResult {
        if let Some(tick) = self.tick.take() {
            loop {
                tick.wait_for_tick()?;
            }
        }
        Ok(())
    }
}

#[test]
fn test_registration_rules() {
    for_each_strategy(|kind| {
        let mut clock = clock_for(kind);
        assert_eq!(clock.state(), ClockState::Unstarted);
        clock.add_component(7, counter("a").0).unwrap();
        assert_eq!(
            clock.add_component(7, counter("b").0).unwrap_err(),
            ClockError::DuplicatePosition(7),
            "{kind}"
        );

        clock.run(1).unwrap();
        assert_eq!(clock.state(), ClockState::Idle);
        assert_eq!(
            clock.add_component(8, counter("c").0).unwrap_err(),
            ClockError::AlreadyStarted,
            "{kind}"
        );
    });
}

#[test]
fn test_no_step_before_first_cycle() {
    for_each_strategy(|kind| {
        let mut clock = clock_for(kind);
        let (component, count) = counter("lazy");
        let handle = clock.add_component(0, component).unwrap();

        clock.start().unwrap();
        clock.run(0).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 0, "{kind}");
        assert_eq!(handle.steps(), 0, "{kind}");

        clock.run(1).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 1, "{kind}");
    });
}

#[test]
fn test_clean_shutdown() {
    for_each_strategy(|kind| {
        let mut clock = clock_for(kind);
        let flags: Vec<Arc<AtomicBool>> = (0..5)
            .map(|position| {
                let dropped = Arc::new(AtomicBool::new(false));
                clock
                    .add_component(
                        position,
                        DropFlag {
                            dropped: Arc::clone(&dropped),
                            tick: None,
                        },
                    )
                    .unwrap();
                dropped
            })
            .collect();
        let firings = Firings::new();
        clock.schedule(1_000, firings.recorder()).unwrap();

        clock.run(50).unwrap();
        let report = clock.dispose();

        assert_eq!(clock.state(), ClockState::Disposed, "{kind}");
        assert_eq!(report.cycles, 50, "{kind}");
        assert_eq!(report.cancelled, 5, "{kind}");
        assert_eq!(report.faulted, 0, "{kind}");
        assert_eq!(report.detached, 0, "{kind}");
        assert_eq!(report.dropped_events, 1, "{kind}");
        assert!(report.is_clean(), "{kind}");
        for (position, dropped) in flags.iter().enumerate() {
            assert!(dropped.load(Ordering::Acquire), "{kind} component {position} still alive");
        }

        // Second dispose is a no-op returning the same report.
        assert_eq!(clock.dispose(), report, "{kind}");
        assert!(firings.cycles().is_empty(), "{kind}");
    });
}

#[test]
fn test_dispose_before_start() {
    for_each_strategy(|kind| {
        let mut clock = clock_for(kind);
        clock.add_component(0, counter("never").0).unwrap();
        clock.add_component(1, counter("never").0).unwrap();

        let report = clock.dispose();
        assert_eq!(report.cycles, 0, "{kind}");
        assert_eq!(report.cancelled, 2, "{kind}");
        assert!(report.is_clean(), "{kind}");
    });
}

#[test]
fn test_operations_after_dispose_fail() {
    for_each_strategy(|kind| {
        let mut clock = clock_for(kind);
        let handle = clock.add_component(0, counter("c").0).unwrap();
        let id = clock.schedule(100, |_: &mut EventScope<'_>| {}).unwrap();
        clock.run(3).unwrap();
        clock.dispose();

        assert_eq!(clock.run(1).unwrap_err(), ClockError::Disposed, "{kind}");
        assert_eq!(
            clock.add_component(1, counter("late").0).unwrap_err(),
            ClockError::Disposed,
            "{kind}"
        );
        assert_eq!(
            clock.schedule(200, |_: &mut EventScope<'_>| {}).unwrap_err(),
            ClockError::Disposed,
            "{kind}"
        );
        assert_eq!(clock.cancel(id).unwrap_err(), ClockError::Disposed, "{kind}");
        assert_eq!(clock.reschedule(id, 300).unwrap_err(), ClockError::Disposed, "{kind}");
        assert!(clock.handle().is_disposed(), "{kind}");

        // Counters are frozen.
        assert_eq!(clock.current_cycle(), 3, "{kind}");
        assert_eq!(handle.steps(), 3, "{kind}");
    });
}

#[test]
fn test_drop_disposes() {
    for_each_strategy(|kind| {
        let dropped = Arc::new(AtomicBool::new(false));
        {
            let mut clock = clock_for(kind);
            clock
                .add_component(
                    0,
                    DropFlag {
                        dropped: Arc::clone(&dropped),
                        tick: None,
                    },
                )
                .unwrap();
            clock.run(10).unwrap();
        }
        assert!(dropped.load(Ordering::Acquire), "{kind}");
    });
}

#[test]
fn test_run_forever_until_requested() {
    for_each_strategy(|kind| {
        let mut clock = clock_for(kind);
        let steps = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&steps);
        let handle = clock.handle();
        clock
            .add_component(
                0,
                Stepper::new("stopper", move |step| {
                    seen.store(step, Ordering::Relaxed);
                    if step == 250 {
                        handle.request_dispose();
                    }
                    Ok(())
                }),
            )
            .unwrap();
        clock.add_component(1, counter("bystander").0).unwrap();

        let report = clock.run_forever().unwrap();
        assert_eq!(report.cycles, 250, "{kind}");
        assert_eq!(steps.load(Ordering::Relaxed), 250, "{kind}");
        assert_eq!(report.cancelled, 2, "{kind}");
        assert_eq!(clock.state(), ClockState::Disposed, "{kind}");
    });
}

#[test]
fn test_failed_start_never_runs_empty() {
    for_each_strategy(|kind| {
        // Fibers do not use worker threads.
        if kind == StrategyKind::Fiber {
            return;
        }
        let mut config = ClockConfig {
            strategy: kind,
            ..ClockConfig::default()
        };
        config.threads.stack_size = 1 << 60;
        let mut clock = Clock::new(config);
        let (component, count) = counter("c");
        let handle = clock.add_component(0, component).unwrap();
        clock.add_component(1, counter("d").0).unwrap();

        assert!(
            matches!(clock.run(5), Err(ClockError::ThreadSpawn(_))),
            "{kind}"
        );
        assert_eq!(clock.run(5).unwrap_err(), ClockError::Faulted, "{kind}");
        assert_eq!(clock.state(), ClockState::Faulted, "{kind}");
        assert_eq!(clock.current_cycle(), 0, "{kind}");
        assert_eq!(handle.steps(), 0, "{kind}");
        assert_eq!(count.load(Ordering::Relaxed), 0, "{kind}");

        let report = clock.dispose();
        assert_eq!(report.cancelled + report.detached, 2, "{kind}");
        assert!(
            report.faults.iter().any(|f| f.source == FaultSource::Startup),
            "{kind}"
        );
    });
}
