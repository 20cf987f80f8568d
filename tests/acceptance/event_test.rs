//! Scheduled event acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - An event fires exactly once, at its target cycle, never earlier
//! - A cancelled event never fires
//! - A rescheduled event fires only at the new cycle
//! - Same-cycle events fire in scheduling order
//! - Targets at or before the current cycle are rejected
//! - A callback's last request about its own event wins

use super::common::{clock_for, counter, for_each_strategy, Firings, Stepper, Trace};
use lockstep_common::config::StrategyKind;
use lockstep_common::error::ClockError;
use lockstep_runtime::{Clock, ComponentExit, EventScope};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn with_component(kind: StrategyKind) -> Clock {
    let mut clock = clock_for(kind);
    clock.add_component(0, counter("load").0).unwrap();
    clock
}

#[test]
fn test_event_fires_once_at_target() {
    for_each_strategy(|kind| {
        let mut clock = with_component(kind);
        let firings = Firings::new();
        let observed = Arc::new(Mutex::new(Vec::new()));

        let log = firings.clone();
        let seen = Arc::clone(&observed);
        clock
            .schedule(5, move |scope: &mut EventScope<'_>| {
                log.push(scope.cycle());
                seen.lock().unwrap().push(scope.handle().current_cycle());
            })
            .unwrap();

        clock.run(10).unwrap();
        assert_eq!(firings.cycles(), [5], "{kind}");
        assert_eq!(*observed.lock().unwrap(), [5], "{kind}");
        assert_eq!(clock.pending_events(), 0, "{kind}");
    });
}

#[test]
fn test_event_not_fired_early() {
    for_each_strategy(|kind| {
        let mut clock = with_component(kind);
        let firings = Firings::new();
        let id = clock.schedule(20, firings.recorder()).unwrap();

        clock.run(19).unwrap();
        assert!(firings.cycles().is_empty(), "{kind}");
        assert!(clock.is_pending(id), "{kind}");
        assert_eq!(clock.next_due(), Some(20), "{kind}");

        clock.run(1).unwrap();
        assert_eq!(firings.cycles(), [20], "{kind}");
        assert!(!clock.is_pending(id), "{kind}");
    });
}

#[test]
fn test_periodic_event_every_three_cycles() {
    for_each_strategy(|kind| {
        let mut clock = with_component(kind);
        let firings = Firings::new();
        let log = firings.clone();
        clock
            .schedule(3, move |scope: &mut EventScope<'_>| {
                log.push(scope.cycle());
                scope.reschedule_self(scope.cycle() + 3).unwrap();
            })
            .unwrap();

        clock.run(30).unwrap();
        let expected: Vec<u64> = (1..=10).map(|i| i * 3).collect();
        assert_eq!(firings.cycles(), expected, "{kind}");
        // The eleventh firing is already queued.
        assert_eq!(clock.next_due(), Some(33), "{kind}");
    });
}

#[test]
fn test_cancelled_event_never_fires() {
    for_each_strategy(|kind| {
        let mut clock = with_component(kind);
        let firings = Firings::new();
        let id = clock.schedule(5, firings.recorder()).unwrap();

        clock.run(2).unwrap();
        assert!(clock.cancel(id).unwrap(), "{kind}");
        assert!(!clock.cancel(id).unwrap(), "{kind} second cancel");

        clock.run(8).unwrap();
        assert!(firings.cycles().is_empty(), "{kind}");
    });
}

#[test]
fn test_cancel_after_fire_is_noop() {
    for_each_strategy(|kind| {
        let mut clock = with_component(kind);
        let firings = Firings::new();
        let id = clock.schedule(1, firings.recorder()).unwrap();
        clock.run(3).unwrap();
        assert!(!clock.cancel(id).unwrap(), "{kind}");
        assert_eq!(firings.cycles(), [1], "{kind}");
    });
}

#[test]
fn test_reschedule_moves_event() {
    for_each_strategy(|kind| {
        let mut clock = with_component(kind);
        let firings = Firings::new();
        let id = clock.schedule(5, firings.recorder()).unwrap();

        clock.run(3).unwrap();
        assert!(clock.reschedule(id, 8).unwrap(), "{kind}");

        clock.run(7).unwrap();
        assert_eq!(firings.cycles(), [8], "{kind}");
    });
}

#[test]
fn test_reschedule_from_running_component() {
    // The component reschedules while the strategy is mid-cycle, which for
    // the threaded strategies means concurrently with the driver.
    for_each_strategy(|kind| {
        let mut clock = clock_for(kind);
        let firings = Firings::new();
        let id = clock.schedule(150, firings.recorder()).unwrap();

        let handle = clock.handle();
        clock
            .add_component(
                0,
                Stepper::new("mover", move |step| {
                    if step == 100 {
                        handle.reschedule(id, 300).map_err(ComponentExit::fault)?;
                    }
                    Ok(())
                }),
            )
            .unwrap();

        clock.run(400).unwrap();
        assert_eq!(firings.cycles(), [300], "{kind}");
    });
}

#[test]
fn test_same_cycle_tie_break() {
    for_each_strategy(|kind| {
        let mut clock = with_component(kind);
        let trace = Trace::new();
        for label in ["first", "second", "third"] {
            let trace = trace.clone();
            clock
                .schedule(4, move |_: &mut EventScope<'_>| trace.push(label))
                .unwrap();
        }
        // Earlier cycle scheduled later still fires first.
        let early = trace.clone();
        clock
            .schedule(2, move |_: &mut EventScope<'_>| early.push("early"))
            .unwrap();

        clock.run(5).unwrap();
        assert_eq!(trace.entries(), ["early", "first", "second", "third"], "{kind}");
    });
}

#[test]
fn test_same_cycle_chaining() {
    for_each_strategy(|kind| {
        let mut clock = with_component(kind);
        let firings = Firings::new();
        let log = firings.clone();
        clock
            .schedule(6, move |scope: &mut EventScope<'_>| {
                log.push(scope.cycle());
                let chained = log.clone();
                scope
                    .schedule(scope.cycle(), move |inner: &mut EventScope<'_>| {
                        chained.push(inner.cycle());
                    })
                    .unwrap();
            })
            .unwrap();

        clock.run(6).unwrap();
        assert_eq!(firings.cycles(), [6, 6], "{kind}");
    });
}

#[test]
fn test_schedule_at_or_before_current_rejected() {
    for_each_strategy(|kind| {
        let mut clock = with_component(kind);
        clock.run(5).unwrap();

        for cycle in 0..=5 {
            let err = clock.schedule(cycle, |_: &mut EventScope<'_>| {}).unwrap_err();
            assert_eq!(
                err,
                ClockError::ScheduleInPast {
                    requested: cycle,
                    current: 5
                },
                "{kind}"
            );
        }
        let id = clock.schedule(6, |_: &mut EventScope<'_>| {}).unwrap();
        assert!(matches!(
            clock.reschedule(id, 5),
            Err(ClockError::ScheduleInPast { .. })
        ));
        assert!(clock.is_pending(id), "{kind} failed reschedule keeps the event");
    });
}

#[test]
fn test_renewal_after_self_cancel_wins() {
    for_each_strategy(|kind| {
        let mut clock = with_component(kind);
        let firings = Firings::new();
        let log = firings.clone();
        clock
            .schedule(2, move |scope: &mut EventScope<'_>| {
                log.push(scope.cycle());
                let own = scope.id();
                assert!(scope.cancel(own).unwrap());
                scope.reschedule_self(scope.cycle() + 2).unwrap();
            })
            .unwrap();

        clock.run(10).unwrap();
        assert_eq!(firings.cycles(), [2, 4, 6, 8, 10], "{kind}");
    });
}

#[test]
fn test_self_cancel_after_renewal_stops() {
    for_each_strategy(|kind| {
        let mut clock = with_component(kind);
        let firings = Firings::new();
        let log = firings.clone();
        let id = clock
            .schedule(3, move |scope: &mut EventScope<'_>| {
                log.push(scope.cycle());
                scope.reschedule_self(scope.cycle() + 1).unwrap();
                let own = scope.id();
                scope.cancel(own).unwrap();
            })
            .unwrap();

        clock.run(10).unwrap();
        assert_eq!(firings.cycles(), [3], "{kind}");
        assert!(!clock.is_pending(id), "{kind}");
    });
}

#[test]
fn test_pending_inside_own_callback() {
    for_each_strategy(|kind| {
        let mut clock = with_component(kind);
        let before = Arc::new(AtomicBool::new(true));
        let after = Arc::new(AtomicBool::new(false));
        let (seen_before, seen_after) = (Arc::clone(&before), Arc::clone(&after));
        let id = clock
            .schedule(5, move |scope: &mut EventScope<'_>| {
                let handle = scope.handle();
                seen_before.store(handle.is_pending(scope.id()), Ordering::SeqCst);
                scope.reschedule_self(50).unwrap();
                seen_after.store(handle.is_pending(scope.id()), Ordering::SeqCst);
            })
            .unwrap();

        clock.run(5).unwrap();
        assert!(!before.load(Ordering::SeqCst), "{kind} firing event is not pending");
        assert!(after.load(Ordering::SeqCst), "{kind} renewed event is pending");
        assert!(clock.is_pending(id), "{kind}");
        assert_eq!(clock.next_due(), Some(50), "{kind}");
    });
}
