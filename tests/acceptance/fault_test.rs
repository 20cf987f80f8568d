//! Fault isolation acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A faulting or panicking component retires without wedging its siblings
//! - Component faults are surfaced in the fault log and the shutdown report
//! - Under the abort policy the run fails after the faulting cycle completes
//! - A panicking event callback fails the run but leaves the queue usable
//! - A component that stops ticking is reported as a stall

use super::common::{clock_for, counter, for_each_strategy, Firings, Stepper};
use lockstep_common::config::{FaultPolicy, StrategyKind};
use lockstep_common::error::ClockError;
use lockstep_common::state::ClockState;
use lockstep_runtime::{Clock, ComponentExit, EventScope, FaultSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn failing_at(step_to_fail: u64, panic: bool) -> Stepper {
    Stepper::new("faulty", move |step| {
        if step == step_to_fail {
            if panic {
                panic!("component blew up");
            }
            return Err(ComponentExit::fault("bad opcode"));
        }
        Ok(())
    })
}

#[test]
fn test_component_fault_is_isolated() {
    for_each_strategy(|kind| {
        for panic in [false, true] {
            let mut clock = clock_for(kind);
            let (before, before_count) = counter("before");
            let (after, after_count) = counter("after");
            clock.add_component(0, before).unwrap();
            let faulty = clock.add_component(1, failing_at(4, panic)).unwrap();
            clock.add_component(2, after).unwrap();

            clock.run(50).unwrap();
            assert_eq!(before_count.load(Ordering::Relaxed), 50, "{kind}");
            assert_eq!(after_count.load(Ordering::Relaxed), 50, "{kind}");
            assert_eq!(faulty.steps(), 3, "{kind}");

            let faults = clock.faults();
            assert_eq!(faults.len(), 1, "{kind}");
            assert_eq!(faults[0].cycle, 4, "{kind}");
            assert_eq!(
                faults[0].source,
                FaultSource::Component {
                    position: 1,
                    name: "faulty".into()
                },
                "{kind}"
            );
            let expected = if panic { "component blew up" } else { "bad opcode" };
            assert_eq!(faults[0].message, expected, "{kind}");

            let report = clock.dispose();
            assert_eq!(report.faulted, 1, "{kind}");
            assert_eq!(report.cancelled, 2, "{kind}");
            assert!(!report.is_clean(), "{kind}");
        }
    });
}

#[test]
fn test_abort_policy_fails_run() {
    for_each_strategy(|kind| {
        let mut clock = Clock::builder()
            .strategy(kind)
            .stall_timeout(Duration::from_secs(30))
            .fault_policy(FaultPolicy::Abort)
            .build();
        let (sibling, count) = counter("sibling");
        clock.add_component(0, failing_at(3, false)).unwrap();
        clock.add_component(1, sibling).unwrap();

        let err = clock.run(10).unwrap_err();
        assert_eq!(
            err,
            ClockError::ComponentFault {
                position: 0,
                name: "faulty".into(),
                message: "bad opcode".into()
            },
            "{kind}"
        );
        // The faulting cycle completed for everyone else.
        assert_eq!(clock.current_cycle(), 3, "{kind}");
        assert_eq!(count.load(Ordering::Relaxed), 3, "{kind}");
        assert_eq!(clock.state(), ClockState::Idle, "{kind}");

        clock.run(2).unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 5, "{kind}");
    });
}

#[test]
fn test_event_panic_leaves_queue_usable() {
    for_each_strategy(|kind| {
        let mut clock = clock_for(kind);
        let (component, count) = counter("c");
        clock.add_component(0, component).unwrap();

        let firings = Firings::new();
        let same_cycle = clock.schedule(4, firings.recorder()).unwrap();
        clock
            .schedule(4, |_: &mut EventScope<'_>| panic!("callback failed"))
            .unwrap();
        let later = clock.schedule(9, firings.recorder()).unwrap();

        let err = clock.run(10).unwrap_err();
        assert!(
            matches!(err, ClockError::EventFault { cycle: 4, ref message } if message == "callback failed"),
            "{kind}: {err:?}"
        );
        assert_eq!(clock.current_cycle(), 4, "{kind}");
        assert_eq!(count.load(Ordering::Relaxed), 4, "{kind}");
        assert!(!clock.is_pending(same_cycle), "{kind}");
        assert!(clock.is_pending(later), "{kind}");

        clock.run(6).unwrap();
        assert_eq!(firings.cycles(), [4, 9], "{kind}");
        assert_eq!(clock.current_cycle(), 10, "{kind}");
    });
}

#[test]
fn test_stalled_component_faults_clock() {
    for_each_strategy(|kind| {
        // A fiber that never yields blocks the driver itself.
        if kind == StrategyKind::Fiber {
            return;
        }
        let mut clock = Clock::builder()
            .strategy(kind)
            .stall_timeout(Duration::from_millis(200))
            .build();
        let release = Arc::new(AtomicBool::new(false));
        let hold = Arc::clone(&release);
        clock.add_component(0, counter("steady").0).unwrap();
        clock
            .add_component(
                1,
                Stepper::new("stuck", move |step| {
                    while step == 3 && !hold.load(Ordering::Acquire) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Ok(())
                }),
            )
            .unwrap();

        let err = clock.run(10).unwrap_err();
        match err {
            ClockError::Stalled { cycle, waiting_on } => {
                assert_eq!(cycle, 3, "{kind}");
                assert_eq!(waiting_on, "stuck@1", "{kind}");
            }
            other => panic!("{kind}: expected stall, got {other:?}"),
        }
        assert_eq!(clock.state(), ClockState::Faulted, "{kind}");
        assert_eq!(clock.run(1).unwrap_err(), ClockError::Faulted, "{kind}");

        release.store(true, Ordering::Release);
        let report = clock.dispose();
        assert_eq!(report.detached, 0, "{kind}");
        assert!(report
            .faults
            .iter()
            .any(|f| matches!(f.source, FaultSource::Stall { .. })));
    });
}
