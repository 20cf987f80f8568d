//! Cycle conservation, per-component fairness and in-cycle ordering.
//!
//! # Acceptance Criteria
//!
//! - `run(n)` advances the counter by exactly n, for any n including 0
//! - Every component's step counter advances by exactly n
//! - Components observe the current cycle during their step
//! - Sequential strategies run components in ascending position order

use super::common::{clock_for, counter, for_each_strategy, Stepper, Trace};
use lockstep_common::config::StrategyKind;
use lockstep_runtime::ComponentExit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[test]
fn test_cycle_conservation() {
    for_each_strategy(|kind| {
        let mut clock = clock_for(kind);
        let (component, _) = counter("c");
        clock.add_component(0, component).unwrap();

        let mut expected = 0;
        for n in [0, 1, 7, 0, 13, 100] {
            clock.run(n).unwrap();
            expected += n;
            assert_eq!(clock.current_cycle(), expected, "{kind} after run({n})");
        }
    });
}

#[test]
fn test_twenty_four_counters_thousand_cycles() {
    for_each_strategy(|kind| {
        let mut clock = clock_for(kind);
        let counts: Vec<Arc<AtomicU64>> = (0..24)
            .map(|position| {
                let (component, count) = counter(&format!("counter{position}"));
                clock.add_component(position, component).unwrap();
                count
            })
            .collect();

        clock.run(1_000).unwrap();

        for (position, count) in counts.iter().enumerate() {
            assert_eq!(count.load(Ordering::Relaxed), 1_000, "{kind} counter {position}");
        }
        assert!(clock.components().all(|c| c.steps() == 1_000), "{kind}");
    });
}

#[test]
fn test_fairness_across_resumed_runs() {
    for_each_strategy(|kind| {
        let mut clock = clock_for(kind);
        let handles: Vec<_> = (0..4)
            .map(|position| clock.add_component(position, counter("c").0).unwrap())
            .collect();

        clock.run(10).unwrap();
        clock.run(25).unwrap();

        for handle in &handles {
            assert_eq!(handle.steps(), 35, "{kind} position {}", handle.position());
        }
    });
}

#[test]
fn test_components_observe_current_cycle() {
    for_each_strategy(|kind| {
        let mut clock = clock_for(kind);
        for position in 0..3 {
            let clock_handle = clock.handle();
            let stepper = Stepper::new("observer", move |step| {
                let seen = clock_handle.current_cycle();
                if seen == step {
                    Ok(())
                } else {
                    Err(ComponentExit::fault(format!("step {step} saw cycle {seen}")))
                }
            });
            clock.add_component(position, stepper).unwrap();
        }

        clock.run(200).unwrap();
        assert!(clock.faults().is_empty(), "{kind}: {:?}", clock.faults());
    });
}

#[test]
fn test_sequential_order_by_position() {
    for_each_strategy(|kind| {
        if kind.is_parallel() {
            return;
        }
        let mut clock = clock_for(kind);
        let trace = Trace::new();
        // Registered out of order on purpose.
        for position in [20, 5, 11] {
            let trace = trace.clone();
            let stepper = Stepper::new("ordered", move |step| {
                trace.push(format!("{step}:{position}"));
                Ok(())
            });
            clock.add_component(position, stepper).unwrap();
        }

        clock.run(3).unwrap();
        assert_eq!(
            trace.entries(),
            ["1:5", "1:11", "1:20", "2:5", "2:11", "2:20", "3:5", "3:11", "3:20"],
            "{kind}"
        );
    });
}

#[test]
fn test_parallel_effects_visible_next_cycle() {
    // A writer publishes its step number; a reader at a lower position must
    // never see a value from the future, and always sees the previous cycle's
    // write by the time its own step runs.
    for_each_strategy(|kind| {
        let mut clock = clock_for(kind);
        let published = Arc::new(AtomicU64::new(0));

        let seen = Arc::clone(&published);
        clock
            .add_component(
                0,
                Stepper::new("reader", move |step| {
                    let value = seen.load(Ordering::Acquire);
                    if value > step || value + 1 < step {
                        return Err(ComponentExit::fault(format!("step {step} read {value}")));
                    }
                    Ok(())
                }),
            )
            .unwrap();
        let out = Arc::clone(&published);
        clock
            .add_component(
                1,
                Stepper::new("writer", move |step| {
                    out.store(step, Ordering::Release);
                    Ok(())
                }),
            )
            .unwrap();

        clock.run(500).unwrap();
        assert!(clock.faults().is_empty(), "{kind}: {:?}", clock.faults());
        assert_eq!(published.load(Ordering::Acquire), 500, "{kind}");
    });
}

#[test]
fn test_strategy_names_match_kinds() {
    for_each_strategy(|kind| {
        let clock = clock_for(kind);
        assert_eq!(clock.strategy_name(), kind.as_str());
    });
    assert_eq!(StrategyKind::ALL.len(), 7);
}
