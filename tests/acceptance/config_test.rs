//! Configuration acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A TOML file selects the strategy and tuning of a clock
//! - Omitted keys fall back to defaults
//! - A configured clock behaves like any other

use super::common::counter;
use lockstep_common::config::{ClockConfig, CpuAffinity, FaultPolicy, StrategyKind};
use lockstep_runtime::Clock;
use std::io::Write;
use std::time::Duration;

#[test]
fn test_config_file_drives_clock() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
strategy = "hybrid"
stall_timeout = "5s"
fault_policy = "abort"

[threads]
name_prefix = "emu"
cpu_affinity = "none"

[spin]
spin_limit = 64
"#
    )
    .unwrap();

    let config = ClockConfig::from_file(file.path()).unwrap();
    assert_eq!(config.strategy, StrategyKind::Hybrid);
    assert_eq!(config.stall_timeout, Some(Duration::from_secs(5)));
    assert_eq!(config.fault_policy, FaultPolicy::Abort);
    assert_eq!(config.threads.name_prefix, "emu");
    assert_eq!(config.threads.cpu_affinity, CpuAffinity::None);
    assert_eq!(config.spin.spin_limit, 64);
    // Omitted keys keep their defaults.
    assert_eq!(config.spin.stall_check_interval, 4096);
    assert!(config.metrics.enabled);

    let mut clock = Clock::new(config);
    assert_eq!(clock.strategy_name(), "hybrid");
    let (component, count) = counter("c");
    clock.add_component(0, component).unwrap();
    clock.run(64).unwrap();
    assert_eq!(count.load(std::sync::atomic::Ordering::Relaxed), 64);
}

#[test]
fn test_written_config_reloads() {
    let config = ClockConfig {
        strategy: StrategyKind::Barrier,
        stall_timeout: Some(Duration::from_millis(750)),
        fault_history: 8,
        ..ClockConfig::default()
    };
    let text = config.to_toml().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lockstep.toml");
    std::fs::write(&path, text).unwrap();

    let reloaded = ClockConfig::from_file(&path).unwrap();
    assert_eq!(reloaded.strategy, StrategyKind::Barrier);
    assert_eq!(reloaded.stall_timeout, Some(Duration::from_millis(750)));
    assert_eq!(reloaded.fault_history, 8);
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(ClockConfig::from_file(&dir.path().join("absent.toml")).is_err());
}

#[test]
fn test_bad_strategy_is_an_error() {
    assert!(ClockConfig::from_toml("strategy = \"quantum\"").is_err());
}
