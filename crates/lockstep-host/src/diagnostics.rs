//! Run summary for the host.
//!
//! Collects what the clock, its components and the demo machine did into a
//! serializable [`RunSummary`], printed as JSON with `--json` or logged.

use crate::machine::MachineCounters;
use lockstep_common::metrics::MetricsSnapshot;
use lockstep_common::time::Cycle;
use lockstep_runtime::{Clock, FaultRecord, ShutdownReport};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// Overall outcome of a host run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every requested cycle ran and nothing faulted.
    Completed,
    /// A stop signal ended the run early.
    Interrupted,
    /// Faults were captured during the run.
    Faulted,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Interrupted => write!(f, "interrupted"),
            RunStatus::Faulted => write!(f, "faulted"),
        }
    }
}

/// Per-component step count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentSummary {
    /// Registration position.
    pub position: u32,
    /// Component name.
    pub name: String,
    /// Completed tick waits.
    pub steps: u64,
}

/// Everything worth reporting after a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// How the run ended.
    pub status: RunStatus,
    /// Strategy name.
    pub strategy: &'static str,
    /// Cycles executed.
    pub cycles: Cycle,
    /// Wall-clock time spent running.
    #[serde(with = "elapsed_str")]
    pub elapsed: Duration,
    /// Simulated cycles per wall-clock second.
    pub cycles_per_second: f64,
    /// Step counts in position order.
    pub components: Vec<ComponentSummary>,
    /// Demo machine activity.
    pub machine: MachineCounters,
    /// Per-cycle latency and event load.
    pub latency: MetricsSnapshot,
    /// Components whose body returned normally.
    pub finished: usize,
    /// Components stopped by cancellation.
    pub cancelled: usize,
    /// Components that faulted.
    pub faulted: usize,
    /// Contexts abandoned at dispose.
    pub detached: usize,
    /// Events still pending at dispose.
    pub dropped_events: usize,
    /// Captured faults.
    pub faults: Vec<FaultRecord>,
}

impl RunSummary {
    /// Build a summary from a disposed clock and its report.
    pub fn collect(
        clock: &Clock,
        report: ShutdownReport,
        machine: MachineCounters,
        elapsed: Duration,
        interrupted: bool,
    ) -> Self {
        let status = if !report.faults.is_empty() {
            RunStatus::Faulted
        } else if interrupted {
            RunStatus::Interrupted
        } else {
            RunStatus::Completed
        };
        let secs = elapsed.as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let cycles_per_second = if secs > 0.0 {
            report.cycles as f64 / secs
        } else {
            0.0
        };

        Self {
            status,
            strategy: report.strategy,
            cycles: report.cycles,
            elapsed,
            cycles_per_second,
            components: clock
                .components()
                .map(|c| ComponentSummary {
                    position: c.position(),
                    name: c.name().to_string(),
                    steps: c.steps(),
                })
                .collect(),
            machine,
            latency: clock.metrics().snapshot(),
            finished: report.finished,
            cancelled: report.cancelled,
            faulted: report.faulted,
            detached: report.detached,
            dropped_events: report.dropped_events,
            faults: report.faults,
        }
    }

    /// Whether the host should exit successfully.
    pub fn is_success(&self) -> bool {
        self.status != RunStatus::Faulted && self.detached == 0
    }

    /// Pretty JSON rendering.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Log the summary through `tracing`.
    pub fn log(&self) {
        for fault in &self.faults {
            warn!(cycle = fault.cycle, source = %fault.source, message = %fault.message, "Fault");
        }
        info!(
            status = %self.status,
            strategy = self.strategy,
            cycles = self.cycles,
            elapsed = %humantime::format_duration(self.elapsed),
            cycles_per_second = format_args!("{:.0}", self.cycles_per_second),
            mean_ns = self.latency.mean_ns.unwrap_or(0),
            p50_ns = self.latency.p50_ns.unwrap_or(0),
            p99_ns = self.latency.p99_ns.unwrap_or(0),
            slowest_cycle = ?self.latency.slowest_cycle,
            slow_cycles = self.latency.slow_cycles,
            events_fired = self.latency.events_fired,
            instructions = self.machine.instructions,
            interrupts = self.machine.interrupts,
            frames = self.machine.frames,
            "Run summary"
        );
    }
}

/// `Duration` as a humantime string rounded to microseconds, e.g. `"1s 250ms"`.
mod elapsed_str {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let rounded = Duration::from_micros(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX));
        serializer.serialize_str(&humantime::format_duration(rounded).to_string())
    }
}
