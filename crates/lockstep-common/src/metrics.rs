//! Per-cycle driver metrics.
//!
//! Every `advance_one_cycle` contributes one sample: the wall-clock time the
//! strategy needed to bring all components through the cycle, and the number
//! of scheduled events that fired in it. Latency is the figure of merit when
//! comparing synchronization strategies; percentiles are taken over a window
//! of the most recent cycles so long runs do not grow memory.

use crate::time::Cycle;
use serde::Serialize;
use std::time::Duration;

/// Percentiles reported in [`MetricsSnapshot`].
const REPORTED_PERCENTILES: [f64; 3] = [50.0, 90.0, 99.0];

/// Fixed-capacity window over the latest latency samples.
#[derive(Debug)]
struct LatencyWindow {
    samples: Vec<u64>,
    capacity: usize,
    next: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    fn push(&mut self, ns: u64) {
        if self.samples.len() < self.capacity {
            self.samples.push(ns);
        } else {
            self.samples[self.next] = ns;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn sorted(&self) -> Vec<u64> {
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        sorted
    }
}

/// Latency and event-load statistics for the cycles a clock has driven.
#[derive(Debug)]
pub struct CycleMetrics {
    window: LatencyWindow,
    cycles: u64,
    total_ns: u64,
    fastest_ns: u64,
    slowest: Option<(Cycle, u64)>,
    slow_threshold_ns: u64,
    slow_cycles: u64,
    events_fired: u64,
    busiest: Option<(Cycle, usize)>,
}

impl CycleMetrics {
    /// Create a collector keeping `window` latency samples for percentiles.
    /// Cycles slower than `slow_threshold` are counted separately.
    #[must_use]
    pub fn new(window: usize, slow_threshold: Duration) -> Self {
        Self {
            window: LatencyWindow::new(window),
            cycles: 0,
            total_ns: 0,
            fastest_ns: u64::MAX,
            slowest: None,
            slow_threshold_ns: duration_ns(slow_threshold),
            slow_cycles: 0,
            events_fired: 0,
            busiest: None,
        }
    }

    /// Record one completed cycle.
    pub fn record(&mut self, cycle: Cycle, elapsed: Duration, fired: usize) {
        let ns = duration_ns(elapsed);
        self.window.push(ns);
        self.cycles += 1;
        self.total_ns = self.total_ns.saturating_add(ns);
        self.fastest_ns = self.fastest_ns.min(ns);
        if !matches!(self.slowest, Some((_, worst)) if worst >= ns) {
            self.slowest = Some((cycle, ns));
        }
        if ns > self.slow_threshold_ns {
            self.slow_cycles += 1;
        }

        self.events_fired += u64::try_from(fired).unwrap_or(u64::MAX);
        if fired > 0 && !matches!(self.busiest, Some((_, most)) if most >= fired) {
            self.busiest = Some((cycle, fired));
        }
    }

    /// Cycles recorded.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Mean cycle latency.
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        (self.cycles > 0).then(|| Duration::from_nanos(self.total_ns / self.cycles))
    }

    /// Fastest cycle latency.
    #[must_use]
    pub fn fastest(&self) -> Option<Duration> {
        (self.cycles > 0).then(|| Duration::from_nanos(self.fastest_ns))
    }

    /// The slowest cycle and its latency.
    #[must_use]
    pub fn slowest(&self) -> Option<(Cycle, Duration)> {
        self.slowest.map(|(cycle, ns)| (cycle, Duration::from_nanos(ns)))
    }

    /// Cycles over the slow threshold.
    #[must_use]
    pub fn slow_cycles(&self) -> u64 {
        self.slow_cycles
    }

    /// Scheduled events fired across all recorded cycles.
    #[must_use]
    pub fn events_fired(&self) -> u64 {
        self.events_fired
    }

    /// The cycle that fired the most events, and how many.
    #[must_use]
    pub fn busiest(&self) -> Option<(Cycle, usize)> {
        self.busiest
    }

    /// Latency percentiles over the sample window, nearest-rank.
    ///
    /// Values outside `0.0..=100.0` (and NaN) are skipped.
    #[must_use]
    pub fn percentiles(&self, wanted: &[f64]) -> Vec<(f64, Duration)> {
        if self.window.len() == 0 {
            return Vec::new();
        }
        let sorted = self.window.sorted();
        wanted
            .iter()
            .copied()
            .filter(|p| (0.0..=100.0).contains(p))
            .map(|p| (p, Duration::from_nanos(sorted[nearest_rank(p, sorted.len())])))
            .collect()
    }

    /// Serializable view for reporting.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut percentiles = self
            .percentiles(&REPORTED_PERCENTILES)
            .into_iter()
            .map(|(_, d)| duration_ns(d));
        let any = self.cycles > 0;
        MetricsSnapshot {
            cycles: self.cycles,
            window: self.window.len(),
            fastest_ns: any.then_some(self.fastest_ns),
            mean_ns: any.then(|| self.total_ns / self.cycles),
            p50_ns: percentiles.next(),
            p90_ns: percentiles.next(),
            p99_ns: percentiles.next(),
            slowest_ns: self.slowest.map(|(_, ns)| ns),
            slowest_cycle: self.slowest.map(|(cycle, _)| cycle),
            slow_cycles: self.slow_cycles,
            events_fired: self.events_fired,
            busiest_cycle: self.busiest.map(|(cycle, _)| cycle),
        }
    }
}

/// Index of the nearest-rank percentile `p` in a sorted slice of `len > 0`.
fn nearest_rank(p: f64, len: usize) -> usize {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rank = ((p / 100.0) * len as f64).ceil() as usize;
    rank.clamp(1, len) - 1
}

fn duration_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// Point-in-time metrics for the host summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Cycles recorded.
    pub cycles: u64,
    /// Samples in the percentile window.
    pub window: usize,
    /// Fastest cycle, nanoseconds.
    pub fastest_ns: Option<u64>,
    /// Mean cycle, nanoseconds.
    pub mean_ns: Option<u64>,
    /// Median over the window, nanoseconds.
    pub p50_ns: Option<u64>,
    /// 90th percentile over the window, nanoseconds.
    pub p90_ns: Option<u64>,
    /// 99th percentile over the window, nanoseconds.
    pub p99_ns: Option<u64>,
    /// Slowest cycle, nanoseconds.
    pub slowest_ns: Option<u64>,
    /// Which cycle was slowest.
    pub slowest_cycle: Option<Cycle>,
    /// Cycles over the slow threshold.
    pub slow_cycles: u64,
    /// Scheduled events fired.
    pub events_fired: u64,
    /// Cycle that fired the most events.
    pub busiest_cycle: Option<Cycle>,
}
