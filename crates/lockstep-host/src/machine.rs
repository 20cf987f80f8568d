//! Demo machine: stand-in chips wired to the clock.
//!
//! None of these model a real instruction set or timing table. They exist to
//! put realistic load shapes on the scheduler: a processor whose
//! instructions take a variable number of cycles and which services
//! interrupts, a raster beam sweeping a fixed line/frame geometry, and an
//! interval timer that raises the interrupt line through a scheduled event
//! one cycle after it underflows.

use lockstep_common::error::{ClockError, ClockResult};
use lockstep_common::time::Cycle;
use lockstep_runtime::{
    Clock, ClockHandle, ClockedComponent, ComponentExit, ComponentHandle, ComponentResult,
    EventId, EventScope, TickHandle,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Cycles the beam spends on one raster line.
pub const LINE_CYCLES: u64 = 63;
/// Raster lines per frame.
pub const FRAME_LINES: u64 = 312;
/// Cycles per frame; the vertical-blank period.
pub const FRAME_CYCLES: u64 = LINE_CYCLES * FRAME_LINES;
/// Cycles a processor spends entering an interrupt handler.
const IRQ_ENTRY_CYCLES: u32 = 7;

/// Shared interrupt request line. Any source may raise it; a processor
/// acknowledges every pending request at once.
#[derive(Debug, Default)]
pub struct InterruptLine {
    pending: AtomicU32,
}

impl InterruptLine {
    /// Assert the line.
    pub fn raise(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Acknowledge all pending requests. True if any were pending.
    pub fn acknowledge(&self) -> bool {
        self.pending.swap(0, Ordering::AcqRel) > 0
    }
}

/// Activity counters for the run summary.
#[derive(Debug, Default)]
pub struct MachineStats {
    instructions: AtomicU64,
    interrupts: AtomicU64,
    lines: AtomicU64,
    frames: AtomicU64,
    underflows: AtomicU64,
    vblanks: AtomicU64,
}

impl MachineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MachineCounters {
        MachineCounters {
            instructions: self.instructions.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            lines: self.lines.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            timer_underflows: self.underflows.load(Ordering::Relaxed),
            vblanks: self.vblanks.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`MachineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MachineCounters {
    /// Instructions retired across all processors.
    pub instructions: u64,
    /// Interrupts serviced.
    pub interrupts: u64,
    /// Raster lines completed across all beams.
    pub lines: u64,
    /// Frames completed across all beams.
    pub frames: u64,
    /// Interval timer underflows.
    pub timer_underflows: u64,
    /// Vertical-blank events fired.
    pub vblanks: u64,
}

/// Wiring shared by every chip.
#[derive(Debug, Default)]
pub struct Bus {
    /// Interrupt request line into the processors.
    pub irq: InterruptLine,
    /// Activity counters.
    pub stats: MachineStats,
}

fn take_tick(tick: &mut Option<TickHandle>) -> Result<TickHandle, ComponentExit> {
    tick.take()
        .ok_or_else(|| ComponentExit::fault("run without a bound tick handle"))
}

fn wait_cycles(tick: &TickHandle, cycles: u64) -> ComponentResult {
    for _ in 0..cycles {
        tick.wait_for_tick()?;
    }
    Ok(())
}

/// Processor stand-in: retires instructions of two to seven cycles each.
pub struct Processor {
    name: String,
    bus: Arc<Bus>,
    state: u32,
    tick: Option<TickHandle>,
}

impl Processor {
    /// Create processor number `index`.
    pub fn new(index: usize, bus: Arc<Bus>) -> Self {
        Self {
            name: format!("cpu{index}"),
            bus,
            // Any non-zero seed; varied so processors drift apart.
            state: (0x9E37_79B9 ^ u32::try_from(index).unwrap_or(0).wrapping_mul(0x85EB_CA6B)) | 1,
            tick: None,
        }
    }

    /// Cycle length of the next instruction.
    fn next_length(&mut self) -> u64 {
        // xorshift32
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        2 + u64::from(x % 6)
    }
}

impl ClockedComponent for Processor {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&mut self, tick: TickHandle) {
        self.tick = Some(tick);
    }

    fn run(&mut self) -> ComponentResult {
        let tick = take_tick(&mut self.tick)?;
        loop {
            if self.bus.irq.acknowledge() {
                wait_cycles(&tick, u64::from(IRQ_ENTRY_CYCLES))?;
                MachineStats::bump(&self.bus.stats.interrupts);
                continue;
            }
            let length = self.next_length();
            wait_cycles(&tick, length)?;
            MachineStats::bump(&self.bus.stats.instructions);
        }
    }
}

/// Video stand-in: a beam sweeping [`FRAME_LINES`] lines of [`LINE_CYCLES`] cycles.
pub struct RasterBeam {
    name: String,
    bus: Arc<Bus>,
    tick: Option<TickHandle>,
}

impl RasterBeam {
    /// Create beam number `index`.
    pub fn new(index: usize, bus: Arc<Bus>) -> Self {
        Self {
            name: format!("video{index}"),
            bus,
            tick: None,
        }
    }
}

impl ClockedComponent for RasterBeam {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&mut self, tick: TickHandle) {
        self.tick = Some(tick);
    }

    fn run(&mut self) -> ComponentResult {
        let tick = take_tick(&mut self.tick)?;
        loop {
            for _ in 0..FRAME_LINES {
                wait_cycles(&tick, LINE_CYCLES)?;
                MachineStats::bump(&self.bus.stats.lines);
            }
            MachineStats::bump(&self.bus.stats.frames);
        }
    }
}

/// Timer stand-in: counts down `period` cycles, then requests an interrupt
/// for the following cycle.
pub struct IntervalTimer {
    name: String,
    period: u64,
    bus: Arc<Bus>,
    clock: ClockHandle,
    tick: Option<TickHandle>,
}

impl IntervalTimer {
    /// Create timer number `index` underflowing every `period` cycles.
    pub fn new(index: usize, period: u64, bus: Arc<Bus>, clock: ClockHandle) -> Self {
        Self {
            name: format!("timer{index}"),
            period: period.max(1),
            bus,
            clock,
            tick: None,
        }
    }

    fn raise_next_cycle(&self) -> ComponentResult {
        let bus = Arc::clone(&self.bus);
        self.clock
            .schedule(self.clock.current_cycle() + 1, move |_: &mut EventScope<'_>| {
                bus.irq.raise();
            })
            .map(drop)
            .map_err(|e| match e {
                ClockError::Disposed => ComponentExit::Cancelled,
                other => ComponentExit::fault(other),
            })
    }
}

impl ClockedComponent for IntervalTimer {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&mut self, tick: TickHandle) {
        self.tick = Some(tick);
    }

    fn run(&mut self) -> ComponentResult {
        let tick = take_tick(&mut self.tick)?;
        loop {
            wait_cycles(&tick, self.period)?;
            MachineStats::bump(&self.bus.stats.underflows);
            self.raise_next_cycle()?;
        }
    }
}

/// How many of each chip to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineLayout {
    /// Processor count.
    pub cpus: usize,
    /// Raster beam count.
    pub videos: usize,
    /// Interval timer count.
    pub timers: usize,
    /// Timer underflow period in cycles.
    pub timer_period: u64,
}

impl Default for MachineLayout {
    fn default() -> Self {
        Self {
            cpus: 1,
            videos: 1,
            timers: 2,
            timer_period: 1_000,
        }
    }
}

impl MachineLayout {
    /// Total number of components.
    pub fn component_count(&self) -> usize {
        self.cpus + self.videos + self.timers
    }

    /// Register every chip on `clock`: processors first, then beams, then timers.
    pub fn install(&self, clock: &mut Clock, bus: &Arc<Bus>) -> ClockResult<Vec<ComponentHandle>> {
        let mut handles = Vec::with_capacity(self.component_count());
        let mut position = 0u32;
        let mut next_position = || {
            let current = position;
            position += 1;
            current
        };

        for i in 0..self.cpus {
            handles.push(clock.add_component(next_position(), Processor::new(i, Arc::clone(bus)))?);
        }
        for i in 0..self.videos {
            handles.push(clock.add_component(next_position(), RasterBeam::new(i, Arc::clone(bus)))?);
        }
        for i in 0..self.timers {
            let timer = IntervalTimer::new(i, self.timer_period, Arc::clone(bus), clock.handle());
            handles.push(clock.add_component(next_position(), timer)?);
        }

        debug!(
            cpus = self.cpus,
            videos = self.videos,
            timers = self.timers,
            "Machine installed"
        );
        Ok(handles)
    }
}

/// Schedule the vertical-blank interrupt, renewing itself every frame.
pub fn schedule_vblank(clock: &Clock, bus: Arc<Bus>) -> ClockResult<EventId> {
    let first: Cycle = clock.current_cycle() + FRAME_CYCLES;
    clock.schedule(first, move |scope: &mut EventScope<'_>| {
        bus.irq.raise();
        MachineStats::bump(&bus.stats.vblanks);
        if let Err(e) = scope.reschedule_self(scope.cycle() + FRAME_CYCLES) {
            warn!(error = %e, "Vertical blank not renewed");
        }
    })
}
