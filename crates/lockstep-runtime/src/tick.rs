//! Tick handles and the clocked-component contract.
//!
//! A component is a straight-line procedure that calls
//! [`TickHandle::wait_for_tick`] whenever it has finished one cycle's worth
//! of work. What actually happens inside that call is decided by the active
//! synchronization strategy, which installs a [`TickPort`] into every handle
//! when the clock starts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// The clock was disposed while a component was suspended.
///
/// This is the normal way for a component's `run` to end and is never
/// reported as a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("clock disposed")
    }
}

impl std::error::Error for Cancelled {}

/// Why a component's `run` stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentExit {
    /// Cooperative cancellation observed at a tick.
    Cancelled,
    /// Unrecoverable component error.
    Fault(String),
}

impl ComponentExit {
    /// Build a fault from anything printable.
    pub fn fault(message: impl fmt::Display) -> Self {
        Self::Fault(message.to_string())
    }
}

impl From<Cancelled> for ComponentExit {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl fmt::Display for ComponentExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::Fault(message) => write!(f, "fault: {message}"),
        }
    }
}

/// Result of a component's `run` body.
pub type ComponentResult = Result<(), ComponentExit>;

/// Strategy-side implementation of the suspension point.
pub trait TickPort: Send + Sync {
    /// Suspend the calling component until its next step is released.
    fn wait_for_tick(&self) -> Result<(), Cancelled>;
}

/// Shared per-component state between the handle, the clock and the strategy.
pub(crate) struct TickSlot {
    position: u32,
    port: OnceLock<Box<dyn TickPort>>,
    steps: AtomicU64,
}

impl TickSlot {
    pub(crate) fn new(position: u32) -> Arc<Self> {
        Arc::new(Self {
            position,
            port: OnceLock::new(),
            steps: AtomicU64::new(0),
        })
    }

    /// Install the strategy's port. Returns false if one was already set.
    pub(crate) fn install(&self, port: Box<dyn TickPort>) -> bool {
        self.port.set(port).is_ok()
    }

    pub(crate) fn position(&self) -> u32 {
        self.position
    }

    pub(crate) fn steps(&self) -> u64 {
        self.steps.load(Ordering::Acquire)
    }
}

/// Capability a component uses to suspend itself until the next cycle.
///
/// Bound to exactly one component and moved into it by
/// [`ClockedComponent::bind`]; it is deliberately not `Clone`.
pub struct TickHandle {
    slot: Arc<TickSlot>,
}

impl TickHandle {
    pub(crate) fn new(slot: Arc<TickSlot>) -> Self {
        Self { slot }
    }

    /// Position the owning component was registered at.
    #[must_use]
    pub fn position(&self) -> u32 {
        self.slot.position
    }

    /// Yield until the next global cycle releases this component.
    ///
    /// Returns `Err(Cancelled)` once the clock is being disposed; the
    /// component should unwind its `run` with `?`.
    pub fn wait_for_tick(&self) -> Result<(), Cancelled> {
        self.slot.steps.fetch_add(1, Ordering::AcqRel);
        match self.slot.port.get() {
            Some(port) => port.wait_for_tick(),
            None => Err(Cancelled),
        }
    }
}

impl fmt::Debug for TickHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickHandle")
            .field("position", &self.slot.position)
            .field("steps", &self.slot.steps())
            .finish()
    }
}

/// A simulated chip driven by the clock.
pub trait ClockedComponent: Send + 'static {
    /// Name used in diagnostics and worker thread names.
    fn name(&self) -> &str;

    /// Receive the tick handle. Called once, during registration.
    fn bind(&mut self, tick: TickHandle);

    /// Execute the component body.
    ///
    /// Conceptually never returns; it ends with `Err(ComponentExit::Cancelled)`
    /// when the clock is disposed, or with a fault.
    fn run(&mut self) -> ComponentResult;
}

impl<T: ClockedComponent + ?Sized> ClockedComponent for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn bind(&mut self, tick: TickHandle) {
        (**self).bind(tick);
    }

    fn run(&mut self) -> ComponentResult {
        (**self).run()
    }
}

/// Host-side view of a registered component.
#[derive(Clone)]
pub struct ComponentHandle {
    slot: Arc<TickSlot>,
    name: Arc<str>,
}

impl ComponentHandle {
    pub(crate) fn new(slot: Arc<TickSlot>, name: &str) -> Self {
        Self {
            slot,
            name: Arc::from(name),
        }
    }

    /// Registration position.
    #[must_use]
    pub fn position(&self) -> u32 {
        self.slot.position
    }

    /// Component name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tick waits the component has entered.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.slot.steps()
    }
}

impl fmt::Debug for ComponentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentHandle")
            .field("position", &self.position())
            .field("name", &self.name)
            .field("steps", &self.steps())
            .finish()
    }
}
