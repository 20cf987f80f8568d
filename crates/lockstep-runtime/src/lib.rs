#![doc = "Cycle-lockstep clock engine for cycle-accurate emulation."]

pub mod clock;
pub mod events;
pub mod fault_recorder;
pub mod handle;
pub mod placement;
pub mod strategy;
pub mod tick;
mod worker;

pub use clock::*;
pub use events::{EventCallback, EventId, EventScope};
pub use fault_recorder::*;
pub use handle::ClockHandle;
pub use strategy::{ComponentOutcome, ComponentSlot, StrategyContext, SyncStrategy};
pub use tick::*;
