//! Cooperative stackful coroutines on the driver thread.
//!
//! Each component body runs inside its own generator stack. A tick is a
//! `yield` back into the driver loop, which resumes the fibers one after
//! another in position order. No OS thread synchronization is involved, so
//! there is nothing to stall on: a component that never ticks simply blocks
//! the driver.

use super::{ComponentOutcome, ComponentSlot, StrategyContext, SyncStrategy};
use crate::tick::{Cancelled, TickPort};
use generator::{Generator, Gn};
use lockstep_common::error::ClockResult;
use lockstep_common::time::Cycle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Resumes granted to a cancelled fiber before it is abandoned.
const CANCEL_ATTEMPTS: usize = 3;

struct FiberPort {
    cancelled: Arc<AtomicBool>,
}

impl TickPort for FiberPort {
    fn wait_for_tick(&self) -> Result<(), Cancelled> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(Cancelled);
        }
        generator::yield_with(());
        if self.cancelled.load(Ordering::Acquire) {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

struct Fiber {
    position: u32,
    name: String,
    body: Generator<'static, (), ()>,
    started: bool,
}

impl Fiber {
    fn resume(&mut self) {
        self.started = true;
        self.body.resume();
    }

    fn is_done(&self) -> bool {
        self.body.is_done()
    }
}

/// Single-threaded strategy running components as coroutines.
#[derive(Default)]
pub struct FiberStrategy {
    fibers: Vec<Fiber>,
    cancelled: Arc<AtomicBool>,
    ctx: Option<StrategyContext>,
}

impl FiberStrategy {
    /// Create an unstarted strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncStrategy for FiberStrategy {
    fn name(&self) -> &'static str {
        "fiber"
    }

    fn start(&mut self, ctx: &StrategyContext, components: Vec<ComponentSlot>) -> ClockResult<()> {
        let stack_words = ctx.config().fiber.stack_size / std::mem::size_of::<usize>();

        for mut slot in components {
            slot.install_port(Box::new(FiberPort {
                cancelled: Arc::clone(&self.cancelled),
            }));
            let position = slot.position();
            let name = slot.name().to_string();
            let fiber_ctx = ctx.clone();

            let body = Gn::<()>::new_opt(stack_words, move || {
                let outcome = slot.run();
                fiber_ctx.report_exit(position, slot.name(), outcome);
            });
            self.fibers.push(Fiber {
                position,
                name,
                body,
                started: false,
            });
        }

        self.ctx = Some(ctx.clone());
        debug!(components = self.fibers.len(), stack_words, "Fibers created");
        Ok(())
    }

    fn step(&mut self, _cycle: Cycle) -> ClockResult<()> {
        for fiber in self.fibers.iter_mut().filter(|f| !f.is_done()) {
            fiber.resume();
        }
        Ok(())
    }

    fn shutdown(&mut self) -> usize {
        self.cancelled.store(true, Ordering::Release);
        let mut abandoned = 0;

        for mut fiber in self.fibers.drain(..) {
            if !fiber.started {
                if let Some(ctx) = &self.ctx {
                    ctx.report_exit(fiber.position, &fiber.name, ComponentOutcome::Cancelled);
                }
                continue;
            }
            for _ in 0..CANCEL_ATTEMPTS {
                if fiber.is_done() {
                    break;
                }
                fiber.resume();
            }
            if !fiber.is_done() {
                warn!(position = fiber.position, name = %fiber.name, "Fiber ignored cancellation");
                abandoned += 1;
            }
        }
        abandoned
    }
}
