//! Worker thread plumbing shared by the thread-based strategies.

use crate::placement;
use crate::strategy::ComponentOutcome;
use crate::tick::{ClockedComponent, ComponentExit};
use lockstep_common::config::ThreadConfig;
use lockstep_common::error::{ClockError, ClockResult};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Extract a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("non-string panic payload")
    }
}

/// Run a component body, converting panics into faults.
pub(crate) fn run_component(component: &mut dyn ClockedComponent) -> ComponentOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| component.run())) {
        Ok(Ok(())) => ComponentOutcome::Finished,
        Ok(Err(ComponentExit::Cancelled)) => ComponentOutcome::Cancelled,
        Ok(Err(ComponentExit::Fault(message))) => ComponentOutcome::Faulted(message),
        Err(payload) => ComponentOutcome::Faulted(panic_message(payload.as_ref())),
    }
}

#[derive(Default)]
struct LiveCount {
    count: Mutex<usize>,
    all_exited: Condvar,
}

/// Marks the worker exited and decrements the live count, even by unwinding.
struct ExitGuard {
    live: Arc<LiveCount>,
    exited: Arc<AtomicBool>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.exited.store(true, Ordering::Release);
        let mut count = self.live.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.live.all_exited.notify_all();
        }
    }
}

struct Worker {
    name: String,
    handle: JoinHandle<()>,
    exited: Arc<AtomicBool>,
}

/// The set of worker threads owned by one strategy.
#[derive(Default)]
pub(crate) struct WorkerSet {
    workers: Vec<Worker>,
    live: Arc<LiveCount>,
}

impl WorkerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Spawn a named worker for the component at `index` in execution order.
    pub(crate) fn spawn<F>(
        &mut self,
        threads: &ThreadConfig,
        index: usize,
        position: u32,
        name: &str,
        body: F,
    ) -> ClockResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread_name = format!("{}-{}-{}", threads.name_prefix, position, name);
        let affinity = threads.cpu_affinity.clone();

        let exited = Arc::new(AtomicBool::new(false));
        *self.live.count.lock() += 1;
        let guard = ExitGuard {
            live: Arc::clone(&self.live),
            exited: Arc::clone(&exited),
        };

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .stack_size(threads.stack_size)
            .spawn(move || {
                let _guard = guard;
                let cpu = placement::apply(&affinity, index);
                debug!(position, ?cpu, "Worker thread started");
                body();
                debug!(position, "Worker thread stopped");
            })
            .map_err(|e| ClockError::ThreadSpawn(format!("{thread_name}: {e}")))?;

        self.workers.push(Worker {
            name: thread_name,
            handle,
            exited,
        });
        Ok(())
    }

    /// Wait up to `grace` for every worker to exit, join them, and detach
    /// the ones that are still stuck. Returns the number detached.
    pub(crate) fn shutdown(&mut self, grace: Duration) -> usize {
        {
            let mut count = self.live.count.lock();
            self.live
                .all_exited
                .wait_while_for(&mut count, |count| *count > 0, grace);
        }

        let mut detached = 0;
        for worker in self.workers.drain(..) {
            // An exited worker is only tearing down; joining it is bounded.
            if worker.exited.load(Ordering::Acquire) {
                if worker.handle.join().is_err() {
                    warn!(thread = %worker.name, "Worker thread panicked outside its component");
                }
            } else {
                warn!(thread = %worker.name, "Worker did not exit; detaching");
                detached += 1;
            }
        }
        detached
    }
}
