//! State shared between the clock, its strategy, and every capability handle.
//!
//! The cycle counter and the event queue are the only state all components
//! share. The counter is only ever incremented while the queue lock is held,
//! so "is this target in the past?" is decided against a counter value that
//! cannot move underneath the check.

use crate::events::{EventCallback, EventId, EventQueue, EventScope};
use crate::fault_recorder::{FaultLog, FaultRecord, FaultSource};
use crate::worker::panic_message;
use crossbeam_utils::CachePadded;
use lockstep_common::error::{ClockError, ClockResult};
use lockstep_common::time::{Cycle, BEFORE_FIRST_CYCLE};
use parking_lot::{Mutex, MutexGuard};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, trace};

#[derive(Debug, Default)]
pub(crate) struct ExitCounts {
    pub(crate) finished: AtomicUsize,
    pub(crate) cancelled: AtomicUsize,
    pub(crate) faulted: AtomicUsize,
}

pub(crate) struct ClockShared {
    cycle: CachePadded<AtomicU64>,
    events: Mutex<EventQueue>,
    disposed: AtomicBool,
    dispose_requested: AtomicBool,
    faults: Mutex<FaultLog>,
    pub(crate) exits: ExitCounts,
}

impl ClockShared {
    pub(crate) fn new(fault_history: usize) -> Arc<Self> {
        Arc::new(Self {
            cycle: CachePadded::new(AtomicU64::new(BEFORE_FIRST_CYCLE)),
            events: Mutex::new(EventQueue::new()),
            disposed: AtomicBool::new(false),
            dispose_requested: AtomicBool::new(false),
            faults: Mutex::new(FaultLog::new(fault_history)),
            exits: ExitCounts::default(),
        })
    }

    pub(crate) fn current_cycle(&self) -> Cycle {
        self.cycle.load(Ordering::Acquire)
    }

    fn events(&self) -> MutexGuard<'_, EventQueue> {
        self.events.lock()
    }

    /// Advance the counter by exactly one and return the new cycle.
    pub(crate) fn begin_cycle(&self) -> Cycle {
        let _queue = self.events();
        self.cycle.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Reject targets earlier than `floor`.
    pub(crate) fn check_target(&self, cycle: Cycle, floor: Cycle) -> ClockResult<()> {
        self.ensure_live()?;
        if cycle < floor {
            return Err(ClockError::ScheduleInPast {
                requested: cycle,
                current: self.current_cycle(),
            });
        }
        Ok(())
    }

    fn ensure_live(&self) -> ClockResult<()> {
        if self.is_disposed() {
            Err(ClockError::Disposed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn schedule(&self, cycle: Cycle, callback: EventCallback) -> ClockResult<EventId> {
        let mut queue = self.events();
        let current = self.current_cycle();
        self.check_target(cycle, current + 1)?;
        let id = queue.insert(cycle, callback);
        trace!(%id, cycle, current, "Event scheduled");
        Ok(id)
    }

    /// Schedule from inside a firing callback; the firing cycle itself is allowed.
    pub(crate) fn schedule_not_before(
        &self,
        cycle: Cycle,
        floor: Cycle,
        callback: EventCallback,
    ) -> ClockResult<EventId> {
        let mut queue = self.events();
        self.check_target(cycle, floor)?;
        let id = queue.insert(cycle, callback);
        trace!(%id, cycle, "Event chained");
        Ok(id)
    }

    pub(crate) fn cancel(&self, id: EventId) -> ClockResult<bool> {
        self.ensure_live()?;
        let removed = self.events().cancel(id);
        trace!(%id, removed, "Event cancel");
        Ok(removed)
    }

    pub(crate) fn reschedule(&self, id: EventId, cycle: Cycle) -> ClockResult<bool> {
        let mut queue = self.events();
        let current = self.current_cycle();
        self.check_target(cycle, current + 1)?;
        Ok(queue.reschedule(id, cycle))
    }

    pub(crate) fn reschedule_not_before(
        &self,
        id: EventId,
        cycle: Cycle,
        floor: Cycle,
    ) -> ClockResult<bool> {
        let mut queue = self.events();
        self.check_target(cycle, floor)?;
        Ok(queue.reschedule(id, cycle))
    }

    /// Renew the firing event from its own callback; `floor` is the first legal target.
    pub(crate) fn renew_in_flight(&self, id: EventId, cycle: Cycle, floor: Cycle) -> ClockResult<()> {
        let mut queue = self.events();
        self.check_target(cycle, floor)?;
        let renewed = queue.renew_in_flight(id, cycle);
        debug_assert!(renewed, "{id} is not in flight");
        Ok(())
    }

    pub(crate) fn is_pending(&self, id: EventId) -> bool {
        self.events().contains(id)
    }

    pub(crate) fn pending_events(&self) -> usize {
        self.events().len()
    }

    pub(crate) fn next_due(&self) -> Option<Cycle> {
        self.events().next_due()
    }

    /// Fire every event due at or before `cycle`, in `(cycle, sequence)` order.
    ///
    /// Callbacks run without the queue lock held. A panicking callback is
    /// dropped, recorded as a fault, and does not stop the remaining events.
    /// Returns the number of callbacks invoked.
    pub(crate) fn fire_due(self: &Arc<Self>, cycle: Cycle) -> usize {
        let mut fired = 0;
        loop {
            let Some((id, mut callback)) = self.events().pop_due(cycle) else {
                break;
            };
            fired += 1;

            let mut scope = EventScope::new(self, id, cycle);
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&mut scope)));

            match outcome {
                Ok(()) => self.events().complete(callback),
                Err(payload) => {
                    self.events().abandon();
                    let message = panic_message(payload.as_ref());
                    error!(%id, cycle, %message, "Event callback panicked");
                    self.record_fault(FaultRecord {
                        cycle,
                        source: FaultSource::Event { id: id.as_u64() },
                        message,
                    });
                }
            }
        }
        fired
    }

    pub(crate) fn record_fault(&self, record: FaultRecord) {
        self.faults.lock().record(record);
    }

    pub(crate) fn take_unreported_faults(&self) -> Vec<FaultRecord> {
        self.faults.lock().take_unreported()
    }

    pub(crate) fn fault_records(&self) -> Vec<FaultRecord> {
        self.faults.lock().records()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_events(&self) -> usize {
        let mut queue = self.events();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    pub(crate) fn request_dispose(&self) {
        self.dispose_requested.store(true, Ordering::Release);
    }

    pub(crate) fn dispose_requested(&self) -> bool {
        self.dispose_requested.load(Ordering::Acquire)
    }
}

/// Cloneable capability for reading the clock and managing events.
///
/// Components capture one of these to schedule events; the host can keep
/// one on another thread to stop a [`Clock::run_forever`](crate::Clock::run_forever).
#[derive(Clone)]
pub struct ClockHandle {
    shared: Arc<ClockShared>,
}

impl ClockHandle {
    pub(crate) fn from_shared(shared: Arc<ClockShared>) -> Self {
        Self { shared }
    }

    /// Current cycle number.
    #[must_use]
    pub fn current_cycle(&self) -> Cycle {
        self.shared.current_cycle()
    }

    /// Schedule a one-shot callback strictly after the current cycle.
    pub fn schedule<F>(&self, cycle: Cycle, callback: F) -> ClockResult<EventId>
    where
        F: FnMut(&mut EventScope<'_>) + Send + 'static,
    {
        self.shared.schedule(cycle, Box::new(callback))
    }

    /// Remove a pending event. `Ok(false)` if it already fired or is unknown.
    pub fn cancel(&self, id: EventId) -> ClockResult<bool> {
        self.shared.cancel(id)
    }

    /// Atomically move a pending event to a later cycle.
    pub fn reschedule(&self, id: EventId, cycle: Cycle) -> ClockResult<bool> {
        self.shared.reschedule(id, cycle)
    }

    /// Whether the event will fire (again). While its callback runs, an
    /// event counts as pending only once it has been renewed or moved.
    #[must_use]
    pub fn is_pending(&self, id: EventId) -> bool {
        self.shared.is_pending(id)
    }

    /// Ask a running clock to dispose itself at the next cycle boundary.
    pub fn request_dispose(&self) {
        self.shared.request_dispose();
    }

    /// Whether the clock has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }
}

impl std::fmt::Debug for ClockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockHandle")
            .field("cycle", &self.current_cycle())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
