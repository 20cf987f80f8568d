//! Scheduled one-shot events keyed by absolute cycle.
//!
//! Events are ordered by `(target cycle, sequence)`. The sequence number is
//! taken from a monotonically increasing counter every time an event is
//! inserted or moved, so events that share a target cycle fire in the order
//! they were (re)scheduled.
//!
//! Firing is "pop, execute, maybe re-insert": the event being executed is
//! parked in an in-flight slot while its callback runs without the queue
//! lock held. Cancelling or rescheduling an in-flight event is recorded
//! against that slot and resolved when the callback returns, so a concurrent
//! reschedule never observes the event as missing. Within the slot the last
//! request wins: a callback that cancels itself and then renews fires again.

use crate::handle::{ClockHandle, ClockShared};
use lockstep_common::error::ClockResult;
use lockstep_common::time::Cycle;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Identity of a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    /// Raw numeric id.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

/// Callback invoked when an event fires.
pub type EventCallback = Box<dyn FnMut(&mut EventScope<'_>) + Send>;

type QueueKey = (Cycle, u64);

/// What happened to the in-flight event while its callback ran.
#[derive(Debug, Default)]
struct InFlight {
    id: Option<EventId>,
    cancelled: bool,
    moved_to: Option<Cycle>,
}

/// Priority queue of pending events.
pub(crate) struct EventQueue {
    next_id: u64,
    next_seq: u64,
    order: BTreeMap<QueueKey, (EventId, EventCallback)>,
    index: HashMap<EventId, QueueKey>,
    in_flight: InFlight,
    /// Earliest pending target, `Cycle::MAX` when empty.
    next_due: Cycle,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            next_seq: 0,
            order: BTreeMap::new(),
            index: HashMap::new(),
            in_flight: InFlight::default(),
            next_due: Cycle::MAX,
        }
    }

    /// Insert a new event. Target validation is the caller's job.
    pub(crate) fn insert(&mut self, cycle: Cycle, callback: EventCallback) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        self.place(id, cycle, callback);
        id
    }

    fn place(&mut self, id: EventId, cycle: Cycle, callback: EventCallback) {
        let key = (cycle, self.next_seq);
        self.next_seq += 1;
        self.order.insert(key, (id, callback));
        self.index.insert(id, key);
        self.refresh_next_due();
    }

    /// Remove a pending event. Returns false if it already fired or never existed.
    pub(crate) fn cancel(&mut self, id: EventId) -> bool {
        if let Some(key) = self.index.remove(&id) {
            self.order.remove(&key);
            self.refresh_next_due();
            return true;
        }
        if self.in_flight.id == Some(id) && !self.in_flight.cancelled {
            self.in_flight.cancelled = true;
            self.in_flight.moved_to = None;
            return true;
        }
        false
    }

    /// Move a pending event to a new target in one step.
    pub(crate) fn reschedule(&mut self, id: EventId, cycle: Cycle) -> bool {
        if let Some(key) = self.index.remove(&id) {
            if let Some((_, callback)) = self.order.remove(&key) {
                self.place(id, cycle, callback);
                return true;
            }
            return false;
        }
        if self.in_flight.id == Some(id) && !self.in_flight.cancelled {
            self.in_flight.moved_to = Some(cycle);
            return true;
        }
        false
    }

    /// Renew the in-flight event at `cycle` on behalf of its own callback,
    /// overriding any earlier cancel or move.
    pub(crate) fn renew_in_flight(&mut self, id: EventId, cycle: Cycle) -> bool {
        if self.in_flight.id != Some(id) {
            return false;
        }
        self.in_flight.cancelled = false;
        self.in_flight.moved_to = Some(cycle);
        true
    }

    /// Pop the earliest event due at or before `cycle` and mark it in flight.
    pub(crate) fn pop_due(&mut self, cycle: Cycle) -> Option<(EventId, EventCallback)> {
        if self.next_due > cycle {
            return None;
        }
        let (key, (id, callback)) = self.order.pop_first()?;
        debug_assert!(key.0 <= cycle);
        self.index.remove(&id);
        self.refresh_next_due();
        self.in_flight = InFlight {
            id: Some(id),
            cancelled: false,
            moved_to: None,
        };
        Some((id, callback))
    }

    /// Resolve the in-flight event after its callback returned: re-insert it
    /// if it was renewed or moved, drop it otherwise.
    pub(crate) fn complete(&mut self, callback: EventCallback) {
        let in_flight = std::mem::take(&mut self.in_flight);
        let Some(id) = in_flight.id else {
            return;
        };
        if in_flight.cancelled {
            return;
        }
        if let Some(target) = in_flight.moved_to {
            self.place(id, target, callback);
        }
    }

    /// Drop the in-flight event without re-inserting it.
    pub(crate) fn abandon(&mut self) {
        self.in_flight = InFlight::default();
    }

    /// Earliest pending target cycle.
    pub(crate) fn next_due(&self) -> Option<Cycle> {
        (self.next_due != Cycle::MAX).then_some(self.next_due)
    }

    /// Whether the event will fire (again). An in-flight event counts once
    /// it has been renewed or moved.
    pub(crate) fn contains(&self, id: EventId) -> bool {
        self.index.contains_key(&id)
            || (self.in_flight.id == Some(id) && self.in_flight.moved_to.is_some())
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
        self.in_flight = InFlight::default();
        self.next_due = Cycle::MAX;
    }

    fn refresh_next_due(&mut self) {
        self.next_due = self
            .order
            .first_key_value()
            .map_or(Cycle::MAX, |(&(cycle, _), _)| cycle);
    }
}

/// View of the clock handed to a firing event callback.
///
/// Scheduling through the scope may target the cycle that is currently
/// firing; such events run later in the same firing pass.
pub struct EventScope<'a> {
    shared: &'a Arc<ClockShared>,
    id: EventId,
    cycle: Cycle,
}

impl<'a> EventScope<'a> {
    pub(crate) fn new(shared: &'a Arc<ClockShared>, id: EventId, cycle: Cycle) -> Self {
        Self { shared, id, cycle }
    }

    /// Cycle at which this event is firing.
    #[must_use]
    pub fn cycle(&self) -> Cycle {
        self.cycle
    }

    /// Id of the firing event.
    #[must_use]
    pub fn id(&self) -> EventId {
        self.id
    }

    /// Schedule another event at or after the firing cycle.
    pub fn schedule<F>(&mut self, cycle: Cycle, callback: F) -> ClockResult<EventId>
    where
        F: FnMut(&mut EventScope<'_>) + Send + 'static,
    {
        self.shared
            .schedule_not_before(cycle, self.cycle, Box::new(callback))
    }

    /// Cancel a pending event. Cancelling the firing event drops any renewal
    /// requested so far; a later `reschedule_self` revives it.
    pub fn cancel(&mut self, id: EventId) -> ClockResult<bool> {
        self.shared.cancel(id)
    }

    /// Move a pending event, or renew the firing event when `id` is its own.
    pub fn reschedule(&mut self, id: EventId, cycle: Cycle) -> ClockResult<bool> {
        if id == self.id {
            self.reschedule_self(cycle)?;
            return Ok(true);
        }
        self.shared.reschedule_not_before(id, cycle, self.cycle)
    }

    /// Fire this same event again at `cycle`, keeping its id.
    ///
    /// The target must be strictly after the firing cycle.
    pub fn reschedule_self(&mut self, cycle: Cycle) -> ClockResult<()> {
        self.shared.renew_in_flight(self.id, cycle, self.cycle + 1)
    }

    /// Capability handle for use outside the callback.
    #[must_use]
    pub fn handle(&self) -> ClockHandle {
        ClockHandle::from_shared(Arc::clone(self.shared))
    }
}
