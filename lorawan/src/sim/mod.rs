//! Virtual-time discrete-event scheduler
//!
//! All device logic runs as callbacks scheduled against a single virtual
//! clock. Each callback receives the owning context (usually one
//! [`EndDevice`](crate::device::EndDevice)) and the scheduler itself, runs to
//! completion, and may schedule or cancel further events.
//!
//! - Events at the same virtual time fire in the order they were scheduled
//! - Cancellation is idempotent; a cancelled event never fires
//! - An [`EventId`] remembers the time it was scheduled for, even after it
//!   fired or was cancelled

pub mod time;

pub use time::SimTime;

use core::cmp::Reverse;
use core::time::Duration;
use std::collections::{BinaryHeap, HashMap};

/// Scheduled callback
pub type Callback<C> = Box<dyn FnOnce(&mut C, &mut Simulator<C>)>;

/// Identifier of a scheduled event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    seq: u64,
    at: SimTime,
}

impl EventId {
    /// Virtual time the event was scheduled for
    pub fn scheduled_at(&self) -> SimTime {
        self.at
    }
}

/// Virtual-time event queue
pub struct Simulator<C> {
    now: SimTime,
    next_seq: u64,
    queue: BinaryHeap<Reverse<(SimTime, u64)>>,
    pending: HashMap<u64, Callback<C>>,
}

impl<C> Default for Simulator<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Simulator<C> {
    /// Create an empty scheduler at time zero
    pub fn new() -> Self {
        Self {
            now: SimTime::ZERO,
            next_seq: 0,
            queue: BinaryHeap::new(),
            pending: HashMap::new(),
        }
    }

    /// Current virtual time
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Schedule `f` to run `delay` after the current time
    pub fn schedule<F>(&mut self, delay: Duration, f: F) -> EventId
    where
        F: FnOnce(&mut C, &mut Simulator<C>) + 'static,
    {
        let at = self.now + delay;
        self.schedule_at(at, f)
    }

    /// Schedule `f` at an absolute time; times in the past run at `now`
    pub fn schedule_at<F>(&mut self, at: SimTime, f: F) -> EventId
    where
        F: FnOnce(&mut C, &mut Simulator<C>) + 'static,
    {
        let at = at.max(self.now);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse((at, seq)));
        self.pending.insert(seq, Box::new(f));
        EventId { seq, at }
    }

    /// Cancel an event. Returns whether a pending event was removed.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.pending.remove(&id.seq).is_some()
    }

    /// Whether the event is still waiting to fire
    pub fn is_pending(&self, id: EventId) -> bool {
        self.pending.contains_key(&id.seq)
    }

    /// Whether the event has fired or was cancelled
    pub fn is_expired(&self, id: EventId) -> bool {
        !self.is_pending(id)
    }

    /// Number of events waiting to fire
    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    /// Time of the next live event, dropping cancelled entries on the way
    pub fn next_event_time(&mut self) -> Option<SimTime> {
        while let Some(Reverse((at, seq))) = self.queue.peek().copied() {
            if self.pending.contains_key(&seq) {
                return Some(at);
            }
            self.queue.pop();
        }
        None
    }

    /// Run the next live event. Returns `false` once the queue is empty.
    pub fn step(&mut self, ctx: &mut C) -> bool {
        while let Some(Reverse((at, seq))) = self.queue.pop() {
            if let Some(callback) = self.pending.remove(&seq) {
                self.now = at;
                callback(ctx, self);
                return true;
            }
        }
        false
    }

    /// Run every event scheduled at or before `end`, then advance the clock
    /// to `end`
    pub fn run_until(&mut self, ctx: &mut C, end: SimTime) {
        while matches!(self.next_event_time(), Some(at) if at <= end) {
            self.step(ctx);
        }
        self.now = self.now.max(end);
    }

    /// Run for `span` of virtual time from now
    pub fn run_for(&mut self, ctx: &mut C, span: Duration) {
        let end = self.now + span;
        self.run_until(ctx, end);
    }

    /// Run until no events remain. Never returns while a self-rescheduling
    /// event (such as a beacon opener) is live; use [`run_until`] instead.
    ///
    /// [`run_until`]: Simulator::run_until
    pub fn run(&mut self, ctx: &mut C) {
        while self.step(ctx) {}
    }
}

/// Named slot for a cancellable timer
///
/// Arming the slot cancels whatever it held before, so a stale callback can
/// never fire after the slot was re-armed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerHandle(Option<EventId>);

impl TimerHandle {
    /// Slot holding no event
    pub const fn idle() -> Self {
        Self(None)
    }

    /// Cancel the previous event, then schedule `f` after `delay`
    pub fn arm<C, F>(&mut self, sim: &mut Simulator<C>, delay: Duration, f: F) -> EventId
    where
        F: FnOnce(&mut C, &mut Simulator<C>) + 'static,
    {
        self.cancel(sim);
        let id = sim.schedule(delay, f);
        self.0 = Some(id);
        id
    }

    /// Cancel the held event. Returns whether it was still pending.
    pub fn cancel<C>(&self, sim: &mut Simulator<C>) -> bool {
        self.0.map_or(false, |id| sim.cancel(id))
    }

    /// Whether the held event is still waiting to fire
    pub fn is_pending<C>(&self, sim: &Simulator<C>) -> bool {
        self.0.map_or(false, |id| sim.is_pending(id))
    }

    /// Whether the slot is empty, or its event fired or was cancelled
    pub fn is_expired<C>(&self, sim: &Simulator<C>) -> bool {
        !self.is_pending(sim)
    }

    /// Time the held event was scheduled for
    pub fn scheduled_at(&self) -> Option<SimTime> {
        self.0.map(|id| id.scheduled_at())
    }

    /// The held event, if any
    pub fn event(&self) -> Option<EventId> {
        self.0
    }
}
