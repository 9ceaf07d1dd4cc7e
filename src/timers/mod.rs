//! Indexed virtual timers
//!
//! [`Timers`] holds a set of one-shot timers identified by small integer
//! indexes. Owners arm and cancel timers by index and collect expiries by
//! calling [`Timers::poll`] once the clock has passed
//! [`Timers::next_deadline`]; an expiry is never delivered twice and a
//! cancelled or rescheduled timer never fires for its old deadline.
//!
//! Each timer may carry a typed context value and a destructor, the
//! destructor receives the context when the timer is deleted, or when the
//! service is dropped while the timer is still scheduled.

use alloc::collections::BTreeMap;

use log::trace;

use crate::{Ts, clock::Clock, error::TimerError};

pub mod repeat;
pub use repeat::RepeatTimers;

/// Timer index, unique within one timer service
pub type TimerId = u32;

/// Expired timer, returned by [`Timers::poll`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Expired {
    pub index: TimerId,
    /// Deadline the timer was armed for
    pub at: Ts,
}

#[derive(Debug)]
struct Slot<X> {
    fire_at: Option<Ts>,
    /// Arm order, breaks ties between equal deadlines
    seq: u64,
    context: Option<X>,
    destructor: Option<fn(X)>,
}

impl <X> Default for Slot<X> {
    fn default() -> Self {
        Self {
            fire_at: None,
            seq: 0,
            context: None,
            destructor: None,
        }
    }
}

/// One-shot timer service, generic over a clock (T) and context type (X)
pub struct Timers<T, X = ()> {
    clock: T,
    slots: BTreeMap<TimerId, Slot<X>>,
    seq: u64,
}

impl <T: Clock, X> Timers<T, X> {
    /// Create an empty timer service using the provided clock
    pub fn new(clock: T) -> Self {
        Self {
            clock,
            slots: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Fetch the current time from the underlying clock
    pub fn now(&self) -> Ts {
        self.clock.now()
    }

    pub fn clock(&self) -> &T {
        &self.clock
    }

    /// Reserve indexes `0..count` so that [`Timers::allocate_next`] skips
    /// them. Already allocated indexes are left untouched.
    pub fn preallocate(&mut self, count: TimerId) {
        for i in 0..count {
            self.slots.entry(i).or_default();
        }
    }

    /// Allocate a specific timer index
    pub fn allocate(&mut self, index: TimerId) -> Result<TimerId, TimerError> {
        if self.slots.contains_key(&index) {
            return Err(TimerError::Duplicate(index));
        }
        self.slots.insert(index, Slot::default());
        Ok(index)
    }

    /// Allocate the lowest free timer index
    pub fn allocate_next(&mut self) -> TimerId {
        // Keys are ordered, so the first gap is the lowest free index
        let mut index = 0;
        for k in self.slots.keys() {
            if *k != index {
                break;
            }
            index += 1;
        }
        self.slots.insert(index, Slot::default());
        index
    }

    pub fn is_allocated(&self, index: TimerId) -> bool {
        self.slots.contains_key(&index)
    }

    /// Arm an allocated timer to fire `delay` ticks from now, replacing
    /// any pending deadline
    pub fn schedule(&mut self, index: TimerId, delay: Ts) -> Result<(), TimerError> {
        let at = self.clock.now() + delay;
        self.schedule_at(index, at)
    }

    /// Arm an allocated timer for an absolute deadline
    pub fn schedule_at(&mut self, index: TimerId, at: Ts) -> Result<(), TimerError> {
        let seq = self.next_seq();
        let slot = self.slots.get_mut(&index).ok_or(TimerError::Unknown(index))?;

        trace!("Timer {} armed for {}", index, at);

        slot.fire_at = Some(at);
        slot.seq = seq;

        Ok(())
    }

    /// Arm a timer, allocating the index first if required
    pub fn set_timer(&mut self, index: TimerId, delay: Ts) {
        self.slots.entry(index).or_default();
        // Cannot fail, the slot exists
        let _ = self.schedule(index, delay);
    }

    /// Allocate the lowest free index and arm it, returning the index
    pub fn set_timer_auto(&mut self, delay: Ts) -> TimerId {
        let index = self.allocate_next();
        let _ = self.schedule(index, delay);
        index
    }

    /// Cancel a pending deadline, this is a no-op for timers that are not
    /// currently scheduled
    pub fn cancel(&mut self, index: TimerId) -> Result<(), TimerError> {
        let slot = self.slots.get_mut(&index).ok_or(TimerError::Unknown(index))?;
        if slot.fire_at.take().is_some() {
            trace!("Timer {} cancelled", index);
        }
        Ok(())
    }

    pub fn is_scheduled(&self, index: TimerId) -> Result<bool, TimerError> {
        let slot = self.slots.get(&index).ok_or(TimerError::Unknown(index))?;
        Ok(slot.fire_at.is_some())
    }

    /// Time until the timer fires, `None` when not scheduled
    pub fn remaining(&self, index: TimerId) -> Result<Option<Ts>, TimerError> {
        let slot = self.slots.get(&index).ok_or(TimerError::Unknown(index))?;
        let now = self.clock.now();
        Ok(slot.fire_at.map(|at| at.saturating_sub(now)))
    }

    /// Attach a context value, returning the previous one
    pub fn set_context(&mut self, index: TimerId, context: X) -> Result<Option<X>, TimerError> {
        let slot = self.slots.get_mut(&index).ok_or(TimerError::Unknown(index))?;
        Ok(slot.context.replace(context))
    }

    pub fn context(&self, index: TimerId) -> Result<Option<&X>, TimerError> {
        let slot = self.slots.get(&index).ok_or(TimerError::Unknown(index))?;
        Ok(slot.context.as_ref())
    }

    /// Detach and return the context value
    pub fn take_context(&mut self, index: TimerId) -> Result<Option<X>, TimerError> {
        let slot = self.slots.get_mut(&index).ok_or(TimerError::Unknown(index))?;
        Ok(slot.context.take())
    }

    /// Set the cleanup function called with the context on delete
    /// (or on drop while scheduled)
    pub fn set_destructor(&mut self, index: TimerId, destructor: fn(X)) -> Result<(), TimerError> {
        let slot = self.slots.get_mut(&index).ok_or(TimerError::Unknown(index))?;
        slot.destructor = Some(destructor);
        Ok(())
    }

    /// Cancel and free a timer index, running the destructor on any
    /// attached context
    pub fn delete(&mut self, index: TimerId) -> Result<(), TimerError> {
        let slot = self.slots.remove(&index).ok_or(TimerError::Unknown(index))?;
        if let (Some(d), Some(c)) = (slot.destructor, slot.context) {
            d(c);
        }
        Ok(())
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Ts> {
        self.slots.values().filter_map(|s| s.fire_at).min()
    }

    /// Remove and return the earliest expired timer, if any.
    ///
    /// Timers sharing a deadline are returned in the order they were armed.
    pub fn poll(&mut self) -> Option<Expired> {
        let now = self.clock.now();

        let (index, at) = self.slots.iter()
            .filter_map(|(i, s)| s.fire_at.map(|at| (at, s.seq, *i)))
            .filter(|(at, _, _)| *at <= now)
            .min()
            .map(|(at, _seq, i)| (i, at))?;

        if let Some(s) = self.slots.get_mut(&index) {
            s.fire_at = None;
        }

        trace!("Timer {} fired at {} (deadline {})", index, now, at);

        Some(Expired{ index, at })
    }

    fn next_seq(&mut self) -> u64 {
        let s = self.seq;
        self.seq = self.seq.wrapping_add(1);
        s
    }
}

impl <T, X> Drop for Timers<T, X> {
    fn drop(&mut self) {
        let slots = core::mem::take(&mut self.slots);
        for (_i, s) in slots {
            if s.fire_at.is_none() {
                continue;
            }
            if let (Some(d), Some(c)) = (s.destructor, s.context) {
                d(c);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{vec, vec::Vec};
    use std::cell::RefCell;

    use crate::clock::mock::SimClock;
    use super::*;

    const SECOND: Ts = crate::TICKS_PER_SECOND;

    fn setup() -> (SimClock, Timers<SimClock, u32>) {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());
        let clock = SimClock::new();
        let timers = Timers::new(clock.clone());
        (clock, timers)
    }

    /// Advance the clock deadline by deadline, collecting expiries
    fn run(clock: &SimClock, timers: &mut Timers<SimClock, u32>) -> Vec<(TimerId, Ts)> {
        let mut fired = Vec::new();
        while let Some(t) = timers.next_deadline() {
            clock.set(t);
            while let Some(e) = timers.poll() {
                fired.push((e.index, clock.now()));
            }
        }
        fired
    }

    #[test]
    fn allocate_unique() {
        let (_clock, mut timers) = setup();

        let mut seen = Vec::new();
        for _ in 0..16 {
            let i = timers.allocate_next();
            assert!(!seen.contains(&i));
            seen.push(i);
        }
        assert_eq!(seen, (0..16).collect::<Vec<_>>());

        // Freed indexes are reused lowest first
        timers.delete(3).unwrap();
        timers.delete(7).unwrap();
        assert_eq!(timers.allocate_next(), 3);
        assert_eq!(timers.allocate_next(), 7);
        assert_eq!(timers.allocate_next(), 16);
    }

    #[test]
    fn preallocate_reserves_low_range() {
        let (clock, mut timers) = setup();

        timers.preallocate(4);
        assert_eq!(timers.allocate(3), Err(TimerError::Duplicate(3)));
        assert_eq!(timers.allocate_next(), 4);

        timers.set_timer(0, SECOND);
        timers.set_timer(7, 2 * SECOND);

        let fired = run(&clock, &mut timers);
        assert_eq!(fired, vec![(0, SECOND), (7, 2 * SECOND)]);
    }

    #[test]
    fn unknown_index() {
        let (_clock, mut timers) = setup();

        assert_eq!(timers.schedule(2, 10), Err(TimerError::Unknown(2)));
        assert_eq!(timers.cancel(2), Err(TimerError::Unknown(2)));
        assert_eq!(timers.remaining(2), Err(TimerError::Unknown(2)));
        assert_eq!(timers.delete(2), Err(TimerError::Unknown(2)));
    }

    #[test]
    fn cancel_idempotent() {
        let (clock, mut timers) = setup();

        let i = timers.set_timer_auto(100);
        timers.cancel(i).unwrap();
        timers.cancel(i).unwrap();

        assert_eq!(timers.is_scheduled(i), Ok(false));
        assert_eq!(timers.remaining(i), Ok(None));
        assert_eq!(timers.next_deadline(), None);

        clock.set(200);
        assert_eq!(timers.poll(), None);
    }

    #[test]
    fn reschedule_overwrites() {
        let (clock, mut timers) = setup();

        let i = timers.allocate_next();
        timers.schedule(i, 100).unwrap();
        clock.set(50);
        timers.schedule(i, 100).unwrap();
        assert_eq!(timers.remaining(i), Ok(Some(100)));

        let fired = run(&clock, &mut timers);
        assert_eq!(fired, vec![(i, 150)]);
    }

    #[test]
    fn same_deadline_fires_in_arm_order() {
        let (clock, mut timers) = setup();

        timers.preallocate(3);
        timers.schedule(2, 10).unwrap();
        timers.schedule(0, 10).unwrap();
        timers.schedule(1, 5).unwrap();

        let fired = run(&clock, &mut timers);
        assert_eq!(fired, vec![(1, 5), (2, 10), (0, 10)]);
    }

    std::thread_local! {
        static DESTROYED: RefCell<Vec<u32>> = RefCell::new(Vec::new());
    }

    fn record(c: u32) {
        DESTROYED.with(|d| d.borrow_mut().push(c));
    }

    #[test]
    fn context_and_destructor() {
        let (_clock, mut timers) = setup();
        DESTROYED.with(|d| d.borrow_mut().clear());

        let a = timers.allocate_next();
        assert_eq!(timers.set_context(a, 11), Ok(None));
        assert_eq!(timers.context(a), Ok(Some(&11)));
        timers.set_destructor(a, record).unwrap();

        // Delete runs the destructor even when not scheduled
        timers.delete(a).unwrap();
        DESTROYED.with(|d| assert_eq!(*d.borrow(), vec![11]));

        // Drop only cleans up timers that are still scheduled
        let b = timers.set_timer_auto(10);
        timers.set_context(b, 22).unwrap();
        timers.set_destructor(b, record).unwrap();

        let c = timers.allocate_next();
        timers.set_context(c, 33).unwrap();
        timers.set_destructor(c, record).unwrap();

        drop(timers);
        DESTROYED.with(|d| assert_eq!(*d.borrow(), vec![11, 22]));
    }
}
