//! Repeating timers
//!
//! Same index contract as [`Timers`], but each timer re-arms itself
//! `period` ticks after every expiry until its repeat count runs out.

use alloc::collections::BTreeMap;

use log::trace;

use crate::{Ts, clock::Clock, error::TimerError};
use super::{Expired, TimerId, Timers};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Repeat {
    period: Ts,
    total: u32,
    remaining: u32,
}

/// Repeating timer service, generic over a clock (T) and context type (X)
pub struct RepeatTimers<T, X = ()> {
    inner: Timers<T, X>,
    repeats: BTreeMap<TimerId, Repeat>,
}

impl <T: Clock, X> RepeatTimers<T, X> {
    pub fn new(clock: T) -> Self {
        Self {
            inner: Timers::new(clock),
            repeats: BTreeMap::new(),
        }
    }

    pub fn now(&self) -> Ts {
        self.inner.now()
    }

    pub fn preallocate(&mut self, count: TimerId) {
        self.inner.preallocate(count)
    }

    pub fn allocate(&mut self, index: TimerId) -> Result<TimerId, TimerError> {
        self.inner.allocate(index)
    }

    pub fn allocate_next(&mut self) -> TimerId {
        self.inner.allocate_next()
    }

    /// Arm an allocated timer to fire every `period` ticks, `repeats` times.
    ///
    /// A repeat count of zero fires once.
    pub fn schedule(&mut self, index: TimerId, period: Ts, repeats: u32) -> Result<(), TimerError> {
        self.inner.schedule(index, period)?;
        self.repeats.insert(index, Repeat{ period, total: repeats, remaining: repeats });
        Ok(())
    }

    /// Arm a repeating timer, allocating the index first if required
    pub fn set_repeat_timer(&mut self, index: TimerId, period: Ts, repeats: u32) {
        if !self.inner.is_allocated(index) {
            let _ = self.inner.allocate(index);
        }
        let _ = self.schedule(index, period, repeats);
    }

    /// Allocate the lowest free index and arm it as a repeating timer
    pub fn set_repeat_timer_auto(&mut self, period: Ts, repeats: u32) -> TimerId {
        let index = self.inner.allocate_next();
        let _ = self.schedule(index, period, repeats);
        index
    }

    pub fn cancel(&mut self, index: TimerId) -> Result<(), TimerError> {
        self.inner.cancel(index)
    }

    pub fn remaining(&self, index: TimerId) -> Result<Option<Ts>, TimerError> {
        self.inner.remaining(index)
    }

    /// Number of expiries left for a timer, `None` if it was never armed
    pub fn repeats_remaining(&self, index: TimerId) -> Result<Option<u32>, TimerError> {
        if !self.inner.is_allocated(index) {
            return Err(TimerError::Unknown(index));
        }
        Ok(self.repeats.get(&index).map(|r| r.remaining))
    }

    /// Restore the full repeat count and re-arm one period from now
    pub fn reset(&mut self, index: TimerId) -> Result<(), TimerError> {
        if !self.inner.is_allocated(index) {
            return Err(TimerError::Unknown(index));
        }
        let r = match self.repeats.get_mut(&index) {
            Some(r) => r,
            // Never armed, nothing to restore
            None => return Ok(()),
        };
        r.remaining = r.total;
        let period = r.period;

        trace!("Repeat timer {} reset ({} repeats)", index, r.total);

        self.inner.schedule(index, period)
    }

    /// Reset every armed timer
    pub fn reset_all(&mut self) {
        let indexes: alloc::vec::Vec<TimerId> = self.repeats.keys().copied().collect();
        for i in indexes {
            let _ = self.reset(i);
        }
    }

    pub fn set_context(&mut self, index: TimerId, context: X) -> Result<Option<X>, TimerError> {
        self.inner.set_context(index, context)
    }

    pub fn context(&self, index: TimerId) -> Result<Option<&X>, TimerError> {
        self.inner.context(index)
    }

    pub fn set_destructor(&mut self, index: TimerId, destructor: fn(X)) -> Result<(), TimerError> {
        self.inner.set_destructor(index, destructor)
    }

    pub fn delete(&mut self, index: TimerId) -> Result<(), TimerError> {
        self.inner.delete(index)?;
        self.repeats.remove(&index);
        Ok(())
    }

    pub fn next_deadline(&self) -> Option<Ts> {
        self.inner.next_deadline()
    }

    /// Return the earliest expired timer, re-arming it first while
    /// repeats remain
    pub fn poll(&mut self) -> Option<Expired> {
        let e = self.inner.poll()?;

        if let Some(r) = self.repeats.get_mut(&e.index) {
            r.remaining = r.remaining.saturating_sub(1);
            if r.remaining > 0 {
                let period = r.period;
                // Slot exists, it just fired
                let _ = self.inner.schedule(e.index, period);
            }
        }

        Some(e)
    }
}
