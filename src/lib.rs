//! Duty-cycled MAC protocols for wireless sensor network simulation
//!
//! Each MAC is a single-threaded state machine driven by two channels:
//! radio / routing events pushed in via [`mac::Mac`] methods, and timer
//! expiries collected by [`mac::Mac::tick`] once the host clock passes
//! [`mac::Mac::next_deadline`].

#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod clock;

pub mod timers;

pub mod error;

pub mod packet;

pub mod radio;

pub mod routing;

pub mod base;

pub mod mac;

#[cfg(any(test, feature = "mocks"))]
pub mod sim;

pub mod prelude;

/// Timestamps are 64-bit ticks of a 32 KiHz clock
pub type Ts = u64;

/// Clock ticks per second
pub const TICKS_PER_SECOND: Ts = 32768;

/// Convert a duration in seconds to (truncated) clock ticks
pub fn seconds_to_ticks(s: f64) -> Ts {
    if s <= 0.0 {
        return 0;
    }
    (s * TICKS_PER_SECOND as f64) as Ts
}

/// Convert clock ticks to seconds
pub fn ticks_to_seconds(t: Ts) -> f64 {
    t as f64 / TICKS_PER_SECOND as f64
}
