use core::fmt;

use crate::timers::TimerId;

/// Timer service errors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimerError {
    /// Timer index was never allocated (or has been deleted)
    Unknown(TimerId),
    /// Timer index is already allocated
    Duplicate(TimerId),
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::Unknown(i) => write!(f, "unknown timer index {}", i),
            TimerError::Duplicate(i) => write!(f, "timer index {} already allocated", i),
        }
    }
}

/// MAC header decoding errors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeError {
    /// Header shorter than the protocol header length
    NotEnoughBytes,
    /// Frame carries no MAC layer data
    MissingHeader,
    /// Unrecognised frame kind
    UnknownKind(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::NotEnoughBytes => write!(f, "not enough bytes for header"),
            DecodeError::MissingHeader => write!(f, "frame has no MAC header"),
            DecodeError::UnknownKind(k) => write!(f, "unknown frame kind {}", k),
        }
    }
}

/// MAC errors, generic over the underlying radio error
///
/// These are invariant faults: the simulation run should stop when one is
/// returned. Expected network conditions (no ACK, lost contention) are
/// reported through [`crate::routing::Routing`] instead.
#[derive(Debug, Clone, PartialEq)]
pub enum MacError<E> {
    /// Wrapper for unhandled / underlying radio errors
    Radio(E),

    /// Timer service misuse
    Timer(TimerError),

    /// Malformed MAC header
    Decode(DecodeError),

    /// State machine reached an invalid state
    InvalidState(&'static str),
}

impl <E> From<TimerError> for MacError<E> {
    fn from(e: TimerError) -> Self {
        MacError::Timer(e)
    }
}

impl <E> From<DecodeError> for MacError<E> {
    fn from(e: DecodeError) -> Self {
        MacError::Decode(e)
    }
}

impl <E: fmt::Debug> fmt::Display for MacError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacError::Radio(e) => write!(f, "radio error: {:?}", e),
            MacError::Timer(e) => write!(f, "timer error: {}", e),
            MacError::Decode(e) => write!(f, "decode error: {}", e),
            MacError::InvalidState(s) => write!(f, "invalid state: {}", s),
        }
    }
}

#[cfg(feature = "std")]
impl <E: fmt::Debug> std::error::Error for MacError<E> {}
