//! WSN MAC crate prelude

pub use crate::{Ts, TICKS_PER_SECOND};

pub use crate::mac::{Mac, Protocol, RoutingRequest, Core, MacStats};
pub use crate::mac::{CoreConfig, CsmaConfig, SmacConfig, LmacConfig, GmacConfig};
pub use crate::mac::{CsmaMode, SmacMode, LmacMode, GmacMode};

pub use crate::radio::{Radio, RadioEvent, RadioMode};
pub use crate::routing::{Routing, FailReason};
pub use crate::packet::{Packet, Address, Layer, PacketKind, NodeId};

pub use crate::base::LplConfig;
pub use crate::clock::Clock;
pub use crate::timers::{Timers, RepeatTimers, TimerId};

pub use crate::error::{MacError, TimerError, DecodeError};
