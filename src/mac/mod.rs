//! Medium Access Control (MAC) layer module.
//! Contains MAC traits and implementations.

use crate::{Ts, packet::{NodeId, Packet}, radio::RadioEvent, timers::TimerId};

pub mod config;
pub use config::*;

pub mod core;
pub use self::core::{Core, MacStats};

pub mod sift;

pub mod ca;

pub mod csma;
pub use csma::CsmaMode;

pub mod smac;
pub use smac::SmacMode;

pub mod lmac;
pub use lmac::LmacMode;

pub mod gmac;
pub use gmac::GmacMode;

/// Requests from the routing layer other than packet transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingRequest {
    /// Next packet should be preferred over reception
    PreferTx,
    /// Hold the radio awake until [`RoutingRequest::ForceEnd`]
    ForceAwake,
    /// Release a force awake
    ForceEnd,
}

/// Generic MAC trait, implemented by all MACs
pub trait Mac {
    type Error;

    /// Node this MAC belongs to
    fn id(&self) -> NodeId;

    /// Hand a packet over for transmission. A packet arriving while
    /// another is in flight is dropped and counted, not queued.
    fn transmit(&mut self, packet: Packet) -> Result<(), Self::Error>;

    /// Handle a radio notification
    fn handle_radio(&mut self, event: RadioEvent) -> Result<(), Self::Error>;

    /// Handle a routing layer request
    fn handle_routing(&mut self, request: RoutingRequest) -> Result<(), Self::Error>;

    /// MAC header length in bytes
    fn header_length(&self) -> usize;

    /// Whether routing asked for the next packet to be preferred
    fn tx_preferred(&self) -> bool;

    /// Earliest pending timer deadline
    fn next_deadline(&self) -> Option<Ts>;

    /// Dispatch every timer expired at the current time
    fn tick(&mut self) -> Result<(), Self::Error>;

    /// Fetch MAC statistics
    fn stats(&self) -> MacStats;
}

/// Protocol hooks, implemented once per MAC mode on [`Core`]
pub trait Protocol<E> {
    /// Accept (or drop) a packet from routing
    fn tx_packet(&mut self, packet: Packet) -> Result<(), crate::error::MacError<E>>;

    /// Complete frame received, header length already stripped
    fn rx_frame(&mut self, packet: Packet) -> Result<(), crate::error::MacError<E>>;

    /// MAC header received ahead of the frame body
    fn rx_header(&mut self, _packet: &Packet) -> Result<(), crate::error::MacError<E>> {
        Ok(())
    }

    fn rx_started(&mut self) -> Result<(), crate::error::MacError<E>>;

    fn rx_failed(&mut self) -> Result<(), crate::error::MacError<E>>;

    /// Frame handed to the radio is on air
    fn transmit_done(&mut self) -> Result<(), crate::error::MacError<E>>;

    /// Protocol timer expiry
    fn timeout(&mut self, which: TimerId) -> Result<(), crate::error::MacError<E>>;

    /// Force awake released
    fn end_force(&mut self) -> Result<(), crate::error::MacError<E>> {
        Ok(())
    }
}
