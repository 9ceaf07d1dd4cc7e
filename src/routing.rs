//! Routing interface
//!
//! Upcalls from a MAC to the routing layer above it.

use strum::IntoStaticStr;

use crate::packet::{Packet, PacketKind};

/// Reason a packet could not be delivered to its next hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum FailReason {
    /// The next hop never acknowledged
    NoAck,
    /// Another sender won the channel
    ContentionLost,
    /// The retry budget ran out
    RetryExhausted,
    /// A retry was skipped so the caller can pick another route
    RetrySkipped,
}

impl FailReason {
    /// Packet kind tag matching this outcome
    pub fn kind(&self) -> PacketKind {
        match self {
            FailReason::NoAck => PacketKind::TxNoAck,
            FailReason::ContentionLost => PacketKind::TxContendLose,
            FailReason::RetryExhausted => PacketKind::TxFailed,
            FailReason::RetrySkipped => PacketKind::TxRetrySkipped,
        }
    }
}

/// Routing layer callbacks invoked by a MAC
pub trait Routing {
    /// Packet received for this node (unicast or broadcast)
    fn receive(&mut self, packet: Packet);

    /// Outbound packet reached its next hop
    fn packet_delivered(&mut self, packet: Packet);

    /// Outbound packet was given up on
    fn packet_failed(&mut self, packet: Packet, reason: FailReason);

    /// Response to a force awake request
    fn force_granted(&mut self, _granted: bool) {}
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use std::{cell::RefCell, rc::Rc, vec::Vec};

    use crate::packet::Packet;
    use super::FailReason;

    /// Upcalls recorded by [`MockRouting`]
    #[derive(Debug, Clone, PartialEq)]
    pub enum Upcall {
        Received(Packet),
        Delivered(Packet),
        Failed(Packet, FailReason),
        ForceGranted(bool),
    }

    /// Mock routing layer recording upcalls, clones share state
    #[derive(Debug, Clone, Default)]
    pub struct MockRouting(Rc<RefCell<Vec<Upcall>>>);

    impl MockRouting {
        pub fn new() -> Self {
            Self::default()
        }

        /// Drain the recorded upcalls
        pub fn take(&self) -> Vec<Upcall> {
            core::mem::take(&mut *self.0.borrow_mut())
        }

        pub fn received(&self) -> usize {
            self.count(|u| matches!(u, Upcall::Received(_)))
        }

        pub fn delivered(&self) -> usize {
            self.count(|u| matches!(u, Upcall::Delivered(_)))
        }

        pub fn failed(&self) -> usize {
            self.count(|u| matches!(u, Upcall::Failed(..)))
        }

        fn count(&self, f: impl Fn(&Upcall) -> bool) -> usize {
            self.0.borrow().iter().filter(|u| f(u)).count()
        }
    }

    impl super::Routing for MockRouting {
        fn receive(&mut self, packet: Packet) {
            self.0.borrow_mut().push(Upcall::Received(packet));
        }

        fn packet_delivered(&mut self, packet: Packet) {
            self.0.borrow_mut().push(Upcall::Delivered(packet));
        }

        fn packet_failed(&mut self, packet: Packet, reason: FailReason) {
            self.0.borrow_mut().push(Upcall::Failed(packet, reason));
        }

        fn force_granted(&mut self, granted: bool) {
            self.0.borrow_mut().push(Upcall::ForceGranted(granted));
        }
    }
}
