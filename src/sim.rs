//! Multi-node simulation over a shared radio medium
//!
//! [`Sim`] runs a set of MACs in virtual time on a single collision
//! domain: every node hears every other node. Medium events are kept in
//! a heap ordered by time then insertion order, and MAC deadlines are
//! polled in node order, so runs with the same seeds replay exactly.
//!
//! Reception model:
//! - a listening node locks onto a frame once its preamble is on air
//! - a second frame starting during the lock corrupts the reception
//! - leaving receive mode during the lock corrupts the reception
//! - RSSI reads busy while any other node is transmitting

use std::{
    boxed::Box,
    cell::RefCell,
    cmp::Ordering,
    collections::{BTreeMap, BinaryHeap},
    rc::Rc,
    vec::Vec,
};

use log::{debug, trace};

use crate::{Ts, seconds_to_ticks};
use crate::clock::{Clock, mock::SimClock};
use crate::error::MacError;
use crate::mac::{Core, CoreConfig, CsmaConfig, GmacConfig, LmacConfig, Mac, RoutingRequest, SmacConfig};
use crate::packet::{NodeId, Packet};
use crate::radio::{Radio, RadioEvent, RadioMode};
use crate::routing::mock::MockRouting;

pub type SimError = MacError<()>;

/// Boxed MAC as driven by the simulation
pub type SimMac = Box<dyn Mac<Error = SimError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediumEvent {
    /// Preamble on air, listeners lock on
    Start(u64),
    /// Frame complete
    End(u64),
}

#[derive(Debug)]
struct Scheduled {
    at: Ts,
    seq: u64,
    event: MediumEvent,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the BinaryHeap pops the earliest event first
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Reception {
    tx: u64,
    corrupt: bool,
}

#[derive(Debug)]
struct NodeRadio {
    mode: RadioMode,
    receiving: Option<Reception>,
}

#[derive(Debug)]
struct Transmission {
    from: NodeId,
    packet: Packet,
}

/// Shared channel state
#[derive(Debug, Default)]
struct Medium {
    now: Ts,
    seq: u64,
    next_tx: u64,
    queue: BinaryHeap<Scheduled>,
    radios: Vec<NodeRadio>,
    active: BTreeMap<u64, Transmission>,
}

impl Medium {
    fn schedule(&mut self, delay: Ts, event: MediumEvent) {
        self.seq += 1;
        self.queue.push(Scheduled{ at: self.now + delay, seq: self.seq, event });
    }

    fn next_event(&self) -> Option<Ts> {
        self.queue.peek().map(|s| s.at)
    }

    fn pop_due(&mut self, t: Ts) -> Option<MediumEvent> {
        let due = self.queue.peek().map(|s| s.at <= t).unwrap_or(false);
        if due {
            self.queue.pop().map(|s| s.event)
        } else {
            None
        }
    }

    fn set_mode(&mut self, id: NodeId, mode: RadioMode) {
        let r = match self.radios.get_mut(id as usize) {
            Some(r) => r,
            None => return,
        };

        if mode != RadioMode::Listen {
            if let Some(rx) = r.receiving.as_mut() {
                rx.corrupt = true;
            }
        }
        r.mode = mode;
    }

    fn transmit(&mut self, from: NodeId, packet: Packet) {
        self.set_mode(from, RadioMode::Transmit);

        let airtime = seconds_to_ticks(packet.airtime()).max(1);
        let preamble = seconds_to_ticks(packet.preamble_time).clamp(1, airtime);

        let tx = self.next_tx;
        self.next_tx += 1;

        trace!("Medium: node {} transmit {} ({} ticks)", from, tx, airtime);

        self.active.insert(tx, Transmission{ from, packet });
        self.schedule(preamble, MediumEvent::Start(tx));
        self.schedule(airtime, MediumEvent::End(tx));
    }

    /// Channel energy seen by a node
    fn rssi(&self, id: NodeId) -> f64 {
        let on_air = self.active.values().any(|t| t.from != id);
        let carrier = self.radios.iter().enumerate()
            .any(|(n, r)| n as NodeId != id && r.mode == RadioMode::Transmit);

        if on_air || carrier { 1.0 } else { 0.0 }
    }

    fn start(&mut self, tx: u64) -> Vec<(NodeId, RadioEvent)> {
        let mut events = Vec::new();
        let from = match self.active.get(&tx) {
            Some(t) => t.from,
            None => return events,
        };

        for n in 0..self.radios.len() {
            let id = n as NodeId;
            if id == from {
                continue;
            }

            let interfered = self.active.iter().any(|(k, t)| *k != tx && t.from != id);
            let r = &mut self.radios[n];

            if let Some(rx) = r.receiving.as_mut() {
                rx.corrupt = true;
            } else if r.mode == RadioMode::Listen {
                r.receiving = Some(Reception{ tx, corrupt: interfered });
                events.push((id, RadioEvent::ReceptionStarted));
            }
        }

        events
    }

    fn end(&mut self, tx: u64) -> Vec<(NodeId, RadioEvent)> {
        let mut events = Vec::new();
        let t = match self.active.remove(&tx) {
            Some(t) => t,
            None => return events,
        };

        events.push((t.from, RadioEvent::TransmitComplete));

        for (n, r) in self.radios.iter_mut().enumerate() {
            let id = n as NodeId;
            let rx = match r.receiving {
                Some(rx) if rx.tx == tx && id != t.from => rx,
                _ => continue,
            };
            r.receiving = None;

            if rx.corrupt || r.mode != RadioMode::Listen {
                events.push((id, RadioEvent::ReceptionFailed));
            } else {
                events.push((id, RadioEvent::HeaderReceived(t.packet.clone())));
                events.push((id, RadioEvent::FrameReceived(t.packet.clone())));
            }
        }

        events
    }
}

/// Radio handle attached to the shared medium
#[derive(Debug, Clone)]
pub struct SimRadio {
    id: NodeId,
    medium: Rc<RefCell<Medium>>,
}

impl Radio for SimRadio {
    type Error = ();

    fn set_listen(&mut self) -> Result<(), Self::Error> {
        self.medium.borrow_mut().set_mode(self.id, RadioMode::Listen);
        Ok(())
    }

    fn set_transmit(&mut self) -> Result<(), Self::Error> {
        self.medium.borrow_mut().set_mode(self.id, RadioMode::Transmit);
        Ok(())
    }

    fn set_sleep(&mut self) -> Result<(), Self::Error> {
        self.medium.borrow_mut().set_mode(self.id, RadioMode::Sleep);
        Ok(())
    }

    fn start_transmit(&mut self, packet: Packet) -> Result<(), Self::Error> {
        self.medium.borrow_mut().transmit(self.id, packet);
        Ok(())
    }
}

/// MAC protocol and its configuration, for building simulated nodes
#[derive(Debug, Clone, PartialEq)]
pub enum MacKind {
    Csma(CsmaConfig),
    Smac(SmacConfig),
    Lmac(LmacConfig),
    Gmac(GmacConfig),
}

impl MacKind {
    pub fn name(&self) -> &'static str {
        match self {
            MacKind::Csma(_) => "csma",
            MacKind::Smac(_) => "smac",
            MacKind::Lmac(_) => "lmac",
            MacKind::Gmac(_) => "gmac",
        }
    }

    pub fn build(&self, id: NodeId, radio: SimRadio, routing: MockRouting, clock: SimClock, core: CoreConfig) -> Result<SimMac, SimError> {
        let mac = match self {
            MacKind::Csma(c) => Box::new(Core::new_csma(id, radio, routing, clock, core, c.clone())?) as SimMac,
            MacKind::Smac(c) => Box::new(Core::new_smac(id, radio, routing, clock, core, c.clone())?) as SimMac,
            MacKind::Lmac(c) => Box::new(Core::new_lmac(id, radio, routing, clock, core, c.clone())?) as SimMac,
            MacKind::Gmac(c) => Box::new(Core::new_gmac(id, radio, routing, clock, core, c.clone())?) as SimMac,
        };
        Ok(mac)
    }
}

struct SimNode {
    mac: SimMac,
    routing: MockRouting,
}

/// Simulation of MAC nodes sharing one channel
pub struct Sim {
    clock: SimClock,
    medium: Rc<RefCell<Medium>>,
    nodes: Vec<SimNode>,
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl Sim {
    pub fn new() -> Self {
        Self {
            clock: SimClock::new(),
            medium: Rc::new(RefCell::new(Medium::default())),
            nodes: Vec::new(),
        }
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn now(&self) -> Ts {
        self.clock.now()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node, `build` receives the new node id and its attachments
    pub fn add_node<F>(&mut self, build: F) -> Result<NodeId, SimError>
    where
        F: FnOnce(NodeId, SimRadio, MockRouting, SimClock) -> Result<SimMac, SimError>,
    {
        let id = self.nodes.len() as NodeId;
        self.medium.borrow_mut().radios.push(NodeRadio{ mode: RadioMode::Sleep, receiving: None });

        let radio = SimRadio{ id, medium: self.medium.clone() };
        let routing = MockRouting::new();

        let mac = match build(id, radio, routing.clone(), self.clock.clone()) {
            Ok(m) => m,
            Err(e) => {
                self.medium.borrow_mut().radios.pop();
                return Err(e);
            }
        };

        debug!("Sim: added node {}", id);
        self.nodes.push(SimNode{ mac, routing });

        Ok(id)
    }

    /// Add a node running the provided protocol
    pub fn add(&mut self, kind: &MacKind, core: CoreConfig) -> Result<NodeId, SimError> {
        self.add_node(|id, radio, routing, clock| kind.build(id, radio, routing, clock, core))
    }

    pub fn mac(&self, id: NodeId) -> Option<&dyn Mac<Error = SimError>> {
        self.nodes.get(id as usize).map(|n| n.mac.as_ref())
    }

    pub fn routing(&self, id: NodeId) -> Option<&MockRouting> {
        self.nodes.get(id as usize).map(|n| &n.routing)
    }

    /// Hand a packet to a node's MAC
    pub fn transmit(&mut self, id: NodeId, packet: Packet) -> Result<(), SimError> {
        self.node(id)?.mac.transmit(packet)
    }

    /// Pass a routing request to a node's MAC
    pub fn request(&mut self, id: NodeId, request: RoutingRequest) -> Result<(), SimError> {
        self.node(id)?.mac.handle_routing(request)
    }

    fn node(&mut self, id: NodeId) -> Result<&mut SimNode, SimError> {
        self.nodes.get_mut(id as usize).ok_or(MacError::InvalidState("unknown node"))
    }

    /// Time of the next medium event or MAC deadline
    pub fn next_event(&self) -> Option<Ts> {
        let medium = self.medium.borrow().next_event();
        let deadline = self.nodes.iter().filter_map(|n| n.mac.next_deadline()).min();

        match (medium, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Advance to the next event and process everything due then.
    ///
    /// Returns false once nothing is left to run.
    pub fn step(&mut self) -> Result<bool, SimError> {
        let t = match self.next_event() {
            Some(t) => t,
            None => return Ok(false),
        };

        self.clock.set(t);
        self.medium.borrow_mut().now = t;

        // Deliveries are collected first, MACs call back into the medium
        loop {
            let deliveries = {
                let mut m = self.medium.borrow_mut();
                match m.pop_due(t) {
                    Some(MediumEvent::Start(tx)) => m.start(tx),
                    Some(MediumEvent::End(tx)) => m.end(tx),
                    None => break,
                }
            };

            for (id, event) in deliveries {
                trace!("Sim: t={} node {} {:?}", t, id, event);
                self.nodes[id as usize].mac.handle_radio(event)?;
            }
        }

        for n in 0..self.nodes.len() {
            let due = self.nodes[n].mac.next_deadline().map(|d| d <= t).unwrap_or(false);
            if !due {
                continue;
            }

            let rssi = self.medium.borrow().rssi(n as NodeId);
            let node = &mut self.nodes[n];
            node.mac.handle_radio(RadioEvent::Rssi(rssi))?;
            node.mac.tick()?;
        }

        Ok(true)
    }

    /// Run every event up to and including `end`, then move the clock to `end`
    pub fn run_until(&mut self, end: Ts) -> Result<(), SimError> {
        while let Some(t) = self.next_event() {
            if t > end {
                break;
            }
            self.step()?;
        }

        self.clock.set(end);
        self.medium.borrow_mut().now = end;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::vec;

    use crate::TICKS_PER_SECOND;
    use crate::mac::MacStats;
    use crate::packet::Address;

    fn setup(kind: MacKind, nodes: usize) -> Sim {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let mut sim = Sim::new();
        for _ in 0..nodes {
            sim.add(&kind, CoreConfig::default()).unwrap();
        }
        sim
    }

    fn listening_medium(nodes: usize) -> Medium {
        let mut m = Medium::default();
        for _ in 0..nodes {
            m.radios.push(NodeRadio{ mode: RadioMode::Listen, receiving: None });
        }
        m
    }

    fn drain(m: &mut Medium) -> Vec<(NodeId, RadioEvent)> {
        let mut events = Vec::new();
        while let Some(t) = m.next_event() {
            m.now = t;
            while let Some(e) = m.pop_due(t) {
                events.extend(match e {
                    MediumEvent::Start(tx) => m.start(tx),
                    MediumEvent::End(tx) => m.end(tx),
                });
            }
        }
        events
    }

    #[test]
    fn clean_frame_delivered() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let mut m = listening_medium(2);
        let p = Packet::data(0, Address::Node(1), &[1, 2, 3]);

        m.transmit(0, p.clone());
        assert_eq!(m.rssi(1), 1.0);
        assert_eq!(m.rssi(0), 0.0);

        let events = drain(&mut m);
        assert_eq!(events, vec![
            (1, RadioEvent::ReceptionStarted),
            (0, RadioEvent::TransmitComplete),
            (1, RadioEvent::HeaderReceived(p.clone())),
            (1, RadioEvent::FrameReceived(p)),
        ]);
    }

    #[test]
    fn overlapping_frames_collide() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let mut m = listening_medium(3);
        m.transmit(0, Packet::data(0, Address::Broadcast, &[0; 10]));
        m.transmit(1, Packet::data(1, Address::Broadcast, &[0; 10]));

        let events = drain(&mut m);
        let failed = events.iter().filter(|(id, e)| *id == 2 && *e == RadioEvent::ReceptionFailed).count();
        let received = events.iter().filter(|(_, e)| matches!(e, RadioEvent::FrameReceived(_))).count();

        assert_eq!(failed, 1);
        assert_eq!(received, 0);
    }

    #[test]
    fn sleeping_during_reception_fails() {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());

        let mut m = listening_medium(2);
        m.transmit(0, Packet::data(0, Address::Node(1), &[0; 10]));

        let t = m.next_event().unwrap();
        m.now = t;
        let start = m.pop_due(t).unwrap();
        assert!(matches!(start, MediumEvent::Start(_)));
        if let MediumEvent::Start(tx) = start {
            m.start(tx);
        }

        m.set_mode(1, RadioMode::Sleep);
        let events = drain(&mut m);
        assert_eq!(events, vec![
            (0, RadioEvent::TransmitComplete),
            (1, RadioEvent::ReceptionFailed),
        ]);
    }

    #[test]
    fn csma_unicast_across_mesh() {
        let mut sim = setup(MacKind::Csma(CsmaConfig::default()), 3);

        sim.transmit(1, Packet::data(1, Address::Node(2), &[1, 2, 3])).unwrap();
        sim.run_until(TICKS_PER_SECOND).unwrap();

        assert_eq!(sim.routing(2).unwrap().received(), 1);
        assert_eq!(sim.routing(1).unwrap().delivered(), 1);
        assert_eq!(sim.routing(0).unwrap().received(), 0);

        assert_eq!(sim.mac(1).unwrap().stats().tx, 1);
        assert_eq!(sim.mac(2).unwrap().stats().rx, 1);
        assert!(sim.mac(0).unwrap().stats().time_rx_overhear > 0.0);
        assert_eq!(sim.now(), TICKS_PER_SECOND);
    }

    #[test]
    fn csma_broadcast_reaches_all() {
        let mut sim = setup(MacKind::Csma(CsmaConfig::default()), 3);

        sim.transmit(0, Packet::data(0, Address::Broadcast, &[7; 8])).unwrap();
        sim.run_until(TICKS_PER_SECOND).unwrap();

        assert_eq!(sim.routing(1).unwrap().received(), 1);
        assert_eq!(sim.routing(2).unwrap().received(), 1);
        assert_eq!(sim.routing(0).unwrap().delivered(), 1);
    }

    #[test]
    fn runs_are_deterministic() {
        let run = || {
            let mut sim = setup(MacKind::Csma(CsmaConfig::default()), 4);
            for n in 1..4 {
                sim.transmit(n, Packet::data(n, Address::Node(0), &[n as u8; 20])).unwrap();
            }
            sim.run_until(2 * TICKS_PER_SECOND).unwrap();
            (0..4).map(|n| sim.mac(n).unwrap().stats()).collect::<Vec<MacStats>>()
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn unknown_node_rejected() {
        let mut sim = setup(MacKind::Csma(CsmaConfig::default()), 1);

        assert!(sim.transmit(3, Packet::data(3, Address::Broadcast, &[])).is_err());
        assert!(sim.mac(3).is_none());
    }

    #[test]
    fn failed_build_leaves_no_node() {
        let mut sim = setup(MacKind::Csma(CsmaConfig::default()), 1);

        let bad = MacKind::Lmac(LmacConfig{ max_slot: 0, ..Default::default() });
        assert!(sim.add(&bad, CoreConfig::default()).is_err());
        assert_eq!(sim.len(), 1);
        assert_eq!(sim.medium.borrow().radios.len(), 1);
    }

    #[test]
    fn smac_synchronises_and_delivers() {
        let mut sim = setup(MacKind::Smac(SmacConfig::default()), 2);

        sim.run_until(12 * TICKS_PER_SECOND).unwrap();
        sim.transmit(0, Packet::data(0, Address::Node(1), &[1; 10])).unwrap();
        sim.run_until(16 * TICKS_PER_SECOND).unwrap();

        assert_eq!(sim.routing(1).unwrap().received(), 1);
        assert_eq!(sim.routing(0).unwrap().delivered(), 1);
    }

    #[test]
    fn lmac_nodes_reach_sink() {
        let mut sim = setup(MacKind::Lmac(LmacConfig{ max_slot: 8, ..Default::default() }), 3);

        sim.run_until(10 * TICKS_PER_SECOND).unwrap();
        sim.transmit(1, Packet::data(1, Address::Node(0), &[1; 10])).unwrap();
        sim.transmit(2, Packet::data(2, Address::Node(0), &[2; 10])).unwrap();
        sim.run_until(12 * TICKS_PER_SECOND).unwrap();

        assert_eq!(sim.routing(0).unwrap().received(), 2);
        assert_eq!(sim.routing(1).unwrap().delivered(), 1);
        assert_eq!(sim.routing(2).unwrap().delivered(), 1);
    }

    #[test]
    fn gmac_unicast_and_broadcast() {
        let mut sim = setup(MacKind::Gmac(GmacConfig::default()), 3);

        sim.run_until(TICKS_PER_SECOND).unwrap();
        sim.transmit(1, Packet::data(1, Address::Node(0), &[1; 10])).unwrap();
        sim.run_until(2 * TICKS_PER_SECOND).unwrap();

        assert_eq!(sim.routing(0).unwrap().received(), 1);
        assert_eq!(sim.routing(1).unwrap().delivered(), 1);

        sim.transmit(0, Packet::data(0, Address::Broadcast, &[0; 4])).unwrap();
        sim.run_until(3 * TICKS_PER_SECOND).unwrap();

        assert_eq!(sim.routing(1).unwrap().received(), 1);
        assert_eq!(sim.routing(2).unwrap().received(), 1);
    }
}
