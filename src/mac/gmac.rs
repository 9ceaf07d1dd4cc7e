//! G-MAC, a receiver scheduled slotted MAC
//!
//! Every node wakes for one slot per cycle of the global slot counter, and
//! the last slot of each cycle is a broadcast slot where every node is
//! awake. A sender contends at the start of its next hop's slot and sends
//! the packet directly; unicast frames are answered with an ACK. With
//! scheduled channel polling (SCP) contention winners hold a carrier until
//! the poll point, so receivers only wake for the end of contention.

use core::convert::TryFrom;

use bytes::Bytes;
use byteorder::{ByteOrder, BigEndian};
use log::{trace, debug, info, warn};
use strum::IntoStaticStr;

use crate::{Ts, TICKS_PER_SECOND, base::RSSI_THRESHOLD, clock::Clock, error::{DecodeError, MacError}};
use crate::packet::{Address, Layer, NodeId, Packet, EXTRA_TRANSMIT_TIME};
use crate::radio::Radio;
use crate::routing::{Routing, FailReason};
use crate::timers::TimerId;

use super::{Core, Protocol, config::*};

pub const TIMER_SLOT: TimerId = 0;
pub const TIMER_CONTENTION: TimerId = 1;
pub const TIMER_MSG: TimerId = 2;
pub const TIMER_ACK: TimerId = 3;
pub const TIMER_POLL: TimerId = 4;

/// Header length in bytes
pub const HEADER_LENGTH: usize = 3;

pub const CLOCK_SKEW_ALLOWANCE: Ts = 2;
pub const CONTEND_TIME: Ts = 100;
pub const ACK_CONTEND_TIME: Ts = 5;

/// Contention slots taken listening before the carrier sense
const PRECONTEND_TIME: Ts = 10;

/// Poll point for contention winners, relative to the slot start
const SEND_POLL_TIME: Ts = CLOCK_SKEW_ALLOWANCE + CONTEND_TIME - 5;

/// Wake point for SCP receivers, relative to the slot start
const RECEIVE_POLL_TIME: Ts = CLOCK_SKEW_ALLOWANCE + CONTEND_TIME - 10;

const ACK_TIMEOUT: Ts = ACK_CONTEND_TIME + 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum GmacKind {
    Notify = 0,
    Data = 1,
    Bcast = 2,
    Ack = 3,
}

impl TryFrom<u8> for GmacKind {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(GmacKind::Notify),
            1 => Ok(GmacKind::Data),
            2 => Ok(GmacKind::Bcast),
            3 => Ok(GmacKind::Ack),
            _ => Err(DecodeError::UnknownKind(v)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GmacHeader {
    pub kind: GmacKind,
    /// Sender position in the wake cycle
    pub slot: u16,
}

impl GmacHeader {
    pub fn new(kind: GmacKind, slot: u16) -> Self {
        Self { kind, slot }
    }

    pub fn encode(&self) -> Bytes {
        let mut b = [0u8; HEADER_LENGTH];
        b[0] = self.kind as u8;
        BigEndian::write_u16(&mut b[1..3], self.slot);
        Bytes::copy_from_slice(&b)
    }

    pub fn decode(b: &[u8]) -> Result<Self, DecodeError> {
        if b.len() < HEADER_LENGTH {
            return Err(DecodeError::NotEnoughBytes);
        }
        Ok(Self {
            kind: GmacKind::try_from(b[0])?,
            slot: BigEndian::read_u16(&b[1..3]),
        })
    }

    pub fn from_packet(p: &Packet) -> Result<Self, DecodeError> {
        let b = p.data_for(Layer::Mac).ok_or(DecodeError::MissingHeader)?;
        Self::decode(b)
    }

    pub fn attach(&self, p: &mut Packet) {
        p.set_data(Layer::Mac, self.encode(), 0);
    }
}

/// MAC data carried on a queued packet when failures are rerouted,
/// tracks whether this node's last attempt with it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RerouteTag {
    pub origin: NodeId,
    pub last_failed: bool,
}

impl RerouteTag {
    const LENGTH: usize = 5;

    pub fn encode(&self) -> Bytes {
        let mut b = [0u8; Self::LENGTH];
        BigEndian::write_u32(&mut b[0..4], self.origin);
        b[4] = self.last_failed as u8;
        Bytes::copy_from_slice(&b)
    }

    pub fn from_packet(p: &Packet) -> Option<Self> {
        let b = p.data_for(Layer::Mac)?;
        if b.len() != Self::LENGTH {
            return None;
        }
        Some(Self {
            origin: BigEndian::read_u32(&b[0..4]),
            last_failed: b[4] != 0,
        })
    }

    pub fn attach(&self, p: &mut Packet) {
        p.set_data(Layer::Mac, self.encode(), 0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum InitState {
    /// No neighbour heard yet
    None,
    /// Counting down to the initial notify
    DoNotify,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum SendState {
    None,
    Notify,
    Data,
    WaitForAck,
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum SlotState {
    None,
    Sleep,
    Send,
    Receive,
    SendReceive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MsgCheck {
    Activity,
    StartSymbol,
}

/// Pick the node predicted to wake soonest, the first listed wins ties
pub fn first_to_wake<F>(nodes: &[NodeId], slots_until_wake: F) -> Option<NodeId>
where
    F: Fn(NodeId) -> Ts,
{
    let mut best: Option<(NodeId, Ts)> = None;

    for n in nodes {
        let slots = slots_until_wake(*n);
        trace!("Node {} wakes in {} slots", n, slots);

        match best {
            Some((_, lowest)) if slots >= lowest => (),
            _ => best = Some((*n, slots)),
        }
    }

    best.map(|(n, _)| n)
}

#[derive(Debug, PartialEq)]
pub struct GmacMode {
    config: GmacConfig,
    slot_time: Ts,

    current_slot: Option<u64>,
    slot_state: SlotState,
    init: InitState,
    send_state: SendState,
    msg_check: MsgCheck,

    /// Slots left before the initial notify
    backoff: Ts,
    retries: u32,
    precontend: bool,
    ack_to: Option<NodeId>,

    tx_msg: Option<Packet>,
    /// Frame held until the poll point
    outgoing: Option<Packet>,
}

impl GmacMode {
    fn new(id: NodeId, config: GmacConfig) -> Self {
        let sink = id == 0;
        Self {
            config,
            slot_time: 0,
            current_slot: None,
            slot_state: SlotState::None,
            init: if sink { InitState::DoNotify } else { InitState::None },
            send_state: SendState::None,
            msg_check: MsgCheck::Activity,
            backoff: if sink { 3 } else { 0 },
            retries: 0,
            precontend: false,
            ack_to: None,
            tx_msg: None,
            outgoing: None,
        }
    }

    pub fn slot_time(&self) -> Ts {
        self.slot_time
    }

    pub fn current_slot(&self) -> Option<u64> {
        self.current_slot
    }

    pub fn slot_state(&self) -> SlotState {
        self.slot_state
    }

    pub fn init_state(&self) -> InitState {
        self.init
    }

    pub fn send_state(&self) -> SendState {
        self.send_state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn pending(&self) -> Option<&Packet> {
        self.tx_msg.as_ref()
    }

    fn cycle(&self) -> u64 {
        self.config.cycle as u64
    }

    /// Position of the current slot in the wake cycle
    fn position(&self) -> u64 {
        self.current_slot.unwrap_or(0) % self.cycle()
    }

    /// Cycle position a node wakes in
    pub fn phase(&self, node: NodeId) -> u64 {
        node as u64 % (self.cycle() - 1)
    }

    pub fn is_broadcast_slot(&self, slot: u64) -> bool {
        slot % self.cycle() == self.cycle() - 1
    }

    /// Slots until the node's wake slot, 0 when it is awake now
    pub fn slots_until_wake(&self, node: NodeId) -> Ts {
        let c = self.cycle();
        (self.phase(node) + c - self.position()) % c
    }

    /// Slot state of `id` in `slot` given the queued packet
    pub fn plan(&self, id: NodeId, slot: u64) -> SlotState {
        let pos = slot % self.cycle();

        let (own, send) = if self.is_broadcast_slot(slot) {
            (true, self.tx_msg.is_some())
        } else {
            let send = match self.tx_msg.as_ref().map(|p| p.local_to) {
                Some(Address::Node(n)) => self.phase(n) == pos,
                _ => false,
            };
            (self.phase(id) == pos, send)
        };

        match (own, send) {
            (true, true) => SlotState::SendReceive,
            (true, false) => SlotState::Receive,
            (false, true) => SlotState::Send,
            (false, false) => SlotState::Sleep,
        }
    }

    fn set_last_failed(&mut self, failed: bool) {
        if let Some(p) = self.tx_msg.as_mut() {
            if let Some(mut tag) = RerouteTag::from_packet(p) {
                tag.last_failed = failed;
                tag.attach(p);
            }
        }
    }

    fn last_failed(&self) -> bool {
        self.tx_msg.as_ref()
            .and_then(RerouteTag::from_packet)
            .map(|t| t.last_failed)
            .unwrap_or(false)
    }
}

impl <R, U, T> Core<R, U, T, GmacMode>
where
    R: Radio,
    U: Routing,
    T: Clock,
{
    /// Create a new G-MAC, node 0 is the sink and announces itself first
    pub fn new_gmac(id: NodeId, radio: R, routing: U, clock: T, core_config: CoreConfig, gmac_config: GmacConfig) -> Result<Self, MacError<R::Error>> {
        if gmac_config.cycle < 2 {
            return Err(MacError::InvalidState("G-MAC cycle needs a wake and a broadcast slot"));
        }

        let mut c = Core::with_mode(id, radio, routing, clock, core_config, HEADER_LENGTH, GmacMode::new(id, gmac_config))?;

        let frames = c.frame_total_time(HEADER_LENGTH + c.mode.config.data_length)
            + c.frame_total_time(HEADER_LENGTH)
            + 2.0 * EXTRA_TRANSMIT_TIME;
        c.mode.slot_time = (frames * TICKS_PER_SECOND as f64) as Ts + CLOCK_SKEW_ALLOWANCE + CONTEND_TIME + ACK_CONTEND_TIME;

        debug!("Node {} G-MAC starting, slot {} ticks", id, c.mode.slot_time);

        c.set_timeout(2, TIMER_SLOT)?;
        c.listen()?;

        Ok(c)
    }

    /// Pick the node among `nodes` that wakes soonest
    pub fn first_to_wake(&self, nodes: &[NodeId]) -> Option<NodeId> {
        first_to_wake(nodes, |n| self.mode.slots_until_wake(n))
    }

    fn fail_pending(&mut self, reason: FailReason) {
        if let Some(p) = self.mode.tx_msg.take() {
            self.tx_failed(p, reason);
        }
    }

    fn contend(&mut self) -> Result<(), MacError<R::Error>> {
        let low = CLOCK_SKEW_ALLOWANCE / 2;
        let high = CONTEND_TIME - PRECONTEND_TIME;

        let mut slots = if self.mode.config.use_sift {
            self.sift_slot(low, high)
        } else {
            self.uniform(low, high)
        };

        let listen_only = !self.mode.config.use_scp && self.mode.slot_state == SlotState::SendReceive;
        if slots <= PRECONTEND_TIME || listen_only {
            self.mode.precontend = false;
            self.listen()?;
        } else {
            self.mode.precontend = true;
            slots -= PRECONTEND_TIME;
        }

        trace!("Node {} contending for {} ticks", self.id, slots);
        self.set_timeout(slots.max(1), TIMER_CONTENTION)
    }

    fn slot_start(&mut self) -> Result<(), MacError<R::Error>> {
        let slot_time = self.mode.slot_time;
        self.set_timeout(slot_time, TIMER_SLOT)?;

        let slot = self.mode.current_slot.map(|s| s + 1).unwrap_or(0);
        self.mode.current_slot = Some(slot);

        if self.id == 0 {
            debug!("==== Slot {} ====", slot);
        }

        match self.mode.init {
            InitState::None => return Ok(()),
            InitState::DoNotify if self.mode.backoff == 0 => {
                info!("Node {} sending notify", self.id);
                self.mode.send_state = SendState::Notify;
                self.contend()?;
                if self.mode.config.use_scp {
                    self.set_timeout(SEND_POLL_TIME, TIMER_POLL)?;
                }
                return Ok(());
            },
            InitState::DoNotify => {
                trace!("Node {} notify in {} slots", self.id, self.mode.backoff);
                self.mode.backoff -= 1;
                return Ok(());
            },
            InitState::Done => (),
        }

        if self.mode.send_state != SendState::None {
            warn!("Node {} slot started in {:?}, resetting", self.id, self.mode.send_state);
            self.mode.send_state = SendState::None;
            self.mode.outgoing = None;
        }

        let mut state = self.mode.plan(self.id, slot);

        let sending = matches!(state, SlotState::Send | SlotState::SendReceive);
        let failed_before = self.mode.retries != 0 || (self.mode.config.reroute_on_fail && self.mode.last_failed());
        if sending && failed_before && self.chance() > self.mode.config.retry_chance {
            debug!("Node {} skipping retry", self.id);
            if self.mode.config.reroute_on_fail {
                self.fail_pending(FailReason::RetrySkipped);
            }
            state = if state == SlotState::Send { SlotState::Sleep } else { SlotState::Receive };
        }

        self.mode.slot_state = state;
        trace!("Node {} slot {} state {:?}", self.id, slot, state);

        match state {
            SlotState::Send | SlotState::SendReceive => {
                if state == SlotState::SendReceive {
                    self.mode.msg_check = MsgCheck::Activity;
                    self.set_timeout(CLOCK_SKEW_ALLOWANCE + CONTEND_TIME, TIMER_MSG)?;
                }
                if self.mode.config.reroute_on_fail {
                    self.mode.set_last_failed(false);
                }
                self.mode.send_state = SendState::Data;
                self.contend()?;
                if self.mode.config.use_scp {
                    self.set_timeout(SEND_POLL_TIME, TIMER_POLL)?;
                }
                Ok(())
            },
            SlotState::Receive => {
                self.mode.msg_check = MsgCheck::Activity;
                self.set_timeout(CLOCK_SKEW_ALLOWANCE + CONTEND_TIME, TIMER_MSG)?;
                if self.mode.config.use_scp {
                    self.set_timeout(RECEIVE_POLL_TIME, TIMER_POLL)?;
                    self.sleep()
                } else {
                    self.listen()
                }
            },
            SlotState::Sleep | SlotState::None => self.sleep(),
        }
    }

    fn contention_timeout(&mut self) -> Result<(), MacError<R::Error>> {
        if self.mode.precontend {
            self.mode.precontend = false;
            self.listen()?;
            return self.set_timeout(PRECONTEND_TIME, TIMER_CONTENTION);
        }

        if self.base.rssi() > RSSI_THRESHOLD && self.mode.send_state != SendState::Ack {
            debug!("Node {} lost contention", self.id);
            self.cancel_timeout(TIMER_POLL)?;

            let unicast = self.mode.tx_msg.as_ref().map(|p| !p.is_broadcast()).unwrap_or(false);
            if self.mode.config.reroute_on_fail && self.mode.send_state == SendState::Data && unicast {
                self.fail_pending(FailReason::ContentionLost);
            }
            self.mode.send_state = SendState::None;

            // Our own receive slot, keep listening for the winner
            if self.mode.slot_state == SlotState::SendReceive {
                return Ok(());
            }
            return self.sleep();
        }

        self.cancel_timeout(TIMER_MSG)?;
        self.transmit_mode()?;

        let slot = self.mode.position() as u16;
        let mut p = match self.mode.send_state {
            SendState::Notify => {
                let mut p = Packet::new(Address::Broadcast);
                self.reg_tx_overhead(&p);
                GmacHeader::new(GmacKind::Notify, slot).attach(&mut p);
                p
            },
            SendState::Data => {
                let mut p = match self.mode.tx_msg.clone() {
                    Some(p) => p,
                    None => return Err(MacError::InvalidState("G-MAC data contention without a packet")),
                };
                let kind = if p.is_broadcast() { GmacKind::Bcast } else { GmacKind::Data };
                self.reg_tx_data(&p);
                debug!("Node {} sending packet to {:?}", self.id, p.local_to);
                GmacHeader::new(kind, slot).attach(&mut p);
                p
            },
            SendState::Ack => {
                let to = match self.mode.ack_to {
                    Some(n) => Address::Node(n),
                    None => return Err(MacError::InvalidState("G-MAC ACK without a recipient")),
                };
                let mut p = Packet::new(to);
                self.reg_tx_overhead(&p);
                debug!("Node {} sending ack to {:?}", self.id, to);
                GmacHeader::new(GmacKind::Ack, slot).attach(&mut p);
                p
            },
            _ => return Err(MacError::InvalidState("G-MAC contention ended with nothing to send")),
        };
        if !self.mode.config.use_scp || self.mode.send_state == SendState::Ack {
            self.start_transmit(p)
        } else {
            // Hold the carrier until the poll point
            self.mode.outgoing = Some(p);
            Ok(())
        }
    }

    fn msg_timeout(&mut self) -> Result<(), MacError<R::Error>> {
        if self.mode.msg_check == MsgCheck::Activity && self.base.rssi() > RSSI_THRESHOLD {
            trace!("Node {} activity detected, waiting for start symbol", self.id);
            self.mode.msg_check = MsgCheck::StartSymbol;
            let t = (self.frame_total_time(0) * TICKS_PER_SECOND as f64) as Ts;
            return self.set_timeout(t.max(1), TIMER_MSG);
        }

        self.sleep()
    }

    fn ack_failed(&mut self) -> Result<(), MacError<R::Error>> {
        debug!("Node {} ACK timeout", self.id);

        if self.mode.config.reroute_on_fail {
            self.mode.set_last_failed(true);
            self.fail_pending(FailReason::NoAck);
        } else {
            self.mode.retries += 1;
            if self.mode.retries >= self.mode.config.max_retries {
                self.stats.tx_drop = self.stats.tx_drop.saturating_add(1);
                self.fail_pending(FailReason::RetryExhausted);
            }
        }

        self.mode.send_state = SendState::None;
        self.sleep()
    }

    fn poll_timeout(&mut self) -> Result<(), MacError<R::Error>> {
        if self.mode.send_state == SendState::None {
            return self.listen();
        }

        match self.mode.outgoing.take() {
            Some(p) => self.start_transmit(p),
            None => Err(MacError::InvalidState("G-MAC poll without a prepared frame")),
        }
    }
}

impl <R, U, T> Protocol<R::Error> for Core<R, U, T, GmacMode>
where
    R: Radio,
    U: Routing,
    T: Clock,
{
    fn tx_packet(&mut self, mut packet: Packet) -> Result<(), MacError<R::Error>> {
        if self.mode.tx_msg.is_some() {
            warn!("Node {} got packet while busy, dropping", self.id);
            self.stats.tx_drop = self.stats.tx_drop.saturating_add(1);
            return Ok(());
        }

        if self.mode.config.reroute_on_fail {
            let ours = RerouteTag::from_packet(&packet).map(|t| t.origin == self.id).unwrap_or(false);
            if !ours {
                RerouteTag{ origin: self.id, last_failed: false }.attach(&mut packet);
            }
        }

        self.mode.retries = 0;
        self.mode.tx_msg = Some(packet);
        Ok(())
    }

    fn rx_frame(&mut self, packet: Packet) -> Result<(), MacError<R::Error>> {
        let header = GmacHeader::from_packet(&packet)?;

        if self.mode.init == InitState::None {
            self.mode.backoff = self.uniform(0, self.mode.config.backoff_max as Ts);
            self.mode.init = InitState::DoNotify;
            self.mode.current_slot = Some(header.slot as u64);
            info!("Node {} heard a neighbour, notify in {} slots", self.id, self.mode.backoff);
        }

        match header.kind {
            GmacKind::Notify => {
                trace!("Node {} notify from {:?}", self.id, packet.local_from);
                self.reg_rx_overhead(&packet);
            },
            GmacKind::Data if packet.local_to.is_node(self.id) => {
                debug!("Node {} received packet from {:?}", self.id, packet.local_from);
                self.mode.ack_to = packet.local_from;
                self.reg_rx_data(&packet);
                self.stats.rx = self.stats.rx.saturating_add(1);
                self.rx_packet(packet);

                self.mode.send_state = SendState::Ack;
                self.mode.precontend = false;
                self.set_timeout(ACK_CONTEND_TIME, TIMER_CONTENTION)?;
                return self.listen();
            },
            GmacKind::Data => {
                trace!("Node {} overheard packet for {:?}", self.id, packet.local_to);
                self.reg_rx_overhear(&packet);
                self.mode.send_state = SendState::None;
            },
            GmacKind::Bcast => {
                debug!("Node {} received broadcast from {:?}", self.id, packet.local_from);
                self.reg_rx_data(&packet);
                self.stats.rx = self.stats.rx.saturating_add(1);
                self.rx_packet(packet);
            },
            GmacKind::Ack => {
                let expected = packet.local_to.is_node(self.id)
                    && self.mode.send_state == SendState::WaitForAck
                    && packet.local_from.is_some()
                    && self.mode.tx_msg.as_ref().and_then(|p| p.local_to.node()) == packet.local_from;

                if expected {
                    debug!("Node {} ack from {:?}", self.id, packet.local_from);
                    self.reg_rx_overhead(&packet);
                    self.stats.tx = self.stats.tx.saturating_add(1);
                    if let Some(p) = self.mode.tx_msg.take() {
                        self.tx_done(p);
                    }
                } else {
                    trace!("Node {} unexpected ack from {:?}", self.id, packet.local_from);
                    self.reg_rx_overhear(&packet);
                }
                self.mode.send_state = SendState::None;
            },
        }

        self.sleep()
    }

    fn rx_header(&mut self, packet: &Packet) -> Result<(), MacError<R::Error>> {
        if self.mode.config.quick_abort && !packet.local_to.is_node(self.id) && !packet.is_broadcast() {
            trace!("Node {} frame for {:?}, aborting", self.id, packet.local_to);
            self.sleep()?;
        }
        Ok(())
    }

    fn rx_started(&mut self) -> Result<(), MacError<R::Error>> {
        if self.mode.init == InitState::None || self.mode.send_state == SendState::Ack {
            return Ok(());
        }

        self.cancel_timeout(TIMER_MSG)?;
        self.cancel_timeout(TIMER_ACK)?;
        self.cancel_timeout(TIMER_CONTENTION)?;
        if self.mode.config.use_scp {
            self.cancel_timeout(TIMER_POLL)?;
        }
        self.mode.outgoing = None;

        if self.mode.slot_state == SlotState::Send && self.mode.send_state != SendState::WaitForAck {
            self.sleep()?;
        }

        let unicast = self.mode.tx_msg.as_ref().map(|p| !p.is_broadcast()).unwrap_or(false);
        if self.mode.config.reroute_on_fail && self.mode.send_state == SendState::Data && unicast {
            debug!("Node {} lost contention to a reception", self.id);
            self.fail_pending(FailReason::ContentionLost);
        }

        if self.mode.send_state != SendState::WaitForAck {
            self.mode.send_state = SendState::None;
        }
        Ok(())
    }

    fn rx_failed(&mut self) -> Result<(), MacError<R::Error>> {
        match self.mode.send_state {
            SendState::Ack => Ok(()),
            // The ACK timer was cancelled when the reception started
            SendState::WaitForAck => self.ack_failed(),
            _ => self.sleep(),
        }
    }

    fn transmit_done(&mut self) -> Result<(), MacError<R::Error>> {
        match self.mode.send_state {
            SendState::Notify => {
                info!("Node {} notify sent", self.id);
                self.mode.init = InitState::Done;
            },
            SendState::Ack => (),
            SendState::Data => {
                let broadcast = match self.mode.tx_msg.as_ref() {
                    Some(p) => p.is_broadcast(),
                    None => return Err(MacError::InvalidState("G-MAC data sent without a packet")),
                };

                if !broadcast {
                    self.mode.send_state = SendState::WaitForAck;
                    self.listen()?;
                    return self.set_timeout(ACK_TIMEOUT, TIMER_ACK);
                }

                self.stats.tx = self.stats.tx.saturating_add(1);
                if let Some(p) = self.mode.tx_msg.take() {
                    self.tx_done(p);
                }
            },
            _ => return Err(MacError::InvalidState("G-MAC transmit completed with nothing sent")),
        }

        self.mode.send_state = SendState::None;
        self.sleep()
    }

    fn timeout(&mut self, which: TimerId) -> Result<(), MacError<R::Error>> {
        match which {
            TIMER_SLOT => self.slot_start(),
            TIMER_CONTENTION => self.contention_timeout(),
            TIMER_MSG => self.msg_timeout(),
            TIMER_ACK => self.ack_failed(),
            TIMER_POLL => self.poll_timeout(),
            _ => Err(MacError::InvalidState("unknown G-MAC timer")),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::radio::{RadioEvent, RadioMode};
    use crate::mac::Mac;
    use crate::clock::mock::SimClock;
    use crate::radio::mock::MockRadio;
    use crate::routing::mock::{MockRouting, Upcall};
    use super::*;

    type Gmac = Core<MockRadio, MockRouting, SimClock, GmacMode>;

    /// Deterministic contention, no polling
    fn plain() -> GmacConfig {
        GmacConfig {
            use_scp: false,
            use_sift: false,
            retry_chance: 1.0,
            ..Default::default()
        }
    }

    fn setup(id: NodeId, config: GmacConfig) -> (SimClock, MockRadio, MockRouting, Gmac) {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());
        let clock = SimClock::new();
        let radio = MockRadio::new();
        let routing = MockRouting::new();
        let mac = Core::new_gmac(id, radio.clone(), routing.clone(), clock.clone(), CoreConfig::default(), config).unwrap();
        (clock, radio, routing, mac)
    }

    /// Skip the notify phase
    fn ready(mac: &mut Gmac) {
        mac.mode.init = InitState::Done;
    }

    fn step(clock: &SimClock, mac: &mut Gmac) -> Ts {
        let t = mac.next_deadline().unwrap();
        clock.set(t);
        mac.tick().unwrap();
        t
    }

    fn next_frame(clock: &SimClock, radio: &MockRadio, mac: &mut Gmac) -> (Ts, Packet) {
        for _ in 0..200 {
            let t = step(clock, mac);
            if let Some(p) = radio.frames().pop() {
                return (t, p);
            }
        }
        panic!("no frame sent");
    }

    fn frame(from: NodeId, to: Address, kind: GmacKind, payload: usize) -> Packet {
        let mut p = Packet::new(to);
        p.local_from = Some(from);
        p.set_length(payload);
        GmacHeader::new(kind, 0).attach(&mut p);
        p.increase_length(HEADER_LENGTH);
        p
    }

    fn receive(mac: &mut Gmac, p: Packet) {
        mac.handle_radio(RadioEvent::ReceptionStarted).unwrap();
        mac.handle_radio(RadioEvent::FrameReceived(p)).unwrap();
    }

    #[test]
    fn header_encoding() {
        let h = GmacHeader::new(GmacKind::Ack, 6);
        assert_eq!(GmacHeader::decode(&h.encode()), Ok(h));
        assert_eq!(GmacHeader::decode(&[9, 0, 0]), Err(DecodeError::UnknownKind(9)));

        let mut p = Packet::new(Address::Node(1));
        RerouteTag{ origin: 4, last_failed: true }.attach(&mut p);
        assert_eq!(RerouteTag::from_packet(&p), Some(RerouteTag{ origin: 4, last_failed: true }));
        assert_eq!(p.length(), 0);
    }

    #[test]
    fn first_to_wake_prefers_earliest() {
        let offsets = |n: NodeId| match n {
            10 => 5,
            11 => 2,
            _ => 2,
        };
        assert_eq!(first_to_wake(&[10, 11, 12], offsets), Some(11));
        assert_eq!(first_to_wake(&[12, 11], offsets), Some(12));
        assert_eq!(first_to_wake(&[], offsets), None);
    }

    #[test]
    fn slot_plan() {
        let (clock, _radio, _routing, mut mac) = setup(3, plain());

        // Slot 0
        step(&clock, &mut mac);
        assert_eq!(mac.mode().current_slot(), Some(0));
        assert_eq!(mac.mode().slots_until_wake(3), 3);
        assert_eq!(mac.mode().slots_until_wake(7), 0);
        assert_eq!(mac.mode().slots_until_wake(8), 1);
        assert_eq!(mac.first_to_wake(&[3, 8, 1]), Some(8));

        let m = mac.mode();
        assert_eq!(m.plan(3, 3), SlotState::Receive);
        assert_eq!(m.plan(3, 11), SlotState::Receive);
        assert_eq!(m.plan(3, 4), SlotState::Sleep);
        assert_eq!(m.plan(3, 7), SlotState::Receive);

        mac.transmit(Packet::data(3, Address::Node(5), &[0u8; 4])).unwrap();
        let m = mac.mode();
        assert_eq!(m.plan(3, 5), SlotState::Send);
        assert_eq!(m.plan(3, 3), SlotState::Receive);
        assert_eq!(m.plan(3, 7), SlotState::SendReceive);

        // Next hop sharing our phase
        let (_clock, _radio, _routing, mut mac) = setup(1, plain());
        mac.transmit(Packet::data(1, Address::Node(8), &[0u8; 4])).unwrap();
        assert_eq!(mac.mode().plan(1, 1), SlotState::SendReceive);
    }

    #[test]
    fn sink_notifies_after_backoff() {
        let (clock, radio, _routing, mut mac) = setup(0, plain());
        assert_eq!(mac.mode().init_state(), InitState::DoNotify);

        let slot_time = mac.mode().slot_time();
        let (t, p) = next_frame(&clock, &radio, &mut mac);

        // Three slots of backoff, the notify goes in the fourth
        assert!(t > 2 + 3 * slot_time && t < 2 + 4 * slot_time);
        assert_eq!(GmacHeader::from_packet(&p).unwrap().kind, GmacKind::Notify);
        assert_eq!(p.local_to, Address::Broadcast);
        assert_eq!(p.length(), HEADER_LENGTH);

        mac.handle_radio(RadioEvent::TransmitComplete).unwrap();
        assert_eq!(mac.mode().init_state(), InitState::Done);
        assert_eq!(radio.mode(), Some(RadioMode::Sleep));
    }

    #[test]
    fn notify_starts_initialisation() {
        let (_clock, _radio, routing, mut mac) = setup(4, plain());
        assert_eq!(mac.mode().init_state(), InitState::None);

        receive(&mut mac, frame(0, Address::Broadcast, GmacKind::Notify, 0));
        assert_eq!(mac.mode().init_state(), InitState::DoNotify);
        assert!(mac.mode.backoff <= 16);
        assert_eq!(routing.received(), 0);
        assert!(mac.stats().time_rx_overhead > 0.0);
    }

    #[test]
    fn unicast_acknowledged() {
        let (clock, radio, routing, mut mac) = setup(1, plain());
        ready(&mut mac);

        mac.transmit(Packet::data(1, Address::Node(2), &[0u8; 20])).unwrap();

        let slot_time = mac.mode().slot_time();
        let (t, p) = next_frame(&clock, &radio, &mut mac);
        assert_eq!(mac.mode().current_slot(), Some(2));
        assert!(t > 2 + 2 * slot_time && t < 2 + 2 * slot_time + CONTEND_TIME);
        assert_eq!(GmacHeader::from_packet(&p).unwrap().kind, GmacKind::Data);
        assert_eq!(p.length(), 20 + HEADER_LENGTH);

        mac.handle_radio(RadioEvent::TransmitComplete).unwrap();
        assert_eq!(mac.mode().send_state(), SendState::WaitForAck);
        assert_eq!(radio.mode(), Some(RadioMode::Listen));

        receive(&mut mac, frame(2, Address::Node(1), GmacKind::Ack, 0));
        assert_eq!(mac.mode().send_state(), SendState::None);
        assert_eq!(routing.delivered(), 1);
        assert_eq!(mac.stats().tx, 1);
        assert!(mac.mode().pending().is_none());
    }

    #[test]
    fn broadcast_waits_for_broadcast_slot() {
        let (clock, radio, routing, mut mac) = setup(1, plain());
        ready(&mut mac);

        mac.transmit(Packet::data(1, Address::Broadcast, &[0u8; 8])).unwrap();
        let (_t, p) = next_frame(&clock, &radio, &mut mac);
        assert_eq!(mac.mode().current_slot(), Some(7));
        assert_eq!(GmacHeader::from_packet(&p).unwrap().kind, GmacKind::Bcast);

        mac.handle_radio(RadioEvent::TransmitComplete).unwrap();
        assert_eq!(routing.delivered(), 1);
    }

    #[test]
    fn retries_exhausted() {
        let config = GmacConfig{ max_retries: 2, ..plain() };
        let (clock, radio, routing, mut mac) = setup(1, config);
        ready(&mut mac);

        mac.transmit(Packet::data(1, Address::Node(2), &[0u8; 8])).unwrap();

        for attempt in 1..=2 {
            next_frame(&clock, &radio, &mut mac);
            mac.handle_radio(RadioEvent::TransmitComplete).unwrap();
            step(&clock, &mut mac);
            assert_eq!(mac.mode().send_state(), SendState::None);
            if attempt == 1 {
                assert_eq!(mac.mode().retries(), 1);
                assert!(mac.mode().pending().is_some());
            }
        }

        let up = routing.take();
        assert!(matches!(up.as_slice(), [Upcall::Failed(_, FailReason::RetryExhausted)]));
        assert_eq!(mac.stats().tx_drop, 1);
    }

    #[test]
    fn reroute_reports_each_failure() {
        let config = GmacConfig{ reroute_on_fail: true, retry_chance: 0.0, ..plain() };
        let (clock, radio, routing, mut mac) = setup(1, config);
        ready(&mut mac);

        mac.transmit(Packet::data(1, Address::Node(2), &[0u8; 8])).unwrap();
        assert_eq!(RerouteTag::from_packet(mac.mode().pending().unwrap()), Some(RerouteTag{ origin: 1, last_failed: false }));

        next_frame(&clock, &radio, &mut mac);
        mac.handle_radio(RadioEvent::TransmitComplete).unwrap();
        step(&clock, &mut mac);

        let p = match routing.take().pop() {
            Some(Upcall::Failed(p, FailReason::NoAck)) => p,
            u => panic!("unexpected upcall {:?}", u),
        };
        assert_eq!(RerouteTag::from_packet(&p).map(|t| t.last_failed), Some(true));

        // Handed back after the failure, the next send slot skips it
        mac.transmit(p).unwrap();
        for _ in 0..20 {
            step(&clock, &mut mac);
            if mac.mode().pending().is_none() {
                break;
            }
        }
        let up = routing.take();
        assert!(matches!(up.as_slice(), [Upcall::Failed(_, FailReason::RetrySkipped)]));
        assert!(radio.frames().is_empty());
    }

    #[test]
    fn lost_contention() {
        let config = GmacConfig{ reroute_on_fail: true, ..plain() };
        let (clock, radio, routing, mut mac) = setup(1, config);
        ready(&mut mac);

        mac.transmit(Packet::data(1, Address::Node(2), &[0u8; 8])).unwrap();
        while mac.mode().current_slot() != Some(2) {
            step(&clock, &mut mac);
        }
        assert_eq!(mac.mode().slot_state(), SlotState::Send);

        mac.handle_radio(RadioEvent::Rssi(0.9)).unwrap();
        while mac.mode().send_state() == SendState::Data {
            step(&clock, &mut mac);
        }

        let up = routing.take();
        assert!(matches!(up.as_slice(), [Upcall::Failed(_, FailReason::ContentionLost)]));
        assert_eq!(radio.mode(), Some(RadioMode::Sleep));
    }

    #[test]
    fn busy_contention_in_own_slot_keeps_listening() {
        let (clock, _radio, routing, mut mac) = setup(1, plain());
        ready(&mut mac);

        mac.transmit(Packet::data(1, Address::Node(8), &[0u8; 8])).unwrap();
        for _ in 0..2 {
            step(&clock, &mut mac);
        }
        assert_eq!(mac.mode().slot_state(), SlotState::SendReceive);

        mac.handle_radio(RadioEvent::Rssi(0.9)).unwrap();
        while mac.mode().send_state() == SendState::Data {
            step(&clock, &mut mac);
        }

        assert_eq!(mac.base().radio().mode(), Some(RadioMode::Listen));
        assert!(mac.mode().pending().is_some());
        assert_eq!(routing.failed(), 0);
    }

    #[test]
    fn received_unicast_is_acked() {
        let (clock, radio, routing, mut mac) = setup(2, plain());
        ready(&mut mac);

        // Slot 0 is not ours, the sender is in our slot
        let t = step(&clock, &mut mac);
        radio.take();

        receive(&mut mac, frame(1, Address::Node(2), GmacKind::Data, 12));
        assert_eq!(routing.received(), 1);
        assert_eq!(mac.stats().rx, 1);
        assert_eq!(mac.mode().send_state(), SendState::Ack);

        assert_eq!(step(&clock, &mut mac), t + ACK_CONTEND_TIME);
        let p = radio.frames().pop().unwrap();
        assert_eq!(GmacHeader::from_packet(&p).unwrap().kind, GmacKind::Ack);
        assert_eq!(p.local_to, Address::Node(1));
        assert_eq!(p.length(), HEADER_LENGTH);

        mac.handle_radio(RadioEvent::TransmitComplete).unwrap();
        assert_eq!(mac.mode().send_state(), SendState::None);
    }

    #[test]
    fn scp_sends_at_poll_point() {
        let config = GmacConfig{ use_scp: true, ..plain() };
        let (clock, radio, _routing, mut mac) = setup(1, config);
        ready(&mut mac);

        mac.transmit(Packet::data(1, Address::Node(2), &[0u8; 8])).unwrap();

        let slot_time = mac.mode().slot_time();
        let (t, _p) = next_frame(&clock, &radio, &mut mac);
        assert_eq!(t, 2 + 2 * slot_time + SEND_POLL_TIME);
    }

    #[test]
    fn scp_receiver_wakes_for_poll() {
        let config = GmacConfig{ use_scp: true, ..plain() };
        let (clock, radio, _routing, mut mac) = setup(1, config);
        ready(&mut mac);

        step(&clock, &mut mac);
        let slot_start = step(&clock, &mut mac);
        assert_eq!(mac.mode().slot_state(), SlotState::Receive);
        assert_eq!(radio.mode(), Some(RadioMode::Sleep));

        assert_eq!(step(&clock, &mut mac), slot_start + RECEIVE_POLL_TIME);
        assert_eq!(radio.mode(), Some(RadioMode::Listen));

        // Quiet channel at the message timeout
        assert_eq!(step(&clock, &mut mac), slot_start + CLOCK_SKEW_ALLOWANCE + CONTEND_TIME);
        assert_eq!(radio.mode(), Some(RadioMode::Sleep));
    }
}
