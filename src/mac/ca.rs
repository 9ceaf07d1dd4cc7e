//! Collision avoidance handshake shared by CSMA-CA and S-MAC
//!
//! Unicast packets are sent with an RTS / CTS / DATA / ACK exchange,
//! broadcasts as a single DATA frame. Nodes overhearing a directed frame
//! defer through a network allocation vector (NAV).

use core::convert::TryFrom;

use bytes::Bytes;
use byteorder::{ByteOrder, BigEndian};
use log::{trace, debug, warn};
use strum::IntoStaticStr;

use crate::{Ts, base::RSSI_THRESHOLD, clock::Clock, error::{DecodeError, MacError}};
use crate::packet::{Address, Layer, NodeId, Packet};
use crate::radio::Radio;
use crate::routing::{Routing, FailReason};
use crate::timers::TimerId;

use super::Core;

/// Header length in bytes
pub const HEADER_LENGTH: usize = 5;

pub const TIMER_PROTOCOL: TimerId = 0;
pub const TIMER_NAV: TimerId = 1;

pub const RTS_CONTEND_TIME: Ts = 300;
pub const CTS_CONTEND_TIME: Ts = 5;
pub const DATA_CONTEND_TIME: Ts = 5;
pub const ACK_CONTEND_TIME: Ts = 5;

/// Shortest contention window
const MIN_CONTEND_TIME: Ts = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum FrameKind {
    Rts = 0,
    Cts = 1,
    Data = 2,
    Ack = 3,
    Sync = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(FrameKind::Rts),
            1 => Ok(FrameKind::Cts),
            2 => Ok(FrameKind::Data),
            3 => Ok(FrameKind::Ack),
            4 => Ok(FrameKind::Sync),
            _ => Err(DecodeError::UnknownKind(v)),
        }
    }
}

/// CSMA-CA / S-MAC frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaHeader {
    pub kind: FrameKind,
    /// Ticks the medium stays reserved after this frame
    pub nav: u16,
    /// Ticks until the sender's next listen window (SYNC only)
    pub sync: u16,
}

impl CaHeader {
    pub fn new(kind: FrameKind) -> Self {
        Self { kind, nav: 0, sync: 0 }
    }

    pub fn encode(&self) -> Bytes {
        let mut b = [0u8; HEADER_LENGTH];
        b[0] = self.kind as u8;
        BigEndian::write_u16(&mut b[1..3], self.nav);
        BigEndian::write_u16(&mut b[3..5], self.sync);
        Bytes::copy_from_slice(&b)
    }

    pub fn decode(b: &[u8]) -> Result<Self, DecodeError> {
        if b.len() < HEADER_LENGTH {
            return Err(DecodeError::NotEnoughBytes);
        }
        Ok(Self {
            kind: FrameKind::try_from(b[0])?,
            nav: BigEndian::read_u16(&b[1..3]),
            sync: BigEndian::read_u16(&b[3..5]),
        })
    }

    /// Decode the header carried in a packet's MAC data
    pub fn from_packet(p: &Packet) -> Result<Self, DecodeError> {
        let b = p.data_for(Layer::Mac).ok_or(DecodeError::MissingHeader)?;
        Self::decode(b)
    }

    /// Attach this header as MAC data, `simulated` bytes on top of the
    /// header length
    pub fn attach(&self, p: &mut Packet, simulated: usize) {
        p.set_data(Layer::Mac, self.encode(), simulated);
    }
}

/// Clamp a tick count into a header field
pub(crate) fn header_ticks(t: Ts) -> u16 {
    if t > u16::MAX as Ts {
        u16::MAX
    } else {
        t as u16
    }
}

/// Handshake states
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum CaState {
    Idle,
    Contend,
    WaitForCts,
    WaitForData,
    SendRts,
    SendCts,
    SendData,
    WaitForAck,
    SendAck,
    SendSync,
}

/// Network allocation vector
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Nav {
    busy: bool,
    end: Ts,
}

impl Nav {
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Time the medium reservation ends
    pub fn end(&self) -> Ts {
        self.end
    }

    /// Reserve the medium for `t` ticks from `now`, only ever extending
    /// the reservation. Returns true if the NAV timer needs re-arming.
    pub fn update(&mut self, now: Ts, t: Ts) -> bool {
        if t == 0 {
            return false;
        }
        if !self.busy || t > self.end.saturating_sub(now) {
            self.busy = true;
            self.end = now + t;
            return true;
        }
        false
    }

    pub fn clear(&mut self) {
        self.busy = false;
    }
}

/// Exponential RTS contention window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    min: Ts,
    max: Ts,
    current: Ts,
}

impl Backoff {
    pub fn new(min: Ts, max: Ts) -> Self {
        let min = min.max(MIN_CONTEND_TIME);
        Self { min, max: max.max(min), current: min }
    }

    pub fn current(&self) -> Ts {
        self.current
    }

    /// Double the window, capped at the maximum
    pub fn increase(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

/// Handshake state shared by collision avoidance modes
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub state: CaState,
    /// Frame to send once contention completes
    pub next: Option<CaState>,
    pub tx_msg: Option<Packet>,
    /// Failed handshakes left before the packet is dropped, unlimited when `None`
    pub attempts_left: Option<u32>,

    pub nav: Nav,
    pub backoff: Backoff,

    pub cts_to: Option<NodeId>,
    pub cts_nav_end: Ts,
    pub ack_to: Option<NodeId>,
}

impl Handshake {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: CaState::Idle,
            next: None,
            tx_msg: None,
            attempts_left: None,
            nav: Nav::default(),
            backoff,
            cts_to: None,
            cts_nav_end: 0,
            ack_to: None,
        }
    }

    /// Next hop of the pending packet
    fn peer(&self) -> Option<NodeId> {
        self.tx_msg.as_ref().and_then(|p| p.local_to.node())
    }
}

/// Modes built on the collision avoidance handshake
pub trait CaMode {
    fn handshake(&self) -> &Handshake;
    fn handshake_mut(&mut self) -> &mut Handshake;
}

/// Mode specific hooks invoked by the shared handshake
pub trait CaHooks<E> {
    /// Decide what to do next when idle
    fn eval_state(&mut self) -> Result<(), MacError<E>>;

    /// Return to idle and re-evaluate
    fn set_idle(&mut self) -> Result<(), MacError<E>>;

    fn send_sync(&mut self) -> Result<(), MacError<E>> {
        Err(MacError::InvalidState("SYNC frames unsupported"))
    }

    fn receive_sync(&mut self, _packet: Packet, _header: CaHeader) -> Result<(), MacError<E>> {
        warn!("Ignoring SYNC frame");
        Ok(())
    }
}

impl <R, U, T, M> Core<R, U, T, M>
where
    R: Radio,
    U: Routing,
    T: Clock,
    M: CaMode,
    Self: CaHooks<R::Error>,
{
    pub(crate) fn hs(&mut self) -> &mut Handshake {
        self.mode.handshake_mut()
    }

    pub(crate) fn nav_rts(&self, length: usize) -> Ts {
        5 + self.flength(0) + 5 + self.flength(length) + 5 + self.flength(0)
    }

    pub(crate) fn nav_ack(&self) -> Ts {
        5 + self.flength(0)
    }

    pub(crate) fn timeout_wfcts(&self) -> Ts {
        self.flength(0) + 5 + 10
    }

    pub(crate) fn timeout_wfdata(&self) -> Ts {
        self.flength(0) + 5
    }

    pub(crate) fn timeout_wfack(&self) -> Ts {
        self.flength(0) + 5 + 10
    }

    /// Start contending for the channel with a uniform delay in `[5, time]`
    pub(crate) fn start_contending(&mut self, time: Ts) -> Result<(), MacError<R::Error>> {
        if self.mode.handshake().nav.is_busy() {
            debug!("Node {} contend: skipping, NAV busy", self.id);
            self.hs().next = None;
            return self.set_idle();
        }

        let ctime = self.uniform(MIN_CONTEND_TIME, time.max(MIN_CONTEND_TIME));
        trace!("Node {} contending, fires in {}", self.id, ctime);

        self.hs().state = CaState::Contend;
        self.listen()?;
        self.set_timeout(ctime, TIMER_PROTOCOL)
    }

    /// Contention window expired, send the pending frame if the channel
    /// is still clear
    pub(crate) fn contention_fired(&mut self) -> Result<(), MacError<R::Error>> {
        self.listen()?;

        if self.base.rssi() > RSSI_THRESHOLD {
            debug!("Node {} sensed communication, cancelling contention", self.id);
            return self.set_idle();
        }

        match self.hs().next.take() {
            Some(CaState::SendRts) => self.send_rts(),
            Some(CaState::SendCts) => self.send_cts(),
            Some(CaState::SendData) => self.send_data(),
            Some(CaState::SendAck) => self.send_ack(),
            Some(CaState::SendSync) => self.send_sync(),
            _ => Err(MacError::InvalidState("contention expired with nothing to send")),
        }
    }

    fn send_control(&mut self, state: CaState, to: Address, header: CaHeader) -> Result<(), MacError<R::Error>> {
        self.hs().state = state;

        let mut p = Packet::new(to);
        header.attach(&mut p, 0);

        self.transmit_mode()?;
        self.reg_tx_overhead(&p);
        self.start_transmit(p)
    }

    pub(crate) fn send_rts(&mut self) -> Result<(), MacError<R::Error>> {
        let (to, length) = match self.mode.handshake().tx_msg.as_ref() {
            Some(p) => (p.local_to, p.length()),
            None => return Err(MacError::InvalidState("RTS without a pending packet")),
        };
        debug!("Node {} sending RTS to {:?}", self.id, to);

        let header = CaHeader{ nav: header_ticks(self.nav_rts(length)), ..CaHeader::new(FrameKind::Rts) };
        self.send_control(CaState::SendRts, to, header)
    }

    pub(crate) fn send_cts(&mut self) -> Result<(), MacError<R::Error>> {
        let to = match self.mode.handshake().cts_to {
            Some(n) => n,
            None => return Err(MacError::InvalidState("CTS without an RTS sender")),
        };
        debug!("Node {} sending CTS to {}", self.id, to);

        let remaining = self.mode.handshake().cts_nav_end.saturating_sub(self.now());
        let header = CaHeader{ nav: header_ticks(remaining), ..CaHeader::new(FrameKind::Cts) };
        self.send_control(CaState::SendCts, Address::Node(to), header)
    }

    pub(crate) fn send_data(&mut self) -> Result<(), MacError<R::Error>> {
        let mut p = match self.mode.handshake().tx_msg.as_ref() {
            Some(p) => p.clone(),
            None => return Err(MacError::InvalidState("DATA without a pending packet")),
        };
        debug!("Node {} sending data to {:?}", self.id, p.local_to);

        self.hs().state = CaState::SendData;
        CaHeader::new(FrameKind::Data).attach(&mut p, 0);

        self.transmit_mode()?;
        self.reg_tx_data(&p);
        self.start_transmit(p)
    }

    pub(crate) fn send_ack(&mut self) -> Result<(), MacError<R::Error>> {
        let to = match self.mode.handshake().ack_to {
            Some(n) => n,
            None => return Err(MacError::InvalidState("ACK without a data sender")),
        };
        debug!("Node {} sending ACK to {}", self.id, to);

        self.send_control(CaState::SendAck, Address::Node(to), CaHeader::new(FrameKind::Ack))
    }

    /// Extend the NAV by `t` ticks from now
    pub(crate) fn update_nav(&mut self, t: Ts) -> Result<(), MacError<R::Error>> {
        let now = self.now();
        if self.hs().nav.update(now, t) {
            trace!("Node {} NAV updated, {} ticks left", self.id, t);
            self.set_timeout(t, TIMER_NAV)?;
        }
        Ok(())
    }

    pub(crate) fn nav_timeout(&mut self) -> Result<(), MacError<R::Error>> {
        debug!("Node {} NAV expired, medium clear", self.id);
        self.hs().nav.clear();
        self.eval_state()
    }

    /// Abandon a wait state the received frame does not complete,
    /// returning the abandoned state
    pub(crate) fn abandon_wait(&mut self, packet: &Packet, header: &CaHeader) -> Result<Option<CaState>, MacError<R::Error>> {
        let for_me = packet.local_to.is_node(self.id);
        let state = self.mode.handshake().state;

        let abandon = match state {
            CaState::WaitForCts => header.kind != FrameKind::Cts || !for_me,
            CaState::WaitForAck => header.kind != FrameKind::Ack || !for_me,
            _ => false,
        };

        if !abandon {
            return Ok(None);
        }

        debug!("Node {} received {:?} in {:?}, abandoning", self.id, header.kind, state);
        self.cancel_timeout(TIMER_PROTOCOL)?;
        self.hs().state = CaState::Idle;

        Ok(Some(state))
    }

    /// Count a failed handshake, dropping the packet once attempts run out
    pub(crate) fn handshake_failed(&mut self) {
        let hs = self.mode.handshake_mut();
        let left = match hs.attempts_left.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n
            },
            None => return,
        };

        if left == 0 {
            if let Some(p) = self.hs().tx_msg.take() {
                warn!("Node {} giving up on packet to {:?}", self.id, p.local_to);
                self.stats.tx_drop = self.stats.tx_drop.saturating_add(1);
                self.tx_failed(p, FailReason::RetryExhausted);
            }
        }
    }

    /// Report the pending packet as delivered
    pub(crate) fn handshake_done(&mut self) {
        if let Some(p) = self.hs().tx_msg.take() {
            self.stats.tx = self.stats.tx.saturating_add(1);
            self.hs().backoff.reset();
            self.tx_done(p);
        }
    }

    /// Dispatch a received frame to its handler
    pub(crate) fn receive_frame(&mut self, packet: Packet, header: CaHeader) -> Result<(), MacError<R::Error>> {
        match header.kind {
            FrameKind::Rts => self.receive_rts(packet, header),
            FrameKind::Cts => self.receive_cts(packet, header),
            FrameKind::Data => self.receive_data(packet),
            FrameKind::Ack => self.receive_ack(packet),
            FrameKind::Sync => self.receive_sync(packet, header),
        }
    }

    fn receive_rts(&mut self, packet: Packet, header: CaHeader) -> Result<(), MacError<R::Error>> {
        if !packet.local_to.is_node(self.id) {
            trace!("Node {} overheard RTS for {:?}", self.id, packet.local_to);
            self.reg_rx_overhear(&packet);
            return self.update_nav(header.nav as Ts);
        }

        debug!("Node {} received RTS from {:?}, preparing CTS", self.id, packet.local_from);
        self.reg_rx_overhead(&packet);

        let now = self.now();
        let hs = self.hs();
        hs.cts_to = packet.local_from;
        hs.cts_nav_end = now + header.nav as Ts;
        hs.next = Some(CaState::SendCts);

        self.start_contending(CTS_CONTEND_TIME)
    }

    fn receive_cts(&mut self, packet: Packet, header: CaHeader) -> Result<(), MacError<R::Error>> {
        if !packet.local_to.is_node(self.id) {
            trace!("Node {} overheard CTS for {:?}", self.id, packet.local_to);
            self.reg_rx_overhear(&packet);
            return self.update_nav(header.nav as Ts);
        }

        self.reg_rx_overhead(&packet);

        let hs = self.mode.handshake();
        if hs.state != CaState::WaitForCts || packet.local_from != hs.peer() {
            debug!("Node {} ignoring unsolicited CTS from {:?}", self.id, packet.local_from);
            return Ok(());
        }

        debug!("Node {} received CTS, preparing data", self.id);
        self.cancel_timeout(TIMER_PROTOCOL)?;
        let hs = self.hs();
        hs.backoff.reset();
        hs.next = Some(CaState::SendData);

        self.start_contending(DATA_CONTEND_TIME)
    }

    fn receive_ack(&mut self, packet: Packet) -> Result<(), MacError<R::Error>> {
        if !packet.local_to.is_node(self.id) {
            trace!("Node {} overheard ACK for {:?}", self.id, packet.local_to);
            self.reg_rx_overhear(&packet);
            return Ok(());
        }

        self.reg_rx_overhead(&packet);

        let hs = self.mode.handshake();
        if hs.state != CaState::WaitForAck || packet.local_from != hs.peer() {
            debug!("Node {} ignoring unsolicited ACK from {:?}", self.id, packet.local_from);
            return Ok(());
        }

        debug!("Node {} received ACK", self.id);
        self.cancel_timeout(TIMER_PROTOCOL)?;
        self.handshake_done();
        self.set_idle()
    }

    fn receive_data(&mut self, packet: Packet) -> Result<(), MacError<R::Error>> {
        if packet.local_to.is_node(self.id) {
            debug!("Node {} received unicast data from {:?}", self.id, packet.local_from);
            self.hs().ack_to = packet.local_from;

            self.reg_rx_data(&packet);
            self.rx_packet(packet);
            self.stats.rx = self.stats.rx.saturating_add(1);

            self.hs().next = Some(CaState::SendAck);
            self.start_contending(ACK_CONTEND_TIME)

        } else if packet.local_to.is_broadcast() {
            debug!("Node {} received broadcast data from {:?}", self.id, packet.local_from);
            self.reg_rx_data(&packet);
            self.rx_packet(packet);
            self.stats.rx = self.stats.rx.saturating_add(1);
            Ok(())

        } else {
            trace!("Node {} overheard data for {:?}", self.id, packet.local_to);
            self.reg_rx_overhear(&packet);
            let t = self.nav_ack();
            self.update_nav(t)
        }
    }

    /// Advance the handshake once the radio has sent a frame
    pub(crate) fn handshake_transmitted(&mut self) -> Result<(), MacError<R::Error>> {
        match self.mode.handshake().state {
            CaState::SendRts => {
                self.hs().state = CaState::WaitForCts;
                let t = self.timeout_wfcts();
                self.set_timeout(t, TIMER_PROTOCOL)?;
                self.listen()
            },
            CaState::SendCts => {
                self.hs().state = CaState::WaitForData;
                let t = self.timeout_wfdata();
                self.set_timeout(t, TIMER_PROTOCOL)?;
                self.listen()
            },
            CaState::SendData => {
                let broadcast = match self.mode.handshake().tx_msg.as_ref() {
                    Some(p) => p.is_broadcast(),
                    None => return Err(MacError::InvalidState("data sent without a pending packet")),
                };
                if broadcast {
                    self.handshake_done();
                    self.set_idle()
                } else {
                    self.hs().state = CaState::WaitForAck;
                    let t = self.timeout_wfack();
                    self.set_timeout(t, TIMER_PROTOCOL)?;
                    self.listen()
                }
            },
            CaState::SendAck | CaState::SendSync => self.set_idle(),
            _ => Err(MacError::InvalidState("transmit complete outside a send state")),
        }
    }

    /// A reception cancels contention and the wait for data
    pub(crate) fn handshake_rx_started(&mut self) -> Result<(), MacError<R::Error>> {
        match self.mode.handshake().state {
            CaState::Contend => {
                debug!("Node {} reception started, cancelling contention", self.id);
                self.cancel_timeout(TIMER_PROTOCOL)?;
                let hs = self.hs();
                hs.state = CaState::Idle;
                hs.next = None;
            },
            CaState::WaitForData => {
                debug!("Node {} reception started, cancelling wait for data", self.id);
                self.cancel_timeout(TIMER_PROTOCOL)?;
                self.hs().state = CaState::Idle;
            },
            _ => (),
        }
        Ok(())
    }
}
