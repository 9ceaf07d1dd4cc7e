//! L-MAC, a self organising TDMA MAC
//!
//! Time is divided into frames of `max_slot` slots. A slotted node sends
//! a header (and any pending packet) at the start of its own slot, and
//! listens at the start of every other slot just long enough to see
//! whether the slot is in use. Headers advertise every slot the sender
//! knows to be occupied, so a joining node can choose a slot that is free
//! within two hops.

use core::iter::FromIterator;

use bytes::Bytes;
use byteorder::{ByteOrder, BigEndian};
use log::{trace, debug, info, warn};

use crate::{Ts, TICKS_PER_SECOND, base::RSSI_THRESHOLD, clock::Clock, error::{DecodeError, MacError}};
use crate::packet::{Address, Layer, NodeId, Packet, EXTRA_TRANSMIT_TIME};
use crate::radio::Radio;
use crate::routing::Routing;
use crate::timers::TimerId;

use super::{Core, Protocol, config::*};

pub const TIMER_SLOT: TimerId = 0;
pub const TIMER_SHORT: TimerId = 1;
pub const TIMER_SEND_DELAY: TimerId = 2;
pub const TIMER_HEADER: TimerId = 3;

pub const CLOCK_SKEW_ALLOWANCE: Ts = 2;

/// Listen period at the start of a foreign slot
pub const SHORT_WAIT: Ts = CLOCK_SKEW_ALLOWANCE + 3;

/// Largest supported frame in slots
pub const MAX_SLOTS: usize = 128;

const SLOT_WORDS: usize = MAX_SLOTS / 64;

/// Encoded header size in bytes
pub const ENCODED_LENGTH: usize = 2 + SLOT_WORDS * 8 + 1 + 2;

/// Consecutive failed slot picks before a node stays unslotted
const MAX_PICK_FAILURES: u32 = 10;

/// Energy below this level with no header is a slot used out of range
const TENTATIVE_THRESHOLD: f64 = 0.6;

/// Bitmap of slot indexes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotSet([u64; SLOT_WORDS]);

impl SlotSet {
    pub const EMPTY: SlotSet = SlotSet([0; SLOT_WORDS]);

    pub fn set(&mut self, slot: usize) {
        if slot < MAX_SLOTS {
            self.0[slot / 64] |= 1u64 << (slot % 64);
        }
    }

    pub fn unset(&mut self, slot: usize) {
        if slot < MAX_SLOTS {
            self.0[slot / 64] &= !(1u64 << (slot % 64));
        }
    }

    pub fn contains(&self, slot: usize) -> bool {
        slot < MAX_SLOTS && self.0[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    pub fn merge(&mut self, other: &SlotSet) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a |= *b;
        }
    }

    pub fn clear(&mut self) {
        *self = Self::EMPTY;
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Lowest set slot below `max`
    pub fn first(&self, max: usize) -> Option<usize> {
        (0..max.min(MAX_SLOTS)).find(|s| self.contains(*s))
    }

    /// Slots below `max` not in the set, in ascending order
    pub fn free(&self, max: usize) -> impl Iterator<Item=usize> + '_ {
        (0..max.min(MAX_SLOTS)).filter(move |s| !self.contains(*s))
    }
}

impl FromIterator<usize> for SlotSet {
    fn from_iter<I: IntoIterator<Item=usize>>(iter: I) -> Self {
        let mut s = SlotSet::EMPTY;
        for i in iter {
            s.set(i);
        }
        s
    }
}

/// L-MAC slot header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LmacHeader {
    /// Slot the sender is transmitting in
    pub current_slot: u16,
    /// Slots known to the sender to be in use, including its own
    pub occupied: SlotSet,
    /// Hops from the sender to the sink
    pub distance: u8,
    /// A slot the sender saw collide
    pub collision_slot: Option<u16>,
}

impl LmacHeader {
    pub fn encode(&self) -> Bytes {
        let mut b = [0u8; ENCODED_LENGTH];
        BigEndian::write_u16(&mut b[0..2], self.current_slot);
        for (i, w) in self.occupied.0.iter().enumerate() {
            BigEndian::write_u64(&mut b[2 + i * 8..10 + i * 8], *w);
        }

        let d = 2 + SLOT_WORDS * 8;
        b[d] = self.distance;
        let collision = self.collision_slot.map(|s| s as i16).unwrap_or(-1);
        BigEndian::write_i16(&mut b[d + 1..d + 3], collision);

        Bytes::copy_from_slice(&b)
    }

    pub fn decode(b: &[u8]) -> Result<Self, DecodeError> {
        if b.len() < ENCODED_LENGTH {
            return Err(DecodeError::NotEnoughBytes);
        }

        let mut occupied = SlotSet::EMPTY;
        for (i, w) in occupied.0.iter_mut().enumerate() {
            *w = BigEndian::read_u64(&b[2 + i * 8..10 + i * 8]);
        }

        let d = 2 + SLOT_WORDS * 8;
        let collision = BigEndian::read_i16(&b[d + 1..d + 3]);

        Ok(Self {
            current_slot: BigEndian::read_u16(&b[0..2]),
            occupied,
            distance: b[d],
            collision_slot: if collision < 0 { None } else { Some(collision as u16) },
        })
    }

    pub fn from_packet(p: &Packet) -> Result<Self, DecodeError> {
        let b = p.data_for(Layer::Mac).ok_or(DecodeError::MissingHeader)?;
        Self::decode(b)
    }

    /// Attach as MAC data, the header size is accounted by the MAC
    pub fn attach(&self, p: &mut Packet) {
        p.set_data(Layer::Mac, self.encode(), 0);
    }
}

/// What is known about the owner of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Neighbour {
    id: Option<NodeId>,
    occupied: SlotSet,
}

impl Neighbour {
    const NONE: Neighbour = Neighbour{ id: None, occupied: SlotSet::EMPTY };
}

#[derive(Debug, PartialEq)]
pub struct LmacMode {
    config: LmacConfig,
    slot_time: Ts,

    initialized: bool,
    current_slot: usize,
    my_slot: Option<usize>,
    verify_slot: bool,
    /// Frames to wait before picking a new slot
    backoff: Ts,
    no_slots: u32,
    distance: u8,

    neighbours: [Neighbour; MAX_SLOTS],
    collisions: SlotSet,
    tentative: SlotSet,

    ignore_failed: bool,
    sending_data: bool,
    tx_msg: Option<Packet>,
}

impl LmacMode {
    fn new(id: NodeId, config: LmacConfig) -> Self {
        let sink = id == 0;
        Self {
            // First slot timer moves to slot 0
            current_slot: config.max_slot - 1,
            config,
            slot_time: 0,
            initialized: sink,
            my_slot: if sink { Some(0) } else { None },
            verify_slot: false,
            backoff: 0,
            no_slots: 0,
            distance: if sink { 0 } else { u8::MAX },
            neighbours: [Neighbour::NONE; MAX_SLOTS],
            collisions: SlotSet::EMPTY,
            tentative: SlotSet::EMPTY,
            ignore_failed: false,
            sending_data: false,
            tx_msg: None,
        }
    }

    pub fn slot_time(&self) -> Ts {
        self.slot_time
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn my_slot(&self) -> Option<usize> {
        self.my_slot
    }

    /// Whether the picked slot is still waiting a frame for confirmation
    pub fn verifying(&self) -> bool {
        self.verify_slot
    }

    pub fn backoff(&self) -> Ts {
        self.backoff
    }

    pub fn distance(&self) -> u8 {
        self.distance
    }

    pub fn collisions(&self) -> &SlotSet {
        &self.collisions
    }

    /// Owner last heard in a slot
    pub fn neighbour(&self, slot: usize) -> Option<NodeId> {
        self.neighbours.get(slot).and_then(|n| n.id)
    }

    pub fn pending(&self) -> Option<&Packet> {
        self.tx_msg.as_ref()
    }

    fn forget(&mut self, slot: usize) {
        if let Some(n) = self.neighbours.get_mut(slot) {
            *n = Neighbour::NONE;
        }
    }

    /// Union of every neighbour's occupied slots
    fn occupied(&self) -> SlotSet {
        let mut s = SlotSet::EMPTY;
        for n in self.neighbours[..self.config.max_slot].iter() {
            s.merge(&n.occupied);
        }
        if self.config.use_tentative {
            s.merge(&self.tentative);
        }
        s
    }
}

impl <R, U, T> Core<R, U, T, LmacMode>
where
    R: Radio,
    U: Routing,
    T: Clock,
{
    /// Create a new L-MAC, node 0 is the sink and owns slot 0
    pub fn new_lmac(id: NodeId, radio: R, routing: U, clock: T, core_config: CoreConfig, lmac_config: LmacConfig) -> Result<Self, MacError<R::Error>> {
        if lmac_config.max_slot == 0 || lmac_config.max_slot > MAX_SLOTS {
            return Err(MacError::InvalidState("L-MAC slot count out of range"));
        }

        let header_length = 7 + (lmac_config.max_slot + 7) / 8;
        let mut c = Core::with_mode(id, radio, routing, clock, core_config, header_length, LmacMode::new(id, lmac_config))?;

        let frame = c.frame_total_time(header_length + c.mode.config.data_length) + EXTRA_TRANSMIT_TIME;
        c.mode.slot_time = (frame * TICKS_PER_SECOND as f64) as Ts + CLOCK_SKEW_ALLOWANCE;

        debug!("Node {} L-MAC starting, {} slots of {} ticks", id, c.mode.config.max_slot, c.mode.slot_time);

        c.set_timeout(2, TIMER_SLOT)?;
        c.listen()?;

        Ok(c)
    }

    /// Choose a slot uniformly among those free in the neighbourhood
    fn pick_slot(&mut self) {
        if self.mode.no_slots > MAX_PICK_FAILURES {
            return;
        }

        let max = self.mode.config.max_slot;
        let occupied = self.mode.occupied();

        let free = occupied.free(max).count();
        if free == 0 {
            self.mode.no_slots += 1;
            if self.mode.no_slots > MAX_PICK_FAILURES {
                warn!("Node {} found no free slot {} times, staying unslotted", self.id, self.mode.no_slots);
            } else {
                debug!("Node {} no free slot in neighbourhood", self.id);
            }
            return;
        }
        self.mode.no_slots = 0;

        let pick = self.uniform(0, free as Ts - 1) as usize;
        if let Some(s) = occupied.free(max).nth(pick) {
            info!("Node {} picked slot {}", self.id, s);
            self.mode.my_slot = Some(s);
            self.mode.verify_slot = true;
        };
    }

    /// Whether a neighbour already owns (or is known to use) the slot
    fn slot_taken(&self, slot: usize) -> bool {
        self.mode.neighbours[slot].id.is_some() ||
            self.mode.neighbours[..self.mode.config.max_slot].iter()
                .any(|n| n.id.is_some() && n.occupied.contains(slot))
    }

    fn slot_start(&mut self) -> Result<(), MacError<R::Error>> {
        let max = self.mode.config.max_slot;
        let slot_time = self.mode.slot_time;
        self.set_timeout(slot_time, TIMER_SLOT)?;

        let cur = (self.mode.current_slot + 1) % max;
        self.mode.current_slot = cur;

        if self.mode.config.use_tentative {
            self.mode.tentative.unset(cur);
        }
        self.mode.collisions.unset(cur);

        if self.mode.backoff > 0 {
            self.mode.backoff -= 1;
            if self.mode.backoff == 0 {
                self.pick_slot();
            }
        }

        if self.mode.my_slot != Some(cur) {
            trace!("Node {} slot {} not ours", self.id, cur);
            if self.mode.initialized {
                self.set_timeout(SHORT_WAIT, TIMER_SHORT)?;
            }
            return self.listen();
        }

        if self.mode.verify_slot {
            self.mode.verify_slot = false;
            if self.slot_taken(cur) {
                info!("Node {} slot {} taken by another node, choosing again", self.id, cur);
                self.mode.my_slot = None;
                self.mode.backoff = self.uniform(max as Ts, 2 * max as Ts);
                self.set_timeout(SHORT_WAIT, TIMER_SHORT)?;
                return self.listen();
            }
        }

        debug!("Node {} === slot {} ===", self.id, cur);
        self.set_timeout(CLOCK_SKEW_ALLOWANCE, TIMER_SEND_DELAY)
    }

    fn short_timeout(&mut self) -> Result<(), MacError<R::Error>> {
        let cur = self.mode.current_slot;
        let rssi = self.base.rssi();

        if rssi < RSSI_THRESHOLD {
            trace!("Node {} slot {} clear", self.id, cur);
            self.mode.forget(cur);
            self.sleep()
        } else if rssi < TENTATIVE_THRESHOLD {
            if self.mode.config.use_tentative {
                self.mode.tentative.set(cur);
            }
            self.sleep()
        } else {
            // Someone is sending, the header should follow
            let t = (self.frame_total_time(0) * TICKS_PER_SECOND as f64) as Ts;
            self.set_timeout(t.max(1), TIMER_HEADER)
        }
    }

    fn send_slot(&mut self) -> Result<(), MacError<R::Error>> {
        let my_slot = match self.mode.my_slot {
            Some(s) => s,
            None => {
                warn!("Node {} lost its slot before sending", self.id);
                return self.sleep();
            }
        };

        let max = self.mode.config.max_slot;

        let mut occupied: SlotSet = self.mode.neighbours[..max].iter()
            .enumerate()
            .filter(|(_, n)| n.id.is_some())
            .map(|(i, _)| i)
            .collect();
        occupied.set(my_slot);
        if self.mode.config.use_tentative {
            occupied.merge(&self.mode.tentative);
        }

        let collision = self.mode.collisions.first(max);
        if let Some(s) = collision {
            self.mode.collisions.unset(s);
        }

        let header = LmacHeader {
            current_slot: self.mode.current_slot as u16,
            occupied,
            distance: self.mode.distance,
            collision_slot: collision.map(|s| s as u16),
        };

        self.transmit_mode()?;

        let mut p = match self.mode.tx_msg.clone() {
            Some(p) => {
                debug!("Node {} sending packet to {:?}", self.id, p.local_to);
                self.mode.sending_data = true;
                self.reg_tx_data(&p);
                p
            },
            None => {
                let p = Packet::new(Address::None);
                self.reg_tx_overhead(&p);
                p
            },
        };

        header.attach(&mut p);
        self.start_transmit(p)
    }

    fn header_timeout(&mut self) -> Result<(), MacError<R::Error>> {
        let cur = self.mode.current_slot;
        debug!("Node {} no header in busy slot {}", self.id, cur);

        self.mode.ignore_failed = true;
        self.mode.collisions.set(cur);
        self.mode.forget(cur);
        self.sleep()
    }
}

impl <R, U, T> Protocol<R::Error> for Core<R, U, T, LmacMode>
where
    R: Radio,
    U: Routing,
    T: Clock,
{
    fn tx_packet(&mut self, packet: Packet) -> Result<(), MacError<R::Error>> {
        if self.mode.tx_msg.is_some() {
            warn!("Node {} got packet while busy, dropping", self.id);
            self.stats.tx_drop = self.stats.tx_drop.saturating_add(1);
            return Ok(());
        }

        self.mode.tx_msg = Some(packet);
        Ok(())
    }

    fn rx_frame(&mut self, packet: Packet) -> Result<(), MacError<R::Error>> {
        if packet.local_to.is_node(self.id) || packet.is_broadcast() {
            debug!("Node {} received frame from {:?}", self.id, packet.local_from);
            self.reg_rx_data(&packet);
            self.stats.rx = self.stats.rx.saturating_add(1);
            self.rx_packet(packet);
        } else {
            trace!("Node {} overheard frame for {:?}", self.id, packet.local_to);
            self.reg_rx_overhear(&packet);
        }

        self.mode.ignore_failed = false;
        self.sleep()
    }

    fn rx_header(&mut self, packet: &Packet) -> Result<(), MacError<R::Error>> {
        let header = LmacHeader::from_packet(packet)?;
        let max = self.mode.config.max_slot;
        let collision = header.collision_slot
            .map(|s| s as usize)
            .filter(|s| *s < max);

        if !self.mode.initialized {
            self.mode.current_slot = header.current_slot as usize % max;
            self.mode.distance = header.distance.saturating_add(1);
            self.mode.initialized = true;
            info!("Node {} synchronised at slot {}, distance {}", self.id, self.mode.current_slot, self.mode.distance);

        } else if self.mode.my_slot.is_some() && collision == self.mode.my_slot && self.id != 0 {
            // The sink keeps its slot regardless
            self.mode.my_slot = None;
            self.mode.collisions.clear();
            self.mode.backoff = self.uniform(self.id as Ts % max as Ts, 2 * max as Ts);
            info!("Node {} collision in own slot, backing off {} slots", self.id, self.mode.backoff);

        } else if let Some(s) = collision {
            self.mode.collisions.unset(s);
            self.mode.forget(s);
        }

        let cur = self.mode.current_slot;
        self.mode.neighbours[cur] = Neighbour {
            id: packet.local_from,
            occupied: header.occupied,
        };

        let d = header.distance.saturating_add(1);
        if self.mode.distance > d {
            self.mode.distance = d;
        }

        if self.mode.my_slot.is_none() && self.mode.backoff == 0 {
            self.pick_slot();
        }

        if !packet.local_to.is_node(self.id) && !packet.is_broadcast() {
            trace!("Node {} frame not for us, sleeping", self.id);
            self.sleep()?;
            self.mode.ignore_failed = true;
        }

        Ok(())
    }

    fn rx_started(&mut self) -> Result<(), MacError<R::Error>> {
        self.cancel_timeout(TIMER_HEADER)
    }

    fn rx_failed(&mut self) -> Result<(), MacError<R::Error>> {
        if !self.mode.ignore_failed && self.mode.initialized {
            let cur = self.mode.current_slot;
            debug!("Node {} reception failed in slot {}", self.id, cur);
            self.mode.collisions.set(cur);
            self.mode.forget(cur);
            self.sleep()?;
        }
        self.mode.ignore_failed = false;
        Ok(())
    }

    fn transmit_done(&mut self) -> Result<(), MacError<R::Error>> {
        if self.mode.sending_data {
            self.mode.sending_data = false;
            if let Some(p) = self.mode.tx_msg.take() {
                self.stats.tx = self.stats.tx.saturating_add(1);
                self.tx_done(p);
            }
        }
        self.sleep()
    }

    fn timeout(&mut self, which: TimerId) -> Result<(), MacError<R::Error>> {
        match which {
            TIMER_SLOT => self.slot_start(),
            TIMER_SHORT => self.short_timeout(),
            TIMER_SEND_DELAY => self.send_slot(),
            TIMER_HEADER => self.header_timeout(),
            _ => Err(MacError::InvalidState("unknown L-MAC timer")),
        }
    }
}
