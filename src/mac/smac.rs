//! S-MAC, a synchronised duty cycled CSMA-CA MAC
//!
//! Time is divided into frames of `frame_time` ticks. Each node listens
//! for `listen_time` ticks at the start of its own frame and sleeps for
//! the remainder, except during the listen windows of foreign schedules
//! it has learned about. Schedules are advertised with SYNC frames that
//! carry the time until the sender's next window.

use heapless::Vec;
use log::{debug, info, warn};
use strum::IntoStaticStr;

use crate::{Ts, TICKS_PER_SECOND, clock::Clock, error::MacError};
use crate::packet::{Address, NodeId, Packet};
use crate::radio::Radio;
use crate::routing::Routing;
use crate::timers::TimerId;

use super::{Core, Protocol, config::*};
use super::ca::*;

pub const TIMER_SCHED: TimerId = 2;

pub const SYNC_CONTEND_TIME: Ts = 300;

/// Simulated SYNC payload in bytes
pub const SYNC_SIZE: usize = 2;

/// Foreign schedules remembered
pub const MAX_SCHEDULES: usize = 10;

const RESYNC_LOW: i64 = 100;
const RESYNC_HIGH: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum ScheduleState {
    Sleep,
    /// Inside the own listen window
    Own,
    /// Inside a foreign listen window
    Other,
    /// Waiting to hear a schedule
    Startup,
}

#[derive(Debug, PartialEq)]
pub struct SmacMode {
    config: SmacConfig,
    hs: Handshake,

    sched: ScheduleState,
    /// Start of the current (or last) own frame
    time_last_sched: i64,
    /// Foreign schedule offsets into the own frame, oldest first
    schedules: Vec<i64, MAX_SCHEDULES>,

    must_send_sync: bool,
    resync_counter: i64,
}

impl SmacMode {
    fn new(config: SmacConfig) -> Self {
        Self {
            config,
            hs: Handshake::new(Backoff::new(RTS_CONTEND_TIME, RTS_CONTEND_TIME)),
            sched: ScheduleState::Startup,
            time_last_sched: 0,
            schedules: Vec::new(),
            must_send_sync: false,
            resync_counter: 0,
        }
    }

    pub fn schedule_state(&self) -> ScheduleState {
        self.sched
    }

    pub fn handshake_state(&self) -> CaState {
        self.hs.state
    }

    pub fn time_last_sched(&self) -> i64 {
        self.time_last_sched
    }

    pub fn schedules(&self) -> impl Iterator<Item=&i64> {
        self.schedules.iter()
    }

    pub fn must_send_sync(&self) -> bool {
        self.must_send_sync
    }

    pub fn pending(&self) -> Option<&Packet> {
        self.hs.tx_msg.as_ref()
    }

    fn frame_time(&self) -> i64 {
        self.config.frame_time as i64
    }

    /// Whether frame starts `a` and `b` belong to the same schedule,
    /// tolerating drift either side
    pub fn is_same_schedule(&self, a: i64, b: i64) -> bool {
        let ft = self.frame_time();
        let offset = (a - b).rem_euclid(ft);
        offset.min(ft - offset) < self.config.allowed_drift as i64
    }

    /// Remember a foreign schedule, evicting the oldest when full
    pub fn adopt_schedule(&mut self, offset: i64) {
        if self.schedules.is_full() {
            self.schedules.rotate_left(1);
            if let Some(old) = self.schedules.pop() {
                warn!("Schedule table full, forgetting offset {}", old);
            }
        }
        let _ = self.schedules.push(offset);
        self.must_send_sync = true;
    }
}

impl CaMode for SmacMode {
    fn handshake(&self) -> &Handshake {
        &self.hs
    }

    fn handshake_mut(&mut self) -> &mut Handshake {
        &mut self.hs
    }
}

impl <R, U, T> Core<R, U, T, SmacMode>
where
    R: Radio,
    U: Routing,
    T: Clock,
{
    /// Create a new S-MAC, the node listens for a schedule to follow
    /// before falling back to its own
    pub fn new_smac(id: NodeId, radio: R, routing: U, clock: T, core_config: CoreConfig, smac_config: SmacConfig) -> Result<Self, MacError<R::Error>> {
        if smac_config.listen_time == 0 || smac_config.frame_time < smac_config.listen_time {
            return Err(MacError::InvalidState("S-MAC listen time must be within the frame"));
        }

        let mut c = Core::with_mode(id, radio, routing, clock, core_config, HEADER_LENGTH, SmacMode::new(smac_config))?;

        let ft = c.mode.config.frame_time;
        let sync_at = c.uniform(ft, 10 * ft);
        debug!("Node {} S-MAC starting, own schedule in {} ticks", id, sync_at);

        c.set_timeout(sync_at, TIMER_SCHED)?;
        c.listen()?;

        Ok(c)
    }

    /// Estimated SYNC airtime in ticks
    fn est_sync_time(&self) -> i64 {
        (self.frame_total_time(SYNC_SIZE + self.header_length) * TICKS_PER_SECOND as f64) as i64
    }

    fn new_resync_counter(&mut self) -> i64 {
        let ft = self.mode.frame_time();
        let low = RESYNC_LOW * 20000 / ft;
        let high = RESYNC_HIGH * 20000 / ft;
        self.uniform(low.max(0) as Ts, high.max(0) as Ts) as i64
    }

    fn set_my_schedule(&mut self, time: i64) -> Result<(), MacError<R::Error>> {
        let ft = self.mode.frame_time();
        let now = self.now() as i64;

        self.mode.time_last_sched = now + time.rem_euclid(ft) - ft;
        self.mode.must_send_sync = true;
        self.mode.resync_counter = self.new_resync_counter();

        info!("Node {} schedule set, offset {}", self.id, self.mode.time_last_sched.rem_euclid(ft));

        self.calc_sched_state()
    }

    fn set_sched_timeout(&mut self, ticks: i64) -> Result<(), MacError<R::Error>> {
        self.set_timeout(ticks.max(1) as Ts, TIMER_SCHED)
    }

    /// Place the current time in the own window, a foreign window or
    /// sleep, arming the schedule timer for the next change
    fn calc_sched_state(&mut self) -> Result<(), MacError<R::Error>> {
        let ft = self.mode.frame_time();
        let listen = self.mode.config.listen_time as i64;
        let now = self.now() as i64;

        let mut in_f = now - self.mode.time_last_sched;
        while in_f >= ft + listen {
            self.mode.time_last_sched += ft;
            in_f -= ft;
        }
        while in_f < 0 {
            self.mode.time_last_sched -= ft;
            in_f += ft;
        }

        if in_f < listen {
            self.mode.sched = ScheduleState::Own;
            debug!("Node {} in own window, {} left", self.id, listen - in_f);
            return self.set_sched_timeout(listen - in_f);
        }

        if in_f > ft - 5 {
            self.mode.time_last_sched += ft;
            in_f -= ft;

            if in_f == 0 {
                self.mode.resync_counter -= 1;
                if self.mode.resync_counter <= 0 {
                    self.mode.must_send_sync = true;
                    self.mode.resync_counter = self.new_resync_counter();
                }
            }

            self.mode.sched = ScheduleState::Own;
            debug!("Node {} in next own window, {} left", self.id, listen - in_f);
            return self.set_sched_timeout(listen - in_f);
        }

        let foreign = self.mode.schedules.iter()
            .find(|s| in_f >= **s && in_f < **s + listen)
            .copied();

        if let Some(s) = foreign {
            self.mode.sched = ScheduleState::Other;
            let end = (s + listen).min(ft);
            debug!("Node {} in foreign window {}, {} left", self.id, s, end - in_f);
            return self.set_sched_timeout(end - in_f);
        }

        let wake_at = self.mode.schedules.iter()
            .filter(|s| **s > in_f)
            .fold(ft, |w, s| w.min(*s));

        self.mode.sched = ScheduleState::Sleep;
        debug!("Node {} outside any window, {} left", self.id, wake_at - in_f);
        self.set_sched_timeout(wake_at - in_f)?;
        self.sleep()
    }

    fn sched_timeout(&mut self) -> Result<(), MacError<R::Error>> {
        if self.mode.sched == ScheduleState::Startup {
            info!("Node {} heard no schedule, adopting its own", self.id);
            self.set_my_schedule(0)?;
        } else {
            self.calc_sched_state()?;
        }
        self.eval_state()
    }
}

impl <R, U, T> CaHooks<R::Error> for Core<R, U, T, SmacMode>
where
    R: Radio,
    U: Routing,
    T: Clock,
{
    fn eval_state(&mut self) -> Result<(), MacError<R::Error>> {
        if self.mode.hs.state != CaState::Idle || self.base.is_receiving() {
            return Ok(());
        }

        if self.mode.hs.nav.is_busy() || self.mode.sched == ScheduleState::Sleep {
            debug!("Node {} idle sleeping", self.id);
            return self.sleep();
        }

        if self.mode.must_send_sync {
            debug!("Node {} preparing to send SYNC", self.id);
            self.mode.hs.next = Some(CaState::SendSync);
            return self.start_contending(SYNC_CONTEND_TIME);
        }

        let broadcast = match self.mode.hs.tx_msg.as_ref() {
            Some(p) if self.mode.sched == ScheduleState::Own => p.is_broadcast(),
            _ => {
                debug!("Node {} idle listening", self.id);
                return self.listen();
            }
        };

        if broadcast {
            debug!("Node {} preparing to send data", self.id);
            self.mode.hs.next = Some(CaState::SendData);
            self.start_contending(RTS_CONTEND_TIME)
        } else {
            debug!("Node {} preparing to send RTS", self.id);
            self.mode.hs.next = Some(CaState::SendRts);
            let t = self.mode.hs.backoff.current();
            self.start_contending(t)
        }
    }

    fn set_idle(&mut self) -> Result<(), MacError<R::Error>> {
        self.mode.hs.state = CaState::Idle;
        if self.mode.sched != ScheduleState::Startup {
            self.calc_sched_state()?;
        }
        self.eval_state()
    }

    fn send_sync(&mut self) -> Result<(), MacError<R::Error>> {
        debug!("Node {} sending SYNC", self.id);

        self.mode.must_send_sync = false;
        self.mode.hs.state = CaState::SendSync;

        let ft = self.mode.frame_time();
        let est = self.est_sync_time();
        let now = self.now() as i64;

        // Advertise the window after next if this SYNC would overrun the next
        let mut stime = self.mode.time_last_sched + ft - now;
        while stime <= est {
            stime += ft;
        }
        stime -= est;

        let mut p = Packet::new(Address::Broadcast);
        let header = CaHeader{ sync: header_ticks(stime as Ts), ..CaHeader::new(FrameKind::Sync) };
        header.attach(&mut p, SYNC_SIZE);

        self.transmit_mode()?;
        self.reg_tx_overhead(&p);
        self.start_transmit(p)
    }

    fn receive_sync(&mut self, packet: Packet, header: CaHeader) -> Result<(), MacError<R::Error>> {
        self.reg_rx_overhead(&packet);
        let stime = header.sync as i64;

        if self.mode.sched == ScheduleState::Startup {
            debug!("Node {} received SYNC from {:?}, following", self.id, packet.local_from);
            self.cancel_timeout(TIMER_SCHED)?;
            return self.set_my_schedule(stime);
        }

        let ftime = self.now() as i64 + stime;
        let tls = self.mode.time_last_sched;

        if self.mode.is_same_schedule(ftime, tls) {
            debug!("Node {} received SYNC, own schedule", self.id);
            return Ok(());
        }

        if self.mode.schedules.iter().any(|s| self.mode.is_same_schedule(ftime, tls + *s)) {
            debug!("Node {} received SYNC, known schedule", self.id);
            return Ok(());
        }

        let offset = (ftime - tls).rem_euclid(self.mode.frame_time());
        info!("Node {} adopting foreign schedule at offset {}", self.id, offset);
        self.mode.adopt_schedule(offset);

        Ok(())
    }
}

impl <R, U, T> Protocol<R::Error> for Core<R, U, T, SmacMode>
where
    R: Radio,
    U: Routing,
    T: Clock,
{
    fn tx_packet(&mut self, packet: Packet) -> Result<(), MacError<R::Error>> {
        if self.mode.hs.tx_msg.is_some() {
            warn!("Node {} got packet while busy, dropping", self.id);
            self.stats.tx_drop = self.stats.tx_drop.saturating_add(1);
            return Ok(());
        }

        self.mode.hs.attempts_left = Some(self.mode.config.packet_retries);
        self.mode.hs.tx_msg = Some(packet);
        self.eval_state()
    }

    fn rx_frame(&mut self, packet: Packet) -> Result<(), MacError<R::Error>> {
        if self.mode.sched == ScheduleState::Sleep {
            debug!("Node {} asleep, dropping frame", self.id);
            return Ok(());
        }

        let header = CaHeader::from_packet(&packet)?;

        if self.abandon_wait(&packet, &header)?.is_some() {
            self.handshake_failed();
        }

        self.receive_frame(packet, header)?;
        self.eval_state()
    }

    fn rx_started(&mut self) -> Result<(), MacError<R::Error>> {
        self.handshake_rx_started()
    }

    fn rx_failed(&mut self) -> Result<(), MacError<R::Error>> {
        if self.mode.sched != ScheduleState::Sleep {
            self.eval_state()?;
        }
        Ok(())
    }

    fn transmit_done(&mut self) -> Result<(), MacError<R::Error>> {
        self.handshake_transmitted()
    }

    fn timeout(&mut self, which: TimerId) -> Result<(), MacError<R::Error>> {
        match which {
            TIMER_PROTOCOL => match self.mode.hs.state {
                CaState::Contend => self.contention_fired(),
                CaState::WaitForCts | CaState::WaitForAck => {
                    debug!("Node {} {:?} timeout", self.id, self.mode.hs.state);
                    self.handshake_failed();
                    self.set_idle()
                },
                CaState::WaitForData => {
                    debug!("Node {} wait for data timeout", self.id);
                    self.set_idle()
                },
                _ => Err(MacError::InvalidState("protocol timer fired outside a timed state")),
            },
            TIMER_NAV => self.nav_timeout(),
            TIMER_SCHED => self.sched_timeout(),
            _ => Err(MacError::InvalidState("unknown S-MAC timer")),
        }
    }

    fn end_force(&mut self) -> Result<(), MacError<R::Error>> {
        if self.mode.sched == ScheduleState::Sleep {
            self.sleep()?;
        }
        if self.mode.sched != ScheduleState::Startup {
            self.calc_sched_state()?;
        }
        self.eval_state()
    }
}

#[cfg(test)]
mod test {
    use std::vec::Vec;

    use crate::{radio::RadioEvent, mac::Mac};
    use crate::clock::mock::SimClock;
    use crate::radio::{RadioMode, mock::MockRadio};
    use crate::routing::{FailReason, mock::{MockRouting, Upcall}};
    use crate::mac::ca::test::frame;
    use super::*;

    type Smac = Core<MockRadio, MockRouting, SimClock, SmacMode>;

    const FT: Ts = 32768;
    const LISTEN: Ts = 1000;

    fn setup(id: NodeId) -> (SimClock, MockRadio, MockRouting, Smac) {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());
        let clock = SimClock::new();
        let radio = MockRadio::new();
        let routing = MockRouting::new();
        let mac = Core::new_smac(id, radio.clone(), routing.clone(), clock.clone(), CoreConfig::default(), SmacConfig::default()).unwrap();
        (clock, radio, routing, mac)
    }

    fn step(clock: &SimClock, mac: &mut Smac) -> Ts {
        let t = mac.next_deadline().unwrap();
        clock.set(t);
        mac.tick().unwrap();
        t
    }

    /// Step, completing any transmission the MAC starts
    fn step_complete(clock: &SimClock, radio: &MockRadio, mac: &mut Smac) -> Vec<CaHeader> {
        step(clock, mac);
        let sent: Vec<_> = radio.frames().iter().map(|p| CaHeader::from_packet(p).unwrap()).collect();
        if !sent.is_empty() {
            mac.handle_radio(RadioEvent::TransmitComplete).unwrap();
        }
        sent
    }

    fn receive(mac: &mut Smac, p: Packet) {
        mac.handle_radio(RadioEvent::ReceptionStarted).unwrap();
        mac.handle_radio(RadioEvent::FrameReceived(p)).unwrap();
    }

    /// Boot a node onto its own schedule, SYNC sent, window closed
    fn own_schedule(clock: &SimClock, radio: &MockRadio, mac: &mut Smac) -> Ts {
        let t0 = step(clock, mac);
        assert!(t0 >= FT && t0 <= 10 * FT);
        assert_eq!(mac.mode().schedule_state(), ScheduleState::Own);
        assert_eq!(mac.mode().time_last_sched(), t0 as i64);
        assert!(mac.mode().must_send_sync());

        let sent = step_complete(clock, radio, mac);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, FrameKind::Sync);
        assert!(!mac.mode().must_send_sync());
        t0
    }

    #[test]
    fn startup_adopts_own_schedule() {
        let (clock, radio, _routing, mut mac) = setup(1);
        assert_eq!(mac.mode().schedule_state(), ScheduleState::Startup);

        let t0 = step(&clock, &mut mac);
        let sent = step_complete(&clock, &radio, &mut mac);
        assert_eq!(sent[0].kind, FrameKind::Sync);

        // SYNC advertises the time to the next window less its own airtime
        let est = mac.est_sync_time();
        let sent_at = clock.now() as i64;
        assert_eq!(sent[0].sync as i64, t0 as i64 + FT as i64 - sent_at - est);

        // Own window closes, sleep until the next frame
        assert_eq!(step(&clock, &mut mac), t0 + LISTEN);
        assert_eq!(mac.mode().schedule_state(), ScheduleState::Sleep);
        assert_eq!(radio.mode(), Some(RadioMode::Sleep));

        assert_eq!(step(&clock, &mut mac), t0 + FT);
        assert_eq!(mac.mode().schedule_state(), ScheduleState::Own);
        assert_eq!(mac.mode().time_last_sched(), (t0 + FT) as i64);
        assert_eq!(radio.mode(), Some(RadioMode::Listen));
    }

    #[test]
    fn startup_follows_sync() {
        let (clock, _radio, _routing, mut mac) = setup(2);

        clock.set(100);
        let sync = CaHeader{ sync: 1000, ..CaHeader::new(FrameKind::Sync) };
        receive(&mut mac, frame(1, Address::Broadcast, sync, SYNC_SIZE));

        // Sender's window starts at 1100
        assert_eq!(mac.mode().schedule_state(), ScheduleState::Sleep);
        assert_eq!(mac.mode().time_last_sched(), 1100 - FT as i64);
        assert!(mac.mode().must_send_sync());

        assert_eq!(step(&clock, &mut mac), 1100);
        assert_eq!(mac.mode().schedule_state(), ScheduleState::Own);
        assert_eq!(mac.mode().handshake_state(), CaState::Contend);
    }

    #[test]
    fn foreign_schedules_merged() {
        let (clock, radio, _routing, mut mac) = setup(1);
        let t0 = own_schedule(&clock, &radio, &mut mac) as i64;

        // Still in the own window, hear a schedule offset by 5000
        let now = clock.now() as i64;
        let sync = CaHeader{ sync: (t0 + 5000 - now) as u16, ..CaHeader::new(FrameKind::Sync) };
        receive(&mut mac, frame(3, Address::Broadcast, sync, SYNC_SIZE));
        assert_eq!(mac.mode().schedules().copied().collect::<Vec<_>>(), [5000]);
        assert!(mac.mode().must_send_sync());

        // Within the allowed drift of a known schedule
        let sync = CaHeader{ sync: (t0 + 5020 - now) as u16, ..CaHeader::new(FrameKind::Sync) };
        receive(&mut mac, frame(4, Address::Broadcast, sync, SYNC_SIZE));
        assert_eq!(mac.mode().schedules().count(), 1);

        // Slightly early relative to the own schedule
        let sync = CaHeader{ sync: (t0 + FT as i64 - 10 - now) as u16, ..CaHeader::new(FrameKind::Sync) };
        receive(&mut mac, frame(5, Address::Broadcast, sync, SYNC_SIZE));
        assert_eq!(mac.mode().schedules().count(), 1);
    }

    #[test]
    fn foreign_window_keeps_node_awake() {
        let (clock, radio, _routing, mut mac) = setup(1);
        let t0 = own_schedule(&clock, &radio, &mut mac);

        let now = clock.now();
        let sync = CaHeader{ sync: (t0 + 5000 - now) as u16, ..CaHeader::new(FrameKind::Sync) };
        receive(&mut mac, frame(3, Address::Broadcast, sync, SYNC_SIZE));

        // Advertise the merged table, then wait out the own window
        let sent = step_complete(&clock, &radio, &mut mac);
        assert_eq!(sent[0].kind, FrameKind::Sync);
        assert_eq!(step(&clock, &mut mac), t0 + LISTEN);
        assert_eq!(mac.mode().schedule_state(), ScheduleState::Sleep);

        assert_eq!(step(&clock, &mut mac), t0 + 5000);
        assert_eq!(mac.mode().schedule_state(), ScheduleState::Other);
        assert_eq!(radio.mode(), Some(RadioMode::Listen));

        assert_eq!(step(&clock, &mut mac), t0 + 5000 + LISTEN);
        assert_eq!(mac.mode().schedule_state(), ScheduleState::Sleep);
    }

    #[test]
    fn schedule_table_evicts_oldest() {
        let mut mode = SmacMode::new(SmacConfig::default());
        for i in 0..=MAX_SCHEDULES as i64 {
            mode.adopt_schedule(1000 * (i + 1));
        }
        let s: Vec<_> = mode.schedules().copied().collect();
        assert_eq!(s.len(), MAX_SCHEDULES);
        assert_eq!(s[0], 2000);
        assert_eq!(s[MAX_SCHEDULES - 1], 11000);
    }

    #[test]
    fn drift_is_symmetric() {
        let mode = SmacMode::new(SmacConfig::default());
        assert!(mode.is_same_schedule(1010, 1000));
        assert!(mode.is_same_schedule(1000, 1010));
        assert!(mode.is_same_schedule(FT as i64 + 990, 1000));
        assert!(!mode.is_same_schedule(1030, 1000));
        assert!(!mode.is_same_schedule(1000, 1030));
    }

    #[test]
    fn data_waits_for_own_window() {
        let (clock, radio, _routing, mut mac) = setup(1);
        let t0 = own_schedule(&clock, &radio, &mut mac);
        assert_eq!(step(&clock, &mut mac), t0 + LISTEN);

        // Asleep, nothing happens until the next own window
        mac.transmit(Packet::data(1, Address::Node(2), &[0u8; 10])).unwrap();
        assert_eq!(mac.mode().handshake_state(), CaState::Idle);
        assert_eq!(mac.next_deadline(), Some(t0 + FT));

        step(&clock, &mut mac);
        assert_eq!(mac.mode().handshake_state(), CaState::Contend);
        let sent = step_complete(&clock, &radio, &mut mac);
        assert_eq!(sent[0].kind, FrameKind::Rts);
    }

    #[test]
    fn frames_dropped_while_asleep() {
        let (clock, radio, routing, mut mac) = setup(1);
        let t0 = own_schedule(&clock, &radio, &mut mac);
        assert_eq!(step(&clock, &mut mac), t0 + LISTEN);

        let mut data = Packet::data(2, Address::Broadcast, &[1, 2]);
        data.local_from = Some(2);
        CaHeader::new(FrameKind::Data).attach(&mut data, 0);
        data.increase_length(HEADER_LENGTH);
        receive(&mut mac, data);

        assert_eq!(routing.received(), 0);
    }

    #[test]
    fn retries_exhausted() {
        let (clock, radio, routing, mut mac) = setup(1);
        own_schedule(&clock, &radio, &mut mac);

        mac.transmit(Packet::data(1, Address::Node(2), &[0u8; 10])).unwrap();

        let mut rts = 0;
        for _ in 0..200 {
            let sent = step_complete(&clock, &radio, &mut mac);
            rts += sent.iter().filter(|h| h.kind == FrameKind::Rts).count();
            if routing.failed() > 0 {
                break;
            }
        }

        assert_eq!(rts, 3);
        let up = routing.take();
        assert!(matches!(up.as_slice(), [Upcall::Failed(_, FailReason::RetryExhausted)]));
        assert_eq!(mac.stats().tx_drop, 1);
        assert!(mac.mode().pending().is_none());
    }
}
