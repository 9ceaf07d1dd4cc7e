
use log::{trace, debug, warn};

use rand::{Rng, SeedableRng, rngs::SmallRng};

use crate::{Ts, TICKS_PER_SECOND};
use crate::base::{Base, PROTOCOL_TIMERS, LPL_TIMER};
use crate::clock::Clock;
use crate::error::MacError;
use crate::packet::{NodeId, Packet, PacketKind, Layer, frame_data_time};
use crate::radio::{Radio, RadioEvent};
use crate::routing::{Routing, FailReason};
use crate::timers::{TimerId, Timers};

use super::{Mac, Protocol, RoutingRequest, config::CoreConfig, sift::Sift};

/// MAC statistics, airtime in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MacStats {
    /// Packets delivered to their next hop
    pub tx: u32,
    /// Packets received for this node
    pub rx: u32,
    /// Packets dropped on send (busy or retries exhausted)
    pub tx_drop: u32,

    pub time_tx_data: f64,
    pub time_tx_overhead: f64,
    pub time_rx_data: f64,
    pub time_rx_overhead: f64,
    pub time_rx_overhear: f64,
}

/// Shared MAC core
/// Generic over a Radio (R), Routing layer (U), Clock (T) and Mode (M)
pub struct Core<R, U, T, M> {
    pub(crate) id: NodeId,
    pub(crate) config: CoreConfig,
    pub(crate) header_length: usize,

    pub(crate) base: Base<R>,
    pub(crate) routing: U,
    pub(crate) timers: Timers<T>,

    pub(crate) rng: SmallRng,
    pub(crate) sift: Sift,

    pub(crate) stats: MacStats,
    pub(crate) tx_preferred: bool,

    pub(crate) mode: M,
}

impl <R, U, T, M> Core<R, U, T, M>
where
    R: Radio,
    U: Routing,
    T: Clock,
{
    /// Build the shared core, protocol constructors finish initialisation
    pub(crate) fn with_mode(id: NodeId, radio: R, routing: U, clock: T, config: CoreConfig, header_length: usize, mode: M) -> Result<Self, MacError<R::Error>> {
        let mut timers = Timers::new(clock);
        timers.preallocate(PROTOCOL_TIMERS + 1);

        let seed = config.seed ^ (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);

        let mut c = Self {
            id,
            base: Base::new(radio, config.lpl),
            sift: Sift::new(config.sift_nodes),
            config,
            header_length,
            routing,
            timers,
            rng: SmallRng::seed_from_u64(seed),
            stats: MacStats::default(),
            tx_preferred: false,
            mode,
        };

        if let Some(l) = c.config.lpl {
            let first = c.uniform(1, l.off_time);
            c.base.start(&mut c.timers, first)?;
        }

        Ok(c)
    }

    pub fn base(&self) -> &Base<R> {
        &self.base
    }

    pub fn routing(&self) -> &U {
        &self.routing
    }

    pub fn mode(&self) -> &M {
        &self.mode
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> Ts {
        self.timers.now()
    }

    /// Uniform integer in `[low, high]`, `low` when the range is empty
    pub(crate) fn uniform(&mut self, low: Ts, high: Ts) -> Ts {
        if low >= high {
            return low;
        }
        self.rng.gen_range(low..=high)
    }

    /// Uniform value in `[0, 1)`
    pub(crate) fn chance(&mut self) -> f64 {
        self.rng.gen()
    }

    pub(crate) fn sift_slot(&mut self, low: Ts, high: Ts) -> Ts {
        self.sift.slot(&mut self.rng, low, high)
    }

    /// Airtime in seconds for a frame of `bytes`, including the preamble
    pub(crate) fn frame_total_time(&self, bytes: usize) -> f64 {
        self.base.preamble_time() + frame_data_time(bytes)
    }

    /// Ticks to send a frame with `bytes` of payload plus the MAC header
    pub(crate) fn flength(&self, bytes: usize) -> Ts {
        (self.frame_total_time(bytes + self.header_length) * TICKS_PER_SECOND as f64) as Ts + 1
    }

    pub(crate) fn set_timeout(&mut self, ticks: Ts, which: TimerId) -> Result<(), MacError<R::Error>> {
        if ticks == 0 {
            return Err(MacError::InvalidState("zero tick timeout"));
        }
        if which >= PROTOCOL_TIMERS {
            return Err(MacError::InvalidState("protocol timer index out of range"));
        }
        self.timers.schedule(which, ticks)?;
        Ok(())
    }

    pub(crate) fn cancel_timeout(&mut self, which: TimerId) -> Result<(), MacError<R::Error>> {
        self.timers.cancel(which)?;
        Ok(())
    }

    pub(crate) fn listen(&mut self) -> Result<(), MacError<R::Error>> {
        self.base.listen(&mut self.timers)
    }

    pub(crate) fn sleep(&mut self) -> Result<(), MacError<R::Error>> {
        self.base.sleep(&mut self.timers)
    }

    pub(crate) fn transmit_mode(&mut self) -> Result<(), MacError<R::Error>> {
        self.base.transmit_mode(&mut self.timers)
    }

    fn airtime(&self, p: &Packet) -> f64 {
        self.frame_total_time(p.length() + self.header_length)
    }

    pub(crate) fn reg_tx_data(&mut self, p: &Packet) {
        self.stats.time_tx_data += self.airtime(p);
    }

    pub(crate) fn reg_tx_overhead(&mut self, p: &Packet) {
        self.stats.time_tx_overhead += self.airtime(p);
    }

    pub(crate) fn reg_rx_data(&mut self, p: &Packet) {
        self.stats.time_rx_data += self.airtime(p);
    }

    pub(crate) fn reg_rx_overhead(&mut self, p: &Packet) {
        self.stats.time_rx_overhead += self.airtime(p);
    }

    pub(crate) fn reg_rx_overhear(&mut self, p: &Packet) {
        self.stats.time_rx_overhear += self.airtime(p);
    }

    /// Hand a frame to the radio, adding the MAC header overhead
    pub(crate) fn start_transmit(&mut self, mut packet: Packet) -> Result<(), MacError<R::Error>> {
        packet.preamble_time = self.base.preamble_time();
        packet.increase_length(self.header_length);
        packet.kind = PacketKind::Tx;
        packet.local_from = Some(self.id);

        trace!("Node {} transmitting {} bytes to {:?} at {}", self.id, packet.length(), packet.local_to, self.now());

        self.base.start_transmit(packet)
    }

    /// Pass a received packet up to routing, MAC data removed
    pub(crate) fn rx_packet(&mut self, mut packet: Packet) {
        packet.discard_data(Layer::Mac);
        packet.kind = PacketKind::Rx;
        self.routing.receive(packet);
    }

    /// Report a delivered packet
    pub(crate) fn tx_done(&mut self, mut packet: Packet) {
        debug!("Node {} delivered packet to {:?}", self.id, packet.local_to);
        packet.kind = PacketKind::TxDone;
        self.tx_preferred = false;
        self.routing.packet_delivered(packet);
    }

    /// Report a packet given up on
    pub(crate) fn tx_failed(&mut self, mut packet: Packet, reason: FailReason) {
        debug!("Node {} failed packet to {:?}: {:?}", self.id, packet.local_to, reason);
        packet.kind = reason.kind();
        self.tx_preferred = false;
        self.routing.packet_failed(packet, reason);
    }
}

impl <R, U, T, M> Mac for Core<R, U, T, M>
where
    R: Radio,
    U: Routing,
    T: Clock,
    Self: Protocol<R::Error>,
{
    type Error = MacError<R::Error>;

    fn id(&self) -> NodeId {
        self.id
    }

    fn header_length(&self) -> usize {
        self.header_length
    }

    fn tx_preferred(&self) -> bool {
        self.tx_preferred
    }

    fn transmit(&mut self, mut packet: Packet) -> Result<(), Self::Error> {
        if packet.local_to.is_node(self.id) {
            return Err(MacError::InvalidState("packet addressed to self"));
        }

        trace!("Node {} transmit request to {:?} at {}", self.id, packet.local_to, self.now());

        packet.kind = PacketKind::Tx;
        self.tx_packet(packet)
    }

    fn handle_radio(&mut self, event: RadioEvent) -> Result<(), Self::Error> {
        match event {
            RadioEvent::Rssi(v) => {
                if self.base.rssi_sample(&mut self.timers, v)? {
                    self.rx_failed()?;
                }
            },
            RadioEvent::ReceptionStarted => {
                trace!("Node {} reception started at {}", self.id, self.now());
                self.base.reception_started(&mut self.timers)?;
                self.rx_started()?;
            },
            RadioEvent::ReceptionFailed => {
                trace!("Node {} reception failed at {}", self.id, self.now());
                self.base.reception_failed(&mut self.timers)?;
                self.rx_failed()?;
            },
            RadioEvent::HeaderReceived(p) => {
                self.rx_header(&p)?;
            },
            RadioEvent::FrameReceived(mut p) => {
                if !self.base.frame_received(&mut self.timers)? {
                    warn!("Node {} dropping frame, sleep pending", self.id);
                    return Ok(());
                }
                if p.length() < self.header_length {
                    return Err(MacError::InvalidState("frame shorter than MAC header"));
                }
                p.decrease_length(self.header_length);
                p.kind = PacketKind::Rx;
                self.rx_frame(p)?;
            },
            RadioEvent::TransmitComplete => {
                self.base.transmit_complete()?;
                self.transmit_done()?;
            },
        }

        Ok(())
    }

    fn handle_routing(&mut self, request: RoutingRequest) -> Result<(), Self::Error> {
        match request {
            RoutingRequest::PreferTx => {
                self.tx_preferred = true;
            },
            RoutingRequest::ForceAwake => {
                self.base.force_awake();
                self.routing.force_granted(true);
            },
            RoutingRequest::ForceEnd => {
                self.base.force_end()?;
                self.end_force()?;
            },
        }
        Ok(())
    }

    fn next_deadline(&self) -> Option<Ts> {
        self.timers.next_deadline()
    }

    fn tick(&mut self) -> Result<(), Self::Error> {
        while let Some(e) = self.timers.poll() {
            if e.index == LPL_TIMER {
                if self.base.lpl_timeout(&mut self.timers)? {
                    self.rx_failed()?;
                }
            } else {
                self.timeout(e.index)?;
            }
        }
        Ok(())
    }

    fn stats(&self) -> MacStats {
        self.stats
    }
}

#[cfg(test)]
pub(crate) mod test {
    use crate::clock::mock::SimClock;
    use crate::radio::mock::MockRadio;
    use crate::routing::mock::MockRouting;
    use crate::base::LplConfig;
    use super::*;

    pub(crate) type MockCore<M> = Core<MockRadio, MockRouting, SimClock, M>;

    pub(crate) fn setup<M>(id: NodeId, config: CoreConfig, header_length: usize, mode: M) -> (SimClock, MockRadio, MockRouting, MockCore<M>) {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());
        let clock = SimClock::new();
        let radio = MockRadio::new();
        let routing = MockRouting::new();
        let core = Core::with_mode(id, radio.clone(), routing.clone(), clock.clone(), config, header_length, mode).unwrap();
        (clock, radio, routing, core)
    }

    #[test]
    fn uniform_inclusive() {
        let (_clock, _radio, _routing, mut core) = setup(1, CoreConfig::default(), 0, ());

        let (mut lo, mut hi) = (false, false);
        for _ in 0..1000 {
            let v = core.uniform(1, 3);
            assert!(v >= 1 && v <= 3);
            lo |= v == 1;
            hi |= v == 3;
        }
        assert!(lo && hi);
        assert_eq!(core.uniform(5, 5), 5);
    }

    #[test]
    fn seeded_per_node() {
        let (_c, _r, _u, mut a) = setup(1, CoreConfig::default(), 0, ());
        let (_c, _r, _u, mut b) = setup(1, CoreConfig::default(), 0, ());
        let (_c, _r, _u, mut c) = setup(2, CoreConfig::default(), 0, ());

        let va: [Ts; 4] = [a.uniform(0, 1 << 20), a.uniform(0, 1 << 20), a.uniform(0, 1 << 20), a.uniform(0, 1 << 20)];
        let vb: [Ts; 4] = [b.uniform(0, 1 << 20), b.uniform(0, 1 << 20), b.uniform(0, 1 << 20), b.uniform(0, 1 << 20)];
        let vc: [Ts; 4] = [c.uniform(0, 1 << 20), c.uniform(0, 1 << 20), c.uniform(0, 1 << 20), c.uniform(0, 1 << 20)];
        assert_eq!(va, vb);
        assert_ne!(va, vc);
    }

    #[test]
    fn zero_timeout_rejected() {
        let (_clock, _radio, _routing, mut core) = setup(1, CoreConfig::default(), 0, ());

        assert!(core.set_timeout(0, 0).is_err());
        assert!(core.set_timeout(10, LPL_TIMER).is_err());
        core.set_timeout(10, 4).unwrap();
        assert_eq!(core.timers.remaining(4), Ok(Some(10)));
    }

    #[test]
    fn frame_lengths() {
        let (_clock, _radio, _routing, core) = setup(1, CoreConfig::default(), 5, ());

        let t = crate::packet::PREAMBLE_TIME + frame_data_time(5);
        assert!((core.frame_total_time(5) - t).abs() < 1e-12);
        assert_eq!(core.flength(0), (t * 32768.0) as Ts + 1);

        // LPL stretches the preamble over a full duty cycle
        let lpl = CoreConfig{ lpl: Some(LplConfig::default()), ..Default::default() };
        let (_clock, _radio, _routing, core) = setup(1, lpl, 5, ());
        let extra = core.frame_total_time(5) - t;
        assert!((extra - 10.0 / 32768.0).abs() < 1e-12);
    }

    #[test]
    fn airtime_accounting() {
        let (_clock, _radio, _routing, mut core) = setup(1, CoreConfig::default(), 5, ());

        let p = Packet::data(1, crate::packet::Address::Node(2), &[0u8; 20]);
        core.reg_tx_data(&p);
        core.reg_rx_overhear(&p);

        let t = core.frame_total_time(25);
        assert!((core.stats.time_tx_data - t).abs() < 1e-12);
        assert!((core.stats.time_rx_overhear - t).abs() < 1e-12);
        assert_eq!(core.stats.time_rx_data, 0.0);
    }

    #[test]
    fn lpl_timer_armed_at_start() {
        let config = CoreConfig{ lpl: Some(LplConfig::default()), ..Default::default() };
        let (_clock, _radio, _routing, core) = setup(3, config, 0, ());

        let r = core.timers.remaining(LPL_TIMER).unwrap().unwrap();
        assert!(r >= 1 && r <= 9);
    }
}
