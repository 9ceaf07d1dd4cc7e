//! Radio mediation shared by all MACs
//!
//! [`Base`] owns the radio and is the only path through which a MAC
//! issues radio commands. It runs the low power listening (LPL) duty
//! cycle on [`LPL_TIMER`] and implements the force awake protocol, which
//! defers sleep requests while the routing layer holds the node awake.

use log::{trace, debug, warn};

use crate::{Ts, clock::Clock, error::MacError, packet::{Packet, PREAMBLE_TIME}};
use crate::radio::Radio;
use crate::timers::{TimerId, Timers};

/// Number of timer indexes reserved for protocol use
pub const PROTOCOL_TIMERS: TimerId = 5;

/// Timer index used by the LPL duty cycle
pub const LPL_TIMER: TimerId = PROTOCOL_TIMERS;

/// RSSI level above which the channel is considered busy
pub const RSSI_THRESHOLD: f64 = 0.5;

/// Ticks to sleep after a frame with LPL, the sender's radio is still on
const LPL_POST_FRAME_SLEEP: Ts = 2;

/// Receive side state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Sampling the channel
    Sense,
    /// Receiving a frame
    Frame,
    /// Duty cycled off
    Sleep,
    /// Energy detected, waiting for a start symbol
    PreambleDetect,
}

/// Force awake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceState {
    Normal,
    /// Held awake by the routing layer
    NoSleep,
    /// Held awake, with a sleep request deferred until release
    SleepWanted,
}

/// Low power listening duty cycle in clock ticks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LplConfig {
    pub on_time: Ts,
    pub off_time: Ts,
}

impl Default for LplConfig {
    fn default() -> Self {
        Self {
            on_time: 1,
            off_time: 9,
        }
    }
}

pub struct Base<R> {
    radio: R,
    lpl: Option<LplConfig>,

    recv_state: RecvState,
    force: ForceState,
    /// Stay asleep for the current LPL off period even if a listen is requested
    force_sleep: bool,
    sending: bool,
    rssi: f64,
}

impl <R: Radio> Base<R> {
    pub fn new(radio: R, lpl: Option<LplConfig>) -> Self {
        Self {
            radio,
            lpl,
            recv_state: RecvState::Sense,
            force: ForceState::Normal,
            force_sleep: false,
            sending: false,
            rssi: 0.0,
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn lpl(&self) -> Option<&LplConfig> {
        self.lpl.as_ref()
    }

    pub fn recv_state(&self) -> RecvState {
        self.recv_state
    }

    pub fn force_state(&self) -> ForceState {
        self.force
    }

    /// Most recent RSSI sample
    pub fn rssi(&self) -> f64 {
        self.rssi
    }

    pub fn is_receiving(&self) -> bool {
        self.recv_state == RecvState::Frame
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    /// Preamble duration in seconds, stretched to cover a full duty
    /// cycle when LPL is enabled
    pub fn preamble_time(&self) -> f64 {
        match &self.lpl {
            Some(l) => PREAMBLE_TIME + (l.on_time + l.off_time) as f64 / crate::TICKS_PER_SECOND as f64,
            None => PREAMBLE_TIME,
        }
    }

    /// Arm the first duty cycle expiry (LPL only)
    pub fn start<T: Clock>(&mut self, timers: &mut Timers<T>, first: Ts) -> Result<(), MacError<R::Error>> {
        if self.lpl.is_some() {
            timers.schedule(LPL_TIMER, first.max(1))?;
        }
        Ok(())
    }

    /// Protocol level listen request
    pub fn listen<T: Clock>(&mut self, timers: &mut Timers<T>) -> Result<(), MacError<R::Error>> {
        if self.force == ForceState::SleepWanted {
            self.force = ForceState::NoSleep;
        }

        self.radio.set_listen().map_err(MacError::Radio)?;

        if let Some(l) = self.lpl {
            let busy = matches!(self.recv_state, RecvState::Frame | RecvState::PreambleDetect);
            if !busy && !self.force_sleep {
                timers.schedule(LPL_TIMER, l.on_time)?;
                self.recv_state = RecvState::Sense;
            }
        }

        Ok(())
    }

    /// Protocol level transmit request
    pub fn transmit_mode<T: Clock>(&mut self, timers: &mut Timers<T>) -> Result<(), MacError<R::Error>> {
        if self.force == ForceState::SleepWanted {
            self.force = ForceState::NoSleep;
        }

        self.radio.set_transmit().map_err(MacError::Radio)?;

        if self.lpl.is_some() {
            timers.cancel(LPL_TIMER)?;
            self.recv_state = RecvState::Sleep;
            self.force_sleep = false;
        }

        Ok(())
    }

    /// Protocol level sleep request, deferred while forced awake
    pub fn sleep<T: Clock>(&mut self, timers: &mut Timers<T>) -> Result<(), MacError<R::Error>> {
        self.sleep_internal()?;

        if self.lpl.is_some() {
            timers.cancel(LPL_TIMER)?;
            self.recv_state = RecvState::Sleep;
            self.force_sleep = false;
        }

        Ok(())
    }

    fn sleep_internal(&mut self) -> Result<(), MacError<R::Error>> {
        if self.force == ForceState::NoSleep {
            trace!("Sleep deferred, forced awake");
            self.force = ForceState::SleepWanted;
            return Ok(());
        }
        self.radio.set_sleep().map_err(MacError::Radio)
    }

    fn lpl_sleep<T: Clock>(&mut self, timers: &mut Timers<T>, ticks: Ts) -> Result<(), MacError<R::Error>> {
        self.sleep_internal()?;
        self.recv_state = RecvState::Sleep;
        timers.schedule(LPL_TIMER, ticks)?;
        Ok(())
    }

    /// Handle an LPL timer expiry, returns true if the protocol should be
    /// told a reception failed (no start symbol followed the preamble)
    pub fn lpl_timeout<T: Clock>(&mut self, timers: &mut Timers<T>) -> Result<bool, MacError<R::Error>> {
        let l = match self.lpl {
            Some(l) => l,
            None => return Err(MacError::InvalidState("LPL timer fired with LPL disabled")),
        };

        self.force_sleep = false;

        match self.recv_state {
            RecvState::Sense if self.rssi < RSSI_THRESHOLD => {
                self.lpl_sleep(timers, l.off_time)?;
            },
            RecvState::Sense => {
                debug!("Channel busy, starting preamble search");
                self.recv_state = RecvState::PreambleDetect;
                let preamble = num_traits::Float::ceil(PREAMBLE_TIME * crate::TICKS_PER_SECOND as f64) as Ts;
                timers.schedule(LPL_TIMER, l.off_time + l.on_time + preamble)?;
            },
            RecvState::PreambleDetect => {
                debug!("No start symbol, back to sleep");
                self.lpl_sleep(timers, l.off_time)?;
                return Ok(true);
            },
            RecvState::Sleep => {
                self.listen(timers)?;
            },
            RecvState::Frame => {
                return Err(MacError::InvalidState("LPL timer fired while receiving a frame"));
            },
        }

        Ok(false)
    }

    /// Record an RSSI sample, returns true if the protocol should be told
    /// a reception failed
    pub fn rssi_sample<T: Clock>(&mut self, timers: &mut Timers<T>, rssi: f64) -> Result<bool, MacError<R::Error>> {
        self.rssi = rssi;

        // Preamble search ends early once the channel goes quiet
        if self.lpl.is_some() && rssi < RSSI_THRESHOLD && self.recv_state == RecvState::PreambleDetect {
            timers.cancel(LPL_TIMER)?;
            return self.lpl_timeout(timers);
        }

        Ok(false)
    }

    pub fn reception_started<T: Clock>(&mut self, timers: &mut Timers<T>) -> Result<(), MacError<R::Error>> {
        if !matches!(self.recv_state, RecvState::Sense | RecvState::PreambleDetect) {
            warn!("Reception started in state {:?}", self.recv_state);
        }

        self.recv_state = RecvState::Frame;
        if self.lpl.is_some() {
            timers.cancel(LPL_TIMER)?;
        }

        Ok(())
    }

    pub fn reception_failed<T: Clock>(&mut self, timers: &mut Timers<T>) -> Result<(), MacError<R::Error>> {
        match self.lpl {
            Some(l) => {
                if self.recv_state == RecvState::Frame {
                    self.lpl_sleep(timers, l.off_time)?;
                    self.force_sleep = true;
                }
            },
            None => self.recv_state = RecvState::Sense,
        }
        Ok(())
    }

    /// Handle a received frame, returns false if the frame should be
    /// dropped because a sleep is pending
    pub fn frame_received<T: Clock>(&mut self, timers: &mut Timers<T>) -> Result<bool, MacError<R::Error>> {
        let deliver = self.force != ForceState::SleepWanted;

        if self.recv_state != RecvState::Frame {
            warn!("Frame received in state {:?}", self.recv_state);
        }

        match self.lpl {
            Some(_) => {
                self.lpl_sleep(timers, LPL_POST_FRAME_SLEEP)?;
                self.force_sleep = true;
            },
            None => self.recv_state = RecvState::Sense,
        }

        Ok(deliver)
    }

    /// Hand a frame to the radio
    pub fn start_transmit(&mut self, packet: Packet) -> Result<(), MacError<R::Error>> {
        if self.sending {
            return Err(MacError::InvalidState("transmit started while already transmitting"));
        }
        self.sending = true;
        self.radio.start_transmit(packet).map_err(MacError::Radio)
    }

    pub fn transmit_complete(&mut self) -> Result<(), MacError<R::Error>> {
        if !self.sending {
            return Err(MacError::InvalidState("transmit complete without a transmission"));
        }
        self.sending = false;
        Ok(())
    }

    /// Hold the node awake for the routing layer
    pub fn force_awake(&mut self) {
        debug!("Forcing awake");
        self.force = ForceState::NoSleep;
    }

    /// Release a force awake, executing any deferred sleep
    pub fn force_end(&mut self) -> Result<(), MacError<R::Error>> {
        if self.force == ForceState::SleepWanted {
            self.radio.set_sleep().map_err(MacError::Radio)?;
        }
        debug!("Ending forced state");
        self.force = ForceState::Normal;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::vec;

    use crate::clock::mock::SimClock;
    use crate::radio::mock::{MockRadio, Command};
    use super::*;

    fn setup(lpl: Option<LplConfig>) -> (SimClock, MockRadio, Timers<SimClock>, Base<MockRadio>) {
        let _ = simplelog::SimpleLogger::init(log::LevelFilter::Debug, simplelog::Config::default());
        let clock = SimClock::new();
        let radio = MockRadio::new();
        let mut timers = Timers::new(clock.clone());
        timers.preallocate(PROTOCOL_TIMERS + 1);
        let base = Base::new(radio.clone(), lpl);
        (clock, radio, timers, base)
    }

    #[test]
    fn force_defers_sleep() {
        let (_clock, radio, mut timers, mut base) = setup(None);

        base.force_awake();
        base.sleep(&mut timers).unwrap();
        assert_eq!(base.force_state(), ForceState::SleepWanted);
        assert!(radio.take().is_empty());

        // Listening cancels the deferred sleep
        base.listen(&mut timers).unwrap();
        assert_eq!(base.force_state(), ForceState::NoSleep);

        base.sleep(&mut timers).unwrap();
        base.force_end().unwrap();
        assert_eq!(base.force_state(), ForceState::Normal);
        assert_eq!(radio.take(), vec![Command::Listen, Command::Sleep]);
    }

    #[test]
    fn frames_dropped_while_sleep_wanted() {
        let (_clock, _radio, mut timers, mut base) = setup(None);

        base.force_awake();
        base.sleep(&mut timers).unwrap();
        base.reception_started(&mut timers).unwrap();
        assert_eq!(base.frame_received(&mut timers), Ok(false));
        assert_eq!(base.recv_state(), RecvState::Sense);
    }

    #[test]
    fn lpl_duty_cycle() {
        let (clock, radio, mut timers, mut base) = setup(Some(LplConfig::default()));

        base.start(&mut timers, 3).unwrap();
        base.listen(&mut timers).unwrap();
        assert_eq!(base.recv_state(), RecvState::Sense);
        assert_eq!(timers.remaining(LPL_TIMER), Ok(Some(1)));

        // Quiet channel, sleep for the off period
        clock.set(1);
        assert_eq!(timers.poll().map(|e| e.index), Some(LPL_TIMER));
        assert_eq!(base.lpl_timeout(&mut timers), Ok(false));
        assert_eq!(base.recv_state(), RecvState::Sleep);
        assert_eq!(timers.remaining(LPL_TIMER), Ok(Some(9)));

        // Wake, sense a busy channel
        clock.set(10);
        timers.poll().unwrap();
        assert_eq!(base.lpl_timeout(&mut timers), Ok(false));
        assert_eq!(base.recv_state(), RecvState::Sense);
        base.rssi_sample(&mut timers, 0.9).unwrap();

        clock.set(11);
        timers.poll().unwrap();
        assert_eq!(base.lpl_timeout(&mut timers), Ok(false));
        assert_eq!(base.recv_state(), RecvState::PreambleDetect);

        // Channel goes quiet before a start symbol
        assert_eq!(base.rssi_sample(&mut timers, 0.1), Ok(true));
        assert_eq!(base.recv_state(), RecvState::Sleep);

        assert_eq!(radio.take(), vec![Command::Listen, Command::Sleep, Command::Listen, Command::Sleep]);
    }

    #[test]
    fn lpl_frame_reception() {
        let (_clock, _radio, mut timers, mut base) = setup(Some(LplConfig::default()));

        base.listen(&mut timers).unwrap();
        base.reception_started(&mut timers).unwrap();
        assert!(base.is_receiving());
        assert_eq!(timers.is_scheduled(LPL_TIMER), Ok(false));

        assert_eq!(base.frame_received(&mut timers), Ok(true));
        assert_eq!(base.recv_state(), RecvState::Sleep);
        assert_eq!(timers.remaining(LPL_TIMER), Ok(Some(LPL_POST_FRAME_SLEEP)));

        // Held asleep until the timer expires
        base.listen(&mut timers).unwrap();
        assert_eq!(base.recv_state(), RecvState::Sleep);
    }

    #[test]
    fn single_transmission() {
        let (_clock, radio, _timers, mut base) = setup(None);

        base.start_transmit(Packet::default()).unwrap();
        assert!(base.start_transmit(Packet::default()).is_err());
        base.transmit_complete().unwrap();
        assert!(base.transmit_complete().is_err());
        assert_eq!(radio.frames().len(), 1);
    }
}
