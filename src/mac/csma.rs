
use log::{debug, warn};

use crate::{clock::Clock, error::MacError, packet::{NodeId, Packet}};
use crate::radio::Radio;
use crate::routing::Routing;
use crate::timers::TimerId;

use super::{Core, Protocol, config::*};
use super::ca::*;

/// CSMA-CA mode, an always-on RTS/CTS MAC
#[derive(Debug, PartialEq)]
pub struct CsmaMode {
    config: CsmaConfig,
    hs: Handshake,
}

impl CsmaMode {
    pub fn handshake_state(&self) -> CaState {
        self.hs.state
    }

    /// Current RTS contention window in ticks
    pub fn contend_time(&self) -> crate::Ts {
        self.hs.backoff.current()
    }

    pub fn nav(&self) -> &Nav {
        &self.hs.nav
    }

    pub fn pending(&self) -> Option<&Packet> {
        self.hs.tx_msg.as_ref()
    }
}

impl CaMode for CsmaMode {
    fn handshake(&self) -> &Handshake {
        &self.hs
    }

    fn handshake_mut(&mut self) -> &mut Handshake {
        &mut self.hs
    }
}

impl <R, U, T> Core<R, U, T, CsmaMode>
where
    R: Radio,
    U: Routing,
    T: Clock,
{
    /// Create a new CSMA-CA MAC, the radio starts listening immediately
    pub fn new_csma(id: NodeId, radio: R, routing: U, clock: T, core_config: CoreConfig, csma_config: CsmaConfig) -> Result<Self, MacError<R::Error>> {
        let backoff = Backoff::new(csma_config.rts_contend_time, csma_config.max_contend_time);
        let mode = CsmaMode {
            config: csma_config,
            hs: Handshake::new(backoff),
        };

        let mut c = Core::with_mode(id, radio, routing, clock, core_config, HEADER_LENGTH, mode)?;

        debug!("Node {} CSMA-CA starting", id);
        c.listen()?;

        Ok(c)
    }
}

impl <R, U, T> CaHooks<R::Error> for Core<R, U, T, CsmaMode>
where
    R: Radio,
    U: Routing,
    T: Clock,
{
    fn eval_state(&mut self) -> Result<(), MacError<R::Error>> {
        if self.mode.hs.state != CaState::Idle || self.base.is_receiving() {
            return Ok(());
        }

        if self.mode.hs.nav.is_busy() {
            debug!("Node {} idle sleeping", self.id);
            return self.sleep();
        }

        let broadcast = match self.mode.hs.tx_msg.as_ref() {
            Some(p) => p.is_broadcast(),
            None => {
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
        self.eval_state()
    }
}

impl <R, U, T> Protocol<R::Error> for Core<R, U, T, CsmaMode>
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

        self.mode.hs.attempts_left = self.mode.config.max_retries;
        self.mode.hs.tx_msg = Some(packet);
        self.eval_state()
    }

    fn rx_frame(&mut self, packet: Packet) -> Result<(), MacError<R::Error>> {
        let header = CaHeader::from_packet(&packet)?;

        if let Some(s) = self.abandon_wait(&packet, &header)? {
            if s == CaState::WaitForCts {
                self.mode.hs.backoff.increase();
            }
            self.handshake_failed();
        }

        self.receive_frame(packet, header)?;
        self.eval_state()
    }

    fn rx_started(&mut self) -> Result<(), MacError<R::Error>> {
        self.handshake_rx_started()
    }

    fn rx_failed(&mut self) -> Result<(), MacError<R::Error>> {
        self.eval_state()
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
                    self.mode.hs.backoff.increase();
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
            _ => Err(MacError::InvalidState("unknown CSMA-CA timer")),
        }
    }
}
