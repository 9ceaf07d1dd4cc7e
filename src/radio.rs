//! Radio interface
//!
//! The MAC drives a radio through [`Radio`] commands and is fed the
//! radio's notifications as [`RadioEvent`]s through
//! [`crate::mac::Mac::handle_radio`].

use core::fmt::Debug;

use crate::packet::Packet;

/// Radio commands issued by a MAC
pub trait Radio {
    type Error: Debug;

    /// Enter receive mode
    fn set_listen(&mut self) -> Result<(), Self::Error>;

    /// Enter transmit mode (carrier on, ready for a frame)
    fn set_transmit(&mut self) -> Result<(), Self::Error>;

    /// Power down
    fn set_sleep(&mut self) -> Result<(), Self::Error>;

    /// Hand a frame to the radio for transmission,
    /// [`RadioEvent::TransmitComplete`] follows once it is on air
    fn start_transmit(&mut self, packet: Packet) -> Result<(), Self::Error>;
}

/// Radio notifications delivered to a MAC
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// Channel energy sample, 0.0 (silent) to 1.0 (busy)
    Rssi(f64),
    /// Start symbol detected
    ReceptionStarted,
    /// Reception aborted (collision or corruption)
    ReceptionFailed,
    /// MAC header received, the frame body follows
    HeaderReceived(Packet),
    /// Complete frame received
    FrameReceived(Packet),
    /// Frame handed to [`Radio::start_transmit`] is on air
    TransmitComplete,
}

/// Radio operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    Listen,
    Transmit,
    Sleep,
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use std::{cell::RefCell, rc::Rc, vec::Vec};

    use crate::packet::Packet;
    use super::RadioMode;

    /// Commands recorded by [`MockRadio`]
    #[derive(Debug, Clone, PartialEq)]
    pub enum Command {
        Listen,
        Transmit,
        Sleep,
        Frame(Packet),
    }

    #[derive(Debug, Default)]
    struct Inner {
        commands: Vec<Command>,
        mode: Option<RadioMode>,
    }

    /// Mock radio recording every command issued, clones share state
    #[derive(Debug, Clone, Default)]
    pub struct MockRadio(Rc<RefCell<Inner>>);

    impl MockRadio {
        pub fn new() -> Self {
            Self::default()
        }

        /// Drain the recorded commands
        pub fn take(&self) -> Vec<Command> {
            core::mem::take(&mut self.0.borrow_mut().commands)
        }

        /// Drain recorded frames, dropping mode changes
        pub fn frames(&self) -> Vec<Packet> {
            self.take().into_iter().filter_map(|c| match c {
                Command::Frame(p) => Some(p),
                _ => None,
            }).collect()
        }

        pub fn mode(&self) -> Option<RadioMode> {
            self.0.borrow().mode
        }

        fn push(&self, c: Command) {
            let mut i = self.0.borrow_mut();
            match &c {
                Command::Listen => i.mode = Some(RadioMode::Listen),
                Command::Transmit => i.mode = Some(RadioMode::Transmit),
                Command::Sleep => i.mode = Some(RadioMode::Sleep),
                Command::Frame(_) => (),
            }
            i.commands.push(c);
        }
    }

    impl super::Radio for MockRadio {
        type Error = ();

        fn set_listen(&mut self) -> Result<(), Self::Error> {
            self.push(Command::Listen);
            Ok(())
        }

        fn set_transmit(&mut self) -> Result<(), Self::Error> {
            self.push(Command::Transmit);
            Ok(())
        }

        fn set_sleep(&mut self) -> Result<(), Self::Error> {
            self.push(Command::Sleep);
            Ok(())
        }

        fn start_transmit(&mut self, packet: Packet) -> Result<(), Self::Error> {
            self.push(Command::Frame(packet));
            Ok(())
        }
    }
}
