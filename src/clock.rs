//! Virtual clock API

use crate::Ts;

/// Clock trait provides the current virtual time to protocol
/// implementations.
///
/// Time is monotonic, in ticks of a 32 KiHz clock, relative to the start
/// of the simulation run.
pub trait Clock {
    /// Returns the number of ticks since the start of the run
    fn now(&self) -> Ts;
}

impl <C: Clock> Clock for &C {
    fn now(&self) -> Ts {
        (*self).now()
    }
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use std::{cell::Cell, rc::Rc};

    use crate::Ts;

    /// Shared simulation clock, clones observe the same time
    #[derive(Clone, Debug, Default)]
    pub struct SimClock(Rc<Cell<Ts>>);

    impl SimClock {
        pub fn new() -> Self {
            Self(Rc::new(Cell::new(0)))
        }

        /// Move the clock to `t`, the clock never runs backwards
        pub fn set(&self, t: Ts) {
            if t > self.0.get() {
                self.0.set(t);
            }
        }

        pub fn advance(&self, ticks: Ts) {
            self.0.set(self.0.get() + ticks);
        }
    }

    impl super::Clock for SimClock {
        fn now(&self) -> Ts {
            self.0.get()
        }
    }
}
