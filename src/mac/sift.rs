//! SIFT contention slot sampler
//!
//! SIFT picks contention slots from a truncated geometric distribution
//! that favours late slots, so with many contenders the first slot is
//! usually taken by a single node. Cumulative distributions are computed
//! once per slot count and kept for the lifetime of the sampler.

use alloc::{collections::BTreeMap, vec::Vec};

use log::{trace, warn};
use num_traits::Float;
use rand::Rng;

use crate::Ts;

#[derive(Debug, Clone)]
pub struct Sift {
    nodes: u32,
    distributions: BTreeMap<Ts, Vec<f64>>,
}

impl Sift {
    /// Create a sampler tuned for `nodes` expected contenders
    pub fn new(nodes: u32) -> Self {
        Self {
            nodes,
            distributions: BTreeMap::new(),
        }
    }

    /// Number of memoized slot counts
    pub fn distributions(&self) -> usize {
        self.distributions.len()
    }

    /// Pick a slot in `[low, high)`, `low` when the range is empty
    pub fn slot<G: Rng>(&mut self, rng: &mut G, low: Ts, high: Ts) -> Ts {
        if low >= high {
            return low;
        }

        let slots = high - low;
        if slots == 1 {
            return low;
        }

        if !self.distributions.contains_key(&slots) {
            match Self::distribution(self.nodes, slots) {
                Some(d) => {
                    trace!("SIFT distribution for {} slots computed", slots);
                    self.distributions.insert(slots, d);
                },
                None => {
                    warn!("No SIFT distribution for {} nodes over {} slots, using uniform", self.nodes, slots);
                    return rng.gen_range(low..high);
                }
            }
        }

        let chances = match self.distributions.get(&slots) {
            Some(c) => c,
            None => return rng.gen_range(low..high),
        };

        let picked: f64 = rng.gen();
        for (i, c) in chances.iter().enumerate() {
            if picked < *c {
                return low + i as Ts;
            }
        }

        high - 1
    }

    /// Normalised cumulative distribution, `None` when degenerate
    fn distribution(nodes: u32, slots: Ts) -> Option<Vec<f64>> {
        let n = slots as f64;
        let alpha = Float::powf(nodes as f64, -1.0 / (n - 1.0));
        let base = (1.0 - alpha) * Float::powf(alpha, n) / (1.0 - Float::powf(alpha, n));

        if !base.is_finite() || base <= 0.0 {
            return None;
        }

        let mut chances = Vec::with_capacity(slots as usize);
        let mut total = 0.0;
        for i in 0..slots {
            total += base * Float::powf(alpha, -(i as f64));
            chances.push(total);
        }

        for c in chances.iter_mut() {
            *c /= total;
        }

        Some(chances)
    }
}
