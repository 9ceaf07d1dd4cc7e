
use crate::{Ts, base::LplConfig};

/// Configuration shared by all MACs
#[derive(Clone, PartialEq, Debug)]
pub struct CoreConfig {
    /// Low power listening duty cycle, `None` to disable LPL
    pub lpl: Option<LplConfig>,

    /// Expected contending node count for the SIFT distribution
    pub sift_nodes: u32,

    /// RNG seed, mixed with the node id
    pub seed: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            lpl: None,
            sift_nodes: 512,
            seed: 0,
        }
    }
}

/// Configuration for CSMA-CA mode
#[derive(Clone, PartialEq, Debug)]
pub struct CsmaConfig {
    /// Initial (and minimum) RTS contention window in ticks
    pub rts_contend_time: Ts,

    /// Upper bound for the doubled RTS contention window in ticks
    pub max_contend_time: Ts,

    /// Handshake attempts before a packet is failed, `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for CsmaConfig {
    fn default() -> Self {
        Self {
            rts_contend_time: 300,
            max_contend_time: 2400,
            max_retries: None,
        }
    }
}

/// Configuration for S-MAC mode
#[derive(Clone, PartialEq, Debug)]
pub struct SmacConfig {
    /// Schedule frame length in ticks
    pub frame_time: Ts,

    /// Listen window at the start of each frame in ticks
    pub listen_time: Ts,

    /// Maximum offset in ticks for two schedules to be considered equal
    pub allowed_drift: Ts,

    /// Handshake attempts per packet
    pub packet_retries: u32,
}

impl Default for SmacConfig {
    fn default() -> Self {
        Self {
            frame_time: 32768,
            listen_time: 1000,
            allowed_drift: 30,
            packet_retries: 3,
        }
    }
}

/// Configuration for L-MAC mode
#[derive(Clone, PartialEq, Debug)]
pub struct LmacConfig {
    /// Slots per frame, at most 128
    pub max_slot: usize,

    /// Maximum payload length in bytes, sizes the slot
    pub data_length: usize,

    /// Mark slots with weak unexplained energy as tentatively occupied
    pub use_tentative: bool,
}

impl Default for LmacConfig {
    fn default() -> Self {
        Self {
            max_slot: 32,
            data_length: 101,
            use_tentative: false,
        }
    }
}

/// Configuration for G-MAC mode
#[derive(Clone, PartialEq, Debug)]
pub struct GmacConfig {
    /// Maximum payload length in bytes, sizes the slot
    pub data_length: usize,

    /// Upper bound on the initial notify backoff in slots
    pub backoff_max: u32,

    /// Missed ACKs before a packet is failed
    pub max_retries: u32,

    /// Poll the channel before sending (scheduled channel polling)
    pub use_scp: bool,

    /// Use the SIFT distribution for contention
    pub use_sift: bool,

    /// Probability of retrying in a slot after a failure
    pub retry_chance: f64,

    /// Return every failure to routing immediately
    pub reroute_on_fail: bool,

    /// Stop receiving once a header shows a frame is for someone else
    pub quick_abort: bool,

    /// Slots per wake cycle, the last is the broadcast slot
    pub cycle: u32,
}

impl Default for GmacConfig {
    fn default() -> Self {
        Self {
            data_length: 64,
            backoff_max: 16,
            max_retries: 3,
            use_scp: true,
            use_sift: true,
            retry_chance: 0.7,
            reroute_on_fail: false,
            quick_abort: false,
            cycle: 8,
        }
    }
}
