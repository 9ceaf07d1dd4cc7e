//! Multi-node MAC simulation
//!
//! Runs a mesh of nodes on one channel, each non-sink node sending a
//! packet to the sink (node 0) every period, and prints per-node stats.

use std::str::FromStr;
use std::time::Duration;

use log::{debug, info, warn};

use structopt::StructOpt;

use wsn_mac::prelude::*;
use wsn_mac::sim::{MacKind, Sim};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Protocol {
    Csma,
    Smac,
    Lmac,
    Gmac,
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csma" => Ok(Protocol::Csma),
            "smac" => Ok(Protocol::Smac),
            "lmac" => Ok(Protocol::Lmac),
            "gmac" => Ok(Protocol::Gmac),
            _ => Err(anyhow::anyhow!("unknown protocol '{}' (csma, smac, lmac, gmac)", s)),
        }
    }
}

impl Protocol {
    fn kind(&self) -> MacKind {
        match self {
            Protocol::Csma => MacKind::Csma(CsmaConfig::default()),
            Protocol::Smac => MacKind::Smac(SmacConfig::default()),
            Protocol::Lmac => MacKind::Lmac(LmacConfig::default()),
            Protocol::Gmac => MacKind::Gmac(GmacConfig::default()),
        }
    }
}

#[derive(Debug, StructOpt)]
struct Options {

    #[structopt(long, default_value = "csma")]
    /// MAC protocol (csma, smac, lmac, gmac)
    pub protocol: Protocol,

    #[structopt(long, default_value = "5")]
    /// Number of nodes, node 0 is the sink
    pub nodes: u32,

    #[structopt(long, default_value = "60s", parse(try_from_str = humantime::parse_duration))]
    /// Simulated run time
    pub duration: Duration,

    #[structopt(long, default_value = "5s", parse(try_from_str = humantime::parse_duration))]
    /// Per-node packet period
    pub period: Duration,

    #[structopt(long, default_value = "20")]
    /// Payload length in bytes
    pub payload: usize,

    #[structopt(long)]
    /// Enable low power listening
    pub lpl: bool,

    #[structopt(long, default_value = "0")]
    /// RNG seed
    pub seed: u64,

    #[structopt(long, default_value = "info")]
    /// Configure log level
    pub log_level: simplelog::LevelFilter,
}

fn main() -> anyhow::Result<()> {
    // Load options
    let opts = Options::from_args();

    // Initialise logging
    let _ = simplelog::TermLogger::init(opts.log_level, simplelog::Config::default(),
        simplelog::TerminalMode::Mixed, simplelog::ColorChoice::Auto);

    let kind = opts.protocol.kind();
    info!("Starting {} simulation with {} nodes", kind.name(), opts.nodes);

    let core_config = CoreConfig {
        lpl: if opts.lpl { Some(LplConfig::default()) } else { None },
        seed: opts.seed,
        ..Default::default()
    };

    let mut sim = Sim::new();
    for _ in 0..opts.nodes {
        if let Err(e) = sim.add(&kind, core_config.clone()) {
            return Err(anyhow::anyhow!("Error initialising MAC: {:?}", e));
        }
    }

    // Traffic generator, one repeating timer per source node
    let end = wsn_mac::seconds_to_ticks(opts.duration.as_secs_f64());
    let period = wsn_mac::seconds_to_ticks(opts.period.as_secs_f64()).max(1);
    let repeats = (end / period) as u32;

    let mut traffic: RepeatTimers<_, NodeId> = RepeatTimers::new(sim.clock().clone());
    for n in 1..opts.nodes {
        let index = traffic.set_repeat_timer_auto(period, repeats);
        traffic.set_context(index, n)
            .map_err(|e| anyhow::anyhow!("Traffic timer error: {:?}", e))?;
    }

    let payload = vec![0xaa; opts.payload];
    let mut sent = 0u32;

    debug!("Starting loop");

    loop {
        let next = traffic.next_deadline().unwrap_or(end).min(end);
        if let Err(e) = sim.run_until(next) {
            return Err(anyhow::anyhow!("Simulation error at {}: {:?}", sim.now(), e));
        }

        while let Some(expired) = traffic.poll() {
            let from = match traffic.context(expired.index) {
                Ok(Some(n)) => *n,
                _ => continue,
            };

            debug!("t={} node {} sending to sink", sim.now(), from);

            let mut p = Packet::data(from, Address::Node(0), &payload);
            p.serial = Some(sent);
            sent += 1;

            if let Err(e) = sim.transmit(from, p) {
                warn!("Node {} transmit error: {:?}", from, e);
            }
        }

        if next >= end {
            break;
        }
    }

    info!("Run complete at {:.3} s, {} packets offered", wsn_mac::ticks_to_seconds(sim.now()), sent);

    println!("{:>4} {:>6} {:>6} {:>6} {:>6} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "node", "tx", "rx", "drop", "failed", "tx_data", "tx_ovh", "rx_data", "rx_ovh", "overhear");

    for n in 0..opts.nodes {
        let (stats, failed) = match (sim.mac(n), sim.routing(n)) {
            (Some(m), Some(r)) => (m.stats(), r.failed()),
            _ => continue,
        };

        println!("{:>4} {:>6} {:>6} {:>6} {:>6} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>10.4}",
            n, stats.tx, stats.rx, stats.tx_drop, failed,
            stats.time_tx_data, stats.time_tx_overhead,
            stats.time_rx_data, stats.time_rx_overhead, stats.time_rx_overhear);
    }

    Ok(())
}
