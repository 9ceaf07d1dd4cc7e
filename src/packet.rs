//! Simulated packets
//!
//! A [`Packet`] carries per-layer side-channel data (each with a simulated
//! on-air size) and a simulated total length in bytes. Ownership moves
//! with the packet through every layer.

use bytes::Bytes;
use strum::{EnumCount, IntoStaticStr};

/// Node identifier
pub type NodeId = u32;

/// Duration of one byte on air in seconds (10 bits at 115.2 kbps)
pub const BYTE_TIME: f64 = 10.0 / 115200.0;

/// Encoding overhead per data byte
pub const MODULATION_FACTOR: f64 = 1.5;

/// Base preamble duration in seconds
pub const PREAMBLE_TIME: f64 = 3.0 * BYTE_TIME;

/// Radio turnaround allowance in seconds
pub const EXTRA_TRANSMIT_TIME: f64 = 0.5 * BYTE_TIME;

/// Time in seconds to send `bytes` of data plus the start symbol and CRC,
/// excluding the preamble
pub fn frame_data_time(bytes: usize) -> f64 {
    BYTE_TIME * (1.0 + MODULATION_FACTOR * (bytes as f64 + 2.0))
}

/// Link or network layer address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// Every node in range
    Broadcast,
    /// A specific node
    Node(NodeId),
    /// No recipient (eg. header only frames)
    None,
}

impl Address {
    pub fn is_broadcast(&self) -> bool {
        *self == Address::Broadcast
    }

    /// Check whether this address targets the provided node directly
    pub fn is_node(&self, id: NodeId) -> bool {
        *self == Address::Node(id)
    }

    pub fn node(&self) -> Option<NodeId> {
        match self {
            Address::Node(n) => Some(*n),
            _ => None,
        }
    }
}

impl Default for Address {
    fn default() -> Self {
        Address::None
    }
}

/// Protocol layers owning side-channel data on a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCount, IntoStaticStr)]
pub enum Layer {
    Mac = 0,
    Routing = 1,
    Application = 2,
    Pattern = 3,
}

/// Packet kind tag, rewritten as a packet moves between layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum PacketKind {
    /// Outbound, pending transmission
    Tx,
    /// Inbound, received from the medium
    Rx,
    /// Delivered (acknowledged or broadcast)
    TxDone,
    /// Retries exhausted
    TxFailed,
    /// Contention lost to another sender
    TxContendLose,
    /// No acknowledgment received
    TxNoAck,
    /// Retry deliberately skipped
    TxRetrySkipped,
}

/// Data attached to a packet by one layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerData {
    pub bytes: Bytes,
    /// Simulated on-air size in bytes
    pub simulated: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,

    /// Originating node
    pub from: Option<NodeId>,
    /// Final destination
    pub to: Address,

    /// Last hop sender
    pub local_from: Option<NodeId>,
    /// Next hop recipient
    pub local_to: Address,

    /// Application sequence number for tracing
    pub serial: Option<u32>,

    /// Preamble duration in seconds, set by the sending MAC
    pub preamble_time: f64,

    length: usize,
    data: [Option<LayerData>; Layer::COUNT],
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            kind: PacketKind::Tx,
            from: None,
            to: Address::None,
            local_from: None,
            local_to: Address::None,
            serial: None,
            preamble_time: PREAMBLE_TIME,
            length: 0,
            data: Default::default(),
        }
    }
}

impl Packet {
    /// Create an empty packet for the provided next hop
    pub fn new(local_to: Address) -> Self {
        Self {
            local_to,
            ..Default::default()
        }
    }

    /// Create an outbound packet from `from` to `to`, with `to` as the
    /// next hop and the payload attached at the application layer
    pub fn data(from: NodeId, to: Address, payload: &[u8]) -> Self {
        let mut p = Self {
            from: Some(from),
            to,
            local_to: to,
            ..Default::default()
        };
        p.set_data(Layer::Application, Bytes::copy_from_slice(payload), payload.len());
        p
    }

    /// Simulated length in bytes
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn set_length(&mut self, length: usize) {
        self.length = length;
    }

    pub fn increase_length(&mut self, by: usize) {
        self.length = self.length.saturating_add(by);
    }

    pub fn decrease_length(&mut self, by: usize) {
        self.length = self.length.saturating_sub(by);
    }

    /// Attach data for a layer, replacing (and un-counting) any previous
    /// data for that layer
    pub fn set_data(&mut self, layer: Layer, bytes: Bytes, simulated: usize) {
        self.discard_data(layer);
        self.length = self.length.saturating_add(simulated);
        self.data[layer as usize] = Some(LayerData{ bytes, simulated });
    }

    pub fn data_for(&self, layer: Layer) -> Option<&Bytes> {
        self.data[layer as usize].as_ref().map(|d| &d.bytes)
    }

    /// Remove a layer's data, returning it
    pub fn discard_data(&mut self, layer: Layer) -> Option<LayerData> {
        let d = self.data[layer as usize].take()?;
        self.length = self.length.saturating_sub(d.simulated);
        Some(d)
    }

    pub fn is_broadcast(&self) -> bool {
        self.local_to.is_broadcast()
    }

    /// Time on air in seconds for the current length and preamble
    pub fn airtime(&self) -> f64 {
        self.preamble_time + frame_data_time(self.length)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layer_data_accounting() {
        let mut p = Packet::data(1, Address::Node(2), &[0xaa; 10]);
        assert_eq!(p.length(), 10);

        p.set_data(Layer::Routing, Bytes::from_static(&[1, 2]), 4);
        assert_eq!(p.length(), 14);

        // Replacing data removes the previous simulated size first
        p.set_data(Layer::Routing, Bytes::from_static(&[1]), 2);
        assert_eq!(p.length(), 12);
        assert_eq!(p.data_for(Layer::Routing).map(|b| b.len()), Some(1));

        let d = p.discard_data(Layer::Application).unwrap();
        assert_eq!(d.simulated, 10);
        assert_eq!(p.length(), 2);
        assert_eq!(p.discard_data(Layer::Application), None);
        assert_eq!(p.length(), 2);

        p.decrease_length(5);
        assert_eq!(p.length(), 0);
    }

    #[test]
    fn airtime() {
        let mut p = Packet::new(Address::Broadcast);
        p.set_length(10);
        let expected = PREAMBLE_TIME + BYTE_TIME * (1.0 + 1.5 * 12.0);
        assert!((p.airtime() - expected).abs() < 1e-12);
    }
}
