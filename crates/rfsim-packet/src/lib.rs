//! # rfsim-packet
//!
//! Packet representation for RFSIM.
//!
//! A [`Packet`] carries one payload per network-stack layer. Payloads are a
//! closed set of typed variants ([`LayerData`]): the reader and tag MAC
//! headers, the reader and tag application payloads, and an opaque sized
//! blob for traffic that carries no protocol structure.

use rfsim_core::{LayerKind, NodeId, SimTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Reader MAC header
// ============================================================================

/// Frame types sent by a reader MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReaderFrameKind {
    /// Envelope for an arbitrary upper-layer packet.
    Generic,
    /// Broadcast start of a contention cycle.
    Request,
    /// Acknowledgment of a received tag identity.
    Ack,
    /// Unicast permission for one tag to send its payload.
    Select,
}

impl std::fmt::Display for ReaderFrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReaderFrameKind::Generic => "GENERIC",
            ReaderFrameKind::Request => "REQUEST",
            ReaderFrameKind::Ack => "ACK",
            ReaderFrameKind::Select => "SELECT",
        };
        write!(f, "{}", s)
    }
}

/// Link-layer header attached by a reader MAC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderMacHeader {
    /// Frame type.
    pub kind: ReaderFrameKind,
    /// Sending reader.
    pub sender: NodeId,
    /// Destination node (may be broadcast).
    pub receiver: NodeId,
    /// Slot count carried by REQUEST frames.
    pub number_of_slots: u8,
}

impl ReaderMacHeader {
    const SENDER_ID_BYTES: u32 = 4;
    const RECEIVER_ID_BYTES: u32 = 12;
    const TYPE_BYTES: u32 = 1;
    const NUMBER_OF_SLOTS_BYTES: u32 = 1;

    /// Wire size of the header in bytes.
    pub fn size_in_bytes(&self) -> u32 {
        let mut bytes = Self::SENDER_ID_BYTES + Self::RECEIVER_ID_BYTES + Self::TYPE_BYTES;
        if self.kind == ReaderFrameKind::Request {
            bytes += Self::NUMBER_OF_SLOTS_BYTES;
        }
        bytes
    }
}

// ============================================================================
// Tag MAC header
// ============================================================================

/// Frame types sent by a tag MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagFrameKind {
    /// Envelope for an arbitrary upper-layer packet.
    Generic,
    /// Contention-slot reply to a REQUEST.
    Reply,
}

impl std::fmt::Display for TagFrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TagFrameKind::Generic => "GENERIC",
            TagFrameKind::Reply => "REPLY",
        };
        write!(f, "{}", s)
    }
}

/// Link-layer header attached by a tag MAC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagMacHeader {
    /// Frame type.
    pub kind: TagFrameKind,
    /// Sending tag.
    pub sender: NodeId,
    /// Destination reader.
    pub receiver: NodeId,
}

impl TagMacHeader {
    const SENDER_ID_BYTES: u32 = 12;
    const RECEIVER_ID_BYTES: u32 = 4;
    const TYPE_BYTES: u32 = 1;

    /// Wire size of the header in bytes.
    pub fn size_in_bytes(&self) -> u32 {
        Self::SENDER_ID_BYTES + Self::RECEIVER_ID_BYTES + Self::TYPE_BYTES
    }
}

// ============================================================================
// Application payloads
// ============================================================================

/// Commands issued by the reader application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReaderAppKind {
    /// Start a read process.
    Read,
    /// Clear tag-side reply inhibition.
    Reset,
}

/// Application payload attached by a reader application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderAppData {
    /// Command type.
    pub kind: ReaderAppKind,
    /// Issuing reader.
    pub reader: NodeId,
    /// Whether the MAC should run the read cycle to completion instead of
    /// stopping early after consecutive missed reads.
    pub do_entire_read_cycle: bool,
}

impl ReaderAppData {
    const NODE_ID_BYTES: u32 = 4;
    const TYPE_BYTES: u32 = 1;

    /// Wire size of the payload in bytes.
    pub fn size_in_bytes(&self) -> u32 {
        Self::NODE_ID_BYTES + Self::TYPE_BYTES
    }
}

/// Application payload attached by a tag application: its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagAppData {
    /// The tag's identity.
    pub tag: NodeId,
}

impl TagAppData {
    const NODE_ID_BYTES: u32 = 12;
    const TYPE_BYTES: u32 = 1;

    /// Wire size of the payload in bytes.
    pub fn size_in_bytes(&self) -> u32 {
        Self::NODE_ID_BYTES + Self::TYPE_BYTES
    }
}

// ============================================================================
// Layer data
// ============================================================================

/// A per-layer payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LayerData {
    /// Reader MAC link header.
    ReaderMac(ReaderMacHeader),
    /// Tag MAC link header.
    TagMac(TagMacHeader),
    /// Reader application payload.
    ReaderApp(ReaderAppData),
    /// Tag application payload.
    TagApp(TagAppData),
    /// Opaque payload with an explicit size.
    Raw(u32),
}

impl LayerData {
    /// Wire size of the payload in bytes.
    pub fn size_in_bytes(&self) -> u32 {
        match self {
            LayerData::ReaderMac(h) => h.size_in_bytes(),
            LayerData::TagMac(h) => h.size_in_bytes(),
            LayerData::ReaderApp(d) => d.size_in_bytes(),
            LayerData::TagApp(d) => d.size_in_bytes(),
            LayerData::Raw(size) => *size,
        }
    }
}

impl std::fmt::Display for LayerData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerData::ReaderMac(h) => write!(
                f,
                "type={}, sender={}, receiver={}, numberOfSlots={}",
                h.kind, h.sender, h.receiver, h.number_of_slots
            ),
            LayerData::TagMac(h) => write!(
                f,
                "type={}, sender={}, receiver={}",
                h.kind, h.sender, h.receiver
            ),
            LayerData::ReaderApp(d) => write!(
                f,
                "type={:?}, reader={}, entireReadCycle={}",
                d.kind, d.reader, d.do_entire_read_cycle
            ),
            LayerData::TagApp(d) => write!(f, "tagId={}", d.tag),
            LayerData::Raw(size) => write!(f, "sizeInBytes={}", size),
        }
    }
}

// ============================================================================
// Packet
// ============================================================================

/// Monotonic id source for packets.
static NEXT_UNIQUE_ID: AtomicU64 = AtomicU64::new(0);

/// A packet exchanged between nodes.
///
/// Cloning produces a deep copy of the payload map; the unique id is
/// assigned at construction and preserved through copies.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    unique_id: u64,
    data_rate: f64,
    tx_power: f64,
    do_max_tx_power: bool,
    has_error: bool,
    destination: NodeId,
    data: BTreeMap<LayerKind, LayerData>,
}

impl Packet {
    /// Size assumed when no per-layer payload is present.
    pub const DEFAULT_SIZE_IN_BYTES: u32 = 512;

    /// Data rate assumed until the physical layer stamps its own.
    pub const DEFAULT_DATA_RATE: f64 = 1e6;

    /// Create an empty broadcast packet.
    pub fn new() -> Self {
        Packet {
            unique_id: NEXT_UNIQUE_ID.fetch_add(1, Ordering::Relaxed),
            data_rate: Self::DEFAULT_DATA_RATE,
            tx_power: 0.0,
            do_max_tx_power: false,
            has_error: false,
            destination: NodeId::BROADCAST,
            data: BTreeMap::new(),
        }
    }

    /// The packet's unique id.
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    /// Packet size in bytes: the sum of present payload sizes, or the
    /// default size when no payload has been added.
    pub fn size_in_bytes(&self) -> u32 {
        if self.data.is_empty() {
            Self::DEFAULT_SIZE_IN_BYTES
        } else {
            self.data.values().map(LayerData::size_in_bytes).sum()
        }
    }

    /// Packet size in bits.
    pub fn size_in_bits(&self) -> u32 {
        self.size_in_bytes() * 8
    }

    /// Time to transmit the packet at its data rate.
    pub fn duration(&self) -> SimTime {
        assert!(self.data_rate > 0.0);
        SimTime::from_secs(self.size_in_bits() as f64 / self.data_rate)
    }

    /// The data rate in bits per second.
    pub fn data_rate(&self) -> f64 {
        self.data_rate
    }

    /// Set the data rate in bits per second. Must be positive.
    pub fn set_data_rate(&mut self, data_rate: f64) {
        assert!(data_rate > 0.0);
        self.data_rate = data_rate;
    }

    /// Whether the packet was received in error.
    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// Mark the packet as received in error (or not).
    pub fn set_has_error(&mut self, has_error: bool) {
        self.has_error = has_error;
    }

    /// The transmit-power override in watts; zero means "use the physical
    /// layer's current level". Superseded by [`Packet::do_max_tx_power`].
    pub fn tx_power(&self) -> f64 {
        self.tx_power
    }

    /// Set the transmit-power override. Must be non-negative.
    pub fn set_tx_power(&mut self, tx_power: f64) {
        assert!(tx_power >= 0.0);
        self.tx_power = tx_power;
    }

    /// Whether the packet must be sent at the maximum power level,
    /// regardless of any numeric override.
    pub fn do_max_tx_power(&self) -> bool {
        self.do_max_tx_power
    }

    /// Request transmission at the maximum power level.
    pub fn set_do_max_tx_power(&mut self, do_max: bool) {
        self.do_max_tx_power = do_max;
    }

    /// Destination field used by layers unaware of upper-layer formats.
    /// Does not count towards the packet size.
    pub fn destination(&self) -> NodeId {
        self.destination
    }

    /// Set the destination field.
    pub fn set_destination(&mut self, destination: NodeId) {
        self.destination = destination;
    }

    /// Attach (or replace) the payload for a layer.
    pub fn add_data(&mut self, kind: LayerKind, data: LayerData) {
        self.data.insert(kind, data);
    }

    /// The payload for a layer, if present.
    pub fn data(&self, kind: LayerKind) -> Option<&LayerData> {
        self.data.get(&kind)
    }

    /// Remove the payload for a layer. Returns whether one was present.
    pub fn remove_data(&mut self, kind: LayerKind) -> bool {
        self.data.remove(&kind).is_some()
    }

    /// Whether any payload for a layer above `kind` is present.
    ///
    /// Only meaningful for Link and above; the physical layer is never the
    /// "upper" of anything.
    pub fn has_upper_layer_data(&self, kind: LayerKind) -> bool {
        debug_assert!(kind != LayerKind::Physical);
        self.data.keys().any(|k| *k > kind)
    }

    /// The reader MAC header, if the link payload is one.
    pub fn reader_mac_header(&self) -> Option<&ReaderMacHeader> {
        match self.data(LayerKind::Link) {
            Some(LayerData::ReaderMac(h)) => Some(h),
            _ => None,
        }
    }

    /// The tag MAC header, if the link payload is one.
    pub fn tag_mac_header(&self) -> Option<&TagMacHeader> {
        match self.data(LayerKind::Link) {
            Some(LayerData::TagMac(h)) => Some(h),
            _ => None,
        }
    }

    /// The reader application payload, if present.
    pub fn reader_app_data(&self) -> Option<&ReaderAppData> {
        match self.data(LayerKind::Application) {
            Some(LayerData::ReaderApp(d)) => Some(d),
            _ => None,
        }
    }

    /// The tag application payload, if present.
    pub fn tag_app_data(&self) -> Option<&TagAppData> {
        match self.data(LayerKind::Application) {
            Some(LayerData::TagApp(d)) => Some(d),
            _ => None,
        }
    }

    /// Whether the link payload is a reader frame of the given kind.
    pub fn is_reader_frame(&self, kind: ReaderFrameKind) -> bool {
        self.reader_mac_header().map(|h| h.kind) == Some(kind)
    }

    /// Whether the link payload is a tag frame of the given kind.
    pub fn is_tag_frame(&self, kind: TagFrameKind) -> bool {
        self.tag_mac_header().map(|h| h.kind) == Some(kind)
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[ packetState uniqueId={}, sizeInBytes={}, ",
            self.unique_id,
            self.size_in_bytes()
        )?;
        if self.do_max_tx_power {
            write!(f, "doMaxTxPower=true, ")?;
        } else {
            write!(f, "txPower={}, ", self.tx_power)?;
        }
        write!(
            f,
            "dataRate={}, durationInSeconds={:.8}, hasError={} ]",
            self.data_rate,
            self.duration().as_secs(),
            self.has_error
        )?;
        for (kind, data) in &self.data {
            write!(f, " [ {} {} ]", kind, data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_header(slots: u8) -> ReaderMacHeader {
        ReaderMacHeader {
            kind: ReaderFrameKind::Request,
            sender: NodeId::new(1),
            receiver: NodeId::BROADCAST,
            number_of_slots: slots,
        }
    }

    #[test]
    fn test_empty_packet_uses_default_size() {
        let packet = Packet::new();
        assert_eq!(packet.size_in_bytes(), Packet::DEFAULT_SIZE_IN_BYTES);
        assert_eq!(packet.size_in_bits(), Packet::DEFAULT_SIZE_IN_BYTES * 8);
    }

    #[test]
    fn test_header_sizes() {
        let mut packet = Packet::new();
        packet.add_data(LayerKind::Link, LayerData::ReaderMac(request_header(10)));
        // sender 4 + receiver 12 + type 1 + slots 1
        assert_eq!(packet.size_in_bytes(), 18);

        let mut packet = Packet::new();
        packet.add_data(
            LayerKind::Link,
            LayerData::ReaderMac(ReaderMacHeader {
                kind: ReaderFrameKind::Ack,
                sender: NodeId::new(1),
                receiver: NodeId::new(2),
                number_of_slots: 0,
            }),
        );
        assert_eq!(packet.size_in_bytes(), 17);

        let mut packet = Packet::new();
        packet.add_data(
            LayerKind::Link,
            LayerData::TagMac(TagMacHeader {
                kind: TagFrameKind::Reply,
                sender: NodeId::new(9),
                receiver: NodeId::new(1),
            }),
        );
        packet.add_data(
            LayerKind::Application,
            LayerData::TagApp(TagAppData { tag: NodeId::new(9) }),
        );
        // tag mac 17 + tag app 13
        assert_eq!(packet.size_in_bytes(), 30);
    }

    #[test]
    fn test_duration_follows_data_rate() {
        let mut packet = Packet::new();
        packet.add_data(
            LayerKind::Application,
            LayerData::ReaderApp(ReaderAppData {
                kind: ReaderAppKind::Read,
                reader: NodeId::new(1),
                do_entire_read_cycle: false,
            }),
        );
        packet.set_data_rate(128e3);
        let expected = (5 * 8) as f64 / 128e3;
        assert!((packet.duration().as_secs() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_deep_copy_preserves_id_and_payloads() {
        let mut packet = Packet::new();
        packet.add_data(LayerKind::Link, LayerData::ReaderMac(request_header(8)));
        packet.set_tx_power(0.5);
        packet.set_destination(NodeId::new(4));

        let copy = packet.clone();
        assert_eq!(copy.unique_id(), packet.unique_id());
        assert_eq!(copy.size_in_bytes(), packet.size_in_bytes());
        assert_eq!(copy.data(LayerKind::Link), packet.data(LayerKind::Link));
        assert_eq!(copy.destination(), NodeId::new(4));

        // Two fresh packets never share an id.
        assert_ne!(Packet::new().unique_id(), Packet::new().unique_id());
    }

    #[test]
    fn test_remove_and_upper_layer_data() {
        let mut packet = Packet::new();
        packet.add_data(LayerKind::Link, LayerData::ReaderMac(request_header(4)));
        packet.add_data(
            LayerKind::Application,
            LayerData::TagApp(TagAppData { tag: NodeId::new(2) }),
        );

        assert!(packet.has_upper_layer_data(LayerKind::Link));
        assert!(!packet.has_upper_layer_data(LayerKind::Application));

        assert!(packet.remove_data(LayerKind::Application));
        assert!(!packet.remove_data(LayerKind::Application));
        assert!(!packet.has_upper_layer_data(LayerKind::Link));
    }

    #[test]
    fn test_frame_predicates() {
        let mut packet = Packet::new();
        packet.add_data(LayerKind::Link, LayerData::ReaderMac(request_header(4)));
        assert!(packet.is_reader_frame(ReaderFrameKind::Request));
        assert!(!packet.is_reader_frame(ReaderFrameKind::Select));
        assert!(!packet.is_tag_frame(TagFrameKind::Reply));
    }
}
