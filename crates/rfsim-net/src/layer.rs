//! Communication-layer common state.
//!
//! Every layer in a stack shares the same plumbing: ordered neighbor lists
//! in both directions, a default neighbor per direction, per-direction
//! hand-off delays, and a bounded downward queue with backpressure flags.
//! The protocol-specific behavior lives in the layer bodies.

use crate::app::AppLayer;
use crate::phy::PhysicalLayer;
use crate::reader_mac::ReaderMac;
use crate::tag_mac::TagMac;
use crate::LayerId;
use rfsim_core::{LayerKind, SimTime};
use rfsim_packet::Packet;
use std::collections::VecDeque;

/// Which side of a layer an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards the physical layer.
    Lower,
    /// Towards the application layer.
    Upper,
}

impl Direction {
    /// The other direction.
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Lower => Direction::Upper,
            Direction::Upper => Direction::Lower,
        }
    }
}

/// State shared by every layer.
#[derive(Debug)]
pub struct LayerCommon {
    /// The layer's position in the stack vocabulary.
    pub kind: LayerKind,
    lower: Vec<LayerId>,
    upper: Vec<LayerId>,
    default_lower: usize,
    default_upper: usize,
    lower_delay: SimTime,
    upper_delay: SimTime,
    /// Downward queue of packets with their target lower-layer index.
    pub queue: VecDeque<(Packet, usize)>,
    max_queue_length: usize,
    /// Set while an upper neighbor has asked this layer to stop draining.
    pub queue_blocked: bool,
    /// Set while a downward hand-off event is outstanding.
    pub lower_recv_event_pending: bool,
}

impl LayerCommon {
    /// Default maximum queue length.
    pub const DEFAULT_MAX_QUEUE_LENGTH: usize = 50;

    /// Queue length of link layers.
    pub const LINK_QUEUE_LENGTH: usize = 1;

    /// Queue length of physical layers.
    pub const PHYSICAL_QUEUE_LENGTH: usize = 1;

    /// Create the common state for a layer of the given kind.
    pub fn new(kind: LayerKind, max_queue_length: usize) -> Self {
        assert!(max_queue_length > 0);
        LayerCommon {
            kind,
            lower: Vec::new(),
            upper: Vec::new(),
            default_lower: 0,
            default_upper: 0,
            lower_delay: SimTime::ZERO,
            upper_delay: SimTime::ZERO,
            queue: VecDeque::new(),
            max_queue_length,
            queue_blocked: false,
            lower_recv_event_pending: false,
        }
    }

    /// The neighbor list in a direction.
    pub fn neighbors(&self, direction: Direction) -> &[LayerId] {
        match direction {
            Direction::Lower => &self.lower,
            Direction::Upper => &self.upper,
        }
    }

    /// Number of neighbors in a direction.
    pub fn number_of_layers(&self, direction: Direction) -> usize {
        self.neighbors(direction).len()
    }

    /// Append a neighbor. The first neighbor inserted in a direction
    /// becomes the default.
    pub fn insert_layer(&mut self, direction: Direction, layer: LayerId) {
        match direction {
            Direction::Lower => self.lower.push(layer),
            Direction::Upper => self.upper.push(layer),
        }
        if self.number_of_layers(direction) == 1 {
            let set = self.set_default_layer(direction, 0);
            debug_assert!(set);
        }
    }

    /// Index of the default neighbor in a direction.
    pub fn default_layer(&self, direction: Direction) -> usize {
        match direction {
            Direction::Lower => self.default_lower,
            Direction::Upper => self.default_upper,
        }
    }

    /// Choose the default neighbor in a direction. Returns false when the
    /// index is out of range.
    pub fn set_default_layer(&mut self, direction: Direction, index: usize) -> bool {
        if index >= self.number_of_layers(direction) {
            return false;
        }
        match direction {
            Direction::Lower => self.default_lower = index,
            Direction::Upper => self.default_upper = index,
        }
        true
    }

    /// The hand-off delay in a direction.
    pub fn layer_delay(&self, direction: Direction) -> SimTime {
        match direction {
            Direction::Lower => self.lower_delay,
            Direction::Upper => self.upper_delay,
        }
    }

    /// Set the hand-off delay in a direction.
    pub fn set_layer_delay(&mut self, direction: Direction, delay: SimTime) {
        assert!(delay.is_valid());
        match direction {
            Direction::Lower => self.lower_delay = delay,
            Direction::Upper => self.upper_delay = delay,
        }
    }

    /// The maximum queue length.
    pub fn max_queue_length(&self) -> usize {
        self.max_queue_length
    }

    /// Change the maximum queue length. Must be positive.
    pub fn set_max_queue_length(&mut self, max_queue_length: usize) {
        assert!(max_queue_length > 0);
        self.max_queue_length = max_queue_length;
    }

    /// Whether the downward queue is at capacity.
    pub fn queue_is_full(&self) -> bool {
        debug_assert!(self.queue.len() <= self.max_queue_length);
        self.queue.len() == self.max_queue_length
    }
}

/// The link layer: the thin shim between the MAC and the rest of the stack.
#[derive(Debug)]
pub struct LinkLayer {
    /// The medium access protocol running in this link layer.
    pub mac: Mac,
}

/// The MAC variants a link layer can run.
#[derive(Debug)]
pub enum Mac {
    /// RFID reader MAC.
    Reader(ReaderMac),
    /// RFID tag MAC.
    Tag(TagMac),
}

/// The protocol-specific part of a layer.
#[derive(Debug)]
pub enum LayerBody {
    /// Physical layer (radio).
    Physical(PhysicalLayer),
    /// Link layer with its MAC.
    Link(LinkLayer),
    /// A pass-through layer (network/transport interposition).
    Relay,
    /// Application layer.
    Application(AppLayer),
}

impl LayerBody {
    /// The physical layer, if this is one.
    pub fn as_phy(&self) -> Option<&PhysicalLayer> {
        match self {
            LayerBody::Physical(phy) => Some(phy),
            _ => None,
        }
    }

    /// The physical layer. Panics when the body is not a physical layer.
    pub fn phy(&self) -> &PhysicalLayer {
        self.as_phy().expect("layer is not a physical layer")
    }

    /// Mutable physical layer access.
    pub fn phy_mut(&mut self) -> &mut PhysicalLayer {
        match self {
            LayerBody::Physical(phy) => phy,
            _ => panic!("layer is not a physical layer"),
        }
    }

    /// The link layer. Panics when the body is not a link layer.
    pub fn link(&self) -> &LinkLayer {
        match self {
            LayerBody::Link(link) => link,
            _ => panic!("layer is not a link layer"),
        }
    }

    /// Mutable link layer access.
    pub fn link_mut(&mut self) -> &mut LinkLayer {
        match self {
            LayerBody::Link(link) => link,
            _ => panic!("layer is not a link layer"),
        }
    }

    /// The reader MAC. Panics when the layer does not run one.
    pub fn reader_mac(&self) -> &ReaderMac {
        match &self.link().mac {
            Mac::Reader(mac) => mac,
            Mac::Tag(_) => panic!("link layer runs a tag MAC"),
        }
    }

    /// Mutable reader MAC access.
    pub fn reader_mac_mut(&mut self) -> &mut ReaderMac {
        match &mut self.link_mut().mac {
            Mac::Reader(mac) => mac,
            Mac::Tag(_) => panic!("link layer runs a tag MAC"),
        }
    }

    /// The tag MAC. Panics when the layer does not run one.
    pub fn tag_mac(&self) -> &TagMac {
        match &self.link().mac {
            Mac::Tag(mac) => mac,
            Mac::Reader(_) => panic!("link layer runs a reader MAC"),
        }
    }

    /// Mutable tag MAC access.
    pub fn tag_mac_mut(&mut self) -> &mut TagMac {
        match &mut self.link_mut().mac {
            Mac::Tag(mac) => mac,
            Mac::Reader(_) => panic!("link layer runs a reader MAC"),
        }
    }

    /// The application layer. Panics when the body is not one.
    pub fn app(&self) -> &AppLayer {
        match self {
            LayerBody::Application(app) => app,
            _ => panic!("layer is not an application layer"),
        }
    }

    /// Mutable application layer access.
    pub fn app_mut(&mut self) -> &mut AppLayer {
        match self {
            LayerBody::Application(app) => app,
            _ => panic!("layer is not an application layer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_neighbor_becomes_default() {
        let mut common = LayerCommon::new(LayerKind::Link, 1);
        common.insert_layer(Direction::Lower, LayerId(4));
        common.insert_layer(Direction::Lower, LayerId(7));
        assert_eq!(common.default_layer(Direction::Lower), 0);
        assert_eq!(common.neighbors(Direction::Lower), &[LayerId(4), LayerId(7)]);

        assert!(common.set_default_layer(Direction::Lower, 1));
        assert_eq!(common.default_layer(Direction::Lower), 1);
        assert!(!common.set_default_layer(Direction::Lower, 2));
        assert!(!common.set_default_layer(Direction::Upper, 0));
    }

    #[test]
    fn test_queue_capacity() {
        let mut common = LayerCommon::new(LayerKind::Application, 2);
        assert!(!common.queue_is_full());
        common.queue.push_back((Packet::new(), 0));
        common.queue.push_back((Packet::new(), 0));
        assert!(common.queue_is_full());
    }

    #[test]
    fn test_direction_opposite() {
        assert_eq!(Direction::Lower.opposite(), Direction::Upper);
        assert_eq!(Direction::Upper.opposite(), Direction::Lower);
    }
}
