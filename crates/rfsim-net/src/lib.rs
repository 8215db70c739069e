//! # rfsim-net
//!
//! The RFSIM node stack and wireless medium.
//!
//! A [`World`] owns every node stack, the wireless channels, the event
//! scheduler, the random number generator, and the record log. Layers live
//! in an arena and are addressed by [`LayerId`]; scheduled events carry
//! layer handles and owned packets, so no component holds a reference into
//! another.
//!
//! Modules:
//! - [`layer`]: communication-layer common state (neighbor lists, downward
//!   queue, backpressure)
//! - [`signal`]: shared wireless signals
//! - [`phy`]: the physical layer (interference set, capture, carrier sense)
//! - [`channel`]: wireless channels and the channel manager
//! - [`mac`]: the slotted-MAC base
//! - [`reader_mac`] / [`tag_mac`]: the RFID MAC state machines
//! - [`app`]: the reader and tag applications
//! - [`world`]: the arena, the event enum, and dispatch

pub mod app;
pub mod channel;
pub mod layer;
pub mod mac;
pub mod phy;
pub mod reader_mac;
pub mod signal;
pub mod tag_mac;
pub mod world;

pub use app::{AppBody, AppLayer, ReadTagData, ReaderApp, TagApp};
pub use channel::{ChannelId, ChannelManager, WirelessChannel};
pub use layer::{Direction, LayerBody, LayerCommon, LinkLayer, Mac};
pub use mac::SlottedMac;
pub use phy::{PhyKind, PhysicalLayer, ReaderPhy, TagPhy};
pub use reader_mac::ReaderMac;
pub use signal::{SignalId, WirelessSignal};
pub use tag_mac::TagMac;
pub use world::{Epoch, Ev, World};

/// Handle to a layer in the world's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayerId(pub usize);

/// Handle to a node in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeIndex(pub usize);
