//! Shared wireless signals.
//!
//! One emitted signal is observed by every listener on the sender's
//! channels; listeners hold it by reference count until their scheduled
//! signal-end fires. The channel id is interior-mutable: emission rewrites
//! it once per attached channel, and listeners read whatever value it holds
//! when their copy is delivered. A tag locking onto the channel of the
//! reader it last heard depends on that.

use crate::channel::ChannelId;
use rfsim_core::{Location, SimTime};
use rfsim_packet::Packet;
use rfsim_propagation::TxField;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identity of an emitted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SignalId(pub u64);

static NEXT_SIGNAL_ID: AtomicU64 = AtomicU64::new(0);

/// A radio signal in flight.
#[derive(Debug)]
pub struct WirelessSignal {
    id: SignalId,
    source: Location,
    db_strength: f64,
    wavelength: f64,
    tx_gain: f64,
    channel: Cell<ChannelId>,
    packet: Packet,
}

impl WirelessSignal {
    /// Create a signal for the given packet.
    pub fn new(
        source: Location,
        db_strength: f64,
        wavelength: f64,
        tx_gain: f64,
        packet: Packet,
    ) -> Self {
        WirelessSignal {
            id: SignalId(NEXT_SIGNAL_ID.fetch_add(1, Ordering::Relaxed)),
            source,
            db_strength,
            wavelength,
            tx_gain,
            channel: Cell::new(ChannelId(0)),
            packet,
        }
    }

    /// The signal's unique id.
    pub fn id(&self) -> SignalId {
        self.id
    }

    /// Where the signal was emitted.
    pub fn source(&self) -> Location {
        self.source
    }

    /// Transmit strength in dB.
    pub fn db_strength(&self) -> f64 {
        self.db_strength
    }

    /// Wavelength in meters.
    pub fn wavelength(&self) -> f64 {
        self.wavelength
    }

    /// Transmitter antenna gain.
    pub fn tx_gain(&self) -> f64 {
        self.tx_gain
    }

    /// The channel the signal is (currently) attributed to.
    pub fn channel(&self) -> ChannelId {
        self.channel.get()
    }

    /// Attribute the signal to a channel.
    pub fn set_channel(&self, channel: ChannelId) {
        self.channel.set(channel);
    }

    /// The packet the signal carries.
    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    /// Airtime of the signal.
    pub fn duration(&self) -> SimTime {
        self.packet.duration()
    }

    /// The transmit-side view the propagation models consume.
    pub fn tx_field(&self) -> TxField {
        TxField {
            location: self.source,
            db_strength: self.db_strength,
            wavelength: self.wavelength,
            tx_gain: self.tx_gain,
        }
    }
}
