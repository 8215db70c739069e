//! Wireless channels and the channel manager.
//!
//! A channel pairs a path-loss model with an optional fading model. The
//! manager owns the channels and the sender/listener attachments: which
//! physical layers transmit on which channels, and which listen.

use crate::signal::WirelessSignal;
use crate::LayerId;
use rfsim_core::{NodeId, SimTime};
use rfsim_propagation::{Fading, PathLoss, RxField};
use std::collections::BTreeMap;
use tracing::debug;

/// Identity of a wireless channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u32);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A wireless channel: required path loss, optional fading.
pub struct WirelessChannel {
    path_loss: Box<dyn PathLoss>,
    fading: Option<Box<dyn Fading>>,
}

impl WirelessChannel {
    /// A channel with path loss only.
    pub fn new(path_loss: Box<dyn PathLoss>) -> Self {
        WirelessChannel {
            path_loss,
            fading: None,
        }
    }

    /// A channel with path loss and fading.
    pub fn with_fading(path_loss: Box<dyn PathLoss>, fading: Box<dyn Fading>) -> Self {
        WirelessChannel {
            path_loss,
            fading: Some(fading),
        }
    }

    /// Strength of a signal at a receiver, fading included.
    pub fn received_strength(
        &mut self,
        signal: &WirelessSignal,
        receiver: &RxField,
        receiver_id: NodeId,
        now: SimTime,
    ) -> f64 {
        let tx = signal.tx_field();
        let mut strength = self.path_loss.received_strength(&tx, receiver);
        if let Some(fading) = self.fading.as_mut() {
            strength *= fading.fading_factor(now, &tx, receiver_id);
        }
        debug!(%receiver_id, strength, "received strength");
        strength
    }

    /// Whether a signal received at the given SINR is in error.
    ///
    /// Reserved for a future bit-error model; reception in the baseline is
    /// threshold-based only.
    pub fn signal_has_error(&self, _sinr: f64, _signal: &WirelessSignal) -> bool {
        false
    }
}

impl std::fmt::Debug for WirelessChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WirelessChannel")
            .field("fading", &self.fading.is_some())
            .finish()
    }
}

/// Routes signals from senders to the listeners of their channels.
#[derive(Debug, Default)]
pub struct ChannelManager {
    channels: BTreeMap<ChannelId, WirelessChannel>,
    /// Channels each physical layer transmits on, in attach order.
    senders: BTreeMap<LayerId, Vec<ChannelId>>,
    /// Physical layers listening on each channel, in attach order.
    listeners: BTreeMap<ChannelId, Vec<LayerId>>,
}

impl ChannelManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) a channel under an id.
    pub fn add_channel(&mut self, id: ChannelId, channel: WirelessChannel) {
        self.channels.insert(id, channel);
    }

    /// Remove a channel. Returns whether one was present.
    pub fn remove_channel(&mut self, id: ChannelId) -> bool {
        self.channels.remove(&id).is_some()
    }

    /// The channel under an id.
    pub fn channel(&self, id: ChannelId) -> Option<&WirelessChannel> {
        self.channels.get(&id)
    }

    /// Mutable channel access (fading state advances on use).
    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut WirelessChannel> {
        self.channels.get_mut(&id)
    }

    /// Attach a physical layer as a sender on a channel.
    pub fn attach_as_sender(&mut self, phy: LayerId, id: ChannelId) -> bool {
        if !self.channels.contains_key(&id) {
            return false;
        }
        self.senders.entry(phy).or_default().push(id);
        true
    }

    /// Detach a physical layer as a sender from a channel. Removes one
    /// attachment; returns whether one was found.
    pub fn detach_as_sender(&mut self, phy: LayerId, id: ChannelId) -> bool {
        if !self.channels.contains_key(&id) {
            return false;
        }
        match self.senders.get_mut(&phy) {
            Some(channels) => match channels.iter().position(|c| *c == id) {
                Some(pos) => {
                    channels.remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Attach a physical layer as a listener on a channel.
    pub fn attach_as_listener(&mut self, phy: LayerId, id: ChannelId) -> bool {
        if !self.channels.contains_key(&id) {
            return false;
        }
        self.listeners.entry(id).or_default().push(phy);
        true
    }

    /// Detach a physical layer as a listener from a channel. Returns
    /// whether an attachment was found.
    pub fn detach_as_listener(&mut self, phy: LayerId, id: ChannelId) -> bool {
        if !self.channels.contains_key(&id) {
            return false;
        }
        match self.listeners.get_mut(&id) {
            Some(layers) => match layers.iter().position(|l| *l == phy) {
                Some(pos) => {
                    layers.remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// The channels a physical layer transmits on, in attach order.
    pub fn sender_channels(&self, phy: LayerId) -> &[ChannelId] {
        self.senders.get(&phy).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The physical layers listening on a channel, in attach order.
    pub fn listeners_of(&self, id: ChannelId) -> &[LayerId] {
        self.listeners.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfsim_propagation::FreeSpace;

    fn manager_with_channel(id: u32) -> ChannelManager {
        let mut manager = ChannelManager::new();
        manager.add_channel(ChannelId(id), WirelessChannel::new(Box::new(FreeSpace::new())));
        manager
    }

    #[test]
    fn test_attach_to_missing_channel_fails() {
        let mut manager = manager_with_channel(0);
        assert!(!manager.attach_as_sender(LayerId(1), ChannelId(9)));
        assert!(!manager.attach_as_listener(LayerId(1), ChannelId(9)));
        assert!(manager.attach_as_sender(LayerId(1), ChannelId(0)));
        assert!(manager.attach_as_listener(LayerId(1), ChannelId(0)));
    }

    #[test]
    fn test_sender_attach_order_is_preserved() {
        let mut manager = manager_with_channel(0);
        manager.add_channel(ChannelId(1), WirelessChannel::new(Box::new(FreeSpace::new())));
        manager.add_channel(ChannelId(2), WirelessChannel::new(Box::new(FreeSpace::new())));

        let phy = LayerId(3);
        assert!(manager.attach_as_sender(phy, ChannelId(0)));
        assert!(manager.attach_as_sender(phy, ChannelId(2)));
        assert_eq!(manager.sender_channels(phy), &[ChannelId(0), ChannelId(2)]);

        assert!(manager.detach_as_sender(phy, ChannelId(0)));
        assert!(!manager.detach_as_sender(phy, ChannelId(0)));
        assert_eq!(manager.sender_channels(phy), &[ChannelId(2)]);
    }

    #[test]
    fn test_listener_detach() {
        let mut manager = manager_with_channel(0);
        let a = LayerId(1);
        let b = LayerId(2);
        manager.attach_as_listener(a, ChannelId(0));
        manager.attach_as_listener(b, ChannelId(0));
        assert_eq!(manager.listeners_of(ChannelId(0)), &[a, b]);

        assert!(manager.detach_as_listener(a, ChannelId(0)));
        assert_eq!(manager.listeners_of(ChannelId(0)), &[b]);
        assert!(!manager.detach_as_listener(a, ChannelId(0)));
    }

    #[test]
    fn test_remove_channel() {
        let mut manager = manager_with_channel(5);
        assert!(manager.remove_channel(ChannelId(5)));
        assert!(!manager.remove_channel(ChannelId(5)));
    }
}
