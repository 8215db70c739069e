//! The RFID tag MAC.
//!
//! A tag joins a contention cycle when it hears a REQUEST, picks a reply
//! slot uniformly at random, and answers a SELECT addressed to it by
//! passing the frame to its application, which produces the identity packet
//! sent in the following slot.

use crate::layer::Direction;
use crate::mac::SlottedMac;
use crate::world::World;
use crate::LayerId;
use rfsim_core::{LayerKind, NodeId, SimTime};
use rfsim_packet::{LayerData, Packet, ReaderFrameKind, TagFrameKind, TagMacHeader};
use tracing::debug;

/// Tag MAC state.
#[derive(Debug)]
pub struct TagMac {
    /// Shared slotted-MAC state.
    pub base: SlottedMac,
    /// The application layer this MAC reports to.
    pub app: LayerId,
}

impl TagMac {
    /// Interframe spacing before GENERIC tag transmissions.
    pub const TAG_GENERIC_IFS: f64 = 15e-6;

    /// Interframe spacing before REPLY transmissions.
    pub const TAG_REPLY_IFS: f64 = 20e-6;

    /// Fresh tag MAC state reporting to `app`.
    pub fn new(app: LayerId) -> Self {
        TagMac {
            base: SlottedMac::new(),
            app,
        }
    }

    /// Build a REPLY addressed to a reader.
    pub fn create_reply_packet(me: NodeId, receiver: NodeId) -> Packet {
        let mut packet = Packet::new();
        packet.add_data(
            LayerKind::Link,
            LayerData::TagMac(TagMacHeader {
                kind: TagFrameKind::Reply,
                sender: me,
                receiver,
            }),
        );
        packet
    }

    /// Attach a GENERIC link header to a packet.
    pub fn add_generic_header(packet: &mut Packet, me: NodeId, receiver: NodeId) {
        packet.add_data(
            LayerKind::Link,
            LayerData::TagMac(TagMacHeader {
                kind: TagFrameKind::Generic,
                sender: me,
                receiver,
            }),
        );
    }
}

impl World {
    /// Tag slot hook, run at every slot boundary.
    pub(crate) fn tag_mac_begin_slot(&mut self, link: LayerId) {
        let mut unblock = false;
        {
            let World {
                layers, scheduler, ..
            } = self;
            let mac = layers[link.0].body.tag_mac_mut();

            if mac.base.current_slot == mac.base.tx_slot {
                if let Some(packet) = mac.base.packet_to_transmit.take() {
                    let ifs = if packet.is_tag_frame(TagFrameKind::Reply) {
                        TagMac::TAG_REPLY_IFS
                    } else {
                        TagMac::TAG_GENERIC_IFS
                    };
                    mac.base.start_send_timer(
                        scheduler,
                        link,
                        Direction::Lower,
                        packet,
                        SimTime::from_secs(ifs),
                    );
                }
            } else if mac.base.number_of_slots == 0
                || mac.base.current_slot >= mac.base.number_of_slots - 1
            {
                // Last slot reached without transmitting.
                debug_assert!(mac.base.packet_to_transmit.is_none());
                mac.base.stop_contention_cycle();
                unblock = true;
            }

            mac.base.current_slot += 1;
            let slot = mac.base.slot_duration;
            mac.base.slot_timer.reschedule(scheduler, slot);
        }
        if unblock {
            self.unblock_upper_queues(link);
        }
    }

    /// Tag handling of frames arriving from readers.
    pub(crate) fn tag_mac_handle_recvd_mac_packet(&mut self, link: LayerId, packet: Packet) {
        let header = match packet.reader_mac_header() {
            Some(header) => header.clone(),
            None => return,
        };
        let me = self.node_id_of(link);
        let for_me = header.receiver == me || header.receiver.is_broadcast();

        match header.kind {
            ReaderFrameKind::Request => {
                debug_assert!(header.receiver.is_broadcast());
                let app = self.layers[link.0].body.tag_mac().app;
                let reply_to_reads = self.layers[app.0].body.app().tag_app().reply_to_reads;
                let World { layers, rng, .. } = self;
                let mac = layers[link.0].body.tag_mac_mut();
                if mac.base.in_contention_cycle() {
                    return;
                }
                mac.base.current_slot = 0;
                mac.base.number_of_slots = header.number_of_slots as u32;
                // Slots for: contention, the SELECT, the tag's payload, the
                // ACK.
                assert!(mac.base.number_of_slots >= 4);
                if mac.base.number_of_slots > 0 {
                    mac.base.tx_slot = rng.uniform_int(0, mac.base.number_of_slots - 4);
                    debug_assert!(mac.base.packet_to_transmit.is_none());
                    if reply_to_reads {
                        mac.base.packet_to_transmit =
                            Some(TagMac::create_reply_packet(me, header.sender));
                        debug!(
                            node = %me,
                            tx_slot = mac.base.tx_slot,
                            current_slot = mac.base.current_slot,
                            "tag picked reply slot"
                        );
                    }
                }
            }
            ReaderFrameKind::Select => {
                if header.receiver == me {
                    // Selected: hand the frame upward so the application
                    // generates the identity packet.
                    self.mac_send_to_link_layer(link, Direction::Upper, packet);
                } else {
                    // Another tag won the slot.
                    let mac = self.layers[link.0].body.tag_mac_mut();
                    mac.base.stop_contention_cycle();
                    mac.base.packet_to_transmit = None;
                    self.unblock_upper_queues(link);
                }
            }
            ReaderFrameKind::Generic => {
                if for_me {
                    self.mac_send_to_link_layer(link, Direction::Upper, packet);
                }
            }
            ReaderFrameKind::Ack => {
                // Acknowledged: stop replying until a RESET arrives.
                if for_me {
                    let app = self.layers[link.0].body.tag_mac().app;
                    self.layers[app.0].body.app_mut().tag_mut().reply_to_reads = false;
                }
            }
        }
    }

    /// Tag handling of the identity packet from its application.
    ///
    /// The packet reaches the MAC fast enough to go out in the slot after
    /// the SELECT; the tag has already won its contention period.
    pub(crate) fn tag_mac_handle_upper_packet(&mut self, link: LayerId, packet: Packet) -> bool {
        if packet.tag_app_data().is_none() {
            return false;
        }
        let me = self.node_id_of(link);
        self.block_upper_queues(link);
        let World {
            layers, scheduler, ..
        } = self;
        let mac = layers[link.0].body.tag_mac_mut();
        debug_assert!(mac.base.packet_to_transmit.is_none());
        let mut packet = packet;
        let destination = packet.destination();
        TagMac::add_generic_header(&mut packet, me, destination);
        mac.base.packet_to_transmit = Some(packet);
        // The current slot number is incremented at the end of the slot
        // hook, so this transmits in the next slot.
        mac.base.tx_slot = mac.base.current_slot;
        debug!(
            node = %me,
            tx_slot = mac.base.tx_slot,
            number_of_slots = mac.base.number_of_slots,
            "tag queued identity packet"
        );
        debug_assert!(mac.base.slot_timer.is_running(scheduler));
        debug_assert!(mac.base.in_contention_cycle());
        true
    }

    /// Tag bookkeeping once a frame actually went out on the channel.
    pub(crate) fn tag_mac_handle_packet_sent(&mut self, link: LayerId, packet: &Packet) {
        if packet.is_tag_frame(TagFrameKind::Generic) {
            self.layers[link.0]
                .body
                .tag_mac_mut()
                .base
                .stop_contention_cycle();
            self.unblock_upper_queues(link);
        }
    }

    /// Tag channel-busy policy: a blocked REPLY abandons the contention
    /// cycle; the queues above are always released.
    pub(crate) fn tag_mac_handle_channel_busy(&mut self, link: LayerId, packet: Packet) {
        debug!(packet = %packet, "tag channel busy, dropping");
        if packet.is_tag_frame(TagFrameKind::Reply) {
            self.layers[link.0]
                .body
                .tag_mac_mut()
                .base
                .stop_contention_cycle();
        }
        self.unblock_upper_queues(link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_packet_shape() {
        let reply = TagMac::create_reply_packet(NodeId::new(9), NodeId::new(1));
        assert!(reply.is_tag_frame(TagFrameKind::Reply));
        let header = reply.tag_mac_header().unwrap();
        assert_eq!(header.sender, NodeId::new(9));
        assert_eq!(header.receiver, NodeId::new(1));
        // sender 12 + receiver 4 + type 1
        assert_eq!(reply.size_in_bytes(), 17);
    }

    #[test]
    fn test_generic_header_keeps_destination() {
        let mut packet = Packet::new();
        packet.set_destination(NodeId::new(1));
        let destination = packet.destination();
        TagMac::add_generic_header(&mut packet, NodeId::new(9), destination);
        let header = packet.tag_mac_header().unwrap();
        assert_eq!(header.kind, TagFrameKind::Generic);
        assert_eq!(header.receiver, NodeId::new(1));
    }
}
