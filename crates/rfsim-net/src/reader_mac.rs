//! The RFID reader MAC.
//!
//! The reader drives the slotted-ALOHA read cycle: it broadcasts a REQUEST
//! naming the slot count, collects tag REPLYs, SELECTs one replying tag,
//! forwards the tag's identity upward, and ACKs it. A cycle timer bounds
//! each application read; after enough consecutive empty contention cycles
//! the read ends early unless the application asked for the entire cycle.

use crate::layer::Direction;
use crate::mac::SlottedMac;
use crate::world::{Ev, World};
use crate::LayerId;
use rfsim_core::{NodeId, RecordLog, Scheduler, SimTime, Timer};
use rfsim_packet::{
    LayerData, Packet, ReaderFrameKind, ReaderMacHeader, ReaderAppKind, TagFrameKind,
};
use rfsim_core::LayerKind;
use tracing::debug;

/// Reader MAC state.
#[derive(Debug)]
pub struct ReaderMac {
    /// Shared slotted-MAC state.
    pub base: SlottedMac,
    /// The application layer this MAC reports to.
    pub app: LayerId,
    /// Whether `reset_slot_number` is live.
    pub do_reset_slot: bool,
    /// Slot at which the contention cycle resets after a sent SELECT.
    pub reset_slot_number: u32,
    /// Run the read cycle to completion instead of stopping early.
    pub do_entire_read_cycle: bool,
    /// Consecutive contention cycles without a successful read.
    pub missed_read_count: u32,
    /// Bounds the current application read.
    pub cycle_timer: Timer<Ev>,
    /// The application read packet currently being served.
    pub current_app_read_packet: Option<Packet>,
    /// Slot count for upcoming contention cycles.
    pub next_cycle_number_of_slots: u32,
    /// Length of each read cycle.
    pub next_cycle_time: SimTime,
    /// Winning slot number per received tag identity.
    pub winning_slots: Vec<(NodeId, u32)>,
    /// Slot numbers at which missed reads occurred.
    pub missed_reads: Vec<u32>,
}

impl ReaderMac {
    /// Interframe spacing before reader transmissions.
    pub const READER_IFS: f64 = 10e-6;

    /// Default contention-cycle slot count.
    pub const DEFAULT_NUMBER_OF_SLOTS: u32 = 10;

    /// Default read-cycle length in seconds.
    pub const DEFAULT_CYCLE_TIME: f64 = 5.25;

    /// Consecutive missed reads before a cycle is ended early.
    pub const MISSED_READ_THRESHOLD: u32 = 3;

    const MISSED_READ_TOTAL_KEY: &'static str = "missed_read_total";
    const MISSED_READ_SLOT_AVG_KEY: &'static str = "missed_read_slot_avg";
    const WINNING_SLOT_AVG_KEY: &'static str = "winning_slot_avg";

    /// Fresh reader MAC state reporting to `app`.
    pub fn new(app: LayerId) -> Self {
        ReaderMac {
            base: SlottedMac::new(),
            app,
            do_reset_slot: false,
            reset_slot_number: 0,
            do_entire_read_cycle: false,
            missed_read_count: 0,
            cycle_timer: Timer::new(),
            current_app_read_packet: None,
            next_cycle_number_of_slots: Self::DEFAULT_NUMBER_OF_SLOTS,
            next_cycle_time: SimTime::from_secs(Self::DEFAULT_CYCLE_TIME),
            winning_slots: Vec::new(),
            missed_reads: Vec::new(),
        }
    }

    /// Whether the remaining read-cycle time fits another contention cycle.
    ///
    /// One extra slot is needed for the REQUEST itself.
    pub fn is_enough_time_for_contention_cycle(&self, scheduler: &Scheduler<Ev>) -> bool {
        let next_cycle = (self.next_cycle_number_of_slots + 1) as f64
            * self.base.slot_duration.as_secs();
        SimTime::from_secs(next_cycle) < self.cycle_timer.time_remaining(scheduler)
    }

    /// Build a REQUEST at the power of the application read packet.
    pub fn create_request_packet(&self, me: NodeId) -> Packet {
        // Slots for: contention, the SELECT, the tag's payload, the ACK.
        assert!(self.next_cycle_number_of_slots >= 4);
        let app_packet = self
            .current_app_read_packet
            .as_ref()
            .expect("request without a read in progress");
        let mut packet = Packet::new();
        packet.set_tx_power(app_packet.tx_power());
        packet.add_data(
            LayerKind::Link,
            LayerData::ReaderMac(ReaderMacHeader {
                kind: ReaderFrameKind::Request,
                sender: me,
                receiver: NodeId::BROADCAST,
                number_of_slots: self.next_cycle_number_of_slots as u8,
            }),
        );
        packet
    }

    /// Build an ACK to a tag, sent at maximum power.
    pub fn create_ack_packet(&self, me: NodeId, destination: NodeId) -> Packet {
        let mut packet = Packet::new();
        packet.set_do_max_tx_power(true);
        packet.add_data(
            LayerKind::Link,
            LayerData::ReaderMac(ReaderMacHeader {
                kind: ReaderFrameKind::Ack,
                sender: me,
                receiver: destination,
                number_of_slots: 0,
            }),
        );
        packet
    }

    /// Attach a GENERIC link header to a packet.
    pub fn add_generic_header(packet: &mut Packet, me: NodeId, receiver: NodeId) {
        packet.add_data(
            LayerKind::Link,
            LayerData::ReaderMac(ReaderMacHeader {
                kind: ReaderFrameKind::Generic,
                sender: me,
                receiver,
                number_of_slots: 0,
            }),
        );
    }

    /// Attach a SELECT link header; SELECTs go out at maximum power.
    pub fn add_select_header(packet: &mut Packet, me: NodeId, receiver: NodeId) {
        packet.set_do_max_tx_power(true);
        packet.add_data(
            LayerKind::Link,
            LayerData::ReaderMac(ReaderMacHeader {
                kind: ReaderFrameKind::Select,
                sender: me,
                receiver,
                number_of_slots: 0,
            }),
        );
    }

    /// Arm a REQUEST for the next slot and leave the current cycle.
    pub fn start_next_contention_cycle(&mut self, me: NodeId) {
        debug_assert!(self.base.packet_to_transmit.is_none());
        self.base.packet_to_transmit = Some(self.create_request_packet(me));
        self.missed_read_count = 0;
        self.do_reset_slot = false;
        self.base.stop_contention_cycle();
        self.base.tx_slot = self.base.current_slot;
    }

    /// Emit end-of-run statistics.
    pub fn emit_stats(&self, log: &mut RecordLog, now: SimTime, node: NodeId) {
        let missed_total = self.missed_reads.len();
        let missed_avg = if missed_total > 0 {
            self.missed_reads.iter().sum::<u32>() as f64 / missed_total as f64
        } else {
            0.0
        };
        log.stats(now, node, Self::MISSED_READ_TOTAL_KEY, missed_total.to_string());
        log.stats(now, node, Self::MISSED_READ_SLOT_AVG_KEY, missed_avg.to_string());

        let winning_total = self.winning_slots.len();
        let winning_avg = if winning_total > 0 {
            self.winning_slots.iter().map(|(_, slot)| *slot).sum::<u32>() as f64
                / winning_total as f64
        } else {
            0.0
        };
        log.stats(now, node, Self::WINNING_SLOT_AVG_KEY, winning_avg.to_string());
    }
}

impl World {
    /// Reader slot hook, run at every slot boundary.
    pub(crate) fn reader_mac_begin_slot(&mut self, link: LayerId) {
        let mut end_cycle_early = false;
        {
            let World {
                layers,
                nodes,
                scheduler,
                ..
            } = self;
            let entry = &mut layers[link.0];
            let me = nodes[entry.node.0].id;
            let mac = entry.body.reader_mac_mut();

            // Check for the transmission slot before the end-slot check so a
            // packet armed right after stop_contention_cycle still goes out
            // without triggering the end-slot actions.
            if mac.base.current_slot == mac.base.tx_slot {
                if let Some(packet) = mac.base.packet_to_transmit.take() {
                    debug!(
                        node = %me,
                        tx_slot = mac.base.tx_slot,
                        current_slot = mac.base.current_slot,
                        "reader transmission slot"
                    );
                    mac.base.start_send_timer(
                        scheduler,
                        link,
                        Direction::Lower,
                        packet,
                        SimTime::from_secs(ReaderMac::READER_IFS),
                    );
                }
            } else if mac.base.number_of_slots == 0
                || mac.base.current_slot >= mac.base.number_of_slots
                || (mac.do_reset_slot && mac.base.current_slot == mac.reset_slot_number)
            {
                // No tag was read in this contention cycle. The next REQUEST
                // goes out one slot later, which keeps the cycle alive when a
                // tag is still transmitting in the last slot.
                debug_assert!(mac.base.packet_to_transmit.is_none());
                debug!(
                    node = %me,
                    current_slot = mac.base.current_slot,
                    reset_slot = mac.reset_slot_number,
                    number_of_slots = mac.base.number_of_slots,
                    missed_read_count = mac.missed_read_count,
                    do_reset = mac.do_reset_slot,
                    "reader end slot"
                );

                // Count the miss only while a read is actually in progress.
                if !mac.do_entire_read_cycle && mac.cycle_timer.is_running(scheduler) {
                    mac.missed_reads.push(mac.base.current_slot);
                    mac.missed_read_count += 1;
                } else {
                    mac.missed_read_count = 0;
                }

                mac.do_reset_slot = false;
                mac.base.stop_contention_cycle();

                if !mac.do_entire_read_cycle
                    && mac.missed_read_count == ReaderMac::MISSED_READ_THRESHOLD
                {
                    // Too many consecutive misses: force the read to end.
                    debug_assert!(mac.cycle_timer.is_running(scheduler));
                    mac.cycle_timer.stop(scheduler);
                    end_cycle_early = true;
                } else if mac.is_enough_time_for_contention_cycle(scheduler) {
                    mac.base.packet_to_transmit = Some(mac.create_request_packet(me));
                    // current_slot is incremented below, so the REQUEST goes
                    // out in the next slot.
                    mac.base.tx_slot = mac.base.current_slot + 1;
                }
            }

            mac.base.current_slot += 1;
            let slot = mac.base.slot_duration;
            mac.base.slot_timer.reschedule(scheduler, slot);
        }
        if end_cycle_early {
            self.reader_mac_end_request_cycle(link);
        }
    }

    /// End the current read: release the application packet, unblock the
    /// queues above, and tell the application.
    pub(crate) fn reader_mac_end_request_cycle(&mut self, link: LayerId) {
        let app = {
            let mac = self.layers[link.0].body.reader_mac_mut();
            debug_assert!(!mac.base.in_contention_cycle());
            mac.current_app_read_packet = None;
            mac.app
        };
        self.unblock_upper_queues(link);
        self.reader_app_signal_read_end(app);
    }

    /// Reader handling of frames arriving from tags.
    pub(crate) fn reader_mac_handle_recvd_mac_packet(&mut self, link: LayerId, packet: Packet) {
        let header = match packet.tag_mac_header() {
            Some(header) => header.clone(),
            None => return,
        };
        let me = self.node_id_of(link);
        if header.receiver != me && !header.receiver.is_broadcast() {
            return;
        }

        match header.kind {
            TagFrameKind::Reply => {
                let World {
                    layers, scheduler, ..
                } = self;
                let mac = layers[link.0].body.reader_mac_mut();
                // A read that was ended early stops the cycle timer; late
                // REPLYs are then ignored.
                if !mac.cycle_timer.is_running(scheduler) {
                    return;
                }
                // After a lost SELECT the reader already has a REQUEST armed
                // for the reset slot; a REPLY racing in is ignored.
                if mac.base.packet_to_transmit.is_some() {
                    return;
                }
                let mut select = mac
                    .current_app_read_packet
                    .clone()
                    .expect("reply outside of a read");
                ReaderMac::add_select_header(&mut select, me, header.sender);
                mac.base.packet_to_transmit = Some(select);
                mac.base.tx_slot = mac.base.current_slot;
                debug_assert!(mac.base.slot_timer.is_running(scheduler));
            }
            TagFrameKind::Generic => {
                {
                    let mac = self.layers[link.0].body.reader_mac_mut();
                    // The slot counter was incremented at the slot boundary,
                    // the REPLY came two slots before this payload, and the
                    // SELECT one slot before: the winning slot is three back.
                    let winning_slot = mac.base.current_slot - 3;
                    mac.winning_slots.push((header.sender, winning_slot));
                }
                self.mac_send_to_link_layer(link, Direction::Upper, packet);
                {
                    let World {
                        layers, scheduler, ..
                    } = self;
                    let mac = layers[link.0].body.reader_mac_mut();
                    mac.base.packet_to_transmit = Some(mac.create_ack_packet(me, header.sender));
                    mac.base.tx_slot = mac.base.current_slot;
                    debug_assert!(mac.base.slot_timer.is_running(scheduler));
                }
            }
        }
    }

    /// Reader handling of packets from the application.
    pub(crate) fn reader_mac_handle_upper_packet(&mut self, link: LayerId, packet: Packet) -> bool {
        let data = match packet.reader_app_data() {
            Some(data) => data.clone(),
            None => return false,
        };
        let me = self.node_id_of(link);

        match data.kind {
            ReaderAppKind::Read => {
                // One read at a time.
                self.block_upper_queues(link);
                let World {
                    layers, scheduler, ..
                } = self;
                let mac = layers[link.0].body.reader_mac_mut();
                assert!(mac.current_app_read_packet.is_none());
                mac.do_entire_read_cycle = data.do_entire_read_cycle;
                mac.current_app_read_packet = Some(packet);
                let cycle = mac.next_cycle_time;
                mac.cycle_timer.start(scheduler, cycle);
                if mac.is_enough_time_for_contention_cycle(scheduler) {
                    mac.start_next_contention_cycle(me);
                }
                debug_assert!(mac.base.slot_timer.is_running(scheduler));
                true
            }
            ReaderAppKind::Reset => {
                self.block_upper_queues(link);
                let World {
                    layers, scheduler, ..
                } = self;
                let mac = layers[link.0].body.reader_mac_mut();
                assert!(mac.base.packet_to_transmit.is_none());
                let mut packet = packet;
                ReaderMac::add_generic_header(&mut packet, me, NodeId::BROADCAST);
                mac.base.packet_to_transmit = Some(packet);
                mac.base.tx_slot = mac.base.current_slot;
                debug_assert!(mac.base.slot_timer.is_running(scheduler));
                true
            }
        }
    }

    /// Reader bookkeeping once a frame actually went out on the channel.
    pub(crate) fn reader_mac_handle_packet_sent(&mut self, link: LayerId, packet: &Packet) {
        let me = self.node_id_of(link);
        let kind = packet.reader_mac_header().map(|h| h.kind);
        let mut unblock = false;
        {
            let World {
                layers, scheduler, ..
            } = self;
            let mac = layers[link.0].body.reader_mac_mut();
            match kind {
                Some(ReaderFrameKind::Request) => {
                    // The cycle is now underway.
                    mac.base.current_slot = 0;
                    mac.base.number_of_slots = packet
                        .reader_mac_header()
                        .map(|h| h.number_of_slots as u32)
                        .unwrap_or(0);
                }
                Some(ReaderFrameKind::Select) => {
                    // If the SELECT is lost, the cycle resets two slots
                    // later (current_slot already points one slot ahead).
                    mac.do_reset_slot = true;
                    mac.reset_slot_number = mac.base.current_slot + 1;
                }
                Some(ReaderFrameKind::Ack) => {
                    if mac.is_enough_time_for_contention_cycle(scheduler) {
                        mac.start_next_contention_cycle(me);
                    }
                }
                _ => unblock = true,
            }
        }
        if unblock {
            self.unblock_upper_queues(link);
        }
    }

    /// Reader channel-busy policy: REQUEST and SELECT are dropped silently;
    /// anything else releases the queues. No retransmission either way.
    pub(crate) fn reader_mac_handle_channel_busy(&mut self, link: LayerId, packet: Packet) {
        debug!(packet = %packet, "reader channel busy, dropping");
        if !packet.is_reader_frame(ReaderFrameKind::Request)
            && !packet.is_reader_frame(ReaderFrameKind::Select)
        {
            self.unblock_upper_queues(link);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_power_and_slots() {
        let mut mac = ReaderMac::new(LayerId(1));
        let mut app_packet = Packet::new();
        app_packet.set_tx_power(0.25);
        mac.current_app_read_packet = Some(app_packet);
        mac.next_cycle_number_of_slots = 12;

        let request = mac.create_request_packet(NodeId::new(3));
        assert!(request.is_reader_frame(ReaderFrameKind::Request));
        assert_eq!(request.tx_power(), 0.25);
        let header = request.reader_mac_header().unwrap();
        assert_eq!(header.number_of_slots, 12);
        assert!(header.receiver.is_broadcast());
    }

    #[test]
    fn test_ack_and_select_force_max_power() {
        let mac = ReaderMac::new(LayerId(1));
        let ack = mac.create_ack_packet(NodeId::new(3), NodeId::new(9));
        assert!(ack.do_max_tx_power());
        assert_eq!(ack.reader_mac_header().unwrap().receiver, NodeId::new(9));

        let mut select = Packet::new();
        ReaderMac::add_select_header(&mut select, NodeId::new(3), NodeId::new(9));
        assert!(select.do_max_tx_power());
        assert!(select.is_reader_frame(ReaderFrameKind::Select));
    }

    #[test]
    fn test_enough_time_needs_running_cycle_timer() {
        let sched: Scheduler<Ev> = Scheduler::new();
        let mac = ReaderMac::new(LayerId(1));
        // Timer not running: no time remaining, so never enough.
        assert!(!mac.is_enough_time_for_contention_cycle(&sched));
    }

    #[test]
    fn test_start_next_contention_cycle_resets_state() {
        let mut mac = ReaderMac::new(LayerId(1));
        mac.current_app_read_packet = Some(Packet::new());
        mac.base.current_slot = 7;
        mac.base.number_of_slots = 10;
        mac.missed_read_count = 2;
        mac.do_reset_slot = true;

        mac.start_next_contention_cycle(NodeId::new(5));
        assert!(mac.base.packet_to_transmit.is_some());
        assert_eq!(mac.missed_read_count, 0);
        assert!(!mac.do_reset_slot);
        assert!(!mac.base.in_contention_cycle());
        assert_eq!(mac.base.tx_slot, 0);
    }

    #[test]
    fn test_stats_emission() {
        let mut mac = ReaderMac::new(LayerId(1));
        mac.missed_reads = vec![10, 0];
        mac.winning_slots = vec![(NodeId::new(2), 3), (NodeId::new(4), 5)];

        let mut log = RecordLog::new();
        mac.emit_stats(&mut log, SimTime::from_secs(20.0), NodeId::new(0));
        let stats = log.stats_for(NodeId::new(0));
        assert_eq!(stats.len(), 3);
        assert_eq!(stats[0].key, "missed_read_total");
        assert_eq!(stats[0].value, "2");
        assert_eq!(stats[1].key, "missed_read_slot_avg");
        assert_eq!(stats[1].value, "5");
        assert_eq!(stats[2].key, "winning_slot_avg");
        assert_eq!(stats[2].value, "4");
    }
}
