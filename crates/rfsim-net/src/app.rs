//! The reader and tag applications.
//!
//! The reader application drives read processes: an optional RESET
//! broadcast, then one READ per power level on a quadratic power ramp,
//! each level waiting for the MAC's read-end signal before the next. It
//! records the first sighting of every tag identity together with the power
//! level and timing. The tag application answers READs with an identity
//! packet while its reply flag is set and re-arms the flag on RESET.

use crate::world::{Ev, World};
use crate::LayerId;
use rfsim_core::{NodeId, RecordLog, SimTime, Timer};
use rfsim_packet::{LayerData, Packet, ReaderAppData, ReaderAppKind, TagAppData};
use rfsim_core::LayerKind;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// One recorded tag sighting.
#[derive(Debug, Clone)]
pub struct ReadTagData {
    /// The tag that was read.
    pub tag: NodeId,
    /// When the identity arrived.
    pub time_read: SimTime,
    /// When the READ that elicited it was sent.
    pub time_read_sent: SimTime,
}

impl ReadTagData {
    /// Latency between the READ going out and the identity arriving.
    pub fn read_latency(&self) -> SimTime {
        self.time_read - self.time_read_sent
    }
}

/// Reader application state.
#[derive(Debug)]
pub struct ReaderApp {
    /// The physical layer whose maximum power anchors the sweep.
    pub phy: LayerId,
    /// Re-arms the read process in repeated mode.
    pub read_timer: Timer<Ev>,
    /// Period between read processes in repeated mode.
    pub read_period: SimTime,
    /// Repeat the read process or run it once.
    pub do_repeated_reads: bool,
    /// Broadcast a RESET before each read process.
    pub do_reset: bool,
    /// Number of power levels in the sweep.
    pub num_power_control_levels: u32,
    /// Maximum transmit power, sampled from the physical layer at start.
    pub max_tx_power: f64,
    /// Zero-based level currently being read.
    pub current_tx_power_level: u32,
    /// When the first READ of the current process was sent.
    pub first_read_sent_time: SimTime,
    /// When the most recent READ was sent.
    pub previous_read_sent_time: SimTime,
    /// Tag sightings grouped by the level they were read at.
    pub read_tags: BTreeMap<u32, Vec<ReadTagData>>,
    /// Identities already seen.
    pub read_tag_ids: BTreeSet<NodeId>,
    /// The most recent sighting.
    pub last_tag_read: Option<(u32, ReadTagData)>,
}

impl ReaderApp {
    /// Default period between repeated read processes, in seconds.
    pub const DEFAULT_READ_PERIOD: f64 = 60.0;

    /// Default number of power control levels.
    pub const DEFAULT_NUM_POWER_CONTROL_LEVELS: u32 = 1;

    const TAGS_READ_COUNT_KEY: &'static str = "tags_read_count";
    const TAGS_READ_AT_LEVEL_KEY_PREFIX: &'static str = "tags_read_count_at_level_";
    const TAGS_READ_PROCESS_AVG_LATENCY_KEY: &'static str = "avg_tag_read_process_latency";
    const LAST_TAG_READ_LATENCY_KEY: &'static str = "last_tag_read_latency";
    const TAG_READ_PROCESS_LATENCY_KEY: &'static str = "tag_read_process_latency";
    const TAG_READ_ID_KEY: &'static str = "tag_read_id";
    const TAG_READ_LEVEL_KEY: &'static str = "tag_read_power_level";
    const TAG_READ_TIME_KEY: &'static str = "tag_read_time";

    /// Fresh reader application state over the given physical layer.
    pub fn new(phy: LayerId) -> Self {
        ReaderApp {
            phy,
            read_timer: Timer::new(),
            read_period: SimTime::from_secs(Self::DEFAULT_READ_PERIOD),
            do_repeated_reads: false,
            do_reset: true,
            num_power_control_levels: Self::DEFAULT_NUM_POWER_CONTROL_LEVELS,
            max_tx_power: 0.0,
            current_tx_power_level: Self::DEFAULT_NUM_POWER_CONTROL_LEVELS,
            first_read_sent_time: SimTime::ZERO,
            previous_read_sent_time: SimTime::ZERO,
            read_tags: BTreeMap::new(),
            read_tag_ids: BTreeSet::new(),
            last_tag_read: None,
        }
    }

    /// Total tags read across all levels.
    pub fn tags_read_count(&self) -> usize {
        self.read_tags.values().map(Vec::len).sum()
    }

    /// Transmit power for a zero-based level.
    ///
    /// Quadratic ramp matching the inverse-square path loss: the read range
    /// grows linearly with the level.
    pub fn tx_power_for_level(&self, level: u32) -> f64 {
        let fraction = (level + 1) as f64 / self.num_power_control_levels as f64;
        self.max_tx_power * fraction * fraction
    }

    /// Emit end-of-run statistics.
    pub fn emit_stats(&self, log: &mut RecordLog, now: SimTime, node: NodeId) {
        let mut process_latency_sum = SimTime::ZERO;
        for (level, reads) in &self.read_tags {
            for read in reads {
                let process_latency = read.time_read - self.first_read_sent_time;
                process_latency_sum += process_latency;

                log.stats(now, node, Self::TAG_READ_ID_KEY, read.tag.to_string());
                log.stats(now, node, Self::TAG_READ_LEVEL_KEY, (level + 1).to_string());
                log.stats(now, node, Self::TAG_READ_TIME_KEY, read.time_read.to_string());
                log.stats(
                    now,
                    node,
                    Self::TAG_READ_PROCESS_LATENCY_KEY,
                    format!("{:.8}", process_latency.as_secs()),
                );
            }
        }

        for level in 0..self.num_power_control_levels {
            let count = self.read_tags.get(&level).map(Vec::len).unwrap_or(0);
            log.stats(
                now,
                node,
                &format!("{}{}", Self::TAGS_READ_AT_LEVEL_KEY_PREFIX, level + 1),
                count.to_string(),
            );
        }

        let total = self.tags_read_count();
        log.stats(now, node, Self::TAGS_READ_COUNT_KEY, total.to_string());

        let avg_process_latency = if total > 0 {
            process_latency_sum.as_secs() / total as f64
        } else {
            0.0
        };
        log.stats(
            now,
            node,
            Self::TAGS_READ_PROCESS_AVG_LATENCY_KEY,
            format!("{:.8}", avg_process_latency),
        );

        let last_latency = self
            .last_tag_read
            .as_ref()
            .map(|(_, read)| read.time_read - self.first_read_sent_time)
            .unwrap_or(SimTime::ZERO);
        log.stats(
            now,
            node,
            Self::LAST_TAG_READ_LATENCY_KEY,
            format!("{:.8}", last_latency.as_secs()),
        );
    }
}

/// Tag application state.
#[derive(Debug)]
pub struct TagApp {
    /// Whether the tag currently answers READs.
    pub reply_to_reads: bool,
}

impl TagApp {
    /// Fresh tag application state; tags start out willing to reply.
    pub fn new() -> Self {
        TagApp {
            reply_to_reads: true,
        }
    }
}

impl Default for TagApp {
    fn default() -> Self {
        Self::new()
    }
}

/// An application layer body.
#[derive(Debug)]
pub struct AppLayer {
    /// Set between the start and stop epochs.
    pub is_running: bool,
    /// Which application runs here.
    pub body: AppBody,
}

/// The application variants.
#[derive(Debug)]
pub enum AppBody {
    /// RFID reader application.
    Reader(ReaderApp),
    /// RFID tag application.
    Tag(TagApp),
}

impl AppLayer {
    /// A reader application layer.
    pub fn reader(phy: LayerId) -> Self {
        AppLayer {
            is_running: false,
            body: AppBody::Reader(ReaderApp::new(phy)),
        }
    }

    /// A tag application layer.
    pub fn tag() -> Self {
        AppLayer {
            is_running: false,
            body: AppBody::Tag(TagApp::new()),
        }
    }

    /// The reader application. Panics when this is a tag application.
    pub fn reader_app(&self) -> &ReaderApp {
        match &self.body {
            AppBody::Reader(app) => app,
            AppBody::Tag(_) => panic!("application layer runs a tag app"),
        }
    }

    /// Mutable reader application access.
    pub fn reader_app_mut(&mut self) -> &mut ReaderApp {
        match &mut self.body {
            AppBody::Reader(app) => app,
            AppBody::Tag(_) => panic!("application layer runs a tag app"),
        }
    }

    /// The tag application. Panics when this is a reader application.
    pub fn tag_app(&self) -> &TagApp {
        match &self.body {
            AppBody::Tag(app) => app,
            AppBody::Reader(_) => panic!("application layer runs a reader app"),
        }
    }

    /// Mutable tag application access.
    pub fn tag_mut(&mut self) -> &mut TagApp {
        match &mut self.body {
            AppBody::Tag(app) => app,
            AppBody::Reader(_) => panic!("application layer runs a reader app"),
        }
    }
}

impl World {
    /// Application start hook.
    pub(crate) fn app_start_handler(&mut self, app: LayerId) {
        let is_reader = matches!(
            self.layers[app.0].body.app().body,
            AppBody::Reader(_)
        );
        if is_reader {
            // The current physical-layer maximum is the top of the sweep;
            // levels step uniformly through (0, max].
            let phy = self.layers[app.0].body.app().reader_app().phy;
            let max_tx_power = self.layers[phy.0].body.phy().max_tx_power();
            self.layers[app.0].body.app_mut().reader_app_mut().max_tx_power = max_tx_power;
            self.reader_app_do_read_process(app);
        }
    }

    /// Application stop hook.
    pub(crate) fn app_stop_handler(&mut self, app: LayerId) {
        let World {
            layers, scheduler, ..
        } = self;
        if let AppBody::Reader(reader) = &mut layers[app.0].body.app_mut().body {
            reader.read_timer.stop(scheduler);
        }
    }

    /// Run one read process: optional RESET, then the power sweep.
    pub(crate) fn reader_app_do_read_process(&mut self, app: LayerId) {
        let do_reset = self.layers[app.0].body.app().reader_app().do_reset;
        if do_reset {
            self.reader_app_send_reset_packet(app);
        }
        {
            let now = self.scheduler.now();
            let reader = self.layers[app.0].body.app_mut().reader_app_mut();
            assert!(reader.num_power_control_levels > 0);
            reader.first_read_sent_time = now;
            reader.current_tx_power_level = 0;
        }
        self.reader_app_do_next_read(app);
    }

    /// Advance the power sweep: send the next READ, or finish the process.
    pub(crate) fn reader_app_do_next_read(&mut self, app: LayerId) {
        let now = self.scheduler.now();
        enum Next {
            Read(f64),
            Rearm(SimTime),
            Done,
        }
        let next = {
            let reader = self.layers[app.0].body.app_mut().reader_app_mut();
            if reader.current_tx_power_level < reader.num_power_control_levels {
                let tx_power = reader.tx_power_for_level(reader.current_tx_power_level);
                debug!(
                    next_tx_power = tx_power,
                    max_tx_power = reader.max_tx_power,
                    "reader power control"
                );
                reader.previous_read_sent_time = now;
                Next::Read(tx_power)
            } else if reader.do_repeated_reads {
                Next::Rearm(reader.read_period)
            } else {
                Next::Done
            }
        };
        match next {
            Next::Read(tx_power) => self.reader_app_send_read_packet(app, tx_power),
            Next::Rearm(period) => {
                let World {
                    layers, scheduler, ..
                } = self;
                let reader = layers[app.0].body.app_mut().reader_app_mut();
                reader.read_timer.reschedule(scheduler, period);
            }
            Next::Done => {}
        }
    }

    /// The MAC finished serving one READ; move to the next power level.
    pub(crate) fn reader_app_signal_read_end(&mut self, app: LayerId) {
        self.layers[app.0]
            .body
            .app_mut()
            .reader_app_mut()
            .current_tx_power_level += 1;
        self.reader_app_do_next_read(app);
    }

    fn reader_app_send_read_packet(&mut self, app: LayerId, tx_power: f64) {
        let me = self.node_id_of(app);
        let max_tx_power = self.layers[app.0].body.app().reader_app().max_tx_power;

        let mut packet = Packet::new();
        packet.set_tx_power(tx_power);
        packet.set_destination(NodeId::BROADCAST);
        packet.add_data(
            LayerKind::Application,
            LayerData::ReaderApp(ReaderAppData {
                kind: ReaderAppKind::Read,
                reader: me,
                // Only the top-level read runs the whole cycle.
                do_entire_read_cycle: tx_power == max_tx_power,
            }),
        );
        self.send_to_queue(app, packet);
    }

    fn reader_app_send_reset_packet(&mut self, app: LayerId) {
        let me = self.node_id_of(app);
        let mut packet = Packet::new();
        packet.set_destination(NodeId::BROADCAST);
        packet.add_data(
            LayerKind::Application,
            LayerData::ReaderApp(ReaderAppData {
                kind: ReaderAppKind::Reset,
                reader: me,
                do_entire_read_cycle: false,
            }),
        );
        self.send_to_queue(app, packet);
    }

    /// Application packet reception.
    pub(crate) fn app_handle_recvd_packet(&mut self, app: LayerId, packet: Packet) {
        if !self.layers[app.0].body.app().is_running {
            return;
        }
        let is_reader = matches!(self.layers[app.0].body.app().body, AppBody::Reader(_));
        if is_reader {
            self.reader_app_handle_recvd_packet(app, packet);
        } else {
            self.tag_app_handle_recvd_packet(app, packet);
        }
    }

    fn reader_app_handle_recvd_packet(&mut self, app: LayerId, packet: Packet) {
        let now = self.scheduler.now();
        if let Some(tag_data) = packet.tag_app_data() {
            let reader = self.layers[app.0].body.app_mut().reader_app_mut();
            if !reader.read_tag_ids.contains(&tag_data.tag) {
                let read = ReadTagData {
                    tag: tag_data.tag,
                    time_read: now,
                    time_read_sent: reader.previous_read_sent_time,
                };
                reader.last_tag_read = Some((reader.current_tx_power_level, read.clone()));
                reader
                    .read_tags
                    .entry(reader.current_tx_power_level)
                    .or_default()
                    .push(read);
                reader.read_tag_ids.insert(tag_data.tag);
            }
        }
        // Reader application payloads can arrive from other readers; they
        // carry nothing for us.
    }

    fn tag_app_handle_recvd_packet(&mut self, app: LayerId, packet: Packet) {
        let data = match packet.reader_app_data() {
            Some(data) => data.clone(),
            None => return,
        };
        match data.kind {
            ReaderAppKind::Read => {
                let reply = self.layers[app.0].body.app().tag_app().reply_to_reads;
                if reply {
                    self.tag_app_send_id_packet(app, data.reader);
                }
            }
            ReaderAppKind::Reset => {
                self.layers[app.0].body.app_mut().tag_mut().reply_to_reads = true;
            }
        }
    }

    fn tag_app_send_id_packet(&mut self, app: LayerId, destination: NodeId) {
        let me = self.node_id_of(app);
        let mut packet = Packet::new();
        packet.set_destination(destination);
        packet.add_data(
            LayerKind::Application,
            LayerData::TagApp(TagAppData { tag: me }),
        );
        self.send_to_queue(app, packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quadratic_power_ramp() {
        let mut app = ReaderApp::new(LayerId(0));
        app.max_tx_power = 1.0;
        app.num_power_control_levels = 3;
        assert!((app.tx_power_for_level(0) - 1.0 / 9.0).abs() < 1e-12);
        assert!((app.tx_power_for_level(1) - 4.0 / 9.0).abs() < 1e-12);
        assert_eq!(app.tx_power_for_level(2), 1.0);
    }

    #[test]
    fn test_stats_keys() {
        let mut app = ReaderApp::new(LayerId(0));
        app.max_tx_power = 1.0;
        app.num_power_control_levels = 2;
        app.first_read_sent_time = SimTime::from_secs(2.5);
        let read = ReadTagData {
            tag: NodeId::new(7),
            time_read: SimTime::from_secs(3.0),
            time_read_sent: SimTime::from_secs(2.5),
        };
        app.read_tags.entry(1).or_default().push(read.clone());
        app.read_tag_ids.insert(read.tag);
        app.last_tag_read = Some((1, read));

        let mut log = RecordLog::new();
        app.emit_stats(&mut log, SimTime::from_secs(20.0), NodeId::new(0));
        let stats = log.stats_for(NodeId::new(0));
        let keys: Vec<&str> = stats.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "tag_read_id",
                "tag_read_power_level",
                "tag_read_time",
                "tag_read_process_latency",
                "tags_read_count_at_level_1",
                "tags_read_count_at_level_2",
                "tags_read_count",
                "avg_tag_read_process_latency",
                "last_tag_read_latency",
            ]
        );
        // Levels are reported one-based.
        assert_eq!(stats[1].value, "2");
        assert_eq!(stats[4].value, "0");
        assert_eq!(stats[5].value, "1");
        assert_eq!(stats[6].value, "1");
    }

    #[test]
    fn test_read_latency() {
        let read = ReadTagData {
            tag: NodeId::new(1),
            time_read: SimTime::from_secs(4.0),
            time_read_sent: SimTime::from_secs(2.5),
        };
        assert!((read.read_latency().as_secs() - 1.5).abs() < 1e-12);
    }
}
