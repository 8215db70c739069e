//! Structured simulation records.
//!
//! The core emits records rather than text: every packet hand-off, stats
//! item, and user-defined note becomes a [`Record`]. The log retains records
//! in memory (tests and the runner read them back) and can additionally
//! stream each record as a JSON line to a writer.

use crate::{LayerKind, NodeId, SimTime};
use serde::Serialize;
use std::io::Write;

/// The kind of a simulation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A packet left a layer.
    PacketSent,
    /// A packet arrived at a layer.
    PacketReceived,
    /// An end-of-run statistics item.
    Stats,
    /// Free-form scenario annotation.
    UserDefined,
    /// Debug detail.
    Debug,
}

/// One structured simulation record.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    /// Record kind.
    pub kind: RecordKind,
    /// Virtual time in seconds at emission.
    pub time: f64,
    /// Node the record concerns, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Stack layer the record concerns, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    /// Record key.
    pub key: String,
    /// Record value.
    pub value: String,
}

/// The simulation record log.
///
/// Retains every record in memory and optionally streams them as JSON lines.
pub struct RecordLog {
    records: Vec<Record>,
    out: Option<Box<dyn Write>>,
}

impl RecordLog {
    /// Create a log with no output writer.
    pub fn new() -> Self {
        RecordLog {
            records: Vec::new(),
            out: None,
        }
    }

    /// Stream records to the given writer as JSON lines, in addition to
    /// retaining them.
    pub fn set_output(&mut self, out: Box<dyn Write>) {
        self.out = Some(out);
    }

    /// All records emitted so far.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// All stats records emitted for the given node.
    pub fn stats_for(&self, node: NodeId) -> Vec<&Record> {
        let node = node.to_string();
        self.records
            .iter()
            .filter(|r| r.kind == RecordKind::Stats && r.node.as_deref() == Some(node.as_str()))
            .collect()
    }

    /// Record a packet leaving a layer.
    pub fn packet_sent(&mut self, now: SimTime, node: NodeId, layer: LayerKind, packet: String) {
        self.push(Record {
            kind: RecordKind::PacketSent,
            time: now.as_secs(),
            node: Some(node.to_string()),
            layer: Some(layer.to_string()),
            key: "packet".to_string(),
            value: packet,
        });
    }

    /// Record a packet arriving at a layer.
    pub fn packet_received(
        &mut self,
        now: SimTime,
        node: NodeId,
        layer: LayerKind,
        packet: String,
    ) {
        self.push(Record {
            kind: RecordKind::PacketReceived,
            time: now.as_secs(),
            node: Some(node.to_string()),
            layer: Some(layer.to_string()),
            key: "packet".to_string(),
            value: packet,
        });
    }

    /// Record an end-of-run statistics item for a node.
    pub fn stats(&mut self, now: SimTime, node: NodeId, key: &str, value: String) {
        self.push(Record {
            kind: RecordKind::Stats,
            time: now.as_secs(),
            node: Some(node.to_string()),
            layer: None,
            key: key.to_string(),
            value,
        });
    }

    /// Record a free-form scenario annotation.
    pub fn user_defined(&mut self, now: SimTime, value: String) {
        self.push(Record {
            kind: RecordKind::UserDefined,
            time: now.as_secs(),
            node: None,
            layer: None,
            key: "note".to_string(),
            value,
        });
    }

    /// Record a debug detail.
    pub fn debug(&mut self, now: SimTime, value: String) {
        self.push(Record {
            kind: RecordKind::Debug,
            time: now.as_secs(),
            node: None,
            layer: None,
            key: "debug".to_string(),
            value,
        });
    }

    /// Flush the output writer, if any.
    pub fn flush(&mut self) -> std::io::Result<()> {
        if let Some(out) = self.out.as_mut() {
            out.flush()?;
        }
        Ok(())
    }

    fn push(&mut self, record: Record) {
        if let Some(out) = self.out.as_mut() {
            // A failed write is reported once via stderr rather than
            // propagated; record emission must not perturb the simulation.
            if let Ok(line) = serde_json::to_string(&record) {
                let _ = writeln!(out, "{}", line);
            }
        }
        self.records.push(record);
    }
}

impl Default for RecordLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_filtering() {
        let mut log = RecordLog::new();
        log.stats(SimTime::from_secs(1.0), NodeId::new(1), "a", "1".into());
        log.stats(SimTime::from_secs(1.0), NodeId::new(2), "b", "2".into());
        log.user_defined(SimTime::ZERO, "note".into());

        assert_eq!(log.records().len(), 3);
        let one = log.stats_for(NodeId::new(1));
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].key, "a");
    }

    #[test]
    fn test_json_stream() {
        let buf: Vec<u8> = Vec::new();
        let mut log = RecordLog::new();
        // Write into a shared buffer through a cursor-like adapter.
        struct Shared(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);
        impl Write for Shared {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let shared = std::rc::Rc::new(std::cell::RefCell::new(buf));
        log.set_output(Box::new(Shared(shared.clone())));
        log.packet_sent(
            SimTime::from_secs(0.5),
            NodeId::new(3),
            LayerKind::Physical,
            "pkt".into(),
        );
        log.flush().unwrap();

        let text = String::from_utf8(shared.borrow().clone()).unwrap();
        assert!(text.contains("\"packet_sent\""));
        assert!(text.contains("\"PHY\""));
    }
}
