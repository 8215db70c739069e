//! # rfsim-runner
//!
//! Scenario loading and simulation driving for RFSIM.
//!
//! A [`Scenario`] describes readers and tags in YAML; [`build_world`] wires
//! the node stacks and channels following the RFID channel model: one
//! shared channel that every reader transmits on and every tag listens on,
//! plus one regular channel per reader on which it both sends and listens.
//! A tag that successfully hears a reader locks its reflection onto that
//! reader's regular channel.

use rfsim_core::{Location, NodeId, SimTime};
use rfsim_net::{ChannelId, LayerId, NodeIndex, WirelessChannel, World};
use rfsim_propagation::TwoRay;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Errors raised while loading or building a scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// YAML parse error.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid scenario: {0}")]
    Invalid(String),
}

fn default_seed() -> u64 {
    rfsim_core::SimRng::DEFAULT_SEED
}

fn default_duration() -> f64 {
    20.0
}

fn default_power_levels() -> u32 {
    1
}

fn default_read_period() -> f64 {
    60.0
}

fn default_true() -> bool {
    true
}

fn default_reader_start() -> f64 {
    2.5
}

/// One reader in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReaderConfig {
    /// Position in meters.
    pub location: [f64; 3],
    /// Number of transmit-power levels in the read sweep.
    #[serde(default = "default_power_levels")]
    pub power_levels: u32,
    /// Period between read processes when repeating.
    #[serde(default = "default_read_period")]
    pub read_period: f64,
    /// Repeat the read process or run it once.
    #[serde(default)]
    pub repeat: bool,
    /// Broadcast a RESET before each read process.
    #[serde(default = "default_true")]
    pub reset: bool,
    /// Application start time in seconds.
    #[serde(default = "default_reader_start")]
    pub start: f64,
    /// Optional application stop time in seconds.
    #[serde(default)]
    pub stop: Option<f64>,
}

/// One tag in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagConfig {
    /// Position in meters.
    pub location: [f64; 3],
    /// Application start time in seconds.
    #[serde(default)]
    pub start: f64,
}

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// RNG seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Simulated duration in seconds.
    #[serde(default = "default_duration")]
    pub duration: f64,
    /// The readers.
    #[serde(default)]
    pub readers: Vec<ReaderConfig>,
    /// The tags.
    #[serde(default)]
    pub tags: Vec<TagConfig>,
}

impl Scenario {
    fn validate(&self) -> Result<(), ScenarioError> {
        if self.duration <= 0.0 {
            return Err(ScenarioError::Invalid("duration must be positive".into()));
        }
        for (i, reader) in self.readers.iter().enumerate() {
            if reader.power_levels == 0 {
                return Err(ScenarioError::Invalid(format!(
                    "reader {} has zero power levels",
                    i
                )));
            }
            if reader.start < 0.0 {
                return Err(ScenarioError::Invalid(format!(
                    "reader {} starts before time zero",
                    i
                )));
            }
        }
        for (i, tag) in self.tags.iter().enumerate() {
            if tag.start < 0.0 {
                return Err(ScenarioError::Invalid(format!(
                    "tag {} starts before time zero",
                    i
                )));
            }
        }
        Ok(())
    }
}

/// Load a scenario from a YAML file.
pub fn load_scenario(path: &Path) -> Result<Scenario, ScenarioError> {
    let text = std::fs::read_to_string(path)?;
    load_scenario_from_str(&text)
}

/// Parse a scenario from a YAML string.
pub fn load_scenario_from_str(yaml: &str) -> Result<Scenario, ScenarioError> {
    let scenario: Scenario = serde_yaml::from_str(yaml)?;
    scenario.validate()?;
    Ok(scenario)
}

/// Layer handles of one built reader stack.
#[derive(Debug, Clone, Copy)]
pub struct ReaderHandles {
    /// The reader's node.
    pub node: NodeIndex,
    /// The reader's identity.
    pub node_id: NodeId,
    /// Physical layer.
    pub phy: LayerId,
    /// Application layer.
    pub app: LayerId,
    /// Link layer (MAC).
    pub link: LayerId,
}

/// Layer handles of one built tag stack.
#[derive(Debug, Clone, Copy)]
pub struct TagHandles {
    /// The tag's node.
    pub node: NodeIndex,
    /// The tag's identity.
    pub node_id: NodeId,
    /// Physical layer.
    pub phy: LayerId,
    /// Application layer.
    pub app: LayerId,
    /// Link layer (MAC).
    pub link: LayerId,
}

/// A world built from a scenario, with the handles tests and tools need.
pub struct BuiltScenario {
    /// The wired world.
    pub world: World,
    /// Handles per reader, in scenario order.
    pub readers: Vec<ReaderHandles>,
    /// Handles per tag, in scenario order.
    pub tags: Vec<TagHandles>,
}

/// The id of the shared channel all readers transmit on.
pub const ALL_READERS_CHANNEL: ChannelId = ChannelId(0);

/// Build a world from a scenario.
///
/// Reader node ids are `0..readers`, tag node ids follow. Channel 0 is the
/// shared all-readers channel; reader `i` gets regular channel `i + 1`.
pub fn build_world(scenario: &Scenario) -> Result<BuiltScenario, ScenarioError> {
    scenario.validate()?;

    let mut world = World::new(scenario.seed);

    // One channel per reader plus the shared channel, all two-ray.
    for channel in 0..=scenario.readers.len() as u32 {
        world.add_channel(
            ChannelId(channel),
            WirelessChannel::new(Box::new(TwoRay::new())),
        );
    }

    let mut readers = Vec::new();
    for (i, config) in scenario.readers.iter().enumerate() {
        let node_id = NodeId::new(i as u128);
        let location = Location::new(config.location[0], config.location[1], config.location[2]);
        let node = world.add_node(location, node_id);
        let now = world.scheduler.now();
        world
            .log
            .user_defined(now, format!("Reader ID: {} Location: {}", node_id, location));

        let phy = world.add_reader_phy(node);
        // Attach order matters: the shared channel first, the regular
        // channel second, so a tag that hears this reader locks onto the
        // regular channel.
        world.reader_phy_set_all_senders_channel(phy, ALL_READERS_CHANNEL);
        world.reader_phy_set_regular_channel(phy, ChannelId(i as u32 + 1));

        let app = world.add_reader_app(node, phy);
        {
            let reader = world.layer_body_mut(app).app_mut().reader_app_mut();
            reader.num_power_control_levels = config.power_levels;
            reader.read_period = SimTime::from_secs(config.read_period);
            reader.do_repeated_reads = config.repeat;
            reader.do_reset = config.reset;
        }

        let link = world.add_reader_link(node, app);
        world.insert_lower_layer(app, link);
        world.insert_lower_layer(link, phy);

        world.app_start(app, SimTime::from_secs(config.start));
        if let Some(stop) = config.stop {
            world.app_stop(app, SimTime::from_secs(stop));
        }

        readers.push(ReaderHandles {
            node,
            node_id,
            phy,
            app,
            link,
        });
    }

    let mut tags = Vec::new();
    for (i, config) in scenario.tags.iter().enumerate() {
        let node_id = NodeId::new((scenario.readers.len() + i) as u128);
        let location = Location::new(config.location[0], config.location[1], config.location[2]);
        let node = world.add_node(location, node_id);
        let now = world.scheduler.now();
        world
            .log
            .user_defined(now, format!("Tag ID: {} Location: {}", node_id, location));

        let phy = world.add_tag_phy(node);
        world.tag_phy_set_all_listeners_channel(phy, ALL_READERS_CHANNEL);

        let app = world.add_tag_app(node);
        let link = world.add_tag_link(node, app);
        world.insert_lower_layer(app, link);
        world.insert_lower_layer(link, phy);

        world.app_start(app, SimTime::from_secs(config.start));

        tags.push(TagHandles {
            node,
            node_id,
            phy,
            app,
            link,
        });
    }

    Ok(BuiltScenario {
        world,
        readers,
        tags,
    })
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Events dispatched.
    pub events_dispatched: u64,
    /// Final virtual time in seconds.
    pub sim_time_s: f64,
    /// Stats records emitted at the end of the run.
    pub stats_records: usize,
}

/// Run a built world for a duration.
pub fn run(world: &mut World, duration: SimTime) -> RunSummary {
    info!(duration_s = duration.as_secs(), "starting simulation");
    let events_dispatched = world.run_until(duration);
    let stats_records = world
        .log
        .records()
        .iter()
        .filter(|r| r.kind == rfsim_core::RecordKind::Stats)
        .count();
    info!(events_dispatched, "simulation complete");
    RunSummary {
        events_dispatched,
        sim_time_s: world.scheduler.now().as_secs(),
        stats_records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_defaults() {
        let scenario = load_scenario_from_str(
            r#"
readers:
  - location: [0.0, 0.0, 0.0]
tags:
  - location: [1.0, 0.0, 0.0]
"#,
        )
        .unwrap();
        assert_eq!(scenario.seed, 1);
        assert_eq!(scenario.duration, 20.0);
        assert_eq!(scenario.readers[0].power_levels, 1);
        assert!(scenario.readers[0].reset);
        assert!(!scenario.readers[0].repeat);
        assert_eq!(scenario.readers[0].start, 2.5);
        assert_eq!(scenario.tags[0].start, 0.0);
    }

    #[test]
    fn test_invalid_scenarios_are_rejected() {
        assert!(load_scenario_from_str("duration: -1.0").is_err());
        assert!(load_scenario_from_str(
            r#"
readers:
  - location: [0.0, 0.0, 0.0]
    power_levels: 0
"#
        )
        .is_err());
        // Unknown fields are configuration mistakes.
        assert!(load_scenario_from_str("frobnicate: 1").is_err());
    }

    #[test]
    fn test_build_wires_channels() {
        let scenario = load_scenario_from_str(
            r#"
readers:
  - location: [0.0, 0.0, 0.0]
  - location: [4.8, 0.0, 0.0]
tags:
  - location: [1.0, 0.0, 0.0]
"#,
        )
        .unwrap();
        let built = build_world(&scenario).unwrap();

        // Readers transmit on the shared channel first, then their own.
        let manager = built.world.channel_manager();
        assert_eq!(
            manager.sender_channels(built.readers[0].phy),
            &[ChannelId(0), ChannelId(1)]
        );
        assert_eq!(
            manager.sender_channels(built.readers[1].phy),
            &[ChannelId(0), ChannelId(2)]
        );
        // Each reader listens on its regular channel only.
        assert_eq!(manager.listeners_of(ChannelId(1)), &[built.readers[0].phy]);
        assert_eq!(manager.listeners_of(ChannelId(2)), &[built.readers[1].phy]);
        // Tags listen on the shared channel.
        assert_eq!(manager.listeners_of(ChannelId(0)), &[built.tags[0].phy]);
        // Node ids: readers first, then tags.
        assert_eq!(built.readers[1].node_id, NodeId::new(1));
        assert_eq!(built.tags[0].node_id, NodeId::new(2));
    }
}
