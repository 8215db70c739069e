//! # rfsim
//!
//! CLI runner for RFSIM scenarios.

use clap::{Parser, Subcommand};
use rfsim_core::{RecordKind, SimTime};
use rfsim_runner::{build_world, load_scenario, run};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Parse a duration string with units into seconds.
///
/// Supported formats: a plain number of seconds (`60`), a unit suffix
/// (`60s`, `10m`, `2h`), or combined units (`1h30m`, `2m30s`).
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        if secs > 0.0 {
            return Ok(secs);
        }
        return Err(format!("duration must be positive, got '{}'", s));
    }

    let mut total_seconds: f64 = 0.0;
    let mut current_number = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            current_number.push(c);
        } else {
            if current_number.is_empty() {
                return Err(format!("invalid duration '{}': unexpected '{}'", s, c));
            }
            let value: f64 = current_number
                .parse()
                .map_err(|_| format!("invalid number '{}' in duration '{}'", current_number, s))?;
            let multiplier = match c {
                's' => 1.0,
                'm' => 60.0,
                'h' => 3600.0,
                _ => {
                    return Err(format!(
                        "unknown duration unit '{}' in '{}'; use s, m, or h",
                        c, s
                    ))
                }
            };
            total_seconds += value * multiplier;
            current_number.clear();
        }
    }
    if !current_number.is_empty() {
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("invalid number '{}' in duration '{}'", current_number, s))?;
        total_seconds += value;
    }
    if total_seconds <= 0.0 {
        return Err(format!("invalid duration '{}'", s));
    }
    Ok(total_seconds)
}

/// RFSIM - RFID network simulator
#[derive(Parser, Debug)]
#[command(name = "rfsim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scenario file.
    Run {
        /// Path to the scenario YAML.
        scenario: PathBuf,
        /// Override the scenario seed.
        #[arg(long)]
        seed: Option<u64>,
        /// Override the scenario duration (e.g. `20`, `90s`, `2m`).
        #[arg(long, value_parser = parse_duration)]
        duration: Option<f64>,
        /// Write all simulation records as JSON lines to this file.
        #[arg(long)]
        records: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            scenario,
            seed,
            duration,
            records,
        } => {
            if let Err(err) = run_command(&scenario, seed, duration, records.as_deref()) {
                eprintln!("error: {}", err);
                std::process::exit(1);
            }
        }
    }
}

fn run_command(
    scenario_path: &std::path::Path,
    seed: Option<u64>,
    duration: Option<f64>,
    records: Option<&std::path::Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut scenario = load_scenario(scenario_path)?;
    if let Some(seed) = seed {
        scenario.seed = seed;
    }
    if let Some(duration) = duration {
        scenario.duration = duration;
    }

    let mut built = build_world(&scenario)?;
    if let Some(path) = records {
        let file = std::fs::File::create(path)?;
        built
            .world
            .log
            .set_output(Box::new(std::io::BufWriter::new(file)));
    }

    let summary = run(&mut built.world, SimTime::from_secs(scenario.duration));

    println!(
        "completed: sim_time={}s events={} stats_records={}",
        summary.sim_time_s, summary.events_dispatched, summary.stats_records
    );
    for record in built.world.log.records() {
        if record.kind == RecordKind::Stats {
            println!(
                "node {} {} = {}",
                record.node.as_deref().unwrap_or("-"),
                record.key,
                record.value
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60").unwrap(), 60.0);
        assert_eq!(parse_duration("90s").unwrap(), 90.0);
        assert_eq!(parse_duration("2m").unwrap(), 120.0);
        assert_eq!(parse_duration("1h30m").unwrap(), 5400.0);
        assert_eq!(parse_duration("2m30s").unwrap(), 150.0);
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("-5").is_err());
    }
}
