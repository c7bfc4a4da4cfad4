/*
 * This file is part of Corewatch.
 *
 * Copyright (C) 2025 Corewatch contributors
 *
 * Corewatch is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corewatch is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corewatch. If not, see <https://www.gnu.org/licenses/>.
 */

//! Command Line Interface
//!
//! `report`, `sensors` and `watch` over a real or simulated machine.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use cw_core::ring0::{FileDriverImage, NullDriver};
use cw_core::{Computer, CorewatchError, JsonFileSettings, MemorySettings, Ring0, SharedSettings};
use tracing::{debug, info, warn};

use crate::demo::DemoMachine;
use crate::output::{self, Sample};

#[derive(Parser, Debug)]
#[command(name = "corewatch")]
#[command(version)]
#[command(about = "Corewatch - live CPU telemetry for Linux")]
#[command(long_about = "Corewatch - live CPU telemetry for Linux

Reads temperatures, clocks, voltages, power and load from the processor's
model-specific and PCI registers. Register access needs root; without it
only the load sensors report values.

EXAMPLES:
    corewatch report                     Print the diagnostic report
    corewatch sensors                    Update once and list every sensor
    corewatch sensors --json             Same, as JSON
    corewatch watch --interval-ms 500    Poll until Ctrl-C
    corewatch --simulate watch --count 5 Poll a built-in simulated machine

ENVIRONMENT VARIABLES:
    COREWATCH_LOG=debug    Log filter (tracing env-filter syntax)

FILES:
    ~/.config/corewatch/settings.json    Sensor names, parameters and history")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Run against a built-in simulated machine
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Never open the register mediator
    #[arg(long, global = true, conflicts_with = "simulate")]
    pub no_driver: bool,

    /// Settings file (default ~/.config/corewatch/settings.json)
    #[arg(long, global = true, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    /// Mediator image to install when none is present
    #[arg(long, global = true, value_name = "PATH")]
    pub driver_image: Option<PathBuf>,

    /// More logging; repeat for more detail
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the diagnostic report
    Report,

    /// Update once and print every sensor
    Sensors {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Poll and print sensors until interrupted
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Polling interval
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(10..))]
    pub interval_ms: u64,

    /// Stop after this many samples
    #[arg(long)]
    pub count: Option<u64>,

    /// One JSON object per sample
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Failed to load settings from {path}: {source}")]
    Settings {
        path: PathBuf,
        #[source]
        source: CorewatchError,
    },

    #[error("Failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

impl Cli {
    /// Log filter: `--verbose` wins, then `COREWATCH_LOG`, then `warn`.
    pub fn log_filter(&self) -> String {
        match self.verbose {
            0 => std::env::var("COREWATCH_LOG").unwrap_or_else(|_| "warn".to_string()),
            1 => "info".to_string(),
            2 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}

/// A computer plus whatever has to outlive it.
pub struct Session {
    pub computer: Computer,
    file_settings: Option<Arc<JsonFileSettings>>,
    demo: Option<DemoMachine>,
}

impl Session {
    pub fn build(cli: &Cli) -> Result<Self, CliError> {
        let (settings, file_settings) = load_settings(cli)?;

        if cli.simulate {
            let demo = DemoMachine::new();
            let computer = Computer::new(Arc::new(demo.ring0(None)), settings)
                .with_cpuid(demo.cpuid())
                .with_environment(demo.environment());
            info!(threads = demo.threads.len(), "Using simulated machine");
            return Ok(Self {
                computer,
                file_settings,
                demo: Some(demo),
            });
        }

        let mut ring0 = if cli.no_driver {
            Ring0::new(Box::new(NullDriver))
        } else {
            Ring0::native()
        };
        if let Some(image) = &cli.driver_image {
            ring0 = ring0.with_driver_image(Box::new(FileDriverImage::new(image.clone())));
        }

        Ok(Self {
            computer: Computer::new(Arc::new(ring0), settings),
            file_settings,
            demo: None,
        })
    }

    pub fn demo(&self) -> Option<&DemoMachine> {
        self.demo.as_ref()
    }

    /// Close the tree and write settings back.
    pub fn close(mut self) -> anyhow::Result<()> {
        self.computer.close();
        if let Some(settings) = self.file_settings.take() {
            settings
                .save()
                .with_context(|| format!("saving settings to {}", settings.path().display()))?;
        }
        Ok(())
    }
}

fn load_settings(cli: &Cli) -> Result<(SharedSettings, Option<Arc<JsonFileSettings>>), CliError> {
    if let Some(path) = &cli.settings {
        let settings = JsonFileSettings::load(path).map_err(|source| CliError::Settings {
            path: path.clone(),
            source,
        })?;
        let settings = Arc::new(settings);
        let shared: SharedSettings = settings.clone();
        return Ok((shared, Some(settings)));
    }
    if cli.simulate {
        return Ok((MemorySettings::shared(), None));
    }
    match JsonFileSettings::load_default() {
        Ok(settings) => {
            let settings = Arc::new(settings);
            let shared: SharedSettings = settings.clone();
            Ok((shared, Some(settings)))
        }
        Err(e) => {
            warn!(error = %e, "Settings unavailable, keeping them in memory");
            Ok((MemorySettings::shared(), None))
        }
    }
}

/// Sleep up to `interval`, waking early when `stop` is raised.
fn pause(interval: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + interval;
    let slice = Duration::from_millis(20);
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(slice.min(deadline - now));
    }
}

pub fn run_report(computer: &mut Computer, out: &mut dyn Write) -> Result<(), CliError> {
    computer.open();
    computer.update();
    out.write_all(computer.report().as_bytes())?;
    Ok(())
}

pub fn run_sensors(computer: &mut Computer, json: bool, out: &mut dyn Write) -> Result<(), CliError> {
    computer.open();
    computer.update();
    let nodes = output::snapshot(computer);
    if json {
        output::write_json(out, &nodes)?;
    } else {
        output::write_text(out, &nodes)?;
    }
    Ok(())
}

/// The polling loop. Returns the number of samples written.
pub fn run_watch(
    computer: &mut Computer,
    args: &WatchArgs,
    stop: &AtomicBool,
    out: &mut dyn Write,
) -> Result<u64, CliError> {
    computer.open();
    let interval = Duration::from_millis(args.interval_ms);
    let mut written = 0u64;

    while !stop.load(Ordering::SeqCst) {
        computer.update();
        let nodes = output::snapshot(computer);
        written += 1;
        if args.json {
            output::write_json_line(out, &Sample { sample: written, hardware: &nodes })?;
        } else {
            writeln!(out, "--- sample {} ---", written)?;
            output::write_text(out, &nodes)?;
        }
        out.flush()?;

        if args.count.is_some_and(|c| written >= c) {
            break;
        }
        pause(interval, stop);
    }
    debug!(samples = written, "Watch finished");
    Ok(written)
}

/// Dispatch one command against an already built session.
pub fn run(cli: &Cli, session: &mut Session, stop: &AtomicBool, out: &mut dyn Write) -> Result<(), CliError> {
    match &cli.command {
        Commands::Report => run_report(&mut session.computer, out),
        Commands::Sensors { json } => run_sensors(&mut session.computer, *json, out),
        Commands::Watch(args) => run_watch(&mut session.computer, args, stop, out).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_watch_defaults() {
        let cli = Cli::try_parse_from(["corewatch", "watch"]).unwrap();
        match cli.command {
            Commands::Watch(args) => {
                assert_eq!(args.interval_ms, 1000);
                assert_eq!(args.count, None);
                assert!(!args.json);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["corewatch", "sensors", "--json", "--simulate", "-vv"]).unwrap();
        assert!(cli.simulate);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_filter(), "debug");
        assert!(matches!(cli.command, Commands::Sensors { json: true }));
    }

    #[test]
    fn test_interval_lower_bound() {
        assert!(Cli::try_parse_from(["corewatch", "watch", "--interval-ms", "5"]).is_err());
    }

    #[test]
    fn test_simulate_conflicts_with_no_driver() {
        assert!(Cli::try_parse_from(["corewatch", "--simulate", "--no-driver", "report"]).is_err());
    }

    #[test]
    fn test_pause_returns_when_stopped() {
        let stop = AtomicBool::new(true);
        let start = Instant::now();
        pause(Duration::from_secs(5), &stop);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
