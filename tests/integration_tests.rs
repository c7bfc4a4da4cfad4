/*
 * Integration tests for Corewatch
 *
 * These drive the whole hardware tree through the simulated mediator and
 * the CLI commands, the way the binary does.
 */

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use corewatch::cli::{self, Cli, Commands, Session, WatchArgs};
use corewatch::demo::DemoMachine;
use corewatch::output;
use cw_core::cpu::{CpuEnvironment, CpuTimes, ProcessorTimes};
use cw_core::ring0::NullDriver;
use cw_core::{Computer, MemorySettings, Ring0, SensorType};
use mockall::mock;
use serial_test::serial;
use tempfile::TempDir;

mock! {
    pub Times {}
    impl ProcessorTimes for Times {
        fn read(&self) -> Option<CpuTimes>;
    }
}

fn simulated(args: &[&str]) -> (Cli, Session) {
    let mut argv = vec!["corewatch", "--simulate"];
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(argv).unwrap();
    let session = Session::build(&cli).unwrap();
    (cli, session)
}

fn watch_args(cli: &Cli) -> &WatchArgs {
    match &cli.command {
        Commands::Watch(args) => args,
        other => panic!("not a watch command: {other:?}"),
    }
}

fn run(cli: &Cli, session: &mut Session) -> String {
    let stop = AtomicBool::new(false);
    let mut buf = Vec::new();
    cli::run(cli, session, &stop, &mut buf).unwrap();
    String::from_utf8(buf).unwrap()
}

// ============================================================================
// Commands
// ============================================================================

#[test]
#[serial]
fn test_sensors_json_on_simulated_machine() {
    let (cli, mut session) = simulated(&["sensors", "--json"]);
    let text = run(&cli, &mut session);
    session.close().unwrap();

    let nodes: serde_json::Value = serde_json::from_str(&text).unwrap();
    let cpu = &nodes[0];
    assert_eq!(cpu["identifier"], "/intelcpu/0");
    assert_eq!(cpu["hardware_type"], "Cpu");

    let sensors = cpu["sensors"].as_array().unwrap();
    let core1 = sensors
        .iter()
        .find(|s| s["sensor_type"] == "Temperature" && s["name"] == "CPU Core #1")
        .unwrap();
    assert_eq!(core1["value"], 62.0);
    let package = sensors
        .iter()
        .find(|s| s["sensor_type"] == "Temperature" && s["name"] == "CPU Package")
        .unwrap();
    assert_eq!(package["value"], 64.0);
    assert!(sensors
        .iter()
        .any(|s| s["sensor_type"] == "Load" && s["name"] == "CPU Total" && s["value"].is_number()));
}

#[test]
#[serial]
fn test_sensors_are_sorted_by_type_then_index() {
    let (cli, mut session) = simulated(&["sensors"]);
    session.computer.open();
    session.computer.update();
    let nodes = output::snapshot(&session.computer);
    let keys: Vec<(SensorType, usize)> = nodes[0].sensors.iter().map(|s| (s.sensor_type, s.index)).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);

    let text = run(&cli, &mut session);
    assert!(text.starts_with("Intel Core i7-8700K (/intelcpu/0)"));
    session.close().unwrap();
}

#[test]
#[serial]
fn test_report_has_every_section() {
    let (cli, mut session) = simulated(&["report"]);
    let text = run(&cli, &mut session);
    session.close().unwrap();

    assert!(text.starts_with("corewatch Report"));
    for section in ["Ring0", "CPUID", "Intel CPU", "Hardware: Intel Core i7-8700K (/intelcpu/0)"] {
        assert!(text.contains(section), "missing {section}");
    }
}

#[test]
#[serial]
fn test_watch_json_lines_until_count() {
    let (cli, mut session) = simulated(&["watch", "--interval-ms", "20", "--count", "3", "--json"]);
    let args = watch_args(&cli);
    assert_eq!((args.interval_ms, args.count, args.json), (20, Some(3), true));
    let stop = AtomicBool::new(false);
    let mut buf = Vec::new();
    let written = cli::run_watch(&mut session.computer, args, &stop, &mut buf).unwrap();
    session.close().unwrap();
    assert_eq!(written, 3);

    let text = String::from_utf8(buf).unwrap();
    let samples: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(samples.len(), 3);
    assert_eq!(samples[2]["sample"], 3);

    let power = samples[2]["hardware"][0]["sensors"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["sensor_type"] == "Power" && s["name"] == "CPU Package")
        .cloned()
        .unwrap();
    assert!(power["value"].as_f64().unwrap() > 0.0);
}

#[test]
#[serial]
fn test_watch_stops_when_interrupted() {
    let (cli, mut session) = simulated(&["watch"]);
    let args = watch_args(&cli);
    assert_eq!((args.interval_ms, args.count), (1000, None));
    let stop = AtomicBool::new(true);
    let mut buf = Vec::new();
    let written = cli::run_watch(&mut session.computer, args, &stop, &mut buf).unwrap();
    assert_eq!(written, 0);
    assert!(buf.is_empty());
    assert!(session.computer.is_open());
    session.close().unwrap();
}

// ============================================================================
// Degraded paths
// ============================================================================

#[test]
fn test_without_mediator_only_load_has_values() {
    let dir = TempDir::new().unwrap();
    let demo = DemoMachine::new();
    let reads = Arc::new(AtomicI64::new(0));
    let threads = demo.threads.len();

    let mut times = MockTimes::new();
    let counter = reads.clone();
    times.expect_read().returning(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Some(vec![Some((n * 2_500_000, n * 10_000_000)); threads])
    });

    let ring0 = Ring0::new(Box::new(NullDriver))
        .with_bus_lock_path(dir.path().join("bus.lock"))
        .with_reinstall_delay(Duration::ZERO);
    let env = CpuEnvironment {
        times: Some(Arc::new(times)),
        ..demo.environment()
    };
    let mut computer = Computer::new(Arc::new(ring0), MemorySettings::shared())
        .with_cpuid(demo.cpuid())
        .with_environment(env);

    computer.open();
    assert!(!computer.ring0().is_open());
    computer.update();
    computer.update();

    let nodes = output::snapshot(&computer);
    assert_eq!(nodes.len(), 1);
    for s in &nodes[0].sensors {
        match s.sensor_type {
            SensorType::Load => assert_eq!(s.value, Some(75.0), "{}", s.name),
            SensorType::Clock => {}
            _ => assert_eq!(s.value, None, "{}", s.name),
        }
    }
    assert!(reads.load(Ordering::SeqCst) >= 2);
    assert!(computer.report().contains("Ring0"));
    computer.close();
}

// ============================================================================
// Settings
// ============================================================================

#[test]
#[serial]
fn test_settings_file_names_and_history() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");
    let mut seed = BTreeMap::new();
    seed.insert("/intelcpu/0/temperature/0/name".to_string(), "Hot Core".to_string());
    std::fs::write(&path, serde_json::to_string(&seed).unwrap()).unwrap();

    let path_arg = path.to_string_lossy().into_owned();
    let (cli, mut session) = simulated(&["--settings", &path_arg, "sensors"]);
    let text = run(&cli, &mut session);
    assert!(text.contains("Hot Core"));
    // history is appended every fourth reading
    for _ in 0..3 {
        session.computer.update();
    }
    session.close().unwrap();

    let saved: BTreeMap<String, String> =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved.get("/intelcpu/0/temperature/0/name").map(String::as_str), Some("Hot Core"));
    assert!(saved.keys().any(|k| k.ends_with("/values")));
}

#[test]
fn test_bad_settings_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(&path, "not json").unwrap();
    let path_arg = path.to_string_lossy().into_owned();
    let cli = Cli::try_parse_from(["corewatch", "--simulate", "--settings", &path_arg, "report"]).unwrap();
    let err = Session::build(&cli).err().unwrap();
    assert!(err.to_string().contains("settings.json"));
}
