//! Constants and configuration values for corewatch
//!
//! Centralizes paths, timing windows and the sensor history bounds.
//! Vendor register addresses live next to the decoder that reads them.

use std::time::Duration;

/// System paths
pub mod paths {
    /// Per-CPU MSR device nodes, `/dev/cpu/<n>/msr`
    pub const CPU_DEV_BASE: &str = "/dev/cpu";

    /// Byte-addressed IO port device
    pub const DEV_PORT: &str = "/dev/port";

    /// Physical memory device
    pub const DEV_MEM: &str = "/dev/mem";

    /// PCI device tree, config space at `<base>/0000:BB:DD.F/config`
    pub const PCI_DEVICES: &str = "/sys/bus/pci/devices";

    /// Per-CPU time accounting
    pub const PROC_STAT: &str = "/proc/stat";

    /// hwmon class directory (k10temp fallback)
    pub const HWMON_BASE: &str = "/sys/class/hwmon";

    /// Device node exposed by the ioctl mediator module
    pub const MEDIATOR_DEVICE: &str = "/dev/corewatch0";

    /// Directory used for the ISA bus lock file
    pub const LOCK_DIR: &str = "/run/lock";

    pub const BUS_LOCK_FILE: &str = "corewatch-isabus.lock";

    /// Settings file name inside the corewatch config directory
    pub const SETTINGS_FILE: &str = "settings.json";

    /// User configuration directory, `~/.config/corewatch`
    pub fn user_config_dir() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|d| d.join(super::app::NAME))
    }
}

/// Application identity
pub mod app {
    pub const NAME: &str = "corewatch";

    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Kernel module name of the ioctl mediator
    pub const DRIVER_MODULE: &str = "corewatch_ring0";

    /// Kernel modules backing the device-file mediator
    pub const DEVFS_MODULES: &[&str] = &["msr"];
}

/// Register session timing
pub mod ring0 {
    use super::Duration;

    /// Pause between a failed install and the retry
    pub const REINSTALL_DELAY: Duration = Duration::from_millis(2000);

    /// Poll interval while waiting on the bus lock
    pub const BUS_LOCK_POLL: Duration = Duration::from_millis(1);

    /// Default bus lock timeout used by decoders
    pub const BUS_LOCK_TIMEOUT_MS: u64 = 10;

    /// Highest logical CPU addressable by a u64 affinity mask
    pub const MAX_THREADS: usize = 64;
}

/// Clock calibration
pub mod clock {
    /// Sampling window for each calibration run, seconds
    pub const WINDOW_SECONDS: f64 = 0.025;

    /// Number of discarded warm-up measurements
    pub const WARMUP_RUNS: usize = 2;

    pub const MAX_RUNS: usize = 5;

    /// Relative error accepted as precise
    pub const MAX_ERROR: f64 = 1e-4;

    /// Start offset as a fraction of the ticks per second
    pub const START_OFFSET_FRACTION: f64 = 0.001;

    /// Accepted refinement window, seconds
    pub const REFINE_MIN_SECONDS: f64 = 0.5;
    pub const REFINE_MAX_SECONDS: f64 = 2.0;
}

/// Load accounting
pub mod load {
    /// Time units per second of the load counters (100 ns)
    pub const UNITS_PER_SECOND: f64 = 1e7;

    /// Minimum per-core elapsed total before an update is accepted
    pub const MIN_ELAPSED_UNITS: i64 = 100_000;
}

/// Sensor history
pub mod sensor {
    use super::Duration;

    /// Raw values folded into one rolling-average entry
    pub const AVERAGE_COUNT: u32 = 4;

    /// How long rolling-average entries are kept
    pub const VALUES_TIME_WINDOW: Duration = Duration::from_secs(120 * 60);
}

/// Power accounting
pub mod power {
    /// Energy samples closer than this are skipped, seconds
    pub const MIN_ENERGY_INTERVAL: f64 = 0.01;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_window_is_two_hours() {
        assert_eq!(sensor::VALUES_TIME_WINDOW.as_secs(), 7200);
    }

    #[test]
    fn test_refine_window_ordered() {
        assert!(clock::REFINE_MIN_SECONDS < clock::REFINE_MAX_SECONDS);
    }

    #[test]
    fn test_user_config_dir_is_namespaced() {
        if let Some(dir) = paths::user_config_dir() {
            assert!(dir.ends_with("corewatch"));
        }
    }
}
