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

//! Built-in simulated machine for `--simulate`
//!
//! A six-core, twelve-thread i7-8700K on the simulated mediator. Each core
//! runs a little hotter and slower than the previous one, and the RAPL
//! counters advance on every read.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cw_core::clock::{CycleCounter, MonotonicClock};
use cw_core::constants::paths;
use cw_core::cpu::{CpuEnvironment, CpuId, CpuTimes, ProcessorTimes};
use cw_core::{LeafBuilder, Ring0, SimulatedMachine, StaticCpuid, Vendor};

const TSC_MHZ: u64 = 3700;

const MSR_PLATFORM_INFO: u32 = 0xCE;
const IA32_PERF_STATUS: u32 = 0x198;
const IA32_THERM_STATUS: u32 = 0x19C;
const IA32_TEMPERATURE_TARGET: u32 = 0x1A2;
const IA32_PACKAGE_THERM_STATUS: u32 = 0x1B1;
const MSR_RAPL_POWER_UNIT: u32 = 0x606;
const MSR_PKG_ENERGY_STATUS: u32 = 0x611;
const MSR_PP0_ENERGY_STATUS: u32 = 0x639;
const MSR_PP1_ENERGY_STATUS: u32 = 0x641;

/// 1/16384 J per count
const ENERGY_UNITS: u64 = 0x000A_0E03;
const COUNTS_PER_JOULE: u64 = 16384;

/// A counter running at a fixed rate against the monotonic clock.
#[derive(Debug)]
pub struct SyntheticTsc {
    origin: Instant,
    mhz: u64,
}

impl SyntheticTsc {
    pub fn new(mhz: u64) -> Self {
        Self {
            origin: Instant::now(),
            mhz,
        }
    }
}

impl CycleCounter for SyntheticTsc {
    fn read(&self) -> u64 {
        (self.origin.elapsed().as_nanos() as u64).wrapping_mul(self.mhz) / 1000
    }
}

/// Processor times where CPU `i` runs at a fixed share of one second per read.
#[derive(Debug)]
pub struct SyntheticTimes {
    busy: Vec<f64>,
    reads: AtomicI64,
}

impl SyntheticTimes {
    pub fn new(busy: Vec<f64>) -> Self {
        Self {
            busy,
            reads: AtomicI64::new(0),
        }
    }
}

impl ProcessorTimes for SyntheticTimes {
    fn read(&self) -> Option<CpuTimes> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        let total = n * 10_000_000;
        Some(
            self.busy
                .iter()
                .map(|b| Some(((total as f64 * (1.0 - b)) as i64, total)))
                .collect(),
        )
    }
}

pub struct DemoMachine {
    pub machine: SimulatedMachine,
    pub threads: Vec<CpuId>,
}

impl DemoMachine {
    pub fn new() -> Self {
        let threads = LeafBuilder::new(Vendor::Intel, "Intel(R) Core(TM) i7-8700K CPU @ 3.70GHz", 6, 0x9E, 0x0A)
            .cores(6, 2)
            .thermal(true, true)
            .invariant_tsc(true)
            .build();
        let machine = SimulatedMachine::new(threads.len());

        machine.set_msr_all(IA32_TEMPERATURE_TARGET, 100 << 16);
        machine.set_msr_all(MSR_PLATFORM_INFO, (TSC_MHZ / 100) << 8);
        machine.set_msr_all(MSR_RAPL_POWER_UNIT, ENERGY_UNITS);
        for register in [MSR_PKG_ENERGY_STATUS, MSR_PP0_ENERGY_STATUS, MSR_PP1_ENERGY_STATUS] {
            machine.set_msr_all(register, 0);
        }
        for cpu in 0..threads.len() {
            let core = (cpu / 2) as u64;
            machine.set_msr(cpu, IA32_THERM_STATUS, 0x8000_0000 | ((38 + 3 * core) << 16));
            machine.set_msr(cpu, IA32_PERF_STATUS, (44 - 2 * core) << 8);
            machine.set_msr_step(cpu, MSR_PKG_ENERGY_STATUS, COUNTS_PER_JOULE * 45);
            machine.set_msr_step(cpu, MSR_PP0_ENERGY_STATUS, COUNTS_PER_JOULE * 32);
            machine.set_msr_step(cpu, MSR_PP1_ENERGY_STATUS, COUNTS_PER_JOULE / 2);
        }
        machine.set_msr_all(IA32_PACKAGE_THERM_STATUS, 0x8000_0000 | (36 << 16));

        Self { machine, threads }
    }

    pub fn cpuid(&self) -> Arc<StaticCpuid> {
        Arc::new(StaticCpuid::new(self.threads.clone()))
    }

    pub fn ring0(&self, bus_lock: Option<PathBuf>) -> Ring0 {
        let lock = bus_lock.unwrap_or_else(|| std::env::temp_dir().join("corewatch-demo.lock"));
        Ring0::simulated(&self.machine)
            .with_bus_lock_path(lock)
            .with_reinstall_delay(Duration::ZERO)
    }

    pub fn environment(&self) -> CpuEnvironment {
        let busy = (0..self.threads.len()).map(|i| 0.15 + 0.05 * (i % 6) as f64).collect();
        CpuEnvironment {
            time: Arc::new(MonotonicClock::new()),
            counter: Arc::new(SyntheticTsc::new(TSC_MHZ)),
            times: Some(Arc::new(SyntheticTimes::new(busy))),
            core_read_delay: Duration::ZERO,
            hwmon_base: PathBuf::from(paths::HWMON_BASE),
        }
    }
}

impl Default for DemoMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_times_follow_busy_share() {
        let times = SyntheticTimes::new(vec![0.25, 0.5]);
        let first = times.read().unwrap();
        let second = times.read().unwrap();
        assert_eq!(first[0], Some((7_500_000, 10_000_000)));
        assert_eq!(second[1], Some((10_000_000, 20_000_000)));
    }

    #[test]
    fn test_synthetic_tsc_counts_up() {
        let tsc = SyntheticTsc::new(1000);
        let a = tsc.read();
        std::thread::sleep(Duration::from_millis(2));
        assert!(tsc.read() > a);
    }

    #[test]
    fn test_demo_registers() {
        let demo = DemoMachine::new();
        assert_eq!(demo.threads.len(), 12);
        assert_eq!(demo.machine.msr(0, MSR_PLATFORM_INFO), Some(37 << 8));
        assert_eq!(demo.machine.msr(11, IA32_THERM_STATUS), Some(0x8000_0000 | (53 << 16)));
    }
}
