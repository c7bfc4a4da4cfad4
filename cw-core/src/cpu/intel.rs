//! Intel decoder
//!
//! Digital thermal sensors, per-core clocks from IA32_PERF_STATUS and RAPL
//! energy counters. What is available depends on the microarchitecture
//! resolved by the selection table.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::debug;

use super::cpuid::CpuId;
use super::energy::EnergyCounter;
use super::generic::GenericCpu;
use super::table::{CpuConfig, PerfStatusLayout, RaplUnit, TscMultiplier};
use super::CpuEnvironment;
use crate::error::{CorewatchError, Result};
use crate::hardware::{Hardware, HardwareCore, SensorHandle};
use crate::ring0::Ring0;
use crate::sensor::{ParameterDescription, SensorType};
use crate::settings::SharedSettings;

const MSR_PLATFORM_INFO: u32 = 0xCE;
const IA32_MPERF: u32 = 0xE7;
const IA32_APERF: u32 = 0xE8;
const IA32_PERF_STATUS: u32 = 0x198;
const IA32_THERM_STATUS: u32 = 0x19C;
const IA32_MISC_ENABLE: u32 = 0x1A0;
const IA32_TEMPERATURE_TARGET: u32 = 0x1A2;
const IA32_PACKAGE_THERM_INTERRUPT: u32 = 0x1B0;
const IA32_PACKAGE_THERM_STATUS: u32 = 0x1B1;
const MSR_RAPL_POWER_UNIT: u32 = 0x606;
const MSR_PKG_ENERGY_STATUS: u32 = 0x611;
const MSR_DRAM_ENERGY_STATUS: u32 = 0x619;
const MSR_PP0_ENERGY_STATUS: u32 = 0x639;
const MSR_PP1_ENERGY_STATUS: u32 = 0x641;

/// Energy status registers and their sensor labels; the position is the sensor index.
const RAPL_DOMAINS: [(u32, &str); 4] = [
    (MSR_PKG_ENERGY_STATUS, "CPU Package"),
    (MSR_PP0_ENERGY_STATUS, "CPU Cores"),
    (MSR_PP1_ENERGY_STATUS, "CPU Graphics"),
    (MSR_DRAM_ENERGY_STATUS, "CPU DRAM"),
];

const REPORT_MSRS: &[u32] = &[
    MSR_PLATFORM_INFO,
    IA32_MPERF,
    IA32_APERF,
    IA32_PERF_STATUS,
    IA32_THERM_STATUS,
    IA32_MISC_ENABLE,
    IA32_TEMPERATURE_TARGET,
    IA32_PACKAGE_THERM_INTERRUPT,
    IA32_PACKAGE_THERM_STATUS,
    MSR_RAPL_POWER_UNIT,
    MSR_PKG_ENERGY_STATUS,
    MSR_DRAM_ENERGY_STATUS,
    MSR_PP0_ENERGY_STATUS,
    MSR_PP1_ENERGY_STATUS,
];

/// Temperature from a thermal status register, or `None` when the reading
/// valid bit is clear.
pub fn thermal_status_temperature(eax: u32, tjmax: f32, slope: f32) -> Option<f32> {
    if eax & 0x8000_0000 == 0 {
        return None;
    }
    let delta = ((eax >> 16) & 0x7F) as f32;
    Some(tjmax - slope * delta)
}

fn thermal_parameters(tjmax: f32, what: &str) -> [ParameterDescription; 2] {
    [
        ParameterDescription::new(
            "TjMax [°C]",
            format!("TjMax temperature of the {} sensor. Temperature = TjMax - TSlope * Value.", what),
            tjmax,
        ),
        ParameterDescription::new(
            "TSlope [°C]",
            "Temperature slope of the digital thermal sensor. Temperature = TjMax - TSlope * Value.",
            1.0,
        ),
    ]
}

struct PowerDomain {
    msr: u32,
    sensor: SensorHandle,
    counter: EnergyCounter,
}

pub struct IntelCpu {
    cpu: GenericCpu,
    tsc_multiplier: f64,
    core_temperatures: Vec<SensorHandle>,
    distances: Vec<SensorHandle>,
    package_temperature: Option<SensorHandle>,
    core_max: Option<SensorHandle>,
    core_average: Option<SensorHandle>,
    bus_clock: SensorHandle,
    core_clocks: Vec<SensorHandle>,
    energy_unit: f64,
    power: Vec<PowerDomain>,
}

impl IntelCpu {
    pub fn new(
        processor_index: usize,
        cores: Vec<Vec<CpuId>>,
        config: CpuConfig,
        ring0: Arc<Ring0>,
        env: &CpuEnvironment,
        settings: SharedSettings,
    ) -> Result<Self> {
        let mut cpu = GenericCpu::new(processor_index, cores, config, ring0, env, settings)?;
        let ring0 = cpu.ring0().clone();
        let known = config.is_known();
        if !known {
            let e = CorewatchError::UnknownMicroarchitecture {
                family: cpu.family(),
                model: cpu.model(),
            };
            debug!(error = %e, "Using generic Intel defaults");
        }

        let core_count = cpu.core_count();
        let tjmax: Vec<f32> = match config.tjmax.fixed_for(core_count) {
            Some(t) => vec![t; core_count],
            None => (0..core_count)
                .map(|i| match ring0.read_msr_on(IA32_TEMPERATURE_TARGET, cpu.core_mask(i)) {
                    Some(msr) => ((msr.eax >> 16) & 0xFF) as f32,
                    None => 100.0,
                })
                .collect(),
        };

        let tsc_multiplier = match config.tsc_multiplier() {
            TscMultiplier::PerfStatus => ring0
                .read_msr(IA32_PERF_STATUS)
                .map(|msr| fid_with_half(msr.edx))
                .unwrap_or(0.0),
            TscMultiplier::PlatformInfo => ring0
                .read_msr(MSR_PLATFORM_INFO)
                .map(|msr| ((msr.eax >> 8) & 0xFF) as f64)
                .unwrap_or(0.0),
            TscMultiplier::None => 0.0,
        };

        let first = cpu.first().clone();
        let core_sensor = known && first.has_core_thermal_sensor();
        let package_sensor = known && first.has_package_thermal_sensor();
        let mut index = 0;

        let mut core_temperatures = Vec::new();
        if core_sensor {
            for (i, &t) in tjmax.iter().enumerate() {
                let name = cpu.core_string(i);
                let h = cpu
                    .core_mut()
                    .create_sensor(name, index, SensorType::Temperature, &thermal_parameters(t, "core"));
                cpu.core_mut().activate(h);
                core_temperatures.push(h);
                index += 1;
            }
        }

        let package_temperature = package_sensor.then(|| {
            let h = cpu.core_mut().create_sensor(
                "CPU Package",
                index,
                SensorType::Temperature,
                &thermal_parameters(tjmax[0], "package"),
            );
            cpu.core_mut().activate(h);
            index += 1;
            h
        });

        let mut distances = Vec::new();
        if core_sensor {
            for i in 0..core_count {
                let name = format!("{} Distance to TjMax", cpu.core_string(i));
                let h = cpu.core_mut().create_sensor(name, index, SensorType::Temperature, &[]);
                cpu.core_mut().activate(h);
                distances.push(h);
                index += 1;
            }
        }

        let (core_max, core_average) = if package_sensor && core_count > 1 {
            let max = cpu.core_mut().create_sensor("Core Max", index, SensorType::Temperature, &[]);
            let avg = cpu.core_mut().create_sensor("Core Average", index + 1, SensorType::Temperature, &[]);
            cpu.core_mut().activate(max);
            cpu.core_mut().activate(avg);
            (Some(max), Some(avg))
        } else {
            (None, None)
        };

        let bus_clock = cpu.core_mut().create_sensor("Bus Speed", 0, SensorType::Clock, &[]);
        let mut core_clocks = Vec::with_capacity(core_count);
        for i in 0..core_count {
            let name = cpu.core_string(i);
            let h = cpu.core_mut().create_sensor(name, i + 1, SensorType::Clock, &[]);
            if cpu.has_tsc() && known {
                cpu.core_mut().activate(h);
            }
            core_clocks.push(h);
        }

        let mut energy_unit = 0.0;
        let mut power = Vec::new();
        if config.rapl() != RaplUnit::None {
            if let Some(msr) = ring0.read_msr(MSR_RAPL_POWER_UNIT) {
                energy_unit = config.rapl().joules((msr.eax >> 8) & 0x1F);
            }
            if energy_unit > 0.0 {
                for (i, (register, label)) in RAPL_DOMAINS.iter().enumerate() {
                    let Some(msr) = ring0.read_msr(*register) else {
                        debug!(msr = register, "RAPL domain not readable");
                        continue;
                    };
                    let sensor = cpu.core_mut().create_sensor(*label, i, SensorType::Power, &[]);
                    cpu.core_mut().activate(sensor);
                    power.push(PowerDomain {
                        msr: *register,
                        sensor,
                        counter: EnergyCounter::new(msr.eax, cpu.now_seconds()),
                    });
                }
            }
        }

        debug!(
            arch = %config.arch,
            tsc_multiplier,
            energy_unit,
            domains = power.len(),
            "Intel decoder ready"
        );

        Ok(Self {
            cpu,
            tsc_multiplier,
            core_temperatures,
            distances,
            package_temperature,
            core_max,
            core_average,
            bus_clock,
            core_clocks,
            energy_unit,
            power,
        })
    }

    pub fn tsc_multiplier(&self) -> f64 {
        self.tsc_multiplier
    }

    fn update_temperatures(&mut self, ring0: &Ring0) {
        let mut max = f32::MIN;
        let mut sum = 0.0;
        for i in 0..self.core_temperatures.len() {
            let (temp, dist) = (self.core_temperatures[i], self.distances[i]);
            let core = self.cpu.core();
            let tjmax = core.parameter(temp, 0, 100.0);
            let slope = core.parameter(temp, 1, 1.0);
            let reading = ring0
                .read_msr_on(IA32_THERM_STATUS, self.cpu.core_mask(i))
                .and_then(|msr| thermal_status_temperature(msr.eax, tjmax, slope).map(|t| (t, msr.eax)));
            match reading {
                Some((t, eax)) => {
                    sum += t;
                    max = max.max(t);
                    self.cpu.core_mut().set_value(temp, Some(t));
                    self.cpu.core_mut().set_value(dist, Some(((eax >> 16) & 0x7F) as f32));
                }
                None => {
                    self.cpu.core_mut().set_value(temp, None);
                    self.cpu.core_mut().set_value(dist, None);
                }
            }
        }

        if let (Some(max_h), Some(avg_h)) = (self.core_max, self.core_average) {
            if max != f32::MIN {
                self.cpu.core_mut().set_value(max_h, Some(max));
                self.cpu
                    .core_mut()
                    .set_value(avg_h, Some(sum / self.core_temperatures.len() as f32));
            }
        }

        if let Some(h) = self.package_temperature {
            let tjmax = self.cpu.core().parameter(h, 0, 100.0);
            let slope = self.cpu.core().parameter(h, 1, 1.0);
            let value = ring0
                .read_msr_on(IA32_PACKAGE_THERM_STATUS, self.cpu.core_mask(0))
                .and_then(|msr| thermal_status_temperature(msr.eax, tjmax, slope));
            self.cpu.core_mut().set_value(h, value);
        }
    }

    fn update_clocks(&mut self, ring0: &Ring0) {
        if !self.cpu.has_tsc() || self.tsc_multiplier <= 0.0 {
            return;
        }
        let tsc = self.cpu.tsc_frequency();
        let layout = self.cpu.config().perf_status_layout();
        let mut bus = 0.0;
        for i in 0..self.core_clocks.len() {
            self.cpu.core_pause();
            let value = match ring0.read_msr_on(IA32_PERF_STATUS, self.cpu.core_mask(i)) {
                Some(msr) => {
                    bus = tsc / self.tsc_multiplier;
                    let multiplier = match layout {
                        PerfStatusLayout::LowByte => (msr.eax & 0xFF) as f64,
                        PerfStatusLayout::SecondByte => ((msr.eax >> 8) & 0xFF) as f64,
                        PerfStatusLayout::FidHalf => fid_with_half(msr.eax),
                    };
                    multiplier * bus
                }
                None => tsc,
            };
            let h = self.core_clocks[i];
            self.cpu.core_mut().set_value(h, Some(value as f32));
        }
        if bus > 0.0 {
            self.cpu.core_mut().set_value(self.bus_clock, Some(bus as f32));
            self.cpu.core_mut().activate(self.bus_clock);
        }
    }

    fn update_power(&mut self, ring0: &Ring0) {
        for i in 0..self.power.len() {
            let Some(msr) = ring0.read_msr(self.power[i].msr) else {
                continue;
            };
            let now = self.cpu.now_seconds();
            let domain = &mut self.power[i];
            if let Some(rate) = domain.counter.rate(msr.eax, now) {
                let sensor = domain.sensor;
                let watts = (self.energy_unit * rate) as f32;
                self.cpu.core_mut().set_value(sensor, Some(watts));
            }
        }
    }
}

/// Bits 12:8 plus a half step from bit 14.
fn fid_with_half(value: u32) -> f64 {
    ((value >> 8) & 0x1F) as f64 + 0.5 * ((value >> 14) & 1) as f64
}

impl Hardware for IntelCpu {
    fn core(&self) -> &HardwareCore {
        self.cpu.core()
    }

    fn core_mut(&mut self) -> &mut HardwareCore {
        self.cpu.core_mut()
    }

    fn update(&mut self) {
        self.cpu.update();
        let ring0 = self.cpu.ring0().clone();
        self.update_temperatures(&ring0);
        self.update_clocks(&ring0);
        self.update_power(&ring0);
    }

    fn report(&self) -> String {
        let mut r = self.cpu.report_with(REPORT_MSRS);
        let _ = writeln!(r, "Time Stamp Counter Multiplier: {}", self.tsc_multiplier);
        let _ = writeln!(r);
        r
    }
}
