//! AMD family 17h (Zen) decoder
//!
//! Per-core clock, multiplier, VID and energy from the hardware P-state and
//! RAPL style MSRs. Package temperature and SVI2 telemetry come from the SMU
//! over the SMN window on the root complex (PCI 0:0.0, index 0x60 / data 0x64).

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::trace;

use super::cpuid::CpuId;
use super::energy::EnergyCounter;
use super::generic::GenericCpu;
use super::table::CpuConfig;
use super::CpuEnvironment;
use crate::constants::ring0::BUS_LOCK_TIMEOUT_MS;
use crate::error::Result;
use crate::hardware::{Hardware, HardwareCore, SensorHandle};
use crate::ring0::{get_pci_address, Ring0};
use crate::sensor::SensorType;
use crate::settings::SharedSettings;

const PERF_CTL_0: u32 = 0xC001_0000;
const PERF_CTR_0: u32 = 0xC001_0004;
const HWCR: u32 = 0xC001_0015;
const MSR_PSTATE_0: u32 = 0xC001_0064;
const COFVID_STATUS: u32 = 0xC001_0071;
const MSR_HARDWARE_PSTATE_STATUS: u32 = 0xC001_0293;
const MSR_PWR_UNIT: u32 = 0xC001_0299;
const MSR_CORE_ENERGY_STAT: u32 = 0xC001_029A;
const MSR_PKG_ENERGY_STAT: u32 = 0xC001_029B;

const REPORT_MSRS: &[u32] = &[PERF_CTL_0, PERF_CTR_0, HWCR, MSR_PSTATE_0, COFVID_STATUS];

const SMN_INDEX_REGISTER: u32 = 0x60;
const SMN_DATA_REGISTER: u32 = 0x64;
const THM_TCON_CUR_TMP: u32 = 0x0005_9800;
const SVI_BASE: u32 = 0x0005_A000;
const SVI_TFN: u32 = SVI_BASE + 0x8;
const SVI_PLANE0: u32 = SVI_BASE + 0xC;
const SVI_PLANE1: u32 = SVI_BASE + 0x10;
const TEMP_OFFSET_FLAG: u32 = 0x80000;

/// Joules per count when the unit register cannot be read.
const DEFAULT_ENERGY_UNIT: f64 = 15.3e-6;

const VID_STEP: f32 = 0.00625;

/// Tdie = Tctl + offset. First matching substring wins.
const TDIE_OFFSETS: &[(&[&str], f32)] = &[
    (&["1600X", "1700X", "1800X"], -20.0),
    (&["1920X", "1950X", "1900X", "2920", "2950", "2970", "2990"], -27.0),
    (&["2600X", "2700X", "2800X", "1910", "1920", "1950"], -10.0),
];

pub fn tdie_offset(name: &str) -> f32 {
    TDIE_OFFSETS
        .iter()
        .find(|(models, _)| models.iter().any(|m| name.contains(m)))
        .map(|(_, offset)| *offset)
        .unwrap_or(0.0)
}

/// Control temperature from THM_TCON_CUR_TMP, 0.125 degrees per count.
fn tctl(raw: u32) -> f32 {
    let t = (raw >> 21) as f32 * 0.125;
    if raw & TEMP_OFFSET_FLAG != 0 {
        t - 49.0
    } else {
        t
    }
}

fn vid_voltage(vid: u32) -> f32 {
    1.55 - VID_STEP * vid as f32
}

/// Clock in MHz, multiplier and VID voltage from the hardware P-state status.
fn pstate_readings(eax: u32) -> Option<(f32, f32, f32)> {
    let vid = (eax >> 14) & 0xFF;
    let dfs = (eax >> 8) & 0x3F;
    let fid = eax & 0xFF;
    if dfs == 0 {
        return None;
    }
    let ratio = fid as f64 / dfs as f64;
    Some(((ratio * 200.0) as f32, (ratio * 2.0) as f32, vid_voltage(vid)))
}

fn energy_unit(ring0: &Ring0) -> f64 {
    match ring0.read_msr(MSR_PWR_UNIT) {
        Some(msr) => 1.0 / (1u64 << ((msr.eax >> 8) & 0x1F)) as f64,
        None => DEFAULT_ENERGY_UNIT,
    }
}

struct ZenCore {
    /// Numbered from 1 in core id order
    number: usize,
    node: u32,
    mask: u64,
    clock: SensorHandle,
    multiplier: SensorHandle,
    power: SensorHandle,
    vid: SensorHandle,
    energy: Option<EnergyCounter>,
}

/// SMU telemetry for one package read.
#[derive(Debug, Default, Clone, Copy)]
struct SmuSample {
    temperature: Option<u32>,
    tfn: Option<u32>,
    plane0: Option<u32>,
    plane1: Option<u32>,
}

pub struct Amd17Cpu {
    cpu: GenericCpu,
    tdie_offset: f32,
    bus_clock: SensorHandle,
    package_power: SensorHandle,
    tctl: SensorHandle,
    tdie: SensorHandle,
    core_voltage: SensorHandle,
    soc_voltage: SensorHandle,
    package_energy: Option<EnergyCounter>,
    cores: Vec<ZenCore>,
}

impl Amd17Cpu {
    pub fn new(
        processor_index: usize,
        cores: Vec<Vec<CpuId>>,
        config: CpuConfig,
        ring0: Arc<Ring0>,
        env: &CpuEnvironment,
        settings: SharedSettings,
    ) -> Result<Self> {
        let mut cpu = GenericCpu::new(processor_index, cores, config, ring0, env, settings)?;

        let hw = cpu.core_mut();
        let bus_clock = hw.create_sensor("Bus Speed", 0, SensorType::Clock, &[]);
        let package_power = hw.create_sensor("CPU Package", 0, SensorType::Power, &[]);
        let tctl = hw.create_sensor("Core (Tctl)", 0, SensorType::Temperature, &[]);
        let tdie = hw.create_sensor("Core (Tdie)", 1, SensorType::Temperature, &[]);
        let core_voltage = hw.create_sensor("Core (SVI2 TFN)", 0, SensorType::Voltage, &[]);
        let soc_voltage = hw.create_sensor("SoC (SVI2 TFN)", 1, SensorType::Voltage, &[]);
        for h in [package_power, tctl, tdie, core_voltage] {
            hw.activate(h);
        }

        // Each SMT sibling is its own topology core on Zen; merge them by the
        // 0x1E core id. Ryzen 3000 skips ids, so number in id order instead.
        let mut siblings: BTreeMap<u32, (u32, usize)> = BTreeMap::new();
        for (i, threads) in cpu.cores().iter().enumerate() {
            let (core_id, node) = threads[0]
                .amd_topology()
                .unwrap_or((threads[0].core_id(), 0));
            siblings.entry(core_id).or_insert((node, i));
        }

        let mut zen_cores = Vec::with_capacity(siblings.len());
        for (n, &(node, i)) in siblings.values().enumerate() {
            let number = n + 1;
            let mask = cpu.core_mask(i);
            let hw = cpu.core_mut();
            let clock = hw.create_sensor(format!("Core #{}", number), number, SensorType::Clock, &[]);
            let multiplier = hw.create_sensor(format!("Core #{}", number), n, SensorType::Factor, &[]);
            let power = hw.create_sensor(format!("Core #{} (SMU)", number), number, SensorType::Power, &[]);
            let vid = hw.create_sensor(format!("Core #{} VID", number), number + 1, SensorType::Voltage, &[]);
            for h in [clock, multiplier, power, vid] {
                hw.activate(h);
            }
            zen_cores.push(ZenCore {
                number,
                node,
                mask,
                clock,
                multiplier,
                power,
                vid,
                energy: None,
            });
        }

        let tdie_offset = tdie_offset(cpu.first().name());

        Ok(Self {
            cpu,
            tdie_offset,
            bus_clock,
            package_power,
            tctl,
            tdie,
            core_voltage,
            soc_voltage,
            package_energy: None,
            cores: zen_cores,
        })
    }

    /// Physical cores, SMT siblings merged.
    pub fn physical_cores(&self) -> usize {
        self.cores.len()
    }

    /// Distinct NUMA node ids in first-seen order.
    pub fn nodes(&self) -> Vec<u32> {
        let mut nodes = Vec::new();
        for core in &self.cores {
            if !nodes.contains(&core.node) {
                nodes.push(core.node);
            }
        }
        nodes
    }

    fn read_smu(ring0: &Ring0) -> SmuSample {
        if !ring0.wait_bus_mutex(BUS_LOCK_TIMEOUT_MS) {
            trace!("Bus lock busy, skipping SMU read");
            return SmuSample::default();
        }
        let root = get_pci_address(0, 0, 0);
        let read = |index: u32| {
            if ring0.write_pci_config(root, SMN_INDEX_REGISTER, index) {
                ring0.read_pci_config(root, SMN_DATA_REGISTER)
            } else {
                None
            }
        };
        let sample = SmuSample {
            temperature: read(THM_TCON_CUR_TMP),
            tfn: read(SVI_TFN),
            plane0: read(SVI_PLANE0),
            plane1: read(SVI_PLANE1),
        };
        ring0.release_bus_mutex();
        sample
    }

    fn update_package(&mut self, ring0: &Ring0) {
        let (unit, energy, smu) = {
            let _guard = self.cpu.pin_first();
            let unit = energy_unit(ring0);
            let energy = ring0.read_msr(MSR_PKG_ENERGY_STAT);
            (unit, energy, Self::read_smu(ring0))
        };

        if let Some(msr) = energy {
            let now = self.cpu.now_seconds();
            match self.package_energy.as_mut() {
                Some(counter) => {
                    if let Some(rate) = counter.rate(msr.eax, now) {
                        let watts = (unit * rate) as f32;
                        self.cpu.core_mut().set_value(self.package_power, Some(watts));
                    }
                }
                None => self.package_energy = Some(EnergyCounter::new(msr.eax, now)),
            }
        }

        let tdie_offset = self.tdie_offset;
        let hw = self.cpu.core_mut();
        let t = smu.temperature.map(tctl);
        hw.set_value(self.tctl, t);
        hw.set_value(self.tdie, t.map(|t| t + tdie_offset));

        let tfn = smu.tfn.unwrap_or(0);
        if tfn & 0x01 == 0 {
            let v = smu.plane0.map(|p| vid_voltage((p >> 16) & 0xFF));
            hw.set_value(self.core_voltage, v);
        }
        // not every part has a SoC plane
        if tfn & 0x02 == 0 {
            if let Some(p) = smu.plane1 {
                hw.set_value(self.soc_voltage, Some(vid_voltage((p >> 16) & 0xFF)));
                hw.activate(self.soc_voltage);
            }
        }
    }

    fn update_cores(&mut self, ring0: &Ring0) {
        let mut bus = None;
        for i in 0..self.cores.len() {
            self.cpu.core_pause();
            let mask = self.cores[i].mask;
            let (unit, energy, pstate) = match ring0.pin(mask) {
                Ok(_guard) => (
                    energy_unit(ring0),
                    ring0.read_msr(MSR_CORE_ENERGY_STAT),
                    ring0.read_msr(MSR_HARDWARE_PSTATE_STATUS),
                ),
                Err(e) => {
                    trace!(core = self.cores[i].number, error = %e, "Skipping core, pin failed");
                    continue;
                }
            };
            let now = self.cpu.now_seconds();

            let core = &mut self.cores[i];
            let readings = pstate.and_then(|msr| pstate_readings(msr.eax));
            let watts = match (energy, core.energy.as_mut()) {
                (Some(msr), Some(counter)) => counter.rate(msr.eax, now).map(|rate| (unit * rate) as f32),
                (Some(msr), None) => {
                    core.energy = Some(EnergyCounter::new(msr.eax, now));
                    None
                }
                (None, _) => None,
            };
            let (clock, multiplier, vid, power) = (core.clock, core.multiplier, core.vid, core.power);

            let hw = self.cpu.core_mut();
            hw.set_value(clock, readings.map(|r| r.0));
            hw.set_value(multiplier, readings.map(|r| r.1));
            hw.set_value(vid, readings.map(|r| r.2));
            if let Some(w) = watts {
                hw.set_value(power, Some(w));
            }
            if bus.is_none() {
                bus = readings.map(|(clock, multiplier, _)| clock / multiplier);
            }
        }

        if let Some(b) = bus.filter(|b| b.is_finite()) {
            let hw = self.cpu.core_mut();
            hw.set_value(self.bus_clock, Some(b));
            hw.activate(self.bus_clock);
        }
    }
}

impl Hardware for Amd17Cpu {
    fn core(&self) -> &HardwareCore {
        self.cpu.core()
    }

    fn core_mut(&mut self) -> &mut HardwareCore {
        self.cpu.core_mut()
    }

    fn update(&mut self) {
        self.cpu.update();
        let ring0 = self.cpu.ring0().clone();
        self.update_package(&ring0);
        self.update_cores(&ring0);
    }

    fn report(&self) -> String {
        let mut r = self.cpu.report_with(REPORT_MSRS);
        for node in self.nodes() {
            let cores: Vec<String> = self
                .cores
                .iter()
                .filter(|c| c.node == node)
                .map(|c| format!("#{}", c.number))
                .collect();
            let _ = writeln!(r, "NUMA Node {}: Cores {}", node, cores.join(" "));
        }
        let _ = writeln!(r, "Tdie Offset: {} °C", self.tdie_offset);
        let _ = writeln!(r);
        r
    }
}
