//! AMD family 10h through 16h decoder
//!
//! One package temperature from the miscellaneous control function (or the
//! k10temp hwmon node when the kernel owns it), per-core clocks from
//! COFVID_STATUS scaled by an estimated TSC multiplier, and core/northbridge
//! voltages from the same register.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use super::cpuid::CpuId;
use super::generic::GenericCpu;
use super::table::CpuConfig;
use super::{amd_pci_address, CpuEnvironment};
use crate::clock::TimeSource;
use crate::constants::ring0::BUS_LOCK_TIMEOUT_MS;
use crate::error::Result;
use crate::hardware::{Hardware, HardwareCore, SensorHandle};
use crate::ring0::{get_pci_address, Ring0};
use crate::sensor::{ParameterDescription, SensorType};
use crate::settings::SharedSettings;

const PERF_CTL_0: u32 = 0xC001_0000;
const PERF_CTR_0: u32 = 0xC001_0004;
const HWCR: u32 = 0xC001_0015;
const P_STATE_0: u32 = 0xC001_0064;
const COFVID_STATUS: u32 = 0xC001_0071;

const REPORT_MSRS: &[u32] = &[PERF_CTL_0, PERF_CTR_0, HWCR, P_STATE_0, COFVID_STATUS];

const REPORTED_TEMPERATURE_CONTROL: u32 = 0xA4;
const CLOCK_POWER_TIMING_CONTROL_0: u32 = 0xD4;

/// Family 15h models 60h/70h expose the temperature through SMN only.
const SMN_INDEX_REGISTER: u32 = 0xB8;
const SMN_DATA_REGISTER: u32 = 0xBC;
const F15H_M60H_REPORTED_TEMP_CTRL: u32 = 0xD820_0CA4;

const CSTATES_IO_PORT: u32 = 0xCD6;

/// Event 076h "CPU clocks not halted", counting in user and OS mode.
const CLOCKS_NOT_HALTED: u32 = (1 << 22) | (1 << 17) | (1 << 16) | 0x76;

/// Device id of the northbridge miscellaneous control function.
fn misc_control_device_id(family: u32, model: u32) -> Option<u16> {
    let id = match (family, model & 0xF0) {
        (0x10, _) => 0x1203,
        (0x11, _) => 0x1303,
        (0x12, _) | (0x14, _) => 0x1703,
        (0x15, 0x00) => 0x1603,
        (0x15, 0x10) => 0x1403,
        (0x15, 0x30) => 0x141D,
        (0x15, 0x60) | (0x15, 0x70) => 0x1573,
        (0x16, 0x00) => 0x1533,
        (0x16, 0x30) => 0x1583,
        _ => return None,
    };
    Some(id)
}

fn is_svi2(family: u32, model: u32) -> bool {
    (family == 0x15 && model >= 0x10) || family == 0x16
}

fn uses_smn_temperature(family: u32, model: u32) -> bool {
    family == 0x15 && matches!(model & 0xF0, 0x60 | 0x70)
}

/// Core multiplier from COFVID_STATUS eax. Family 14h also needs the
/// frequency id from D18F3xD4.
pub fn core_multiplier(family: u32, eax: u32, d4: Option<u32>) -> f64 {
    match family {
        0x10 | 0x11 | 0x15 | 0x16 => {
            let did = (eax >> 6) & 7;
            let fid = eax & 0x1F;
            0.5 * (fid + 0x10) as f64 / (1u32 << did) as f64
        }
        0x12 => {
            let fid = (eax >> 4) & 0x1F;
            let divisor = match eax & 0xF {
                1 => 1.5,
                2 => 2.0,
                3 => 3.0,
                4 => 4.0,
                5 => 6.0,
                6 => 8.0,
                7 => 12.0,
                8 => 16.0,
                _ => 1.0,
            };
            (fid + 0x10) as f64 / divisor
        }
        0x14 => {
            let msd = (eax >> 4) & 0x1F;
            let lsd = eax & 0xF;
            let fid = d4.unwrap_or(0) & 0x1F;
            (fid + 0x10) as f64 / (msd as f64 + lsd as f64 * 0.25 + 1.0)
        }
        _ => 1.0,
    }
}

fn svi2_voltage(vid: u32) -> Option<f32> {
    (vid < 0xF8).then(|| 1.55 - 0.00625 * vid as f32)
}

fn svi1_voltage(vid: u32) -> Option<f32> {
    (vid < 0x7C).then(|| 1.55 - 0.0125 * vid as f32)
}

/// Core and northbridge voltage from COFVID_STATUS eax.
fn cofvid_voltages(svi2: bool, eax: u32) -> (Option<f32>, Option<f32>) {
    let core_vid = (eax >> 9) & 0x7F;
    if svi2 {
        (svi2_voltage(((eax >> 13) & 0x80) | core_vid), svi2_voltage(eax >> 24))
    } else {
        (svi1_voltage(core_vid), svi1_voltage(eax >> 25))
    }
}

/// Reported temperature control register to degrees, before the user offset.
fn reported_temperature(family: u32, model: u32, value: u32) -> f32 {
    // CurTmpRangeSel shifts the reading by 49 degrees
    if matches!(family, 0x15 | 0x16) && value & 0x30000 == 0x30000 {
        let mask = if family == 0x15 && model & 0xF0 == 0x00 { 0x7FC } else { 0x7FF };
        ((value >> 21) & mask) as f32 / 8.0 - 49.0
    } else {
        ((value >> 21) & 0x7FF) as f32 / 8.0
    }
}

/// The `temp1_input` of the first hwmon chip named k10temp.
fn find_k10temp(base: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(base).ok()?;
    for entry in entries.flatten() {
        let dir = entry.path();
        for sub in [dir.clone(), dir.join("device")] {
            let is_k10 = fs::read_to_string(sub.join("name"))
                .map(|name| name.trim() == "k10temp")
                .unwrap_or(false);
            if is_k10 {
                let input = sub.join("temp1_input");
                if input.exists() {
                    debug!(path = %input.display(), "Using k10temp for the package temperature");
                    return Some(input);
                }
            }
        }
    }
    None
}

/// I/O offset of the C-state residency counters in the southbridge PM block.
fn cstates_io_offset(ring0: &Ring0) -> Option<u8> {
    let address = get_pci_address(0, 20, 0);
    let device = ring0.read_pci_config(address, 0)?;
    match device {
        0x4385_1002 => {
            let revision = ring0.read_pci_config(address, 8).unwrap_or(0) & 0xFF;
            Some(if revision < 0x40 { 0xB3 } else { 0x9C })
        }
        0x780B_1022 | 0x790B_1022 => Some(0x9C),
        _ => None,
    }
}

pub struct Amd10Cpu {
    cpu: GenericCpu,
    misc_control: Option<u32>,
    svi2: bool,
    k10temp: Option<PathBuf>,
    tsc_multiplier: Option<f64>,
    cstates_offset: Option<u8>,
    cstates: Option<[SensorHandle; 2]>,
    core_temperature: SensorHandle,
    core_voltage: SensorHandle,
    northbridge_voltage: SensorHandle,
    bus_clock: SensorHandle,
    core_clocks: Vec<SensorHandle>,
}

impl Amd10Cpu {
    pub fn new(
        processor_index: usize,
        cores: Vec<Vec<CpuId>>,
        config: CpuConfig,
        ring0: Arc<Ring0>,
        env: &CpuEnvironment,
        settings: SharedSettings,
    ) -> Result<Self> {
        let mut cpu = GenericCpu::new(processor_index, cores, config, ring0, env, settings)?;
        let (family, model) = (cpu.family(), cpu.model());

        let offset = [ParameterDescription::new(
            "Offset [°C]",
            "Temperature offset.",
            config.temperature_offset,
        )];
        let core_temperature = cpu
            .core_mut()
            .create_sensor("CPU Cores", 0, SensorType::Temperature, &offset);
        let core_voltage = cpu.core_mut().create_sensor("CPU Cores", 0, SensorType::Voltage, &[]);
        let northbridge_voltage = cpu.core_mut().create_sensor("Northbridge", 1, SensorType::Voltage, &[]);
        cpu.core_mut().activate(core_voltage);
        cpu.core_mut().activate(northbridge_voltage);

        let misc_control = misc_control_device_id(family, model)
            .and_then(|id| amd_pci_address(cpu.ring0(), processor_index, id));

        let bus_clock = cpu.core_mut().create_sensor("Bus Speed", 0, SensorType::Clock, &[]);
        let mut core_clocks = Vec::with_capacity(cpu.core_count());
        for i in 0..cpu.core_count() {
            let name = cpu.core_string(i);
            let h = cpu.core_mut().create_sensor(name, i + 1, SensorType::Clock, &[]);
            if cpu.has_tsc() {
                cpu.core_mut().activate(h);
            }
            core_clocks.push(h);
        }

        let tsc_multiplier = if cpu.has_tsc() {
            let d4 = read_d4(cpu.ring0(), family, misc_control);
            let _guard = cpu.pin_first();
            estimate_tsc_multiplier(&cpu, d4)
        } else {
            None
        };
        debug!(processor = processor_index, tsc_multiplier = ?tsc_multiplier, "TSC multiplier estimated");

        let k10temp = find_k10temp(&env.hwmon_base);
        let cstates_offset = cstates_io_offset(cpu.ring0());
        let cstates = cstates_offset.map(|_| {
            let hw = cpu.core_mut();
            let c2 = hw.create_sensor("CPU Package C2", 0, SensorType::Level, &[]);
            let c3 = hw.create_sensor("CPU Package C3", 1, SensorType::Level, &[]);
            hw.activate(c2);
            hw.activate(c3);
            [c2, c3]
        });

        Ok(Self {
            cpu,
            misc_control,
            svi2: is_svi2(family, model),
            k10temp,
            tsc_multiplier,
            cstates_offset,
            cstates,
            core_temperature,
            core_voltage,
            northbridge_voltage,
            bus_clock,
            core_clocks,
        })
    }

    pub fn tsc_multiplier(&self) -> Option<f64> {
        self.tsc_multiplier
    }

    fn update_temperature(&mut self, ring0: &Ring0) {
        let h = self.core_temperature;
        if let Some(path) = &self.k10temp {
            let millidegrees = fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok());
            let core = self.cpu.core_mut();
            match millidegrees {
                Some(m) => {
                    core.set_value(h, Some(m as f32 / 1000.0));
                    core.activate(h);
                }
                None => core.deactivate(h),
            }
            return;
        }

        let Some(address) = self.misc_control else {
            self.cpu.core_mut().deactivate(h);
            return;
        };
        let (family, model) = (self.cpu.family(), self.cpu.model());
        let raw = if uses_smn_temperature(family, model) {
            read_smn_temperature(ring0)
        } else {
            ring0.read_pci_config(address, REPORTED_TEMPERATURE_CONTROL)
        };
        let core = self.cpu.core_mut();
        let offset = core.parameter(h, 0, 0.0);
        core.set_value(h, raw.map(|v| reported_temperature(family, model, v) + offset));
        core.activate(h);
    }

    fn update_clocks(&mut self, ring0: &Ring0) {
        if !self.cpu.has_tsc() {
            return;
        }
        let family = self.cpu.family();
        let d4 = read_d4(ring0, family, self.misc_control);
        let tsc = self.cpu.tsc_frequency();

        let mut bus = 0.0;
        let mut core_voltage: Option<f32> = None;
        let mut nb_voltage: Option<f32> = None;
        for i in 0..self.core_clocks.len() {
            self.cpu.core_pause();
            let cofvid = ring0.read_msr_on(COFVID_STATUS, self.cpu.core_mask(i));
            let clock = match (cofvid, self.tsc_multiplier) {
                (Some(msr), Some(tsc_multiplier)) => {
                    bus = tsc / tsc_multiplier;
                    core_multiplier(family, msr.eax, d4) * bus
                }
                _ => tsc,
            };
            let h = self.core_clocks[i];
            self.cpu.core_mut().set_value(h, Some(clock as f32));

            if let Some(msr) = cofvid {
                let (c, nb) = cofvid_voltages(self.svi2, msr.eax);
                core_voltage = max_option(core_voltage, c);
                nb_voltage = max_option(nb_voltage, nb);
            }
        }

        let core = self.cpu.core_mut();
        core.set_value(self.core_voltage, core_voltage);
        core.set_value(self.northbridge_voltage, nb_voltage);
        if bus > 0.0 {
            core.set_value(self.bus_clock, Some(bus as f32));
            core.activate(self.bus_clock);
        }
    }

    /// C2 and C3 residency in percent, read under the bus lock.
    fn cstate_residency(&self) -> Option<[f32; 2]> {
        let offset = self.cstates_offset?;
        let ring0 = self.cpu.ring0();
        if !ring0.wait_bus_mutex(BUS_LOCK_TIMEOUT_MS) {
            trace!("Bus lock busy, skipping C-state residency");
            return None;
        }
        let mut residency = [0.0; 2];
        for (i, slot) in residency.iter_mut().enumerate() {
            ring0.write_io_port(CSTATES_IO_PORT, offset.wrapping_add(i as u8));
            *slot = ring0.read_io_port(CSTATES_IO_PORT + 1) as f32 / 256.0 * 100.0;
        }
        ring0.release_bus_mutex();
        Some(residency)
    }
}

fn max_option(current: Option<f32>, candidate: Option<f32>) -> Option<f32> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn read_d4(ring0: &Ring0, family: u32, misc_control: Option<u32>) -> Option<u32> {
    if family != 0x14 {
        return None;
    }
    ring0.read_pci_config(misc_control?, CLOCK_POWER_TIMING_CONTROL_0)
}

fn read_smn_temperature(ring0: &Ring0) -> Option<u32> {
    let root = get_pci_address(0, 0, 0);
    if !ring0.wait_bus_mutex(BUS_LOCK_TIMEOUT_MS) {
        return None;
    }
    let value = if ring0.write_pci_config(root, SMN_INDEX_REGISTER, F15H_M60H_REPORTED_TEMP_CTRL) {
        ring0.read_pci_config(root, SMN_DATA_REGISTER)
    } else {
        None
    };
    ring0.release_bus_mutex();
    value
}

/// Median of three PERF_CTR0 measurements with core boost disabled.
/// The caller is pinned to the package's first thread.
fn estimate_tsc_multiplier(cpu: &GenericCpu, d4: Option<u32>) -> Option<f64> {
    let ring0 = cpu.ring0();
    let boost = cpu.first().has_core_boost();

    let hwcr = ring0.read_msr(HWCR);
    if let (true, Some(hwcr)) = (boost, hwcr) {
        ring0.write_msr(HWCR, hwcr.eax | (1 << 25), hwcr.edx);
    }
    let ctl = ring0.read_msr(PERF_CTL_0);
    let ctr = ring0.read_msr(PERF_CTR_0);

    let time = cpu.time_source();
    let tsc = cpu.tsc_frequency();
    let family = cpu.family();

    // warm up
    measure_multiplier(ring0, time, 0.0, family, d4, tsc);
    measure_multiplier(ring0, time, 0.0, family, d4, tsc);

    let mut estimates: Vec<f64> = (0..3)
        .filter_map(|_| measure_multiplier(ring0, time, 0.025, family, d4, tsc))
        .collect();
    estimates.sort_by(f64::total_cmp);

    if let Some(ctl) = ctl {
        ring0.write_msr(PERF_CTL_0, ctl.eax, ctl.edx);
    }
    if let Some(ctr) = ctr {
        ring0.write_msr(PERF_CTR_0, ctr.eax, ctr.edx);
    }
    if let (true, Some(hwcr)) = (boost, hwcr) {
        ring0.write_msr(HWCR, hwcr.eax, hwcr.edx);
    }

    estimates.get(estimates.len() / 2).copied()
}

/// One busy-wait window over the unhalted clock counter, rounded to a
/// quarter multiplier.
fn measure_multiplier(
    ring0: &Ring0,
    time: &dyn TimeSource,
    window: f64,
    family: u32,
    d4: Option<u32>,
    tsc: f64,
) -> Option<f64> {
    ring0.write_msr(PERF_CTL_0, CLOCKS_NOT_HALTED, 0);
    ring0.write_msr(PERF_CTR_0, 0, 0);

    let ticks = (window * time.frequency()) as i64;
    let begin = time.ticks() + (0.001 * ticks as f64).ceil() as i64;
    let end = begin + ticks;
    while time.ticks() < begin {
        std::hint::spin_loop();
    }
    let first = ring0.read_msr(PERF_CTR_0)?;
    while time.ticks() < end {
        std::hint::spin_loop();
    }
    let last = ring0.read_msr(PERF_CTR_0)?;
    let cofvid = ring0.read_msr(COFVID_STATUS)?;

    let cycles = last.value().wrapping_sub(first.value());
    let core_frequency = 1e-6 * cycles as f64 * time.frequency() / (end - begin) as f64;
    let bus_frequency = core_frequency / core_multiplier(family, cofvid.eax, d4);
    let multiplier = 0.25 * (4.0 * tsc / bus_frequency).round();
    (multiplier.is_finite() && multiplier > 0.0).then_some(multiplier)
}

impl Hardware for Amd10Cpu {
    fn core(&self) -> &HardwareCore {
        self.cpu.core()
    }

    fn core_mut(&mut self) -> &mut HardwareCore {
        self.cpu.core_mut()
    }

    fn update(&mut self) {
        self.cpu.update();
        let ring0 = self.cpu.ring0().clone();
        self.update_temperature(&ring0);
        self.update_clocks(&ring0);
        if let (Some(handles), Some(residency)) = (self.cstates, self.cstate_residency()) {
            let core = self.cpu.core_mut();
            for (h, value) in handles.into_iter().zip(residency) {
                core.set_value(h, Some(value));
            }
        }
    }

    fn report(&self) -> String {
        let mut r = self.cpu.report_with(REPORT_MSRS);
        match self.misc_control {
            Some(address) => {
                let _ = writeln!(r, "Miscellaneous Control Address: 0x{:X}", address);
            }
            None => {
                let _ = writeln!(r, "Miscellaneous Control Address: not found");
            }
        }
        match self.tsc_multiplier {
            Some(m) => {
                let _ = writeln!(r, "Time Stamp Counter Multiplier: {}", m);
            }
            None => {
                let _ = writeln!(r, "Time Stamp Counter Multiplier: unknown");
            }
        }
        if self.cpu.family() == 0x14 {
            let d4 = read_d4(self.cpu.ring0(), 0x14, self.misc_control).unwrap_or(0);
            let _ = writeln!(r, "PCI Register D18F3xD4: {:08X}", d4);
        }
        if let Some([c2, c3]) = self.cstate_residency() {
            let _ = writeln!(r, "C-State Residency C2: {:.1} %", c2);
            let _ = writeln!(r, "C-State Residency C3: {:.1} %", c3);
        }
        let _ = writeln!(r);
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::cpuid::{LeafBuilder, Vendor};
    use crate::cpu::table::select;
    use crate::cpu::testing::Bench;

    fn phenom() -> LeafBuilder {
        LeafBuilder::new(Vendor::Amd, "AMD Phenom(tm) II X4 955 Processor", 0x10, 0x04, 2)
            .cores(4, 1)
            .core_boost(true)
    }

    fn build(bench: &Bench) -> Amd10Cpu {
        let threads = bench.package(0);
        let first = &threads[0][0];
        let config = select(Vendor::Amd, first.family(), first.model(), first.stepping());
        Amd10Cpu::new(0, threads, config, bench.ring0.clone(), &bench.env, bench.settings.clone()).unwrap()
    }

    fn misc(bench: &Bench, device: u32) -> u32 {
        let address = get_pci_address(0, 0x18, 3);
        bench.machine.set_pci(address, 0, (device << 16) | 0x1022);
        address
    }

    fn value(cpu: &Amd10Cpu, kind: SensorType, name: &str) -> Option<f32> {
        cpu.core()
            .sensors()
            .find(|s| s.sensor_type() == kind && s.name() == name)
            .and_then(|s| s.value())
    }

    #[test]
    fn test_misc_control_device_ids() {
        assert_eq!(misc_control_device_id(0x10, 0x04), Some(0x1203));
        assert_eq!(misc_control_device_id(0x14, 0x02), Some(0x1703));
        assert_eq!(misc_control_device_id(0x15, 0x02), Some(0x1603));
        assert_eq!(misc_control_device_id(0x15, 0x38), Some(0x141D));
        assert_eq!(misc_control_device_id(0x15, 0x70), Some(0x1573));
        assert_eq!(misc_control_device_id(0x16, 0x30), Some(0x1583));
        assert_eq!(misc_control_device_id(0x16, 0x60), None);
    }

    #[test]
    fn test_core_multiplier_by_family() {
        // fid 0x0E, did 1
        assert_eq!(core_multiplier(0x10, (1 << 6) | 0x0E, None), 7.5);
        // fid 0x08, did 5 => divisor 6
        assert_eq!(core_multiplier(0x12, (0x08 << 4) | 5, None), 4.0);
        // fid 0x10 from D4, msd 3, lsd 0 => 32 / 4
        assert_eq!(core_multiplier(0x14, 3 << 4, Some(0x10)), 8.0);
        assert_eq!(core_multiplier(0x17, 0xFFFF, None), 1.0);
    }

    #[test]
    fn test_reported_temperature_range_select() {
        assert_eq!(reported_temperature(0x10, 0x04, 400 << 21), 50.0);
        // the range bits only shift 15h/16h
        assert_eq!(reported_temperature(0x10, 0x04, (400 << 21) | 0x30000), 50.0);
        assert_eq!(reported_temperature(0x16, 0x00, (803 << 21) | 0x30000), 803.0 / 8.0 - 49.0);
        // 15h m00 drops the two low bits
        assert_eq!(reported_temperature(0x15, 0x01, (803 << 21) | 0x30000), 800.0 / 8.0 - 49.0);
    }

    #[test]
    fn test_misc_register_temperature() {
        let bench = Bench::at_mhz(&phenom(), 3200);
        let address = misc(&bench, 0x1203);
        bench.machine.set_pci(address, REPORTED_TEMPERATURE_CONTROL, 400 << 21);
        let mut cpu = build(&bench);
        cpu.update();
        assert_eq!(value(&cpu, SensorType::Temperature, "CPU Cores"), Some(50.0));
    }

    #[test]
    fn test_smn_temperature_for_family_15h_model_60h() {
        let leaves = LeafBuilder::new(Vendor::Amd, "AMD A10-8700P Radeon R6", 0x15, 0x60, 1).cores(4, 1);
        let bench = Bench::at_mhz(&leaves, 1800);
        misc(&bench, 0x1573);
        let root = get_pci_address(0, 0, 0);
        bench.machine.add_indexed_pci(root, SMN_INDEX_REGISTER, SMN_DATA_REGISTER);
        bench
            .machine
            .set_indexed(root, SMN_DATA_REGISTER, F15H_M60H_REPORTED_TEMP_CTRL, 480 << 21);
        let mut cpu = build(&bench);
        cpu.update();
        assert_eq!(value(&cpu, SensorType::Temperature, "CPU Cores"), Some(60.0));
    }

    #[test]
    fn test_k10temp_takes_precedence() {
        let bench = Bench::at_mhz(&phenom(), 3200);
        let address = misc(&bench, 0x1203);
        bench.machine.set_pci(address, REPORTED_TEMPERATURE_CONTROL, 400 << 21);
        let chip = bench.env.hwmon_base.join("hwmon2");
        fs::create_dir_all(&chip).unwrap();
        fs::write(chip.join("name"), "k10temp\n").unwrap();
        fs::write(chip.join("temp1_input"), "45250\n").unwrap();

        let mut cpu = build(&bench);
        cpu.update();
        assert_eq!(value(&cpu, SensorType::Temperature, "CPU Cores"), Some(45.25));

        fs::write(chip.join("temp1_input"), "garbage").unwrap();
        cpu.update();
        assert!(cpu
            .core()
            .sensors()
            .all(|s| s.sensor_type() != SensorType::Temperature));
    }

    #[test]
    fn test_no_misc_device_deactivates_temperature() {
        let bench = Bench::at_mhz(&phenom(), 3200);
        let mut cpu = build(&bench);
        cpu.update();
        assert!(cpu
            .core()
            .sensors()
            .all(|s| s.sensor_type() != SensorType::Temperature));
        assert!(cpu.report().contains("Miscellaneous Control Address: not found"));
    }

    #[test]
    fn test_tsc_multiplier_estimate_and_clocks() {
        let bench = Bench::at_mhz(&phenom(), 3200);
        // P0 at 16x while estimating: 3200 MHz over a 25 ms window
        bench.machine.set_msr_all(COFVID_STATUS, 0x10);
        bench.machine.set_msr(0, PERF_CTR_0, 0);
        bench.machine.set_msr_step(0, PERF_CTR_0, 3200 * 25_000);
        bench.machine.set_msr(0, HWCR, 0x0100_0010);
        let mut cpu = build(&bench);
        assert_eq!(cpu.tsc_multiplier(), Some(16.0));
        // boost bit cleared again
        assert_eq!(bench.machine.msr(0, HWCR), Some(0x0100_0010));

        // down to 8x
        bench.machine.set_msr_all(COFVID_STATUS, 0x00);
        cpu.update();
        let bus = value(&cpu, SensorType::Clock, "Bus Speed").unwrap();
        assert!((bus - 200.0).abs() < 0.5, "bus {bus}");
        let core = value(&cpu, SensorType::Clock, "CPU Core #3").unwrap();
        assert!((core - 1600.0).abs() < 2.0, "core {core}");
        assert!(cpu.report().contains("Time Stamp Counter Multiplier: 16"));
    }

    #[test]
    fn test_failed_estimate_reports_tsc() {
        let bench = Bench::at_mhz(&phenom(), 3200);
        bench.machine.set_msr_all(COFVID_STATUS, 0x10);
        let mut cpu = build(&bench);
        assert_eq!(cpu.tsc_multiplier(), None);
        cpu.update();
        let core = value(&cpu, SensorType::Clock, "CPU Core #1").unwrap();
        assert!((core - 3200.0).abs() < 3.5);
        assert!(value(&cpu, SensorType::Clock, "Bus Speed").is_none());
    }

    #[test]
    fn test_svi2_voltages_take_maximum() {
        let leaves = LeafBuilder::new(Vendor::Amd, "AMD A10-7850K Radeon R7", 0x15, 0x30, 1).cores(2, 1);
        let bench = Bench::at_mhz(&leaves, 3700);
        // core vid 0x40 / nb vid 0x50 on one core, lower vids on the other
        bench.machine.set_msr(0, COFVID_STATUS, (0x50 << 24) | (0x40 << 9));
        bench.machine.set_msr(1, COFVID_STATUS, (0x60 << 24) | (0x44 << 9));
        let mut cpu = build(&bench);
        cpu.update();
        let core = value(&cpu, SensorType::Voltage, "CPU Cores").unwrap();
        let nb = value(&cpu, SensorType::Voltage, "Northbridge").unwrap();
        assert!((core - 1.15).abs() < 1e-4, "core {core}");
        assert!((nb - 1.05).abs() < 1e-4, "nb {nb}");
    }

    #[test]
    fn test_svi1_voltages() {
        let (core, nb) = cofvid_voltages(false, (0x20 << 25) | (0x10 << 9));
        assert!((core.unwrap() - 1.35).abs() < 1e-4);
        assert!((nb.unwrap() - 1.15).abs() < 1e-4);
        assert_eq!(cofvid_voltages(false, 0x7C << 9).0, None);
    }

    #[test]
    fn test_report_includes_cstate_residency() {
        let bench = Bench::at_mhz(&phenom(), 3200);
        let sb = get_pci_address(0, 20, 0);
        bench.machine.set_pci(sb, 0, 0x780B_1022);
        bench.machine.set_io_port(CSTATES_IO_PORT + 1, 128);
        let cpu = build(&bench);
        let report = cpu.report();
        assert!(report.contains("C-State Residency C2: 50.0 %"));
        assert!(report.contains("C-State Residency C3: 50.0 %"));
        assert_eq!(bench.machine.io_port(CSTATES_IO_PORT), Some(0x9D));
    }

    #[test]
    fn test_cstate_residency_sensors() {
        let bench = Bench::at_mhz(&phenom(), 3200);
        let sb = get_pci_address(0, 20, 0);
        bench.machine.set_pci(sb, 0, 0x4385_1002);
        bench.machine.set_pci(sb, 8, 0x3C);
        bench.machine.set_io_port(CSTATES_IO_PORT + 1, 64);
        let mut cpu = build(&bench);
        cpu.update();
        assert_eq!(value(&cpu, SensorType::Level, "CPU Package C2"), Some(25.0));
        assert_eq!(value(&cpu, SensorType::Level, "CPU Package C3"), Some(25.0));
        // revision below 0x40 uses the older offset
        assert_eq!(bench.machine.io_port(CSTATES_IO_PORT), Some(0xB4));
    }

    #[test]
    fn test_no_southbridge_no_cstate_sensors() {
        let bench = Bench::at_mhz(&phenom(), 3200);
        let mut cpu = build(&bench);
        cpu.update();
        assert!(cpu.core().sensors().all(|s| s.sensor_type() != SensorType::Level));
    }
}
