//! AMD family 0Fh (K8) decoder
//!
//! Core temperatures come from the THERMTRIP register of the northbridge
//! miscellaneous control function, core clocks from FIDVID_STATUS.

use std::fmt::Write as _;
use std::sync::Arc;

use super::cpuid::CpuId;
use super::generic::GenericCpu;
use super::table::CpuConfig;
use super::{amd_pci_address, CpuEnvironment};
use crate::error::Result;
use crate::hardware::{Hardware, HardwareCore, SensorHandle};
use crate::ring0::Ring0;
use crate::sensor::{ParameterDescription, SensorType};
use crate::settings::SharedSettings;

const FIDVID_STATUS: u32 = 0xC0010042;
const MISC_CONTROL_DEVICE_ID: u16 = 0x1103;
const THERMTRIP_STATUS: u32 = 0xE4;

/// Current and maximum multiplier from FIDVID_STATUS eax.
fn fidvid_multipliers(eax: u32) -> (f64, f64) {
    let current = 0.5 * ((eax & 0x3F) + 8) as f64;
    let max = 0.5 * (((eax >> 16) & 0x3F) + 8) as f64;
    (current, max)
}

pub struct Amd0FCpu {
    cpu: GenericCpu,
    misc_control: Option<u32>,
    /// Core select values for the first core and for the others
    core_select: [u32; 2],
    core_temperatures: Vec<SensorHandle>,
    bus_clock: SensorHandle,
    core_clocks: Vec<SensorHandle>,
}

impl Amd0FCpu {
    pub fn new(
        processor_index: usize,
        cores: Vec<Vec<CpuId>>,
        config: CpuConfig,
        ring0: Arc<Ring0>,
        env: &CpuEnvironment,
        settings: SharedSettings,
    ) -> Result<Self> {
        let mut cpu = GenericCpu::new(processor_index, cores, config, ring0, env, settings)?;

        // NPT revisions F and G swap the core selection
        let core_select = if cpu.model() < 40 { [0x0, 0x4] } else { [0x4, 0x0] };

        let mut core_temperatures = Vec::new();
        if cpu.first().has_amd_thermal_sensor() {
            let offset = [ParameterDescription::new(
                "Offset [°C]",
                "Temperature offset of the thermal sensor. Temperature = Value + Offset.",
                config.temperature_offset,
            )];
            for i in 0..cpu.core_count() {
                let h = cpu
                    .core_mut()
                    .create_sensor(format!("Core #{}", i + 1), i, SensorType::Temperature, &offset);
                core_temperatures.push(h);
            }
        }

        let misc_control = amd_pci_address(cpu.ring0(), processor_index, MISC_CONTROL_DEVICE_ID);

        let bus_clock = cpu.core_mut().create_sensor("Bus Speed", 0, SensorType::Clock, &[]);
        let mut core_clocks = Vec::new();
        for i in 0..cpu.core_count() {
            let name = cpu.core_string(i);
            let h = cpu.core_mut().create_sensor(name, i + 1, SensorType::Clock, &[]);
            if cpu.has_tsc() {
                cpu.core_mut().activate(h);
            }
            core_clocks.push(h);
        }

        Ok(Self {
            cpu,
            misc_control,
            core_select,
            core_temperatures,
            bus_clock,
            core_clocks,
        })
    }

    fn update_temperatures(&mut self, ring0: &Ring0) {
        let Some(address) = self.misc_control else {
            return;
        };
        for (i, &h) in self.core_temperatures.iter().enumerate() {
            let select = self.core_select[usize::from(i > 0)];
            if !ring0.write_pci_config(address, THERMTRIP_STATUS, select) {
                // the register would still hold the other core's reading
                self.cpu.core_mut().set_value(h, None);
                continue;
            }
            let core = self.cpu.core_mut();
            match ring0.read_pci_config(address, THERMTRIP_STATUS) {
                Some(value) => {
                    let offset = core.parameter(h, 0, 0.0);
                    core.set_value(h, Some(((value >> 16) & 0xFF) as f32 + offset));
                    core.activate(h);
                }
                None => core.deactivate(h),
            }
        }
    }

    fn update_clocks(&mut self, ring0: &Ring0) {
        if !self.cpu.has_tsc() {
            return;
        }
        let tsc = self.cpu.tsc_frequency();
        let mut bus = 0.0;
        for i in 0..self.core_clocks.len() {
            self.cpu.core_pause();
            let value = match ring0.read_msr_on(FIDVID_STATUS, self.cpu.core_mask(i)) {
                Some(msr) => {
                    let (current, max) = fidvid_multipliers(msr.eax);
                    bus = tsc / max;
                    current * tsc / max
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
}

impl Hardware for Amd0FCpu {
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
    }

    fn report(&self) -> String {
        let mut r = self.cpu.report_with(&[FIDVID_STATUS]);
        match self.misc_control {
            Some(address) => {
                let _ = writeln!(r, "Miscellaneous Control Address: 0x{:X}", address);
            }
            None => {
                let _ = writeln!(r, "Miscellaneous Control Address: not found");
            }
        }
        let _ = writeln!(r);
        r
    }
}
