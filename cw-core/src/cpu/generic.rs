//! Vendor-neutral processor node
//!
//! `GenericCpu` owns what every decoder needs: the package topology, load
//! accounting and the TSC frequency estimate. Vendor decoders embed one and
//! call its `update` before reading their own registers. Processors with no
//! matching decoder are exposed as a bare `GenericCpu`.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::cpuid::{CpuId, Vendor};
use super::load::CpuLoad;
use super::table::CpuConfig;
use super::CpuEnvironment;
use crate::affinity::{thread_mask, AffinityGuard};
use crate::clock::{ClockCalibrator, TimeSource};
use crate::error::{CorewatchError, Result};
use crate::hardware::{Hardware, HardwareCore, HardwareType, SensorHandle};
use crate::identifier::Identifier;
use crate::ring0::Ring0;
use crate::sensor::SensorType;
use crate::settings::SharedSettings;

struct LoadSensors {
    load: CpuLoad,
    total: Option<SensorHandle>,
    cores: Vec<SensorHandle>,
}

pub struct GenericCpu {
    core: HardwareCore,
    cores: Vec<Vec<CpuId>>,
    ring0: Arc<Ring0>,
    config: CpuConfig,
    loads: Option<LoadSensors>,
    clock: ClockCalibrator,
    core_read_delay: Duration,
}

impl GenericCpu {
    /// `cores` holds the threads of one package, grouped by core.
    pub fn new(
        processor_index: usize,
        cores: Vec<Vec<CpuId>>,
        config: CpuConfig,
        ring0: Arc<Ring0>,
        env: &CpuEnvironment,
        settings: SharedSettings,
    ) -> Result<Self> {
        let first = cores
            .first()
            .and_then(|threads| threads.first())
            .ok_or_else(|| CorewatchError::generic(format!("processor {} has no threads", processor_index)))?
            .clone();

        let name = if first.name().is_empty() {
            format!("{} CPU", first.vendor())
        } else {
            first.name().to_string()
        };
        let identifier = Identifier::new([first.vendor().token().to_string(), processor_index.to_string()])?;
        let mut core = HardwareCore::new(name, identifier, HardwareType::Cpu, settings);

        let loads = env.times.as_ref().and_then(|times| {
            let threads = cores
                .iter()
                .map(|c| c.iter().map(|t| t.thread()).collect())
                .collect();
            let load = CpuLoad::new(times.clone(), threads);
            if !load.is_available() {
                debug!(processor = processor_index, "Load counters unavailable, no load sensors");
                return None;
            }
            let total = (cores.len() > 1).then(|| core.create_sensor("CPU Total", 0, SensorType::Load, &[]));
            let per_core: Vec<SensorHandle> = (0..cores.len())
                .map(|i| core.create_sensor(core_label(cores.len(), i), i + 1, SensorType::Load, &[]))
                .collect();
            for &h in &per_core {
                core.activate(h);
            }
            if let Some(h) = total {
                core.activate(h);
            }
            Some(LoadSensors { load, total, cores: per_core })
        });

        let mut cpu = Self {
            core,
            cores,
            ring0,
            config,
            loads,
            clock: ClockCalibrator::new(env.time.clone(), env.counter.clone()),
            core_read_delay: env.core_read_delay,
        };

        if first.has_tsc() {
            let mask = thread_mask(first.thread()).unwrap_or(0);
            let _guard = match cpu.ring0.pin(mask) {
                Ok(g) => Some(g),
                Err(e) => {
                    debug!(error = %e, "Calibrating without a pin");
                    None
                }
            };
            cpu.clock.calibrate();
        } else {
            cpu.clock.set_frequency(0.0);
        }
        if let Err(e) = cpu.clock.precision() {
            debug!(processor = processor_index, error = %e, "TSC estimate is imprecise");
        }

        Ok(cpu)
    }

    pub fn cores(&self) -> &[Vec<CpuId>] {
        &self.cores
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    pub fn threads_per_core(&self) -> usize {
        self.cores[0].len()
    }

    /// CPUID of the package's first thread.
    pub fn first(&self) -> &CpuId {
        &self.cores[0][0]
    }

    pub fn vendor(&self) -> Vendor {
        self.first().vendor()
    }

    pub fn family(&self) -> u32 {
        self.first().family()
    }

    pub fn model(&self) -> u32 {
        self.first().model()
    }

    pub fn stepping(&self) -> u32 {
        self.first().stepping()
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn ring0(&self) -> &Arc<Ring0> {
        &self.ring0
    }

    pub fn has_msr(&self) -> bool {
        self.first().has_msr()
    }

    pub fn has_tsc(&self) -> bool {
        self.first().has_tsc()
    }

    pub fn has_invariant_tsc(&self) -> bool {
        self.first().has_invariant_tsc()
    }

    /// Current TSC frequency in MHz.
    pub fn tsc_frequency(&self) -> f64 {
        self.clock.frequency()
    }

    pub fn time_source(&self) -> &dyn TimeSource {
        self.clock.time_source()
    }

    /// Seconds on the calibration timer, for energy deltas.
    pub fn now_seconds(&self) -> f64 {
        let time = self.clock.time_source();
        time.ticks() as f64 / time.frequency()
    }

    /// Affinity mask of the first thread of core `index`.
    pub fn core_mask(&self, index: usize) -> u64 {
        self.cores
            .get(index)
            .and_then(|c| c.first())
            .and_then(|t| thread_mask(t.thread()).ok())
            .unwrap_or(0)
    }

    /// Pin the caller to the package's first thread.
    pub fn pin_first(&self) -> Option<AffinityGuard<'_>> {
        match self.ring0.pin(self.core_mask(0)) {
            Ok(g) => Some(g),
            Err(e) => {
                trace!(error = %e, "Pin to first thread failed");
                None
            }
        }
    }

    /// "CPU Core" for single core packages, "CPU Core #n" otherwise.
    pub fn core_string(&self, index: usize) -> String {
        core_label(self.cores.len(), index)
    }

    /// Pause between per-core register reads.
    pub fn core_pause(&self) {
        if !self.core_read_delay.is_zero() {
            std::thread::sleep(self.core_read_delay);
        }
    }

    /// Refresh the TSC estimate and the load sensors.
    pub fn update(&mut self) {
        if self.has_tsc() && self.has_invariant_tsc() {
            let mask = self.core_mask(0);
            if let Ok(_guard) = self.ring0.pin(mask) {
                self.clock.refine();
            }
        }

        if let Some(loads) = self.loads.as_mut() {
            loads.load.update();
            for (i, &h) in loads.cores.iter().enumerate() {
                self.core.set_value(h, Some(loads.load.core_load(i)));
            }
            if let Some(h) = loads.total {
                self.core.set_value(h, Some(loads.load.total_load()));
            }
        }
    }

    /// Base report followed by a per-core dump of `msrs`.
    pub fn report_with(&self, msrs: &[u32]) -> String {
        let mut r = String::new();
        let heading = match self.vendor() {
            Vendor::Amd => "AMD CPU",
            Vendor::Intel => "Intel CPU",
            Vendor::Unknown => "Generic CPU",
        };
        let _ = writeln!(r, "{}", heading);
        let _ = writeln!(r);
        let _ = writeln!(r, "Name: {}", self.core.name());
        let _ = writeln!(r, "Microarchitecture: {}", self.config.arch);
        let _ = writeln!(r, "Number of Cores: {}", self.core_count());
        let _ = writeln!(r, "Threads per Core: {}", self.threads_per_core());
        let _ = writeln!(r, "Timer Frequency: {} MHz", self.clock.time_source().frequency() * 1e-6);
        let tsc = match (self.has_tsc(), self.has_invariant_tsc()) {
            (false, _) => "None",
            (true, true) => "Invariant",
            (true, false) => "Not Invariant",
        };
        let _ = writeln!(r, "Time Stamp Counter: {}", tsc);
        let estimated = self.clock.estimated_frequency();
        let _ = writeln!(r, "Estimated Time Stamp Counter Frequency: {:.2} MHz", estimated);
        let _ = writeln!(
            r,
            "Estimated Time Stamp Counter Frequency Error: {:.5} MHz",
            estimated * self.clock.estimated_error()
        );
        let _ = writeln!(r, "Time Stamp Counter Frequency: {:.2} MHz", self.tsc_frequency());
        let _ = writeln!(r);

        if !msrs.is_empty() {
            for i in 0..self.core_count() {
                let _ = writeln!(r, "MSR Core #{}", i + 1);
                let _ = writeln!(r);
                let _ = writeln!(r, " MSR       EDX       EAX");
                let mask = self.core_mask(i);
                for &index in msrs {
                    if let Some(msr) = self.ring0.read_msr_on(index, mask) {
                        let _ = writeln!(r, " {:08X}  {:08X}  {:08X}", index, msr.edx, msr.eax);
                    }
                }
                let _ = writeln!(r);
            }
        }
        r
    }
}

fn core_label(core_count: usize, index: usize) -> String {
    if core_count == 1 {
        "CPU Core".to_string()
    } else {
        format!("CPU Core #{}", index + 1)
    }
}

impl Hardware for GenericCpu {
    fn core(&self) -> &HardwareCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut HardwareCore {
        &mut self.core
    }

    fn update(&mut self) {
        GenericCpu::update(self);
    }

    fn report(&self) -> String {
        self.report_with(&[])
    }
}
