//! Root of the hardware tree
//!
//! `Computer` owns the register session and the groups built on it. The
//! caller drives it: `open`, then `update` from its polling loop, then `close`.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, info};

use crate::affinity::ThreadAffinity;
use crate::constants::app;
use crate::cpu::{CpuEnvironment, CpuGroup, CpuidSource, NativeCpuid};
use crate::hardware::{Group, Hardware, Visitor};
use crate::ring0::Ring0;
use crate::settings::SharedSettings;

pub struct Computer {
    ring0: Arc<Ring0>,
    settings: SharedSettings,
    env: CpuEnvironment,
    cpuid: Arc<dyn CpuidSource>,
    cpu: Option<CpuGroup>,
    groups: Vec<Box<dyn Group>>,
    cpu_enabled: bool,
    open: bool,
}

impl Computer {
    pub fn new(ring0: Arc<Ring0>, settings: SharedSettings) -> Self {
        Self {
            ring0,
            settings,
            env: CpuEnvironment::default(),
            cpuid: Arc::new(NativeCpuid::new(Arc::new(ThreadAffinity))),
            cpu: None,
            groups: Vec::new(),
            cpu_enabled: true,
            open: false,
        }
    }

    pub fn with_cpuid(mut self, cpuid: Arc<dyn CpuidSource>) -> Self {
        self.cpuid = cpuid;
        self
    }

    pub fn with_environment(mut self, env: CpuEnvironment) -> Self {
        self.env = env;
        self
    }

    pub fn ring0(&self) -> &Arc<Ring0> {
        &self.ring0
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Open the register session and discover hardware. Idempotent.
    pub fn open(&mut self) {
        if self.open {
            return;
        }
        self.ring0.open();
        if self.cpu_enabled {
            self.open_cpu();
        }
        self.open = true;
        info!(hardware = self.hardware().len(), "Computer open");
    }

    fn open_cpu(&mut self) {
        let group = CpuGroup::new(self.ring0.clone(), self.cpuid.as_ref(), &self.env, self.settings.clone());
        debug!(processors = group.hardware().len(), "CPU group open");
        self.cpu = Some(group);
    }

    fn close_cpu(&mut self) {
        if let Some(mut group) = self.cpu.take() {
            group.close();
            debug!("CPU group closed");
        }
    }

    /// Tear the tree down and close the session.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.close_cpu();
        for group in &mut self.groups {
            group.close();
        }
        self.ring0.close();
        self.open = false;
        info!("Computer closed");
    }

    pub fn is_cpu_enabled(&self) -> bool {
        self.cpu_enabled
    }

    /// Toggle the CPU group; takes effect immediately on an open computer.
    pub fn set_cpu_enabled(&mut self, enabled: bool) {
        if enabled == self.cpu_enabled {
            return;
        }
        self.cpu_enabled = enabled;
        if self.open {
            if enabled {
                self.open_cpu();
            } else {
                self.close_cpu();
            }
        }
    }

    /// Attach a group owned by another collaborator.
    pub fn add_group(&mut self, group: Box<dyn Group>) {
        self.groups.push(group);
    }

    fn all_groups(&self) -> impl Iterator<Item = &dyn Group> {
        self.cpu
            .iter()
            .map(|g| g as &dyn Group)
            .chain(self.groups.iter().map(|g| g.as_ref()))
    }

    pub fn hardware(&self) -> Vec<&dyn Hardware> {
        self.all_groups()
            .flat_map(|g| g.hardware().iter().map(|h| h.as_ref()))
            .collect()
    }

    /// One sequential pass over every hardware node, sub-hardware included.
    pub fn update(&mut self) {
        if let Some(group) = self.cpu.as_mut() {
            for hardware in group.hardware_mut() {
                update_tree(hardware.as_mut());
            }
        }
        for group in &mut self.groups {
            for hardware in group.hardware_mut() {
                update_tree(hardware.as_mut());
            }
        }
    }

    pub fn accept<V: Visitor + ?Sized>(&self, visitor: &mut V) {
        for hardware in self.hardware() {
            visitor.visit_hardware(hardware);
        }
    }

    /// Plain-text diagnostic report of the whole tree.
    pub fn report(&self) -> String {
        let mut r = String::new();
        let _ = writeln!(r, "{} Report", app::NAME);
        let _ = writeln!(r);
        let _ = writeln!(r, "Version: {}", app::VERSION);
        let _ = writeln!(r, "Operating System: {} ({})", std::env::consts::OS, std::env::consts::ARCH);
        let _ = writeln!(r);
        r.push_str(&self.ring0.report());

        for group in self.all_groups() {
            let report = group.report();
            if !report.is_empty() {
                r.push_str(&report);
            }
        }

        for hardware in self.hardware() {
            let _ = writeln!(r, "Hardware: {} ({})", hardware.name(), hardware.identifier());
            let _ = writeln!(r);
            for sensor in hardware.core().sorted_sensors() {
                let value = sensor
                    .value()
                    .map(|v| format!("{:.3}", v))
                    .unwrap_or_else(|| "-".to_string());
                let _ = writeln!(r, "| {:<24} : {:>10} {}  ({})", sensor.name(), value, sensor.sensor_type().unit(), sensor.identifier());
            }
            let _ = writeln!(r);
            r.push_str(&hardware.report());
        }
        r
    }
}

fn update_tree(hardware: &mut dyn Hardware) {
    hardware.update();
    for sub in hardware.sub_hardware_mut() {
        update_tree(sub.as_mut());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::clock::SteppingClock;
    use crate::cpu::testing::HalfBusy;
    use crate::cpu::{LeafBuilder, StaticCpuid, Vendor};
    use crate::hardware::{walk_hardware, HardwareCore, HardwareType};
    use crate::identifier::Identifier;
    use crate::ring0::SimulatedMachine;
    use crate::sensor::{Sensor, SensorType};
    use crate::settings::MemorySettings;

    struct Rig {
        machine: SimulatedMachine,
        computer: Computer,
        _dir: TempDir,
    }

    fn rig(machine: SimulatedMachine, leaves: &LeafBuilder) -> Rig {
        let dir = TempDir::new().unwrap();
        let threads = leaves.build();
        let ring0 = Ring0::simulated(&machine)
            .with_bus_lock_path(dir.path().join("bus.lock"))
            .with_reinstall_delay(Duration::ZERO);
        let clock = Arc::new(SteppingClock::at_mhz(3300));
        let env = CpuEnvironment {
            time: clock.clone(),
            counter: clock,
            times: Some(Arc::new(HalfBusy::new(threads.len()))),
            core_read_delay: Duration::ZERO,
            hwmon_base: dir.path().join("hwmon"),
        };
        let computer = Computer::new(Arc::new(ring0), MemorySettings::shared())
            .with_cpuid(Arc::new(StaticCpuid::new(threads)))
            .with_environment(env);
        Rig {
            machine,
            computer,
            _dir: dir,
        }
    }

    fn haswell() -> LeafBuilder {
        LeafBuilder::new(Vendor::Intel, "Intel(R) Core(TM) i5-4590 CPU @ 3.30GHz", 6, 0x3C, 3)
            .cores(4, 1)
            .thermal(true, true)
    }

    #[derive(Default)]
    struct Values {
        values: Vec<(SensorType, Option<f32>)>,
    }

    impl Visitor for Values {
        fn visit_sensor(&mut self, sensor: &Sensor) {
            self.values.push((sensor.sensor_type(), sensor.value()));
        }
    }

    struct Static {
        hardware: Vec<Box<dyn Hardware>>,
    }

    struct Plate {
        core: HardwareCore,
        updates: Arc<AtomicUsize>,
        subs: Vec<Box<dyn Hardware>>,
    }

    impl Plate {
        fn new(name: &str, index: usize, settings: SharedSettings, updates: Arc<AtomicUsize>) -> Self {
            let id = Identifier::new(["plate".to_string(), index.to_string()]).unwrap();
            let mut core = HardwareCore::new(name, id, HardwareType::Controller, settings);
            let h = core.create_sensor("Level", 0, SensorType::Level, &[]);
            core.activate(h);
            Self {
                core,
                updates,
                subs: Vec::new(),
            }
        }
    }

    impl Hardware for Plate {
        fn core(&self) -> &HardwareCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut HardwareCore {
            &mut self.core
        }

        fn update(&mut self) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }

        fn sub_hardware(&self) -> &[Box<dyn Hardware>] {
            &self.subs
        }

        fn sub_hardware_mut(&mut self) -> &mut [Box<dyn Hardware>] {
            &mut self.subs
        }
    }

    impl Group for Static {
        fn hardware(&self) -> &[Box<dyn Hardware>] {
            &self.hardware
        }

        fn hardware_mut(&mut self) -> &mut [Box<dyn Hardware>] {
            &mut self.hardware
        }
    }

    #[test]
    fn test_open_update_close() {
        let Rig { machine, mut computer, _dir } = rig(SimulatedMachine::new(4), &haswell());
        machine.set_msr_all(0x19C, 0x8823_0000);
        computer.open();
        assert!(computer.is_open());
        assert_eq!(computer.hardware().len(), 1);

        computer.update();
        let mut v = Values::default();
        computer.accept(&mut v);
        assert!(v
            .values
            .iter()
            .any(|(kind, value)| *kind == SensorType::Temperature && value.is_some()));

        computer.close();
        assert!(!computer.is_open());
        assert!(computer.hardware().is_empty());
        assert!(!computer.ring0().is_open());
    }

    #[test]
    fn test_unavailable_mediator_leaves_register_sensors_empty() {
        let Rig { mut computer, _dir, .. } = rig(SimulatedMachine::uninstalled(4), &haswell());
        computer.open();
        assert!(!computer.ring0().is_open());
        computer.update();
        computer.update();

        let mut v = Values::default();
        computer.accept(&mut v);
        assert!(v
            .values
            .iter()
            .filter(|(kind, _)| *kind != SensorType::Load)
            .all(|(_, value)| value.is_none()));
    }

    #[test]
    fn test_cpu_toggle() {
        let Rig { mut computer, _dir, .. } = rig(SimulatedMachine::new(4), &haswell());
        computer.open();
        computer.set_cpu_enabled(false);
        assert!(computer.hardware().is_empty());
        computer.set_cpu_enabled(true);
        assert_eq!(computer.hardware().len(), 1);
        computer.close();
    }

    #[test]
    fn test_added_group_is_walked() {
        let Rig { mut computer, _dir, .. } = rig(SimulatedMachine::new(4), &haswell());
        computer.set_cpu_enabled(false);
        let plate = Plate::new("Plate", 0, computer.settings().clone(), Arc::default());
        computer.add_group(Box::new(Static {
            hardware: vec![Box::new(plate)],
        }));
        computer.open();

        struct Names(Vec<String>);
        impl Visitor for Names {
            fn visit_hardware(&mut self, hardware: &dyn Hardware) {
                self.0.push(hardware.name().to_string());
                walk_hardware(self, hardware);
            }
        }
        let mut names = Names(Vec::new());
        computer.accept(&mut names);
        assert_eq!(names.0, vec!["Plate".to_string()]);
    }

    #[test]
    fn test_report_sections() {
        let Rig { mut computer, _dir, .. } = rig(SimulatedMachine::new(4), &haswell());
        computer.open();
        computer.update();
        let report = computer.report();
        assert!(report.starts_with("corewatch Report"));
        assert!(report.contains("Ring0"));
        assert!(report.contains("CPUID"));
        assert!(report.contains("Hardware: Intel Core i5-4590 (/intelcpu/0)"));
        assert!(report.contains("Intel CPU"));
        computer.close();
    }

    #[test]
    fn test_update_reaches_sub_hardware() {
        let Rig { mut computer, _dir, .. } = rig(SimulatedMachine::new(4), &haswell());
        computer.set_cpu_enabled(false);
        let (outer, inner) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let settings = computer.settings().clone();
        let mut plate = Plate::new("Plate", 0, settings.clone(), outer.clone());
        plate.subs.push(Box::new(Plate::new("Sub Plate", 1, settings, inner.clone())));
        computer.add_group(Box::new(Static {
            hardware: vec![Box::new(plate)],
        }));
        computer.open();
        computer.update();
        computer.update();
        assert_eq!(outer.load(Ordering::SeqCst), 2);
        assert_eq!(inner.load(Ordering::SeqCst), 2);
        computer.close();
    }
}
