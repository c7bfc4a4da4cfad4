//! Processor discovery and decoding
//!
//! - `cpuid` - raw leaves, topology and capability flags
//! - `table` - decoder and microarchitecture selection
//! - `generic` - load, TSC and the node every decoder embeds
//! - `intel`, `amd0f`, `amd10`, `amd17` - vendor register decoders
//! - `load`, `energy` - OS time accounting and energy counter deltas

pub mod amd0f;
pub mod amd10;
pub mod amd17;
pub mod cpuid;
pub mod energy;
pub mod generic;
pub mod intel;
pub mod load;
pub mod table;

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::{CycleCounter, MonotonicClock, TimeSource, Tsc};
use crate::constants::paths;
use crate::error::Result;
use crate::hardware::{Group, Hardware};
use crate::ring0::{get_pci_address, Ring0};
use crate::settings::SharedSettings;

pub use amd0f::Amd0FCpu;
pub use amd10::Amd10Cpu;
pub use amd17::Amd17Cpu;
pub use cpuid::{discover, CpuId, CpuidSource, LeafBuilder, NativeCpuid, StaticCpuid, Topology, Vendor};
pub use generic::GenericCpu;
pub use intel::IntelCpu;
pub use load::{CpuTimes, ProcStat, ProcessorTimes};
pub use table::{CpuConfig, DecoderKind, MicroArchitecture};

const AMD_VENDOR_ID: u32 = 0x1022;
const MISCELLANEOUS_CONTROL_FUNCTION: u8 = 3;

/// Host services the decoders measure against.
#[derive(Clone)]
pub struct CpuEnvironment {
    pub time: Arc<dyn TimeSource>,
    pub counter: Arc<dyn CycleCounter>,
    /// `None` disables the load sensors
    pub times: Option<Arc<dyn ProcessorTimes>>,
    /// Pause between per-core register reads
    pub core_read_delay: Duration,
    /// Where to look for a k10temp hwmon node
    pub hwmon_base: PathBuf,
}

impl Default for CpuEnvironment {
    fn default() -> Self {
        Self {
            time: Arc::new(MonotonicClock::new()),
            counter: Arc::new(Tsc),
            times: Some(Arc::new(ProcStat::default())),
            core_read_delay: Duration::from_millis(1),
            hwmon_base: PathBuf::from(paths::HWMON_BASE),
        }
    }
}

/// PCI address of an AMD northbridge function for `processor_index`, if the
/// device there has the expected id.
pub(crate) fn amd_pci_address(ring0: &Ring0, processor_index: usize, device_id: u16) -> Option<u32> {
    let device = 0x18u8.checked_add(u8::try_from(processor_index).ok()?)?;
    let address = get_pci_address(0, device, MISCELLANEOUS_CONTROL_FUNCTION);
    let expected = ((device_id as u32) << 16) | AMD_VENDOR_ID;
    match ring0.read_pci_config(address, 0) {
        Some(id) if id == expected => Some(address),
        _ => None,
    }
}

fn build(
    kind: DecoderKind,
    processor_index: usize,
    cores: Vec<Vec<CpuId>>,
    config: CpuConfig,
    ring0: Arc<Ring0>,
    env: &CpuEnvironment,
    settings: SharedSettings,
) -> Result<Box<dyn Hardware>> {
    let hardware: Box<dyn Hardware> = match kind {
        DecoderKind::Intel => Box::new(IntelCpu::new(processor_index, cores, config, ring0, env, settings)?),
        DecoderKind::Amd0F => Box::new(Amd0FCpu::new(processor_index, cores, config, ring0, env, settings)?),
        DecoderKind::Amd10 => Box::new(Amd10Cpu::new(processor_index, cores, config, ring0, env, settings)?),
        DecoderKind::Amd17 => Box::new(Amd17Cpu::new(processor_index, cores, config, ring0, env, settings)?),
        DecoderKind::Generic => Box::new(GenericCpu::new(processor_index, cores, config, ring0, env, settings)?),
    };
    Ok(hardware)
}

/// Every processor package, each behind the decoder its signature selects.
pub struct CpuGroup {
    hardware: Vec<Box<dyn Hardware>>,
    topology: Topology,
}

impl CpuGroup {
    pub fn new(ring0: Arc<Ring0>, source: &dyn CpuidSource, env: &CpuEnvironment, settings: SharedSettings) -> Self {
        let topology = discover(source);
        let mut hardware = Vec::with_capacity(topology.len());

        for (index, cores) in topology.iter().enumerate() {
            let Some(first) = cores.first().and_then(|c| c.first()) else {
                continue;
            };
            let config = table::select(first.vendor(), first.family(), first.model(), first.stepping());
            if !config.is_known() {
                debug!(
                    processor = index,
                    family = first.family(),
                    model = first.model(),
                    "Unknown microarchitecture, decoding generically where possible"
                );
            }
            match build(config.decoder, index, cores.clone(), config, ring0.clone(), env, settings.clone()) {
                Ok(h) => {
                    info!(processor = index, name = h.name(), decoder = ?config.decoder, "Processor added");
                    hardware.push(h);
                }
                Err(e) => warn!(processor = index, error = %e, "Skipping processor"),
            }
        }

        Self { hardware, topology }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }
}

fn append_leaves(r: &mut String, base: u32, leaves: &[cpuid::Leaf]) {
    for (i, leaf) in leaves.iter().enumerate() {
        let _ = writeln!(
            r,
            " {:08X}  {:08X}  {:08X}  {:08X}  {:08X}",
            base + i as u32,
            leaf[0],
            leaf[1],
            leaf[2],
            leaf[3]
        );
    }
}

impl Group for CpuGroup {
    fn hardware(&self) -> &[Box<dyn Hardware>] {
        &self.hardware
    }

    fn hardware_mut(&mut self) -> &mut [Box<dyn Hardware>] {
        &mut self.hardware
    }

    fn report(&self) -> String {
        if self.topology.is_empty() {
            return String::new();
        }
        let mut r = String::new();
        let _ = writeln!(r, "CPUID");
        let _ = writeln!(r);
        for (i, cores) in self.topology.iter().enumerate() {
            let Some(first) = cores.first().and_then(|c| c.first()) else {
                continue;
            };
            let _ = writeln!(r, "Processor {}", i);
            let _ = writeln!(r);
            let _ = writeln!(r, "Processor Vendor: {}", first.vendor());
            let _ = writeln!(r, "Processor Brand: {}", first.brand());
            let _ = writeln!(r, "Family: 0x{:X}", first.family());
            let _ = writeln!(r, "Model: 0x{:X}", first.model());
            let _ = writeln!(r, "Stepping: 0x{:X}", first.stepping());
            let _ = writeln!(r);
            let _ = writeln!(r, "CPUID Return Values");
            let _ = writeln!(r);
            for thread in cores.iter().flatten() {
                let _ = writeln!(r, " CPU Thread: {}", thread.thread());
                let _ = writeln!(r, " APIC ID: {}", thread.apic_id());
                let _ = writeln!(r, " Processor ID: {}", thread.processor_id());
                let _ = writeln!(r, " Core ID: {}", thread.core_id());
                let _ = writeln!(r, " Thread ID: {}", thread.thread_id());
                let _ = writeln!(r);
                let _ = writeln!(r, " Function  EAX       EBX       ECX       EDX");
                append_leaves(&mut r, cpuid::CPUID_STD, thread.leaves());
                append_leaves(&mut r, cpuid::CPUID_EXT, thread.ext_leaves());
                let _ = writeln!(r);
            }
        }
        r
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Simulated package for decoder tests.

    use std::sync::atomic::{AtomicI64, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::clock::SteppingClock;
    use crate::ring0::SimulatedMachine;
    use crate::settings::MemorySettings;

    /// Every read adds one second of wall time at 50% load on each CPU.
    pub struct HalfBusy {
        cpus: usize,
        reads: AtomicI64,
    }

    impl HalfBusy {
        pub fn new(cpus: usize) -> Self {
            Self {
                cpus,
                reads: AtomicI64::new(0),
            }
        }
    }

    impl ProcessorTimes for HalfBusy {
        fn read(&self) -> Option<CpuTimes> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            Some(vec![Some((n * 5_000_000, n * 10_000_000)); self.cpus])
        }
    }

    pub struct Bench {
        pub machine: SimulatedMachine,
        pub ring0: Arc<Ring0>,
        pub env: CpuEnvironment,
        pub settings: SharedSettings,
        pub clock: Arc<SteppingClock>,
        pub threads: Vec<CpuId>,
        _dir: TempDir,
    }

    impl Bench {
        pub fn new(leaves: &LeafBuilder) -> Self {
            Self::at_mhz(leaves, 3300)
        }

        pub fn at_mhz(leaves: &LeafBuilder, mhz: u64) -> Self {
            let threads = leaves.build();
            Self::with_machine(SimulatedMachine::new(threads.len()), threads, mhz)
        }

        /// A machine whose mediator can never be installed.
        pub fn unavailable(leaves: &LeafBuilder) -> Self {
            let threads = leaves.build();
            Self::with_machine(SimulatedMachine::uninstalled(threads.len()), threads, 3300)
        }

        fn with_machine(machine: SimulatedMachine, threads: Vec<CpuId>, mhz: u64) -> Self {
            let dir = TempDir::new().unwrap();
            let ring0 = Ring0::simulated(&machine)
                .with_bus_lock_path(dir.path().join("bus.lock"))
                .with_reinstall_delay(Duration::ZERO);
            ring0.open();
            let clock = Arc::new(SteppingClock::at_mhz(mhz));
            let env = CpuEnvironment {
                time: clock.clone(),
                counter: clock.clone(),
                times: Some(Arc::new(HalfBusy::new(threads.len()))),
                core_read_delay: Duration::ZERO,
                hwmon_base: dir.path().join("hwmon"),
            };
            Self {
                machine,
                ring0: Arc::new(ring0),
                env,
                settings: MemorySettings::shared(),
                clock,
                threads,
                _dir: dir,
            }
        }

        pub fn package(&self, index: usize) -> Vec<Vec<CpuId>> {
            discover(&StaticCpuid::new(self.threads.clone())).swap_remove(index)
        }

        pub fn generic(&self) -> GenericCpu {
            let cores = self.package(0);
            let first = &cores[0][0];
            let config = table::select(first.vendor(), first.family(), first.model(), first.stepping());
            GenericCpu::new(0, cores, config, self.ring0.clone(), &self.env, self.settings.clone()).unwrap()
        }
    }
}
