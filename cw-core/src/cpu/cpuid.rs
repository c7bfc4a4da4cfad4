//! CPUID leaves and processor topology
//!
//! Each logical CPU is identified by executing `cpuid` while pinned to it.
//! The APIC id splits into package, core and thread fields whose widths
//! come from vendor specific leaves.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, trace};

use crate::affinity::{thread_mask, AffinityControl, AffinityGuard};
use crate::constants::ring0::MAX_THREADS;

pub const CPUID_STD: u32 = 0;
pub const CPUID_EXT: u32 = 0x8000_0000;

/// Highest leaf kept per range.
const MAX_LEAF: u32 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Intel,
    Amd,
    Unknown,
}

impl Vendor {
    fn from_signature(signature: &str) -> Self {
        match signature {
            "GenuineIntel" => Vendor::Intel,
            "AuthenticAMD" => Vendor::Amd,
            _ => Vendor::Unknown,
        }
    }

    /// Identifier token for CPUs of this vendor.
    pub fn token(self) -> &'static str {
        match self {
            Vendor::Intel => "intelcpu",
            Vendor::Amd => "amdcpu",
            Vendor::Unknown => "genericcpu",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vendor::Intel => write!(f, "Intel"),
            Vendor::Amd => write!(f, "AMD"),
            Vendor::Unknown => write!(f, "Unknown"),
        }
    }
}

/// eax, ebx, ecx, edx
pub type Leaf = [u32; 4];

const EAX: usize = 0;
const EBX: usize = 1;
const ECX: usize = 2;
const EDX: usize = 3;

/// Decoded CPUID data of one logical CPU.
#[derive(Debug, Clone)]
pub struct CpuId {
    thread: usize,
    vendor: Vendor,
    brand: String,
    name: String,
    data: Vec<Leaf>,
    ext: Vec<Leaf>,
    family: u32,
    model: u32,
    stepping: u32,
    apic_id: u32,
    processor_id: u32,
    core_id: u32,
    thread_id: u32,
}

fn register_chars(value: u32, out: &mut Vec<u8>) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn next_log2(x: i64) -> u32 {
    if x <= 0 {
        return 0;
    }
    let mut x = x - 1;
    let mut count = 0;
    while x > 0 {
        x >>= 1;
        count += 1;
    }
    count
}

/// Strip marketing noise from a brand string.
pub fn clean_name(brand: &str) -> String {
    let noise = Regex::new(
        r"\(R\)|\(TM\)|\(tm\)|(Dual|Triple|Quad|Six|Eight|12|16|24|32|64)-Core Processor|with Radeon .*Graphics|CPU|Processor",
    );
    let mut name = match noise {
        Ok(re) => re.replace_all(brand, " ").into_owned(),
        Err(_) => brand.to_string(),
    };
    if let Some(at) = name.rfind('@') {
        name.truncate(at);
    }
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl CpuId {
    /// Decode the raw leaves read on `thread`.
    ///
    /// `data[0]` and `ext[0]` are the range headers. Missing leaves read as zero.
    pub fn from_leaves(thread: usize, data: Vec<Leaf>, ext: Vec<Leaf>) -> Self {
        let leaf = |v: &Vec<Leaf>, i: usize| v.get(i).copied().unwrap_or_default();

        let l0 = leaf(&data, 0);
        let mut signature = Vec::with_capacity(12);
        register_chars(l0[EBX], &mut signature);
        register_chars(l0[EDX], &mut signature);
        register_chars(l0[ECX], &mut signature);
        let vendor = Vendor::from_signature(&String::from_utf8_lossy(&signature));

        let mut brand_bytes = Vec::with_capacity(48);
        for i in 2..=4 {
            for reg in leaf(&ext, i) {
                register_chars(reg, &mut brand_bytes);
            }
        }
        let brand = String::from_utf8_lossy(&brand_bytes)
            .replace('\0', " ")
            .trim()
            .to_string();
        let name = clean_name(&brand);

        let l1 = leaf(&data, 1);
        let family = ((l1[EAX] & 0x0FF0_0000) >> 20) + ((l1[EAX] & 0x0F00) >> 8);
        let model = ((l1[EAX] & 0x000F_0000) >> 12) + ((l1[EAX] & 0xF0) >> 4);
        let stepping = l1[EAX] & 0x0F;
        let apic_id = (l1[EBX] >> 24) & 0xFF;

        let max_std = data.len().saturating_sub(1);
        let max_ext = ext.len().saturating_sub(1);

        let (thread_width, core_width) = match vendor {
            Vendor::Intel => {
                let logical_per_package = ((l1[EBX] >> 16) & 0xFF) as i64;
                let cores_per_package = if max_std >= 4 {
                    (((leaf(&data, 4)[EAX] >> 26) & 0x3F) + 1) as i64
                } else {
                    1
                };
                (
                    next_log2(logical_per_package / cores_per_package),
                    next_log2(cores_per_package),
                )
            }
            Vendor::Amd => {
                let e8 = leaf(&ext, 8);
                let cores_per_package = if max_ext >= 8 { (e8[ECX] & 0xFF) + 1 } else { 1 };
                let mut core_width = next_log2(cores_per_package as i64);
                if family == 0x17 {
                    match (e8[ECX] >> 12) & 0xF {
                        0x4 => core_width = next_log2(16),
                        0x5 => core_width = next_log2(32),
                        0x6 => core_width = next_log2(64),
                        _ => {}
                    }
                }
                (0, core_width)
            }
            Vendor::Unknown => (0, 0),
        };

        let processor_id = apic_id >> (core_width + thread_width);
        let core_id = (apic_id >> thread_width) - (processor_id << core_width);
        let thread_id =
            apic_id - (processor_id << (core_width + thread_width)) - (core_id << thread_width);

        Self {
            thread,
            vendor,
            brand,
            name,
            data,
            ext,
            family,
            model,
            stepping,
            apic_id,
            processor_id,
            core_id,
            thread_id,
        }
    }

    pub fn thread(&self) -> usize {
        self.thread
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    pub fn brand(&self) -> &str {
        &self.brand
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    pub fn model(&self) -> u32 {
        self.model
    }

    pub fn stepping(&self) -> u32 {
        self.stepping
    }

    pub fn apic_id(&self) -> u32 {
        self.apic_id
    }

    pub fn processor_id(&self) -> u32 {
        self.processor_id
    }

    pub fn core_id(&self) -> u32 {
        self.core_id
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Standard leaf `index`, if the processor reports it.
    pub fn leaf(&self, index: usize) -> Option<Leaf> {
        self.data.get(index).copied()
    }

    /// Extended leaf `0x80000000 + index`, if reported.
    pub fn ext_leaf(&self, index: usize) -> Option<Leaf> {
        self.ext.get(index).copied()
    }

    pub fn leaves(&self) -> &[Leaf] {
        &self.data
    }

    pub fn ext_leaves(&self) -> &[Leaf] {
        &self.ext
    }

    pub fn has_msr(&self) -> bool {
        self.leaf(1).is_some_and(|l| l[EDX] & 0x20 != 0)
    }

    pub fn has_tsc(&self) -> bool {
        self.leaf(1).is_some_and(|l| l[EDX] & 0x10 != 0)
    }

    pub fn has_invariant_tsc(&self) -> bool {
        self.ext_leaf(7).is_some_and(|l| l[EDX] & 0x100 != 0)
    }

    /// Core performance boost (AMD).
    pub fn has_core_boost(&self) -> bool {
        self.ext_leaf(7).is_some_and(|l| l[EDX] & 0x200 != 0)
    }

    /// Legacy AMD thermal diode, ext leaf 7 edx bit 0.
    pub fn has_amd_thermal_sensor(&self) -> bool {
        self.ext_leaf(7).is_some_and(|l| l[EDX] & 0x1 != 0)
    }

    pub fn has_core_thermal_sensor(&self) -> bool {
        self.leaf(6).is_some_and(|l| l[EAX] & 0x1 != 0)
    }

    pub fn has_package_thermal_sensor(&self) -> bool {
        self.leaf(6).is_some_and(|l| l[EAX] & 0x40 != 0)
    }

    /// Core id and NUMA node id from ext leaf 0x1E (AMD 17h+).
    pub fn amd_topology(&self) -> Option<(u32, u32)> {
        self.ext_leaf(0x1E).map(|l| (l[EBX] & 0xFF, l[ECX] & 0xFF))
    }
}

// ============================================================================
// Sources
// ============================================================================

/// Reads the CPUID leaves of one logical CPU.
pub trait CpuidSource: Send + Sync {
    /// Logical CPU numbers to read, `0..thread_count()`.
    fn thread_count(&self) -> usize;

    /// `None` when `thread` is offline or cannot be reached.
    fn read(&self, thread: usize) -> Option<CpuId>;
}

/// Executes `cpuid` pinned to each thread.
pub struct NativeCpuid {
    affinity: Arc<dyn AffinityControl>,
}

impl NativeCpuid {
    pub fn new(affinity: Arc<dyn AffinityControl>) -> Self {
        Self { affinity }
    }
}

#[cfg(target_arch = "x86_64")]
fn cpuid(leaf: u32) -> Leaf {
    // SAFETY: cpuid is available on every x86_64 processor.
    let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, 0) };
    [r.eax, r.ebx, r.ecx, r.edx]
}

/// CPUs configured in the system, online or not.
fn configured_cpus() -> usize {
    // SAFETY: sysconf has no preconditions.
    let configured = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    match usize::try_from(configured) {
        Ok(n) if n > 0 => n.min(MAX_THREADS),
        _ => MAX_THREADS,
    }
}

impl CpuidSource for NativeCpuid {
    fn thread_count(&self) -> usize {
        configured_cpus()
    }

    #[cfg(target_arch = "x86_64")]
    fn read(&self, thread: usize) -> Option<CpuId> {
        let mask = thread_mask(thread).ok()?;
        let _guard = match AffinityGuard::pin(self.affinity.as_ref(), mask) {
            Ok(g) => g,
            Err(e) => {
                trace!(thread, error = %e, "Thread cannot be pinned");
                return None;
            }
        };

        let header = cpuid(CPUID_STD);
        if header[EAX] == 0 {
            return None;
        }
        let max_std = header[EAX].min(MAX_LEAF);
        let data: Vec<Leaf> = (0..=max_std).map(|i| cpuid(CPUID_STD + i)).collect();

        let ext_header = cpuid(CPUID_EXT);
        let ext: Vec<Leaf> = if ext_header[EAX] > CPUID_EXT {
            let max_ext = (ext_header[EAX] - CPUID_EXT).min(MAX_LEAF);
            (0..=max_ext).map(|i| cpuid(CPUID_EXT + i)).collect()
        } else {
            Vec::new()
        };

        Some(CpuId::from_leaves(thread, data, ext))
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn read(&self, _thread: usize) -> Option<CpuId> {
        None
    }
}

/// Fixed per-thread CPUID tables, looked up by thread number.
#[derive(Debug, Clone, Default)]
pub struct StaticCpuid {
    threads: Vec<CpuId>,
}

impl StaticCpuid {
    pub fn new(threads: Vec<CpuId>) -> Self {
        Self { threads }
    }
}

impl CpuidSource for StaticCpuid {
    fn thread_count(&self) -> usize {
        self.threads.iter().map(|t| t.thread() + 1).max().unwrap_or(0)
    }

    fn read(&self, thread: usize) -> Option<CpuId> {
        self.threads.iter().find(|t| t.thread() == thread).cloned()
    }
}

/// Threads grouped by package, then by core. Both levels are ordered by id.
pub type Topology = Vec<Vec<Vec<CpuId>>>;

pub fn discover(source: &dyn CpuidSource) -> Topology {
    let mut packages: BTreeMap<u32, BTreeMap<u32, Vec<CpuId>>> = BTreeMap::new();
    let mut skipped = 0;
    for thread in 0..source.thread_count().min(MAX_THREADS) {
        let Some(id) = source.read(thread) else {
            skipped += 1;
            continue;
        };
        packages
            .entry(id.processor_id())
            .or_default()
            .entry(id.core_id())
            .or_default()
            .push(id);
    }

    let topology: Topology = packages
        .into_values()
        .map(|cores| cores.into_values().collect())
        .collect();
    debug!(
        packages = topology.len(),
        threads = topology.iter().flatten().flatten().count(),
        skipped,
        "Discovered processor topology"
    );
    topology
}

// ============================================================================
// Synthetic leaves
// ============================================================================

/// Builds raw leaves for a described processor; used by the simulator.
#[derive(Debug, Clone)]
pub struct LeafBuilder {
    vendor: Vendor,
    brand: String,
    family: u32,
    model: u32,
    stepping: u32,
    threads_per_core: u32,
    cores_per_package: u32,
    thermal: u32,
    invariant_tsc: bool,
    core_boost: bool,
    amd_thermal: bool,
    amd_core_id_size: u32,
    topology_leaf: bool,
}

impl LeafBuilder {
    pub fn new(vendor: Vendor, brand: impl Into<String>, family: u32, model: u32, stepping: u32) -> Self {
        Self {
            vendor,
            brand: brand.into(),
            family,
            model,
            stepping,
            threads_per_core: 1,
            cores_per_package: 1,
            thermal: 0,
            invariant_tsc: false,
            core_boost: false,
            amd_thermal: false,
            amd_core_id_size: 0,
            topology_leaf: false,
        }
    }

    pub fn cores(mut self, cores_per_package: u32, threads_per_core: u32) -> Self {
        self.cores_per_package = cores_per_package.max(1);
        self.threads_per_core = threads_per_core.max(1);
        self
    }

    /// Leaf 6 eax: bit 0 core sensor, bit 6 package sensor.
    pub fn thermal(mut self, core: bool, package: bool) -> Self {
        self.thermal = (core as u32) | ((package as u32) << 6);
        self
    }

    pub fn invariant_tsc(mut self, on: bool) -> Self {
        self.invariant_tsc = on;
        self
    }

    pub fn core_boost(mut self, on: bool) -> Self {
        self.core_boost = on;
        self
    }

    pub fn amd_thermal(mut self, on: bool) -> Self {
        self.amd_thermal = on;
        self
    }

    /// Ext leaf 8 ecx[15:12] and ext leaf 0x1E.
    pub fn zen_topology(mut self, core_id_size: u32) -> Self {
        self.amd_core_id_size = core_id_size;
        self.topology_leaf = true;
        self
    }

    fn signature(&self) -> u32 {
        let (base_family, ext_family) = if self.family > 0xF {
            (0xF, self.family - 0xF)
        } else {
            (self.family, 0)
        };
        (ext_family << 20)
            | ((self.model >> 4) << 16)
            | (base_family << 8)
            | ((self.model & 0xF) << 4)
            | (self.stepping & 0xF)
    }

    fn apic_id(&self, core: u32, thread: u32) -> u32 {
        match self.vendor {
            Vendor::Intel => {
                let tw = next_log2(self.threads_per_core as i64);
                (core << tw) | thread
            }
            // AMD counts SMT siblings as cores of their own
            _ => core * self.threads_per_core + thread,
        }
    }

    /// The thread list of one package, core-major.
    pub fn build(&self) -> Vec<CpuId> {
        let vendor = match self.vendor {
            Vendor::Intel => *b"GenuineIntel",
            Vendor::Amd => *b"AuthenticAMD",
            Vendor::Unknown => *b"VirtualCPU  ",
        };
        let word = |i: usize| u32::from_le_bytes([vendor[i], vendor[i + 1], vendor[i + 2], vendor[i + 3]]);

        let mut brand = [0u8; 48];
        for (i, b) in self.brand.bytes().take(47).enumerate() {
            brand[i] = b;
        }
        let brand_leaf = |n: usize| -> Leaf {
            let mut leaf = [0u32; 4];
            for (r, reg) in leaf.iter_mut().enumerate() {
                let at = n * 16 + r * 4;
                *reg = u32::from_le_bytes([brand[at], brand[at + 1], brand[at + 2], brand[at + 3]]);
            }
            leaf
        };

        let threads = self.threads_per_core;
        let mut out = Vec::new();
        for core in 0..self.cores_per_package {
            for t in 0..threads {
                let apic = self.apic_id(core, t);
                let mut data = vec![[0u32; 4]; 7];
                data[0] = [6, word(0), word(8), word(4)];
                data[1] = [
                    self.signature(),
                    (apic << 24) | ((self.cores_per_package * threads) << 16),
                    0,
                    0x30,
                ];
                data[4] = [(self.cores_per_package - 1) << 26, 0, 0, 0];
                data[6] = [self.thermal, 0, 0, 0];

                let mut ext = vec![[0u32; 4]; 0x1F];
                ext[0] = [CPUID_EXT + 0x1E, 0, 0, 0];
                ext[2] = brand_leaf(0);
                ext[3] = brand_leaf(1);
                ext[4] = brand_leaf(2);
                ext[7][EDX] = ((self.invariant_tsc as u32) << 8)
                    | ((self.core_boost as u32) << 9)
                    | (self.amd_thermal as u32);
                if self.vendor == Vendor::Amd {
                    ext[8][ECX] = (self.cores_per_package * threads - 1) | (self.amd_core_id_size << 12);
                }
                if self.topology_leaf {
                    ext[0x1E] = [apic, core | ((threads - 1) << 8), 0, 0];
                }
                if !self.topology_leaf {
                    ext.truncate(9);
                    ext[0][EAX] = CPUID_EXT + 8;
                }
                out.push((data, ext));
            }
        }
        out.into_iter()
            .enumerate()
            .map(|(thread, (data, ext))| CpuId::from_leaves(thread, data, ext))
            .collect()
    }
}
