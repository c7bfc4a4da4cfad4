//! Decoder selection
//!
//! One flat table maps `(vendor, family, model, stepping)` to the decoder
//! and its defaults. The first matching row wins, so specific rows come
//! before catch-alls.

use std::fmt;

use super::cpuid::Vendor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroArchitecture {
    Unknown,
    NetBurst,
    Core,
    Atom,
    Nehalem,
    SandyBridge,
    IvyBridge,
    Haswell,
    Broadwell,
    Silvermont,
    Skylake,
    Airmont,
    KabyLake,
    ApolloLake,
    CoffeeLake,
    K8,
    K10,
    Zen,
}

impl fmt::Display for MicroArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderKind {
    Generic,
    Intel,
    Amd0F,
    Amd10,
    Amd17,
}

/// Where the junction temperature limit comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TjMax {
    Fixed(f32),
    /// Core 2 B2 stepping: depends on the number of cores.
    ByCoreCount { dual: f32, quad: f32, other: f32 },
    /// IA32_TEMPERATURE_TARGET bits 23:16, per core.
    Msr,
}

impl TjMax {
    pub fn fixed_for(&self, core_count: usize) -> Option<f32> {
        match *self {
            TjMax::Fixed(t) => Some(t),
            TjMax::ByCoreCount { dual, quad, other } => Some(match core_count {
                2 => dual,
                4 => quad,
                _ => other,
            }),
            TjMax::Msr => None,
        }
    }
}

/// How the TSC reference multiplier is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TscMultiplier {
    None,
    /// IA32_PERF_STATUS edx: bits 12:8 plus half bit 14
    PerfStatus,
    /// MSR_PLATFORM_INFO eax bits 15:8
    PlatformInfo,
}

/// Current multiplier field of IA32_PERF_STATUS eax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfStatusLayout {
    /// bits 7:0
    LowByte,
    /// bits 15:8
    SecondByte,
    /// bits 12:8 plus half bit 14
    FidHalf,
}

/// Energy status unit encoding of MSR_RAPL_POWER_UNIT bits 12:8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaplUnit {
    None,
    /// 1 / 2^ESU joules
    Standard,
    /// 2^ESU microjoules
    Atom,
}

impl RaplUnit {
    pub fn joules(self, esu: u32) -> f64 {
        let esu = esu & 0x1F;
        match self {
            RaplUnit::None => 0.0,
            RaplUnit::Standard => 1.0 / (1u64 << esu) as f64,
            RaplUnit::Atom => 1e-6 * (1u64 << esu) as f64,
        }
    }
}

impl MicroArchitecture {
    pub fn tsc_multiplier(self) -> TscMultiplier {
        use MicroArchitecture::*;
        match self {
            NetBurst | Atom | Core => TscMultiplier::PerfStatus,
            Nehalem | SandyBridge | IvyBridge | Haswell | Broadwell | Silvermont | Skylake
            | Airmont | ApolloLake | KabyLake | CoffeeLake => TscMultiplier::PlatformInfo,
            _ => TscMultiplier::None,
        }
    }

    pub fn perf_status_layout(self) -> PerfStatusLayout {
        use MicroArchitecture::*;
        match self {
            Nehalem => PerfStatusLayout::LowByte,
            SandyBridge | IvyBridge | Haswell | Broadwell | Silvermont | Skylake | ApolloLake
            | KabyLake | CoffeeLake => PerfStatusLayout::SecondByte,
            _ => PerfStatusLayout::FidHalf,
        }
    }

    pub fn rapl(self) -> RaplUnit {
        use MicroArchitecture::*;
        match self {
            SandyBridge | IvyBridge | Haswell | Broadwell | Skylake | KabyLake | ApolloLake => {
                RaplUnit::Standard
            }
            Silvermont | Airmont => RaplUnit::Atom,
            _ => RaplUnit::None,
        }
    }
}

/// Everything a decoder needs to know about its silicon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuConfig {
    pub decoder: DecoderKind,
    pub arch: MicroArchitecture,
    pub tjmax: TjMax,
    /// Default of the temperature offset parameter, °C
    pub temperature_offset: f32,
}

impl CpuConfig {
    pub fn tsc_multiplier(&self) -> TscMultiplier {
        self.arch.tsc_multiplier()
    }

    pub fn perf_status_layout(&self) -> PerfStatusLayout {
        self.arch.perf_status_layout()
    }

    pub fn rapl(&self) -> RaplUnit {
        self.arch.rapl()
    }

    pub fn is_known(&self) -> bool {
        self.arch != MicroArchitecture::Unknown
    }
}

enum Models {
    Any,
    Only(&'static [u32]),
    /// This model and above
    From(u32),
}

impl Models {
    fn contains(&self, model: u32) -> bool {
        match self {
            Models::Any => true,
            Models::Only(list) => list.contains(&model),
            Models::From(first) => model >= *first,
        }
    }
}

struct Row {
    vendor: Vendor,
    families: (u32, u32),
    models: Models,
    /// Inclusive range.
    steppings: (u32, u32),
    config: CpuConfig,
}

const ANY_STEPPING: (u32, u32) = (0, 0xF);

const fn intel(models: &'static [u32], steppings: (u32, u32), arch: MicroArchitecture, tjmax: TjMax) -> Row {
    Row {
        vendor: Vendor::Intel,
        families: (0x06, 0x06),
        models: Models::Only(models),
        steppings,
        config: CpuConfig {
            decoder: DecoderKind::Intel,
            arch,
            tjmax,
            temperature_offset: 0.0,
        },
    }
}

const fn amd(families: (u32, u32), models: Models, decoder: DecoderKind, arch: MicroArchitecture, offset: f32) -> Row {
    Row {
        vendor: Vendor::Amd,
        families,
        models,
        steppings: ANY_STEPPING,
        config: CpuConfig {
            decoder,
            arch,
            tjmax: TjMax::Fixed(100.0),
            temperature_offset: offset,
        },
    }
}

use MicroArchitecture as M;

/// AM2+ 65 nm parts read 21 °C high; these models are the exceptions.
const K8_NO_SHIFT: &[u32] = &[0x6C, 0x7C, 0xC1];

static TABLE: &[Row] = &[
    // Core 2, 65 nm
    intel(&[0x0F], (0x06, 0x06), M::Core, TjMax::ByCoreCount { dual: 90.0, quad: 100.0, other: 95.0 }),
    intel(&[0x0F], (0x0B, 0x0B), M::Core, TjMax::Fixed(100.0)),
    intel(&[0x0F], (0x0D, 0x0D), M::Core, TjMax::Fixed(95.0)),
    intel(&[0x0F], ANY_STEPPING, M::Core, TjMax::Fixed(95.0)),
    // Core 2, 45 nm
    intel(&[0x17], ANY_STEPPING, M::Core, TjMax::Fixed(100.0)),
    // Atom, 45 nm
    intel(&[0x1C], (0x02, 0x02), M::Atom, TjMax::Fixed(90.0)),
    intel(&[0x1C], (0x0A, 0x0A), M::Atom, TjMax::Fixed(100.0)),
    intel(&[0x1C], ANY_STEPPING, M::Atom, TjMax::Fixed(90.0)),
    intel(&[0x1A, 0x1E, 0x1F, 0x25, 0x2C, 0x2E, 0x2F], ANY_STEPPING, M::Nehalem, TjMax::Msr),
    intel(&[0x2A, 0x2D], ANY_STEPPING, M::SandyBridge, TjMax::Msr),
    intel(&[0x3A, 0x3E], ANY_STEPPING, M::IvyBridge, TjMax::Msr),
    intel(&[0x3C, 0x3F, 0x45, 0x46], ANY_STEPPING, M::Haswell, TjMax::Msr),
    intel(&[0x3D, 0x47, 0x4F, 0x56], ANY_STEPPING, M::Broadwell, TjMax::Msr),
    intel(&[0x36], ANY_STEPPING, M::Atom, TjMax::Msr),
    intel(&[0x37, 0x4A, 0x4D, 0x5A, 0x5D], ANY_STEPPING, M::Silvermont, TjMax::Msr),
    intel(&[0x4E, 0x5E, 0x55], ANY_STEPPING, M::Skylake, TjMax::Msr),
    intel(&[0x4C], ANY_STEPPING, M::Airmont, TjMax::Msr),
    intel(&[0x8E, 0x9E], ANY_STEPPING, M::KabyLake, TjMax::Msr),
    intel(&[0x5C], ANY_STEPPING, M::ApolloLake, TjMax::Msr),
    intel(&[0xAE], ANY_STEPPING, M::CoffeeLake, TjMax::Msr),
    // NetBurst
    Row {
        vendor: Vendor::Intel,
        families: (0x0F, 0x0F),
        models: Models::Only(&[0x00, 0x01, 0x02, 0x03, 0x04, 0x06]),
        steppings: ANY_STEPPING,
        config: CpuConfig {
            decoder: DecoderKind::Intel,
            arch: M::NetBurst,
            tjmax: TjMax::Fixed(100.0),
            temperature_offset: 0.0,
        },
    },
    // Any other Intel part
    Row {
        vendor: Vendor::Intel,
        families: (0, u32::MAX),
        models: Models::Any,
        steppings: ANY_STEPPING,
        config: CpuConfig {
            decoder: DecoderKind::Intel,
            arch: M::Unknown,
            tjmax: TjMax::Fixed(100.0),
            temperature_offset: 0.0,
        },
    },
    amd((0x0F, 0x0F), Models::Only(K8_NO_SHIFT), DecoderKind::Amd0F, M::K8, -49.0),
    amd((0x0F, 0x0F), Models::From(0x69), DecoderKind::Amd0F, M::K8, -28.0),
    amd((0x0F, 0x0F), Models::Any, DecoderKind::Amd0F, M::K8, -49.0),
    amd((0x10, 0x12), Models::Any, DecoderKind::Amd10, M::K10, 0.0),
    amd((0x14, 0x16), Models::Any, DecoderKind::Amd10, M::K10, 0.0),
    amd((0x17, 0x17), Models::Any, DecoderKind::Amd17, M::Zen, 0.0),
];

const GENERIC: CpuConfig = CpuConfig {
    decoder: DecoderKind::Generic,
    arch: M::Unknown,
    tjmax: TjMax::Fixed(100.0),
    temperature_offset: 0.0,
};

/// Resolve the decoder configuration for a processor.
pub fn select(vendor: Vendor, family: u32, model: u32, stepping: u32) -> CpuConfig {
    TABLE
        .iter()
        .find(|row| {
            row.vendor == vendor
                && (row.families.0..=row.families.1).contains(&family)
                && row.models.contains(model)
                && (row.steppings.0..=row.steppings.1).contains(&stepping)
        })
        .map(|row| row.config)
        .unwrap_or(GENERIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core2_b2_by_core_count() {
        let c = select(Vendor::Intel, 6, 0x0F, 0x06);
        assert_eq!(c.arch, M::Core);
        assert_eq!(c.tjmax.fixed_for(2), Some(90.0));
        assert_eq!(c.tjmax.fixed_for(4), Some(100.0));
        assert_eq!(c.tjmax.fixed_for(1), Some(95.0));
        assert_eq!(select(Vendor::Intel, 6, 0x0F, 0x0B).tjmax, TjMax::Fixed(100.0));
        assert_eq!(select(Vendor::Intel, 6, 0x0F, 0x02).tjmax, TjMax::Fixed(95.0));
    }

    #[test]
    fn test_atom_steppings() {
        assert_eq!(select(Vendor::Intel, 6, 0x1C, 0x02).tjmax, TjMax::Fixed(90.0));
        assert_eq!(select(Vendor::Intel, 6, 0x1C, 0x0A).tjmax, TjMax::Fixed(100.0));
        assert_eq!(select(Vendor::Intel, 6, 0x1C, 0x05).tjmax, TjMax::Fixed(90.0));
    }

    #[test]
    fn test_modern_intel_reads_msr() {
        let c = select(Vendor::Intel, 6, 0x9E, 10);
        assert_eq!(c.arch, M::KabyLake);
        assert_eq!(c.tjmax, TjMax::Msr);
        assert_eq!(c.tsc_multiplier(), TscMultiplier::PlatformInfo);
        assert_eq!(c.perf_status_layout(), PerfStatusLayout::SecondByte);
        assert_eq!(c.rapl(), RaplUnit::Standard);
    }

    #[test]
    fn test_unknown_intel_defaults() {
        let c = select(Vendor::Intel, 6, 0xFF, 0);
        assert_eq!(c.decoder, DecoderKind::Intel);
        assert!(!c.is_known());
        assert_eq!(c.tjmax, TjMax::Fixed(100.0));
        assert_eq!(c.tsc_multiplier(), TscMultiplier::None);
        assert_eq!(c.rapl(), RaplUnit::None);
        assert_eq!(select(Vendor::Intel, 0x0F, 0x02, 0).arch, M::NetBurst);
        assert_eq!(select(Vendor::Intel, 0x0F, 0x05, 0).arch, M::Unknown);
    }

    #[test]
    fn test_amd_families() {
        assert_eq!(select(Vendor::Amd, 0x0F, 0x6B, 2).temperature_offset, -28.0);
        assert_eq!(select(Vendor::Amd, 0x0F, 0x7C, 2).temperature_offset, -49.0);
        assert_eq!(select(Vendor::Amd, 0x0F, 0x2F, 2).temperature_offset, -49.0);
        assert_eq!(select(Vendor::Amd, 0x0F, 0xC1, 2).temperature_offset, -49.0);
        assert_eq!(select(Vendor::Amd, 0x0F, 0x75, 2).temperature_offset, -28.0);
        assert_eq!(select(Vendor::Amd, 0x14, 0x00, 0).decoder, DecoderKind::Amd10);
        assert_eq!(select(Vendor::Amd, 0x13, 0x00, 0).decoder, DecoderKind::Generic);
        assert_eq!(select(Vendor::Amd, 0x17, 0x71, 0).decoder, DecoderKind::Amd17);
        assert_eq!(select(Vendor::Amd, 0x19, 0x21, 0).decoder, DecoderKind::Generic);
        assert_eq!(select(Vendor::Unknown, 6, 0, 0), GENERIC);
    }

    #[test]
    fn test_rapl_units() {
        assert!((RaplUnit::Standard.joules(16) - 1.0 / 65536.0).abs() < 1e-12);
        assert!((RaplUnit::Atom.joules(5) - 32e-6).abs() < 1e-12);
        assert_eq!(RaplUnit::None.joules(16), 0.0);
    }
}
