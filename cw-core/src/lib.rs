//! Corewatch Core Library
//!
//! Live CPU telemetry for x86 systems: temperatures, clocks, voltages,
//! power and load, decoded from model-specific and PCI registers.
//!
//! # Module Structure
//!
//! - `ring0/` - privileged register session, mediators, bus lock, simulator
//! - `cpu/` - CPUID topology, microarchitecture table and vendor decoders
//! - `hardware`, `sensor` - the hardware tree and its sensors
//! - `computer` - root of the tree, owns the session
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cw_core::{Computer, MemorySettings, Ring0};
//!
//! let mut computer = Computer::new(Arc::new(Ring0::native()), MemorySettings::shared());
//! computer.open();
//! computer.update();
//! for hardware in computer.hardware() {
//!     for sensor in hardware.core().sensors() {
//!         println!("{} {:?}", sensor.name(), sensor.value());
//!     }
//! }
//! computer.close();
//! ```

// Grouped modules
pub mod cpu;
pub mod ring0;

// Standalone modules
pub mod affinity;
pub mod clock;
pub mod computer;
pub mod constants;
pub mod error;
pub mod hardware;
pub mod identifier;
pub mod sensor;
pub mod settings;

pub use affinity::{AffinityControl, AffinityGuard, SavedAffinity, ThreadAffinity};
pub use clock::{ClockCalibrator, CycleCounter, MonotonicClock, SteppingClock, TimeSource, Tsc};
pub use computer::Computer;
pub use cpu::{CpuEnvironment, CpuGroup, LeafBuilder, StaticCpuid, Vendor};
pub use error::{CorewatchError, Result};
pub use hardware::{Group, Hardware, HardwareCore, HardwareType, SensorHandle, Visitor};
pub use identifier::Identifier;
pub use ring0::{Ring0, SimulatedMachine};
pub use sensor::{Parameter, ParameterDescription, Sensor, SensorReading, SensorType};
pub use settings::{JsonFileSettings, MemorySettings, Settings, SharedSettings};
