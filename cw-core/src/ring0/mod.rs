//! Privileged register access session
//!
//! `Ring0` is the one place register I/O goes through. It owns the mediator
//! (`Driver`), the affinity control used for per-core reads and the ISA bus
//! lock. Decoders share it as `Arc<Ring0>`.
//!
//! Every primitive degrades the same way: when the mediator is unavailable
//! the call fails and its output is zero. Nothing here panics on I/O.

pub mod bus_mutex;
pub mod driver;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod simulated;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cw_protocol::{read_u32, split_msr, validate_pci_offset, Request};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::affinity::{AffinityControl, AffinityGuard, SavedAffinity, ThreadAffinity};
use crate::constants::ring0::REINSTALL_DELAY;
use crate::error::{CorewatchError, Result};

pub use bus_mutex::BusMutex;
pub use driver::{
    BytesDriverImage, Driver, DriverImageProvider, FileDriverImage, NoDriverImage, NullDriver,
};
#[cfg(target_os = "linux")]
pub use linux::{DevFsDriver, KernelDriver};
pub use simulated::SimulatedMachine;

/// Raw MSR contents split the way the hardware reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Msr {
    pub eax: u32,
    pub edx: u32,
}

impl Msr {
    pub fn value(self) -> u64 {
        ((self.edx as u64) << 32) | self.eax as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Never opened
    Idle,
    Open,
    /// Open was attempted and no mediator could be reached
    Unavailable,
    Closed,
}

struct SessionState {
    phase: Phase,
    driver: Box<dyn Driver>,
    temp_image: Option<PathBuf>,
    report: Vec<String>,
    misuse_logged: bool,
}

pub struct Ring0 {
    state: Mutex<SessionState>,
    images: Box<dyn DriverImageProvider>,
    affinity: Arc<dyn AffinityControl>,
    bus: Mutex<Option<BusMutex>>,
    bus_lock_path: PathBuf,
    image_dir: PathBuf,
    reinstall_delay: Duration,
}

/// Packed PCI config address for bus/device/function.
pub fn get_pci_address(bus: u8, device: u8, function: u8) -> u32 {
    cw_protocol::pci_address(bus, device, function)
}

impl Ring0 {
    pub fn new(driver: Box<dyn Driver>) -> Self {
        Self {
            state: Mutex::new(SessionState {
                phase: Phase::Idle,
                driver,
                temp_image: None,
                report: Vec::new(),
                misuse_logged: false,
            }),
            images: Box::new(NoDriverImage),
            affinity: Arc::new(ThreadAffinity),
            bus: Mutex::new(None),
            bus_lock_path: bus_mutex::default_lock_path(),
            image_dir: std::env::temp_dir(),
            reinstall_delay: REINSTALL_DELAY,
        }
    }

    /// Session on the best mediator this platform offers.
    pub fn native() -> Self {
        Self::new(native_driver())
    }

    /// Session over a simulated machine, pinned through the same machine.
    pub fn simulated(machine: &SimulatedMachine) -> Self {
        Self::new(machine.driver()).with_affinity(machine.affinity())
    }

    pub fn with_driver_image(mut self, images: Box<dyn DriverImageProvider>) -> Self {
        self.images = images;
        self
    }

    pub fn with_affinity(mut self, affinity: Arc<dyn AffinityControl>) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_bus_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.bus_lock_path = path.into();
        self
    }

    /// Where an extracted driver image lives until the session closes.
    pub fn with_image_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_dir = dir.into();
        self
    }

    pub fn with_reinstall_delay(mut self, delay: Duration) -> Self {
        self.reinstall_delay = delay;
        self
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open the session. Calling it again while open does nothing.
    pub fn open(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Open {
            return;
        }
        state.report.clear();
        state.misuse_logged = false;

        if !state.driver.open() {
            self.install_and_open(&mut state);
        }

        if state.driver.is_open() {
            info!(driver = state.driver.name(), "Register session open");
            state.phase = Phase::Open;
            *self.bus.lock() = BusMutex::open(&self.bus_lock_path);
        } else {
            state.driver.delete();
            state.phase = Phase::Unavailable;
            warn!(driver = state.driver.name(), "No privileged mediator available, register sensors disabled");
        }
    }

    fn install_and_open(&self, state: &mut SessionState) {
        let Some(image) = self.images.driver_image() else {
            state.report.push("Status: No driver image available".into());
            return;
        };

        let path = temp_image_path(&self.image_dir);
        if let Err(e) = std::fs::write(&path, &image) {
            state
                .report
                .push(format!("Status: Extracting driver image failed: {}", e));
            return;
        }
        state.temp_image = Some(path.clone());

        if let Err(first) = state.driver.install(&path) {
            state.report.push(format!("Status: Installing driver failed: {}", first));
            debug!(error = %first, "Install failed, retrying once");
            state.driver.delete();
            std::thread::sleep(self.reinstall_delay);
            if let Err(second) = state.driver.install(&path) {
                state
                    .report
                    .push(format!("Status: Installing driver failed again: {}", second));
            }
        }

        if !state.driver.open() {
            state.report.push("Status: Opening driver failed after install".into());
        }

        remove_temp_image(state);
    }

    /// Close the session, uninstalling the mediator when no one else holds it.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Open {
            let mut out = [0u8; 4];
            let refcount = if state.driver.device_io_control(
                Request::GetRefCount.code(),
                &[],
                &mut out,
            ) {
                u32::from_le_bytes(out)
            } else {
                0
            };
            state.driver.close();
            if refcount <= 1 {
                state.driver.delete();
            }
            info!(refcount, "Register session closed");
        }
        remove_temp_image(&mut state);
        state.phase = Phase::Closed;
        drop(state);
        *self.bus.lock() = None;
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().phase == Phase::Open
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Session status lines for the diagnostic report.
    pub fn report(&self) -> String {
        let state = self.state.lock();
        let mut r = String::new();
        let _ = writeln!(r, "Ring0");
        let _ = writeln!(r);
        let _ = writeln!(r, "Mediator: {}", state.driver.name());
        let _ = writeln!(r, "Phase: {:?}", state.phase);
        for line in &state.report {
            let _ = writeln!(r, "{}", line);
        }
        if state.phase == Phase::Open {
            drop(state);
            let mut out = [0u8; 4];
            if self.transact(Request::GetVersion, &mut out) {
                let _ = writeln!(r, "Version: 0x{:08X}", u32::from_le_bytes(out));
            }
        }
        let _ = writeln!(r);
        r
    }

    /// Ok when primitives can reach a mediator.
    pub fn check(&self) -> Result<()> {
        match self.state.lock().phase {
            Phase::Open => Ok(()),
            Phase::Unavailable => Err(CorewatchError::unavailable("mediator could not be opened")),
            Phase::Idle | Phase::Closed => Err(CorewatchError::SessionNotOpen),
        }
    }

    // ========================================================================
    // Primitives
    // ========================================================================

    fn transact(&self, request: Request, output: &mut [u8]) -> bool {
        output.fill(0);
        if let Err(e) = request.validate() {
            debug!(request = request.type_name(), error = %e, "Invalid request");
            return false;
        }
        let mut state = self.state.lock();
        match state.phase {
            Phase::Open => {}
            Phase::Unavailable => return false,
            Phase::Idle | Phase::Closed => {
                if !state.misuse_logged {
                    warn!(request = request.type_name(), phase = ?state.phase, "Register primitive used outside an open session");
                    state.misuse_logged = true;
                }
                return false;
            }
        }
        let ok = state
            .driver
            .device_io_control(request.code(), &request.encode(), output);
        if !ok {
            output.fill(0);
            trace!(request = ?request, "Mediator call failed");
        }
        ok
    }

    /// Read an MSR on whichever CPU the caller runs on.
    pub fn read_msr(&self, index: u32) -> Option<Msr> {
        let mut out = [0u8; 8];
        if !self.transact(Request::ReadMsr { index }, &mut out) {
            return None;
        }
        split_msr(&out).map(|(eax, edx)| Msr { eax, edx })
    }

    /// Read an MSR on the CPUs in `mask`, restoring affinity afterwards.
    pub fn read_msr_on(&self, index: u32, mask: u64) -> Option<Msr> {
        let _guard = match self.pin(mask) {
            Ok(g) => g,
            Err(e) => {
                trace!(index, error = %e, "Pin for MSR read failed");
                return None;
            }
        };
        self.read_msr(index)
    }

    pub fn try_read_msr(&self, index: u32) -> Result<Msr> {
        self.check()?;
        self.read_msr(index)
            .ok_or_else(|| CorewatchError::register_read(format!("MSR 0x{:X}", index)))
    }

    pub fn write_msr(&self, index: u32, eax: u32, edx: u32) -> bool {
        let value = ((edx as u64) << 32) | eax as u64;
        self.transact(Request::WriteMsr { index, value }, &mut [])
    }

    pub fn read_io_port(&self, port: u32) -> u8 {
        let mut out = [0u8; 4];
        self.transact(Request::ReadIoPort { port }, &mut out);
        out[0]
    }

    pub fn write_io_port(&self, port: u32, value: u8) -> bool {
        self.transact(Request::WriteIoPort { port, value }, &mut [])
    }

    pub fn read_pci_config(&self, address: u32, offset: u32) -> Option<u32> {
        if offset & 3 != 0 {
            return None;
        }
        let mut out = [0u8; 4];
        if !self.transact(Request::ReadPciConfig { address, offset }, &mut out) {
            return None;
        }
        read_u32(&out)
    }

    pub fn try_read_pci_config(&self, address: u32, offset: u32) -> Result<u32> {
        if validate_pci_offset(offset).is_err() {
            return Err(CorewatchError::UnalignedAccess { offset });
        }
        self.check()?;
        self.read_pci_config(address, offset).ok_or_else(|| {
            CorewatchError::register_read(format!("PCI 0x{:X} register 0x{:X}", address, offset))
        })
    }

    pub fn write_pci_config(&self, address: u32, offset: u32, value: u32) -> bool {
        if offset & 3 != 0 {
            return false;
        }
        self.transact(Request::WritePciConfig { address, offset, value }, &mut [])
    }

    /// Read `buffer.len()` bytes of physical memory. The buffer is zeroed on failure.
    pub fn read_physical_memory(&self, address: u64, buffer: &mut [u8]) -> bool {
        let Ok(count) = u32::try_from(buffer.len()) else {
            buffer.fill(0);
            return false;
        };
        self.transact(Request::ReadMemory { address, unit_size: 1, count }, buffer)
    }

    // ========================================================================
    // Affinity and bus lock
    // ========================================================================

    /// Pin the calling thread, returning the previous affinity for `affinity().restore`.
    pub fn thread_affinity_set(&self, mask: u64) -> Result<SavedAffinity> {
        self.affinity.set(mask)
    }

    /// Scoped pin that restores the previous mask on drop.
    pub fn pin(&self, mask: u64) -> Result<AffinityGuard<'_>> {
        AffinityGuard::pin(self.affinity.as_ref(), mask)
    }

    pub fn affinity(&self) -> &dyn AffinityControl {
        self.affinity.as_ref()
    }

    /// Take the ISA bus lock. False only when another process holds it past the timeout.
    pub fn wait_bus_mutex(&self, timeout_ms: u64) -> bool {
        match self.bus.lock().as_mut() {
            Some(m) => m.wait(Duration::from_millis(timeout_ms)),
            None => true,
        }
    }

    pub fn release_bus_mutex(&self) {
        if let Some(m) = self.bus.lock().as_mut() {
            m.release();
        }
    }
}

impl Drop for Ring0 {
    fn drop(&mut self) {
        if self.state.get_mut().phase == Phase::Open {
            self.close();
        }
    }
}

fn temp_image_path(dir: &Path) -> PathBuf {
    dir.join(format!("corewatch-{}.ko", std::process::id()))
}

fn remove_temp_image(state: &mut SessionState) {
    if let Some(path) = state.temp_image.take() {
        if let Err(e) = std::fs::remove_file(&path) {
            debug!(path = %path.display(), error = %e, "Could not remove driver image");
        }
    }
}

#[cfg(target_os = "linux")]
fn native_driver() -> Box<dyn Driver> {
    let kernel = KernelDriver::default();
    if kernel.device_exists() {
        Box::new(kernel)
    } else {
        Box::new(DevFsDriver::default())
    }
}

#[cfg(not(target_os = "linux"))]
fn native_driver() -> Box<dyn Driver> {
    Box::new(NullDriver)
}
