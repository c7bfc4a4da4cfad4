//! Linux mediators
//!
//! `KernelDriver` talks to a loadable module through ioctl on its device
//! node. `DevFsDriver` serves the same frames from the stock kernel
//! interfaces: the msr module's per-CPU nodes, /dev/port, sysfs PCI config
//! space and /dev/mem.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use cw_protocol::{pci_bus, pci_device, pci_function, ControlCode, Request};
use tracing::{debug, info, trace};

use super::driver::{module_loaded, run_module_tool, Driver};
use crate::constants::{app, paths};

// ============================================================================
// ioctl device
// ============================================================================

pub struct KernelDriver {
    device: PathBuf,
    module: String,
    file: Option<File>,
}

impl KernelDriver {
    pub fn new(device: impl Into<PathBuf>, module: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            module: module.into(),
            file: None,
        }
    }

    pub fn device_exists(&self) -> bool {
        self.device.exists()
    }
}

impl Default for KernelDriver {
    fn default() -> Self {
        Self::new(paths::MEDIATOR_DEVICE, app::DRIVER_MODULE)
    }
}

impl Driver for KernelDriver {
    fn name(&self) -> &str {
        "kernel module"
    }

    fn open(&mut self) -> bool {
        if self.file.is_some() {
            return true;
        }
        match OpenOptions::new().read(true).write(true).open(&self.device) {
            Ok(file) => {
                info!(device = %self.device.display(), "Opened mediator device");
                self.file = Some(file);
                true
            }
            Err(e) => {
                debug!(device = %self.device.display(), error = %e, "Mediator device not available");
                false
            }
        }
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn install(&mut self, image: &Path) -> std::result::Result<(), String> {
        let image = image
            .to_str()
            .ok_or_else(|| format!("Driver image path {:?} is not UTF-8", image))?;
        run_module_tool("insmod", &[image])
    }

    fn delete(&mut self) -> bool {
        if !module_loaded(&self.module) {
            return true;
        }
        match run_module_tool("rmmod", &[&self.module]) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Could not remove mediator module");
                false
            }
        }
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn device_io_control(&mut self, code: ControlCode, input: &[u8], output: &mut [u8]) -> bool {
        let Some(file) = self.file.as_ref() else {
            return false;
        };
        let mut buffer = vec![0u8; input.len().max(output.len()).max(1)];
        buffer[..input.len()].copy_from_slice(input);

        // SAFETY: the buffer is large enough for both the input frame and
        // the output the mediator writes for this code.
        let status = unsafe { libc::ioctl(file.as_raw_fd(), code.value() as _, buffer.as_mut_ptr()) };
        if status < 0 {
            trace!(code = %code, error = %std::io::Error::last_os_error(), "ioctl failed");
            return false;
        }
        let n = output.len();
        output.copy_from_slice(&buffer[..n]);
        true
    }
}

// ============================================================================
// Device file mediator
// ============================================================================

/// Serves mediator frames from kernel device files.
pub struct DevFsDriver {
    cpu_base: PathBuf,
    pci_base: PathBuf,
    open: bool,
    msr: HashMap<usize, File>,
    port: Option<File>,
    mem: Option<File>,
}

impl Default for DevFsDriver {
    fn default() -> Self {
        Self::new(paths::CPU_DEV_BASE, paths::PCI_DEVICES)
    }
}

impl DevFsDriver {
    pub fn new(cpu_base: impl Into<PathBuf>, pci_base: impl Into<PathBuf>) -> Self {
        Self {
            cpu_base: cpu_base.into(),
            pci_base: pci_base.into(),
            open: false,
            msr: HashMap::new(),
            port: None,
            mem: None,
        }
    }

    fn msr_path(&self, cpu: usize) -> PathBuf {
        self.cpu_base.join(cpu.to_string()).join("msr")
    }

    fn pci_config_path(&self, address: u32) -> PathBuf {
        self.pci_base
            .join(format!(
                "0000:{:02x}:{:02x}.{:x}",
                pci_bus(address),
                pci_device(address),
                pci_function(address)
            ))
            .join("config")
    }

    fn msr_file(&mut self, cpu: usize) -> Option<&File> {
        if !self.msr.contains_key(&cpu) {
            let path = self.msr_path(cpu);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .or_else(|_| File::open(&path))
                .ok()?;
            self.msr.insert(cpu, file);
        }
        self.msr.get(&cpu)
    }

    fn port_file(&mut self) -> Option<&File> {
        if self.port.is_none() {
            self.port = OpenOptions::new().read(true).write(true).open(paths::DEV_PORT).ok();
        }
        self.port.as_ref()
    }

    fn mem_file(&mut self) -> Option<&File> {
        if self.mem.is_none() {
            self.mem = File::open(paths::DEV_MEM).ok();
        }
        self.mem.as_ref()
    }

    fn serve(&mut self, request: Request, output: &mut [u8]) -> std::io::Result<()> {
        match request {
            Request::GetVersion | Request::GetRefCount => {
                output.copy_from_slice(&1u32.to_le_bytes());
            }
            Request::ReadMsr { index } => {
                let cpu = current_cpu();
                let file = self.msr_file(cpu).ok_or_else(not_available)?;
                file.read_exact_at(output, index as u64)?;
            }
            Request::WriteMsr { index, value } => {
                let cpu = current_cpu();
                let file = self.msr_file(cpu).ok_or_else(not_available)?;
                file.write_all_at(&value.to_le_bytes(), index as u64)?;
            }
            Request::ReadIoPort { port } => {
                let file = self.port_file().ok_or_else(not_available)?;
                let mut byte = [0u8; 1];
                file.read_exact_at(&mut byte, port as u64)?;
                output.copy_from_slice(&(byte[0] as u32).to_le_bytes());
            }
            Request::WriteIoPort { port, value } => {
                let file = self.port_file().ok_or_else(not_available)?;
                file.write_all_at(&[value], port as u64)?;
            }
            Request::ReadPciConfig { address, offset } => {
                let file = File::open(self.pci_config_path(address))?;
                file.read_exact_at(output, offset as u64)?;
            }
            Request::WritePciConfig { address, offset, value } => {
                let file = OpenOptions::new().write(true).open(self.pci_config_path(address))?;
                file.write_all_at(&value.to_le_bytes(), offset as u64)?;
            }
            Request::ReadMemory { address, .. } => {
                let file = self.mem_file().ok_or_else(not_available)?;
                file.read_exact_at(output, address)?;
            }
        }
        Ok(())
    }
}

fn not_available() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotFound, "device node not available")
}

fn current_cpu() -> usize {
    // SAFETY: sched_getcpu has no preconditions.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as usize
    }
}

impl Driver for DevFsDriver {
    fn name(&self) -> &str {
        "device files"
    }

    fn open(&mut self) -> bool {
        if self.open {
            return true;
        }
        if !self.msr_path(0).exists() {
            for module in app::DEVFS_MODULES {
                if !module_loaded(module) {
                    if let Err(e) = run_module_tool("modprobe", &[module]) {
                        debug!(error = %e, "Module not loaded");
                    }
                }
            }
        }
        self.open = self.msr_file(0).is_some();
        if self.open {
            info!(base = %self.cpu_base.display(), "Using MSR device files");
        }
        self.open
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn install(&mut self, _image: &Path) -> std::result::Result<(), String> {
        for module in app::DEVFS_MODULES {
            run_module_tool("modprobe", &[module])?;
        }
        Ok(())
    }

    fn delete(&mut self) -> bool {
        true
    }

    fn close(&mut self) {
        self.msr.clear();
        self.port = None;
        self.mem = None;
        self.open = false;
    }

    fn device_io_control(&mut self, code: ControlCode, input: &[u8], output: &mut [u8]) -> bool {
        if !self.open {
            return false;
        }
        let request = match Request::decode(code, input) {
            Ok(r) => r,
            Err(e) => {
                debug!(code = %code, error = %e, "Rejected frame");
                return false;
            }
        };
        if output.len() != request.output_size() {
            return false;
        }
        match self.serve(request, output) {
            Ok(()) => true,
            Err(e) => {
                trace!(request = request.type_name(), error = %e, "Device file access failed");
                false
            }
        }
    }
}
