//! In-memory machine behind the mediator protocol.
//!
//! Register files are plain maps. Requests arrive as encoded frames and are
//! decoded exactly like a real mediator would, so everything above the
//! `Driver` seam runs unchanged. Used by tests and `--simulate`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use cw_protocol::{ControlCode, Request};
use parking_lot::Mutex;

use super::driver::Driver;
use crate::affinity::{AffinityControl, SavedAffinity};
use crate::error::{CorewatchError, Result};

/// A PCI register pair where a write selects what the next read returns.
#[derive(Debug, Default)]
struct IndexedRegister {
    index_reg: u32,
    data_reg: u32,
    selected: u32,
    values: HashMap<u32, u32>,
}

#[derive(Debug, Default)]
struct MachineState {
    cpu_count: usize,
    affinity: u64,
    msrs: HashMap<(usize, u32), u64>,
    msr_steps: HashMap<(usize, u32), u64>,
    io_ports: HashMap<u32, u8>,
    pci: HashMap<(u32, u32), u32>,
    indexed: HashMap<u32, Vec<IndexedRegister>>,
    memory: HashMap<u64, u8>,
    installed: bool,
    accepts_install: bool,
    refcount: u32,
    deletes: usize,
    requests: Vec<Request>,
}

impl MachineState {
    fn current_cpu(&self) -> usize {
        if self.affinity == 0 {
            0
        } else {
            self.affinity.trailing_zeros() as usize
        }
    }

    fn serve(&mut self, request: Request, output: &mut [u8]) -> bool {
        self.requests.push(request);
        match request {
            Request::GetVersion => output.copy_from_slice(&0x0103_0000u32.to_le_bytes()),
            Request::GetRefCount => output.copy_from_slice(&self.refcount.to_le_bytes()),
            Request::ReadMsr { index } => {
                let cpu = self.current_cpu();
                let step = self.msr_steps.get(&(cpu, index)).copied().unwrap_or(0);
                match self.msrs.get_mut(&(cpu, index)) {
                    Some(v) => {
                        output.copy_from_slice(&v.to_le_bytes());
                        *v = v.wrapping_add(step);
                    }
                    None => return false,
                }
            }
            Request::WriteMsr { index, value } => {
                let cpu = self.current_cpu();
                self.msrs.insert((cpu, index), value);
            }
            Request::ReadIoPort { port } => match self.io_ports.get(&port) {
                Some(v) => output.copy_from_slice(&(*v as u32).to_le_bytes()),
                None => return false,
            },
            Request::WriteIoPort { port, value } => {
                self.io_ports.insert(port, value);
            }
            Request::ReadPciConfig { address, offset } => {
                if let Some(regs) = self.indexed.get(&address) {
                    if let Some(reg) = regs.iter().find(|r| r.data_reg == offset) {
                        let v = reg.values.get(&reg.selected).copied().unwrap_or(0);
                        output.copy_from_slice(&v.to_le_bytes());
                        return true;
                    }
                }
                match self.pci.get(&(address, offset)) {
                    Some(v) => output.copy_from_slice(&v.to_le_bytes()),
                    None => return false,
                }
            }
            Request::WritePciConfig { address, offset, value } => {
                if let Some(regs) = self.indexed.get_mut(&address) {
                    if let Some(reg) = regs.iter_mut().find(|r| r.index_reg == offset) {
                        reg.selected = value;
                        return true;
                    }
                }
                self.pci.insert((address, offset), value);
            }
            Request::ReadMemory { address, .. } => {
                for (i, byte) in output.iter_mut().enumerate() {
                    match self.memory.get(&(address + i as u64)) {
                        Some(b) => *byte = *b,
                        None => return false,
                    }
                }
            }
        }
        true
    }
}

/// Shared handle to a simulated machine.
#[derive(Debug, Clone)]
pub struct SimulatedMachine {
    state: Arc<Mutex<MachineState>>,
}

impl SimulatedMachine {
    /// A machine whose mediator is already installed.
    pub fn new(cpu_count: usize) -> Self {
        let machine = Self::uninstalled(cpu_count);
        machine.state.lock().installed = true;
        machine
    }

    /// A machine with no mediator installed and no way to install one.
    pub fn uninstalled(cpu_count: usize) -> Self {
        let state = MachineState {
            cpu_count,
            affinity: if cpu_count >= 64 { u64::MAX } else { (1u64 << cpu_count) - 1 },
            refcount: 1,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Let `install` succeed with any non-empty image.
    pub fn accept_install(&self, accept: bool) {
        self.state.lock().accepts_install = accept;
    }

    pub fn driver(&self) -> Box<dyn Driver> {
        Box::new(SimulatedDriver {
            machine: self.clone(),
            open: false,
        })
    }

    pub fn affinity(&self) -> Arc<dyn AffinityControl> {
        Arc::new(SimulatedAffinity {
            machine: self.clone(),
        })
    }

    pub fn cpu_count(&self) -> usize {
        self.state.lock().cpu_count
    }

    pub fn current_cpu(&self) -> usize {
        self.state.lock().current_cpu()
    }

    pub fn set_msr(&self, cpu: usize, index: u32, value: u64) {
        self.state.lock().msrs.insert((cpu, index), value);
    }

    /// Set the same MSR value on every CPU.
    pub fn set_msr_all(&self, index: u32, value: u64) {
        let mut state = self.state.lock();
        for cpu in 0..state.cpu_count {
            state.msrs.insert((cpu, index), value);
        }
    }

    /// Make an MSR count up by `step` after every read, like a running
    /// performance counter.
    pub fn set_msr_step(&self, cpu: usize, index: u32, step: u64) {
        self.state.lock().msr_steps.insert((cpu, index), step);
    }

    pub fn msr(&self, cpu: usize, index: u32) -> Option<u64> {
        self.state.lock().msrs.get(&(cpu, index)).copied()
    }

    pub fn remove_msr(&self, cpu: usize, index: u32) {
        self.state.lock().msrs.remove(&(cpu, index));
    }

    /// Add `delta` to the low 32 bits of an MSR, wrapping like an energy counter.
    pub fn advance_counter(&self, cpu: usize, index: u32, delta: u32) {
        let mut state = self.state.lock();
        let entry = state.msrs.entry((cpu, index)).or_insert(0);
        let low = (*entry as u32).wrapping_add(delta);
        *entry = (*entry & 0xFFFF_FFFF_0000_0000) | low as u64;
    }

    pub fn set_io_port(&self, port: u32, value: u8) {
        self.state.lock().io_ports.insert(port, value);
    }

    pub fn io_port(&self, port: u32) -> Option<u8> {
        self.state.lock().io_ports.get(&port).copied()
    }

    pub fn set_pci(&self, address: u32, offset: u32, value: u32) {
        self.state.lock().pci.insert((address, offset), value);
    }

    pub fn pci(&self, address: u32, offset: u32) -> Option<u32> {
        self.state.lock().pci.get(&(address, offset)).copied()
    }

    /// Register an index/data pair on a PCI function.
    pub fn add_indexed_pci(&self, address: u32, index_reg: u32, data_reg: u32) {
        self.state
            .lock()
            .indexed
            .entry(address)
            .or_default()
            .push(IndexedRegister {
                index_reg,
                data_reg,
                ..Default::default()
            });
    }

    pub fn set_indexed(&self, address: u32, data_reg: u32, index: u32, value: u32) {
        let mut state = self.state.lock();
        if let Some(reg) = state
            .indexed
            .get_mut(&address)
            .and_then(|regs| regs.iter_mut().find(|r| r.data_reg == data_reg))
        {
            reg.values.insert(index, value);
        }
    }

    pub fn set_memory(&self, address: u64, bytes: &[u8]) {
        let mut state = self.state.lock();
        for (i, b) in bytes.iter().enumerate() {
            state.memory.insert(address + i as u64, *b);
        }
    }

    pub fn set_refcount(&self, refcount: u32) {
        self.state.lock().refcount = refcount;
    }

    pub fn is_installed(&self) -> bool {
        self.state.lock().installed
    }

    /// How often the mediator was uninstalled.
    pub fn deletes(&self) -> usize {
        self.state.lock().deletes
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }
}

pub struct SimulatedDriver {
    machine: SimulatedMachine,
    open: bool,
}

impl Driver for SimulatedDriver {
    fn name(&self) -> &str {
        "simulated"
    }

    fn open(&mut self) -> bool {
        self.open = self.machine.state.lock().installed;
        self.open
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn install(&mut self, image: &Path) -> std::result::Result<(), String> {
        let mut state = self.machine.state.lock();
        if !state.accepts_install {
            return Err("Simulated mediator refuses installation".into());
        }
        let size = std::fs::metadata(image).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(format!("Driver image {} is empty", image.display()));
        }
        state.installed = true;
        Ok(())
    }

    fn delete(&mut self) -> bool {
        let mut state = self.machine.state.lock();
        state.installed = false;
        state.deletes += 1;
        true
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn device_io_control(&mut self, code: ControlCode, input: &[u8], output: &mut [u8]) -> bool {
        if !self.open {
            return false;
        }
        let Ok(request) = Request::decode(code, input) else {
            return false;
        };
        if output.len() != request.output_size() {
            return false;
        }
        self.machine.state.lock().serve(request, output)
    }
}

/// Affinity that moves the simulated machine's "current" CPU.
pub struct SimulatedAffinity {
    machine: SimulatedMachine,
}

impl AffinityControl for SimulatedAffinity {
    fn set(&self, mask: u64) -> Result<SavedAffinity> {
        if mask == 0 {
            return Ok(SavedAffinity::from_mask(0));
        }
        let mut state = self.machine.state.lock();
        let cpu = mask.trailing_zeros() as usize;
        if cpu >= state.cpu_count {
            return Err(CorewatchError::affinity(mask, "no such CPU"));
        }
        let previous = state.affinity;
        state.affinity = mask;
        Ok(SavedAffinity::from_mask(previous))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cw_protocol::{pci_address, Function};

    fn call(driver: &mut Box<dyn Driver>, request: Request) -> Option<Vec<u8>> {
        let mut out = vec![0u8; request.output_size()];
        driver
            .device_io_control(request.code(), &request.encode(), &mut out)
            .then_some(out)
    }

    #[test]
    fn test_msr_follows_affinity() {
        let m = SimulatedMachine::new(4);
        m.set_msr(0, 0x10, 100);
        m.set_msr(2, 0x10, 300);
        let mut d = m.driver();
        assert!(d.open());
        let aff = m.affinity();

        aff.set(1 << 2).unwrap();
        assert_eq!(call(&mut d, Request::ReadMsr { index: 0x10 }).unwrap(), 300u64.to_le_bytes());
        aff.set(1).unwrap();
        assert_eq!(call(&mut d, Request::ReadMsr { index: 0x10 }).unwrap(), 100u64.to_le_bytes());
        assert!(aff.set(1 << 9).is_err());
    }

    #[test]
    fn test_indexed_pci_pair() {
        let m = SimulatedMachine::new(1);
        let root = pci_address(0, 0, 0);
        m.add_indexed_pci(root, 0x60, 0x64);
        m.set_indexed(root, 0x64, 0x59800, 0x1234_5678);
        let mut d = m.driver();
        d.open();
        assert!(call(&mut d, Request::WritePciConfig { address: root, offset: 0x60, value: 0x59800 }).is_some());
        let out = call(&mut d, Request::ReadPciConfig { address: root, offset: 0x64 }).unwrap();
        assert_eq!(u32::from_le_bytes(out.try_into().unwrap()), 0x1234_5678);
    }

    #[test]
    fn test_uninstalled_does_not_open() {
        let m = SimulatedMachine::uninstalled(2);
        let mut d = m.driver();
        assert!(!d.open());
        let mut out = [0u8; 4];
        assert!(!d.device_io_control(Function::GetVersion.code(), &[], &mut out));
    }

    #[test]
    fn test_stepping_msr() {
        let m = SimulatedMachine::new(1);
        m.set_msr(0, 0xC0010004, 0);
        m.set_msr_step(0, 0xC0010004, 5);
        let mut d = m.driver();
        d.open();
        let read = |d: &mut Box<dyn Driver>| {
            u64::from_le_bytes(call(d, Request::ReadMsr { index: 0xC0010004 }).unwrap().try_into().unwrap())
        };
        assert_eq!(read(&mut d), 0);
        assert_eq!(read(&mut d), 5);
    }

    #[test]
    fn test_counter_wraps() {
        let m = SimulatedMachine::new(1);
        m.set_msr(0, 0x611, 0xFFFF_FFF0);
        m.advance_counter(0, 0x611, 0x20);
        assert_eq!(m.msr(0, 0x611), Some(0x10));
    }
}
