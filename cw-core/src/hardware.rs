//! Hardware tree nodes
//!
//! A hardware node owns every sensor it may ever expose and keeps an
//! ordered set of the ones currently active. Sensors are activated and
//! deactivated as readings appear and disappear; they are never destroyed
//! before the node itself is closed.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::identifier::Identifier;
use crate::sensor::{Parameter, ParameterDescription, Sensor, SensorType};
use crate::settings::SharedSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HardwareType {
    Cpu,
    Motherboard,
    SuperIo,
    Memory,
    GpuNvidia,
    GpuAmd,
    Storage,
    Network,
    Cooler,
    Controller,
}

impl fmt::Display for HardwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Index of a sensor inside its owning `HardwareCore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SensorHandle(usize);

/// State shared by every hardware node: naming, sensors and the active set.
pub struct HardwareCore {
    default_name: String,
    name: String,
    identifier: Identifier,
    hardware_type: HardwareType,
    parent: Option<Identifier>,
    sensors: Vec<Sensor>,
    active: Vec<SensorHandle>,
    settings: SharedSettings,
}

fn name_key(identifier: &Identifier) -> String {
    identifier.child("name").to_string()
}

impl HardwareCore {
    pub fn new(
        name: impl Into<String>,
        identifier: Identifier,
        hardware_type: HardwareType,
        settings: SharedSettings,
    ) -> Self {
        let default_name = name.into();
        let name = settings.get_value(&name_key(&identifier), &default_name);
        Self {
            default_name,
            name,
            identifier,
            hardware_type,
            parent: None,
            sensors: Vec::new(),
            active: Vec::new(),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the node. An empty name restores the default.
    pub fn set_name(&mut self, name: &str) {
        self.name = if name.is_empty() {
            self.default_name.clone()
        } else {
            name.to_string()
        };
        self.settings.set_value(&name_key(&self.identifier), &self.name);
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn hardware_type(&self) -> HardwareType {
        self.hardware_type
    }

    pub fn parent(&self) -> Option<&Identifier> {
        self.parent.as_ref()
    }

    pub fn set_parent(&mut self, parent: Option<Identifier>) {
        self.parent = parent;
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    /// Create an inactive sensor owned by this node.
    pub fn create_sensor(
        &mut self,
        name: impl Into<String>,
        index: usize,
        sensor_type: SensorType,
        parameters: &[ParameterDescription],
    ) -> SensorHandle {
        let sensor = Sensor::new(
            name,
            index,
            sensor_type,
            &self.identifier,
            parameters,
            self.settings.clone(),
        );
        self.sensors.push(sensor);
        SensorHandle(self.sensors.len() - 1)
    }

    pub fn activate(&mut self, handle: SensorHandle) {
        if !self.active.contains(&handle) {
            trace!(sensor = %self.sensors[handle.0].identifier(), "Sensor activated");
            self.active.push(handle);
        }
    }

    pub fn deactivate(&mut self, handle: SensorHandle) {
        if let Some(pos) = self.active.iter().position(|h| *h == handle) {
            trace!(sensor = %self.sensors[handle.0].identifier(), "Sensor deactivated");
            self.active.remove(pos);
        }
    }

    pub fn is_active(&self, handle: SensorHandle) -> bool {
        self.active.contains(&handle)
    }

    pub fn sensor(&self, handle: SensorHandle) -> &Sensor {
        &self.sensors[handle.0]
    }

    pub fn sensor_mut(&mut self, handle: SensorHandle) -> &mut Sensor {
        &mut self.sensors[handle.0]
    }

    pub fn value(&self, handle: SensorHandle) -> Option<f32> {
        self.sensors[handle.0].value()
    }

    pub fn set_value(&mut self, handle: SensorHandle, value: Option<f32>) {
        self.sensors[handle.0].set_value(value);
    }

    /// Current value of parameter `index` on a sensor.
    pub fn parameter(&self, handle: SensorHandle, index: usize, fallback: f32) -> f32 {
        self.sensors[handle.0].parameter_value(index, fallback)
    }

    /// Active sensors in activation order.
    pub fn sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.active.iter().map(|h| &self.sensors[h.0])
    }

    /// Active sensors ordered by type, then index.
    pub fn sorted_sensors(&self) -> Vec<&Sensor> {
        let mut sensors: Vec<&Sensor> = self.sensors().collect();
        sensors.sort_by_key(|s| (s.sensor_type(), s.index()));
        sensors
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Persist every sensor's history and drop the active set.
    pub fn close(&mut self) {
        for sensor in &self.sensors {
            sensor.persist_values();
        }
        self.active.clear();
    }
}

impl fmt::Debug for HardwareCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareCore")
            .field("name", &self.name)
            .field("identifier", &self.identifier)
            .field("hardware_type", &self.hardware_type)
            .field("sensors", &self.sensors.len())
            .field("active", &self.active.len())
            .finish()
    }
}

/// A node in the hardware tree.
pub trait Hardware: Send {
    fn core(&self) -> &HardwareCore;

    fn core_mut(&mut self) -> &mut HardwareCore;

    /// Refresh every sensor from the device.
    fn update(&mut self);

    /// Plain-text diagnostic dump.
    fn report(&self) -> String {
        String::new()
    }

    fn sub_hardware(&self) -> &[Box<dyn Hardware>] {
        &[]
    }

    fn sub_hardware_mut(&mut self) -> &mut [Box<dyn Hardware>] {
        &mut []
    }

    fn close(&mut self) {
        self.core_mut().close();
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn identifier(&self) -> &Identifier {
        self.core().identifier()
    }

    fn hardware_type(&self) -> HardwareType {
        self.core().hardware_type()
    }
}

/// A family of hardware discovered and torn down together.
pub trait Group: Send {
    fn hardware(&self) -> &[Box<dyn Hardware>];

    fn hardware_mut(&mut self) -> &mut [Box<dyn Hardware>];

    fn report(&self) -> String {
        String::new()
    }

    fn close(&mut self) {
        for hardware in self.hardware_mut() {
            hardware.close();
        }
    }
}

/// Walks the tree. Default methods descend; override one to stop or
/// intercept at that level.
pub trait Visitor {
    fn visit_hardware(&mut self, hardware: &dyn Hardware) {
        walk_hardware(self, hardware);
    }

    fn visit_sensor(&mut self, sensor: &Sensor) {
        walk_sensor(self, sensor);
    }

    fn visit_parameter(&mut self, _parameter: &Parameter) {}
}

pub fn walk_hardware<V: Visitor + ?Sized>(visitor: &mut V, hardware: &dyn Hardware) {
    for sub in hardware.sub_hardware() {
        visitor.visit_hardware(sub.as_ref());
    }
    for sensor in hardware.core().sensors() {
        visitor.visit_sensor(sensor);
    }
}

pub fn walk_sensor<V: Visitor + ?Sized>(visitor: &mut V, sensor: &Sensor) {
    for parameter in sensor.parameters() {
        visitor.visit_parameter(parameter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettings;

    struct Fixed {
        core: HardwareCore,
        load: SensorHandle,
        temp: SensorHandle,
        ticks: u32,
    }

    impl Fixed {
        fn new(settings: SharedSettings) -> Self {
            let id = Identifier::new(["test", "0"]).unwrap();
            let mut core = HardwareCore::new("Test", id, HardwareType::Cpu, settings);
            let temp = core.create_sensor(
                "Core",
                0,
                SensorType::Temperature,
                &[ParameterDescription::new("Offset [°C]", "offset", 0.0)],
            );
            let load = core.create_sensor("Total", 0, SensorType::Load, &[]);
            core.activate(temp);
            core.activate(load);
            Self { core, load, temp, ticks: 0 }
        }
    }

    impl Hardware for Fixed {
        fn core(&self) -> &HardwareCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut HardwareCore {
            &mut self.core
        }

        fn update(&mut self) {
            self.ticks += 1;
            let t = self.ticks as f32;
            self.core.set_value(self.load, Some(t));
            self.core.set_value(self.temp, Some(40.0 + t));
        }
    }

    #[derive(Default)]
    struct Counter {
        hardware: usize,
        sensors: usize,
        parameters: usize,
    }

    impl Visitor for Counter {
        fn visit_hardware(&mut self, hardware: &dyn Hardware) {
            self.hardware += 1;
            walk_hardware(self, hardware);
        }

        fn visit_sensor(&mut self, sensor: &Sensor) {
            self.sensors += 1;
            walk_sensor(self, sensor);
        }

        fn visit_parameter(&mut self, _parameter: &Parameter) {
            self.parameters += 1;
        }
    }

    #[test]
    fn test_sorted_by_type_then_index() {
        let h = Fixed::new(MemorySettings::shared());
        let kinds: Vec<SensorType> = h.core.sorted_sensors().iter().map(|s| s.sensor_type()).collect();
        assert_eq!(kinds, vec![SensorType::Temperature, SensorType::Load]);
        let order: Vec<&str> = h.core.sensors().map(|s| s.name()).collect();
        assert_eq!(order, vec!["Core", "Total"]);
    }

    #[test]
    fn test_activation_is_a_set() {
        let mut h = Fixed::new(MemorySettings::shared());
        h.core.activate(h.load);
        assert_eq!(h.core.active_count(), 2);
        h.core.deactivate(h.load);
        h.core.deactivate(h.load);
        assert_eq!(h.core.active_count(), 1);
        assert!(!h.core.is_active(h.load));
        // still owned, still writable
        h.core.set_value(h.load, Some(3.0));
        assert_eq!(h.core.value(h.load), Some(3.0));
    }

    #[test]
    fn test_visitor_counts() {
        let mut h = Fixed::new(MemorySettings::shared());
        h.update();
        let mut c = Counter::default();
        c.visit_hardware(&h);
        assert_eq!((c.hardware, c.sensors, c.parameters), (1, 2, 1));
    }

    #[test]
    fn test_name_persisted() {
        let settings = MemorySettings::shared();
        let mut h = Fixed::new(settings.clone());
        h.core.set_name("Workstation");
        let again = Fixed::new(settings);
        assert_eq!(again.name(), "Workstation");
    }

    #[test]
    fn test_close_persists_history() {
        let settings = MemorySettings::shared();
        let mut h = Fixed::new(settings.clone());
        for _ in 0..4 {
            h.update();
        }
        h.close();
        assert_eq!(h.core.active_count(), 0);
        assert!(settings.contains("/test/0/load/0/values"));
    }
}
