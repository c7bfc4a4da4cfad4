//! Sensors and their tunable parameters
//!
//! A sensor holds the latest value of one reading, its observed min/max,
//! and a rolling history with one averaged entry per four raw values.
//! History older than the time window is pruned when new entries arrive.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::constants::sensor::{AVERAGE_COUNT, VALUES_TIME_WINDOW};
use crate::identifier::Identifier;
use crate::settings::SharedSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorType {
    Voltage,
    Clock,
    Temperature,
    Load,
    Fan,
    Flow,
    Control,
    Level,
    Factor,
    Power,
    Data,
    SmallData,
}

impl SensorType {
    /// Identifier token for this type.
    pub fn token(self) -> &'static str {
        match self {
            SensorType::Voltage => "voltage",
            SensorType::Clock => "clock",
            SensorType::Temperature => "temperature",
            SensorType::Load => "load",
            SensorType::Fan => "fan",
            SensorType::Flow => "flow",
            SensorType::Control => "control",
            SensorType::Level => "level",
            SensorType::Factor => "factor",
            SensorType::Power => "power",
            SensorType::Data => "data",
            SensorType::SmallData => "smalldata",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            SensorType::Voltage => "V",
            SensorType::Clock => "MHz",
            SensorType::Temperature => "°C",
            SensorType::Load | SensorType::Control | SensorType::Level => "%",
            SensorType::Fan => "RPM",
            SensorType::Flow => "L/h",
            SensorType::Factor => "",
            SensorType::Power => "W",
            SensorType::Data => "GB",
            SensorType::SmallData => "MB",
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Parameters
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescription {
    pub name: String,
    pub description: String,
    pub default_value: f32,
}

impl ParameterDescription {
    pub fn new(name: impl Into<String>, description: impl Into<String>, default_value: f32) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default_value,
        }
    }
}

/// A named float attached to a sensor, overridable and persisted.
pub struct Parameter {
    description: ParameterDescription,
    identifier: Identifier,
    value: f32,
    is_default: bool,
    settings: SharedSettings,
}

impl Parameter {
    pub fn new(description: ParameterDescription, sensor: &Identifier, settings: SharedSettings) -> Self {
        let token: String = description
            .name
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let identifier = sensor.child("parameter").child(token);

        let stored = if settings.contains(identifier.as_str()) {
            settings
                .get_value(identifier.as_str(), "")
                .parse::<f32>()
                .ok()
        } else {
            None
        };

        let (value, is_default) = match stored {
            Some(v) => (v, false),
            None => (description.default_value, true),
        };

        Self {
            description,
            identifier,
            value,
            is_default,
            settings,
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    pub fn description(&self) -> &str {
        &self.description.description
    }

    pub fn default_value(&self) -> f32 {
        self.description.default_value
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn set_value(&mut self, value: f32) {
        self.value = value;
        self.is_default = false;
        self.settings.set_value(self.identifier.as_str(), &value.to_string());
    }

    /// Drop the override and return to the default value.
    pub fn set_default(&mut self) {
        self.value = self.description.default_value;
        self.is_default = true;
        self.settings.remove(self.identifier.as_str());
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("identifier", &self.identifier)
            .field("value", &self.value)
            .field("is_default", &self.is_default)
            .finish()
    }
}

// ============================================================================
// Sensor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorValue {
    pub value: f32,
    pub time: SystemTime,
}

/// Serializable view of a sensor at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct SensorReading {
    pub identifier: String,
    pub name: String,
    pub sensor_type: SensorType,
    pub index: usize,
    pub value: Option<f32>,
    pub min: Option<f32>,
    pub max: Option<f32>,
    pub unit: &'static str,
}

pub struct Sensor {
    identifier: Identifier,
    hardware: Identifier,
    sensor_type: SensorType,
    index: usize,
    default_name: String,
    name: String,
    value: Option<f32>,
    min: Option<f32>,
    max: Option<f32>,
    values: VecDeque<SensorValue>,
    current_sum: f32,
    current_count: u32,
    values_time_window: Duration,
    parameters: Vec<Parameter>,
    settings: SharedSettings,
}

impl Sensor {
    pub fn new(
        name: impl Into<String>,
        index: usize,
        sensor_type: SensorType,
        hardware: &Identifier,
        parameters: &[ParameterDescription],
        settings: SharedSettings,
    ) -> Self {
        let default_name = name.into();
        let identifier = hardware.child(sensor_type.token()).child(index);
        let name = settings.get_value(&name_key(&identifier), &default_name);
        let parameters = parameters
            .iter()
            .cloned()
            .map(|d| Parameter::new(d, &identifier, settings.clone()))
            .collect();

        let mut sensor = Self {
            identifier,
            hardware: hardware.clone(),
            sensor_type,
            index,
            default_name,
            name,
            value: None,
            min: None,
            max: None,
            values: VecDeque::new(),
            current_sum: 0.0,
            current_count: 0,
            values_time_window: VALUES_TIME_WINDOW,
            parameters,
            settings,
        };
        sensor.restore_values();
        sensor
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Identifier of the owning hardware node.
    pub fn hardware(&self) -> &Identifier {
        &self.hardware
    }

    pub fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// Rename the sensor. An empty name restores the default.
    pub fn set_name(&mut self, name: &str) {
        let key = name_key(&self.identifier);
        if name.is_empty() || name == self.default_name {
            self.name = self.default_name.clone();
            self.settings.remove(&key);
        } else {
            self.name = name.to_string();
            self.settings.set_value(&key, name);
        }
    }

    pub fn value(&self) -> Option<f32> {
        self.value
    }

    pub fn min(&self) -> Option<f32> {
        self.min
    }

    pub fn max(&self) -> Option<f32> {
        self.max
    }

    pub fn reset_min(&mut self) {
        self.min = None;
    }

    pub fn reset_max(&mut self) {
        self.max = None;
    }

    pub fn set_value(&mut self, value: Option<f32>) {
        self.set_value_at(value, SystemTime::now());
    }

    /// Record a new reading taken at `time`.
    pub fn set_value_at(&mut self, value: Option<f32>, time: SystemTime) {
        if let Some(v) = value {
            // a zero window keeps no history at all
            if !self.values_time_window.is_zero() {
                self.prune(time);
                self.current_sum += v;
                self.current_count += 1;
                if self.current_count == AVERAGE_COUNT {
                    self.append_value(self.current_sum / self.current_count as f32, time);
                    self.current_sum = 0.0;
                    self.current_count = 0;
                }
            }

            self.min = Some(self.min.map_or(v, |m| m.min(v)));
            self.max = Some(self.max.map_or(v, |m| m.max(v)));
        }
        self.value = value;
    }

    fn prune(&mut self, now: SystemTime) {
        while let Some(first) = self.values.front() {
            let age = now.duration_since(first.time).unwrap_or(Duration::ZERO);
            if age > self.values_time_window {
                self.values.pop_front();
            } else {
                break;
            }
        }
    }

    fn append_value(&mut self, value: f32, time: SystemTime) {
        let len = self.values.len();
        if len >= 2 && self.values[len - 1].value == value && self.values[len - 2].value == value {
            self.values[len - 1] = SensorValue { value, time };
            return;
        }
        self.values.push_back(SensorValue { value, time });
    }

    pub fn values(&self) -> impl Iterator<Item = &SensorValue> {
        self.values.iter()
    }

    pub fn values_len(&self) -> usize {
        self.values.len()
    }

    pub fn values_time_window(&self) -> Duration {
        self.values_time_window
    }

    /// A zero window disables history and clears it.
    pub fn set_values_time_window(&mut self, window: Duration) {
        self.values_time_window = window;
        if window.is_zero() {
            self.values.clear();
            self.current_sum = 0.0;
            self.current_count = 0;
        }
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameter(&self, index: usize) -> Option<&Parameter> {
        self.parameters.get(index)
    }

    pub fn parameter_mut(&mut self, index: usize) -> Option<&mut Parameter> {
        self.parameters.get_mut(index)
    }

    /// Value of parameter `index`, or `fallback` when the sensor has none.
    pub fn parameter_value(&self, index: usize, fallback: f32) -> f32 {
        self.parameters.get(index).map_or(fallback, |p| p.value())
    }

    pub fn reading(&self) -> SensorReading {
        SensorReading {
            identifier: self.identifier.to_string(),
            name: self.name.clone(),
            sensor_type: self.sensor_type,
            index: self.index,
            value: self.value,
            min: self.min,
            max: self.max,
            unit: self.sensor_type.unit(),
        }
    }

    /// Store the history under `<id>/values`.
    pub fn persist_values(&self) {
        if self.values.is_empty() {
            self.settings.remove(&values_key(&self.identifier));
            return;
        }
        let history: Vec<&SensorValue> = self.values.iter().collect();
        match serde_json::to_string(&history) {
            Ok(json) => self.settings.set_value(&values_key(&self.identifier), &json),
            Err(e) => debug!(sensor = %self.identifier, error = %e, "Could not encode history"),
        }
    }

    fn restore_values(&mut self) {
        let key = values_key(&self.identifier);
        if !self.settings.contains(&key) {
            return;
        }
        let json = self.settings.get_value(&key, "[]");
        match serde_json::from_str::<Vec<SensorValue>>(&json) {
            Ok(history) => {
                trace!(sensor = %self.identifier, entries = history.len(), "Restored history");
                for entry in history {
                    self.append_value(entry.value, entry.time);
                }
                self.prune(SystemTime::now());
            }
            Err(e) => {
                debug!(sensor = %self.identifier, error = %e, "Discarding unreadable history");
                self.settings.remove(&key);
            }
        }
    }
}

impl fmt::Debug for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sensor")
            .field("identifier", &self.identifier)
            .field("name", &self.name)
            .field("value", &self.value)
            .field("min", &self.min)
            .field("max", &self.max)
            .finish()
    }
}

fn name_key(id: &Identifier) -> String {
    format!("{}/name", id)
}

fn values_key(id: &Identifier) -> String {
    format!("{}/values", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{MemorySettings, Settings};
    use std::sync::Arc;

    fn hw() -> Identifier {
        Identifier::new(["intelcpu", "0"]).unwrap()
    }

    fn sensor(settings: SharedSettings) -> Sensor {
        Sensor::new("CPU Core #1", 1, SensorType::Temperature, &hw(), &[], settings)
    }

    #[test]
    fn test_identifier_layout() {
        let s = sensor(MemorySettings::shared());
        assert_eq!(s.identifier().as_str(), "/intelcpu/0/temperature/1");
        assert_eq!(s.hardware(), &hw());
    }

    #[test]
    fn test_min_max_bracket_value() {
        let mut s = sensor(MemorySettings::shared());
        let mut last_min = f32::MAX;
        let mut last_max = f32::MIN;
        for v in [40.0, 38.5, 55.0, 55.0, 12.0, 70.25, 41.0] {
            s.set_value(Some(v));
            let (min, max) = (s.min().unwrap(), s.max().unwrap());
            assert!(min <= v && v <= max);
            assert!(min <= last_min);
            assert!(max >= last_max);
            last_min = min;
            last_max = max;
        }
        assert_eq!(s.min(), Some(12.0));
        assert_eq!(s.max(), Some(70.25));
    }

    #[test]
    fn test_null_values_keep_min_max() {
        let mut s = sensor(MemorySettings::shared());
        s.set_value(Some(50.0));
        s.set_value(None);
        assert_eq!(s.value(), None);
        assert_eq!(s.min(), Some(50.0));
        assert_eq!(s.max(), Some(50.0));
        s.reset_min();
        s.reset_max();
        assert_eq!(s.min(), None);
        s.set_value(Some(30.0));
        assert_eq!(s.max(), Some(30.0));
    }

    #[test]
    fn test_one_entry_per_four_values() {
        let mut s = sensor(MemorySettings::shared());
        let start = SystemTime::now();
        for i in 0..12 {
            s.set_value_at(Some(i as f32), start + Duration::from_secs(i));
        }
        let averages: Vec<f32> = s.values().map(|v| v.value).collect();
        assert_eq!(averages, vec![1.5, 5.5, 9.5]);
    }

    #[test]
    fn test_repeated_average_replaces_last_entry() {
        let mut s = sensor(MemorySettings::shared());
        let start = SystemTime::now();
        for i in 0..16 {
            s.set_value_at(Some(42.0), start + Duration::from_secs(i));
        }
        assert_eq!(s.values_len(), 2);
        let last = s.values().last().unwrap();
        assert_eq!(last.time, start + Duration::from_secs(15));
    }

    #[test]
    fn test_history_pruned_to_window() {
        let mut s = sensor(MemorySettings::shared());
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        // one averaged entry per minute for three hours
        for minute in 0..180u64 {
            for k in 0..4u64 {
                let t = start + Duration::from_secs(minute * 60 + k);
                s.set_value_at(Some(minute as f32), t);
            }
        }
        let newest = start + Duration::from_secs(179 * 60 + 3);
        assert!(s.values().all(|v| newest.duration_since(v.time).unwrap() <= VALUES_TIME_WINDOW));
        // entries within the window survive
        assert!(s.values_len() >= 120);
        assert!(s.values_len() <= 122);
    }

    #[test]
    fn test_pruning_only_drops_old_entries() {
        let mut s = sensor(MemorySettings::shared());
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000_000);
        let old = now - Duration::from_secs(3 * 3600 + 1800);
        let recent = now - Duration::from_secs(3600);
        for v in 0..4 {
            s.set_value_at(Some(v as f32), old);
        }
        for v in 4..8 {
            s.set_value_at(Some(v as f32), recent);
        }
        assert_eq!(s.values_len(), 1);
        for v in 8..12 {
            s.set_value_at(Some(v as f32), now);
        }
        let kept: Vec<f32> = s.values().map(|e| e.value).collect();
        assert_eq!(kept, vec![5.5, 9.5]);
    }

    #[test]
    fn test_zero_window_clears_history() {
        let mut s = sensor(MemorySettings::shared());
        for v in 0..8 {
            s.set_value(Some(v as f32));
        }
        assert_eq!(s.values_len(), 2);
        s.set_values_time_window(Duration::ZERO);
        assert_eq!(s.values_len(), 0);

        for v in 0..8 {
            s.set_value(Some(v as f32));
        }
        assert_eq!(s.values_len(), 0);
        assert_eq!(s.value(), Some(7.0));
        assert_eq!(s.max(), Some(7.0));
    }

    #[test]
    fn test_name_persisted() {
        let settings = Arc::new(MemorySettings::new());
        let mut s = sensor(settings.clone());
        s.set_name("Hot Core");
        assert!(settings.contains("/intelcpu/0/temperature/1/name"));

        let again = sensor(settings.clone());
        assert_eq!(again.name(), "Hot Core");

        s.set_name("");
        assert_eq!(s.name(), "CPU Core #1");
        assert!(!settings.contains("/intelcpu/0/temperature/1/name"));
    }

    #[test]
    fn test_parameter_override_and_reset() {
        let settings = Arc::new(MemorySettings::new());
        let desc = [ParameterDescription::new("TjMax [°C]", "junction limit", 100.0)];
        let mut s = Sensor::new("Core", 0, SensorType::Temperature, &hw(), &desc, settings.clone());
        let key = "/intelcpu/0/temperature/0/parameter/tjmax[°c]";

        let p = s.parameter_mut(0).unwrap();
        assert!(p.is_default());
        assert_eq!(p.identifier().as_str(), key);
        p.set_value(95.0);
        assert!(!p.is_default());
        assert_eq!(settings.get_value(key, ""), "95");

        let reloaded = Sensor::new("Core", 0, SensorType::Temperature, &hw(), &desc, settings.clone());
        assert_eq!(reloaded.parameter_value(0, 0.0), 95.0);

        s.parameter_mut(0).unwrap().set_default();
        assert_eq!(s.parameter_value(0, 0.0), 100.0);
        assert!(!settings.contains(key));
    }

    #[test]
    fn test_history_persist_and_restore() {
        let settings = Arc::new(MemorySettings::new());
        let mut s = sensor(settings.clone());
        for v in 0..8 {
            s.set_value(Some(v as f32));
        }
        s.persist_values();
        let restored = sensor(settings);
        let values: Vec<f32> = restored.values().map(|v| v.value).collect();
        assert_eq!(values, vec![1.5, 5.5]);
    }

    #[test]
    fn test_reading_carries_unit() {
        let mut s = Sensor::new("Bus Speed", 0, SensorType::Clock, &hw(), &[], MemorySettings::shared());
        s.set_value(Some(100.0));
        let r = s.reading();
        assert_eq!(r.unit, "MHz");
        assert_eq!(r.value, Some(100.0));
    }
}
