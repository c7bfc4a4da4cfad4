/*
 * This file is part of Corewatch.
 *
 * Copyright (C) 2025 Corewatch contributors
 *
 * Corewatch is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corewatch is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corewatch. If not, see <https://www.gnu.org/licenses/>.
 */

//! Sensor snapshots and their text and JSON renderings

use std::io::Write;

use cw_core::hardware::walk_hardware;
use cw_core::{Computer, Hardware, HardwareType, Sensor, SensorReading, SensorType, Visitor};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HardwareSnapshot {
    pub identifier: String,
    pub name: String,
    pub hardware_type: HardwareType,
    pub sensors: Vec<SensorReading>,
}

/// One polling pass, as written by `watch --json`.
#[derive(Debug, Clone, Serialize)]
pub struct Sample<'a> {
    pub sample: u64,
    pub hardware: &'a [HardwareSnapshot],
}

#[derive(Default)]
struct Collector {
    nodes: Vec<HardwareSnapshot>,
}

impl Visitor for Collector {
    fn visit_hardware(&mut self, hardware: &dyn Hardware) {
        self.nodes.push(HardwareSnapshot {
            identifier: hardware.identifier().to_string(),
            name: hardware.name().to_string(),
            hardware_type: hardware.hardware_type(),
            sensors: Vec::new(),
        });
        walk_hardware(self, hardware);
    }

    fn visit_sensor(&mut self, sensor: &Sensor) {
        if let Some(node) = self.nodes.last_mut() {
            node.sensors.push(sensor.reading());
        }
    }
}

/// Every active sensor, grouped by hardware and sorted by type then index.
pub fn snapshot(computer: &Computer) -> Vec<HardwareSnapshot> {
    let mut collector = Collector::default();
    computer.accept(&mut collector);
    for node in &mut collector.nodes {
        node.sensors.sort_by_key(|s| (s.sensor_type, s.index));
    }
    collector.nodes
}

fn format_value(kind: SensorType, value: Option<f32>) -> String {
    let Some(v) = value else {
        return "-".to_string();
    };
    match kind {
        SensorType::Voltage => format!("{:.3}", v),
        SensorType::Factor => format!("{:.2}", v),
        SensorType::Fan => format!("{:.0}", v),
        _ => format!("{:.1}", v),
    }
}

pub fn write_text(out: &mut dyn Write, nodes: &[HardwareSnapshot]) -> std::io::Result<()> {
    for node in nodes {
        writeln!(out, "{} ({})", node.name, node.identifier)?;
        let mut current = None;
        for s in &node.sensors {
            if current != Some(s.sensor_type) {
                writeln!(out, "  {:?}", s.sensor_type)?;
                current = Some(s.sensor_type);
            }
            writeln!(
                out,
                "    {:<32} {:>10} {:<4} [{} .. {}]",
                s.name,
                format_value(s.sensor_type, s.value),
                s.unit,
                format_value(s.sensor_type, s.min),
                format_value(s.sensor_type, s.max),
            )?;
        }
        writeln!(out)?;
    }
    Ok(())
}

pub fn write_json(out: &mut dyn Write, nodes: &[HardwareSnapshot]) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, nodes)?;
    writeln!(out)
}

/// One compact JSON object per line.
pub fn write_json_line(out: &mut dyn Write, sample: &Sample<'_>) -> std::io::Result<()> {
    serde_json::to_writer(&mut *out, sample)?;
    writeln!(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> HardwareSnapshot {
        HardwareSnapshot {
            identifier: "/intelcpu/0".into(),
            name: "Intel Core i7-8700K".into(),
            hardware_type: HardwareType::Cpu,
            sensors: vec![
                SensorReading {
                    identifier: "/intelcpu/0/temperature/0".into(),
                    name: "CPU Core #1".into(),
                    sensor_type: SensorType::Temperature,
                    index: 0,
                    value: Some(61.0),
                    min: Some(58.0),
                    max: Some(64.0),
                    unit: "°C",
                },
                SensorReading {
                    identifier: "/intelcpu/0/power/0".into(),
                    name: "CPU Package".into(),
                    sensor_type: SensorType::Power,
                    index: 0,
                    value: None,
                    min: None,
                    max: None,
                    unit: "W",
                },
            ],
        }
    }

    #[test]
    fn test_format_value_precision() {
        assert_eq!(format_value(SensorType::Voltage, Some(1.2)), "1.200");
        assert_eq!(format_value(SensorType::Clock, Some(3700.04)), "3700.0");
        assert_eq!(format_value(SensorType::Power, None), "-");
    }

    #[test]
    fn test_text_groups_by_type() {
        let mut buf = Vec::new();
        write_text(&mut buf, &[node()]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("Intel Core i7-8700K (/intelcpu/0)\n  Temperature\n"));
        assert!(text.contains("  Power\n"));
        assert!(text.contains("CPU Core #1"));
    }

    #[test]
    fn test_json_line_is_single_line() {
        let nodes = [node()];
        let mut buf = Vec::new();
        write_json_line(&mut buf, &Sample { sample: 3, hardware: &nodes }).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["sample"], 3);
        assert_eq!(value["hardware"][0]["sensors"][0]["sensor_type"], "Temperature");
        assert!(value["hardware"][0]["sensors"][1]["value"].is_null());
    }
}
