//! Energy counter deltas
//!
//! RAPL style energy registers are free running 32-bit counters. Power is
//! the wrapped counter delta over the wall-clock interval between samples.

use crate::constants::power::MIN_ENERGY_INTERVAL;

/// Counter delta from `from` to `to`, allowing one wrap.
pub fn wrapping_delta(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}

#[derive(Debug, Clone, Copy)]
pub struct EnergyCounter {
    last_value: u32,
    last_time: f64,
}

impl EnergyCounter {
    /// Start tracking from a first raw sample taken at `time` seconds.
    pub fn new(value: u32, time: f64) -> Self {
        Self {
            last_value: value,
            last_time: time,
        }
    }

    /// Counter units per second since the previous sample.
    ///
    /// Samples closer than the minimum interval are ignored and leave the
    /// baseline untouched.
    pub fn rate(&mut self, value: u32, time: f64) -> Option<f64> {
        let elapsed = time - self.last_time;
        if elapsed < MIN_ENERGY_INTERVAL {
            return None;
        }
        let delta = wrapping_delta(self.last_value, value);
        self.last_value = value;
        self.last_time = time;
        Some(delta as f64 / elapsed)
    }

    pub fn last_value(&self) -> u32 {
        self.last_value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_delta() {
        assert_eq!(wrapping_delta(0xFFFF_FFF0, 0x10), 0x20);
        assert_eq!(wrapping_delta(5, 9), 4);
    }

    #[test]
    fn test_rate_over_wrap() {
        let mut c = EnergyCounter::new(0xFFFF_FFF0, 10.0);
        let r = c.rate(0x10, 10.5).unwrap();
        assert!((r - 64.0).abs() < 1e-9);
        assert_eq!(c.last_value(), 0x10);
    }

    #[test]
    fn test_short_interval_keeps_baseline() {
        let mut c = EnergyCounter::new(100, 1.0);
        assert!(c.rate(200, 1.001).is_none());
        assert_eq!(c.last_value(), 100);
        let r = c.rate(300, 2.0).unwrap();
        assert!((r - 200.0).abs() < 1e-9);
    }
}
