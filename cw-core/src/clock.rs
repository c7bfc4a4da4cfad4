//! Time-stamp counter frequency estimation
//!
//! The TSC frequency is estimated once by busy-waiting over short windows of
//! a monotonic clock and counting cycles. On processors with an invariant
//! TSC the estimate is then refined on every update from the counter delta
//! over the polling interval, which is far longer and therefore far more
//! precise than the calibration windows.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::constants::clock::{
    MAX_ERROR, MAX_RUNS, REFINE_MAX_SECONDS, REFINE_MIN_SECONDS, START_OFFSET_FRACTION,
    WARMUP_RUNS, WINDOW_SECONDS,
};
use crate::error::{CorewatchError, Result};

/// A high resolution monotonic timer.
pub trait TimeSource: Send + Sync {
    fn ticks(&self) -> i64;

    /// Ticks per second.
    fn frequency(&self) -> f64;
}

/// A free running cycle counter.
pub trait CycleCounter: Send + Sync {
    fn read(&self) -> u64;
}

/// Monotonic clock with nanosecond ticks.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn ticks(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }

    fn frequency(&self) -> f64 {
        1e9
    }
}

/// The processor's time-stamp counter. Reads 0 on targets without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tsc;

impl CycleCounter for Tsc {
    #[cfg(target_arch = "x86_64")]
    fn read(&self) -> u64 {
        // SAFETY: rdtsc is available on every x86_64 processor.
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn read(&self) -> u64 {
        0
    }
}

/// Deterministic timer and counter for the simulator.
///
/// Time advances one tick per read and the counter runs a fixed number of
/// cycles per tick, so the calibrated frequency is exact.
#[derive(Debug)]
pub struct SteppingClock {
    now: AtomicI64,
    ticks_per_second: f64,
    cycles_per_tick: u64,
}

impl SteppingClock {
    pub fn new(ticks_per_second: f64, cycles_per_tick: u64) -> Self {
        Self {
            now: AtomicI64::new(1_000),
            ticks_per_second,
            cycles_per_tick,
        }
    }

    /// A 1 MHz timer with a counter at `mhz`.
    pub fn at_mhz(mhz: u64) -> Self {
        Self::new(1e6, mhz)
    }

    /// Jump the timer forward without counting a read.
    pub fn advance(&self, ticks: i64) {
        self.now.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl TimeSource for SteppingClock {
    fn ticks(&self) -> i64 {
        self.now.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn frequency(&self) -> f64 {
        self.ticks_per_second
    }
}

impl CycleCounter for SteppingClock {
    fn read(&self) -> u64 {
        (self.now.load(Ordering::SeqCst) as u64).wrapping_mul(self.cycles_per_tick)
    }
}

/// One busy-wait measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// MHz
    pub frequency: f64,
    /// Relative timing error of the window
    pub error: f64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    time: i64,
    count: u64,
}

pub struct ClockCalibrator {
    time: Arc<dyn TimeSource>,
    counter: Arc<dyn CycleCounter>,
    estimated: f64,
    estimated_error: f64,
    frequency: f64,
    last: Option<Sample>,
}

impl ClockCalibrator {
    pub fn new(time: Arc<dyn TimeSource>, counter: Arc<dyn CycleCounter>) -> Self {
        Self {
            time,
            counter,
            estimated: 0.0,
            estimated_error: f64::INFINITY,
            frequency: 0.0,
            last: None,
        }
    }

    /// Calibrator over the OS clock and the real TSC.
    pub fn native() -> Self {
        Self::new(Arc::new(MonotonicClock::new()), Arc::new(Tsc))
    }

    pub fn time_source(&self) -> &dyn TimeSource {
        self.time.as_ref()
    }

    /// Count cycles across a window of `window` seconds.
    pub fn measure(&self, window: f64) -> Measurement {
        let ticks_per_second = self.time.frequency();
        let ticks = (window * ticks_per_second) as i64;

        let begin = self.time.ticks() + (START_OFFSET_FRACTION * ticks as f64).ceil() as i64;
        let end = begin + ticks;

        while self.time.ticks() < begin {}
        let count_begin = self.counter.read();
        let after_begin = self.time.ticks();

        while self.time.ticks() < end {}
        let count_end = self.counter.read();
        let after_end = self.time.ticks();

        let delta = (end - begin) as f64;
        if delta <= 0.0 {
            return Measurement { frequency: 0.0, error: f64::INFINITY };
        }

        let cycles = count_end.wrapping_sub(count_begin) as f64;
        Measurement {
            frequency: 1e-6 * cycles * ticks_per_second / delta,
            error: (after_begin - begin) as f64 / delta + (after_end - end) as f64 / delta,
        }
    }

    /// Run the full calibration and return the estimate in MHz.
    ///
    /// The caller pins the thread; the counter must not migrate mid-window.
    pub fn calibrate(&mut self) -> f64 {
        for _ in 0..WARMUP_RUNS {
            self.measure(0.0);
        }

        let mut best = Measurement { frequency: 0.0, error: f64::INFINITY };
        for run in 0..MAX_RUNS {
            let m = self.measure(WINDOW_SECONDS);
            trace!(run, frequency = m.frequency, error = m.error, "Calibration window");
            if m.error < best.error {
                best = m;
            }
            if best.error < MAX_ERROR {
                break;
            }
        }

        debug!(frequency = best.frequency, error = best.error, "TSC calibrated");
        self.estimated = best.frequency;
        self.estimated_error = best.error;
        self.frequency = best.frequency;
        self.estimated
    }

    /// Seed the estimate without measuring, for processors without a TSC.
    pub fn set_frequency(&mut self, frequency: f64) {
        self.estimated = frequency;
        self.frequency = frequency;
    }

    /// Current frequency in MHz, refined when possible.
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn estimated_frequency(&self) -> f64 {
        self.estimated
    }

    pub fn estimated_error(&self) -> f64 {
        self.estimated_error
    }

    /// Ok when the calibration window error stayed below the threshold.
    pub fn precision(&self) -> Result<()> {
        if self.estimated_error < MAX_ERROR {
            Ok(())
        } else {
            Err(CorewatchError::CalibrationImprecise {
                error: self.estimated_error,
                threshold: MAX_ERROR,
            })
        }
    }

    /// Take one refinement sample. The caller pins the thread.
    pub fn refine(&mut self) {
        let before = self.time.ticks();
        let count = self.counter.read();
        let after = self.time.ticks();
        self.observe(before, count, after);
    }

    /// Feed a (time, counter, time) triple into the steady-state estimate.
    pub fn observe(&mut self, before: i64, count: u64, after: i64) {
        let ticks_per_second = self.time.frequency();
        let error = (after - before) as f64 / ticks_per_second;
        if error >= MAX_ERROR {
            trace!(error, "Refinement sample too noisy");
            return;
        }

        if let Some(last) = self.last {
            let delta = (after - last.time) as f64 / ticks_per_second;
            if delta > REFINE_MIN_SECONDS && delta < REFINE_MAX_SECONDS {
                self.frequency = count.wrapping_sub(last.count) as f64 / (1e6 * delta);
            }
        }
        self.last = Some(Sample { time: after, count });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibrator(source: Arc<SteppingClock>) -> ClockCalibrator {
        ClockCalibrator::new(source.clone(), source)
    }

    #[test]
    fn test_synthetic_clock_converges() {
        // 1 MHz timer, 3000 cycles per tick => 3 GHz
        let source = Arc::new(SteppingClock::new(1e6, 3000));
        let mut c = calibrator(source);
        let f = c.calibrate();
        assert!((f - 3000.0).abs() / 3000.0 < 1e-3, "estimated {f}");
        assert!(c.precision().is_ok());
        assert_eq!(c.frequency(), f);
    }

    #[test]
    fn test_zero_window_is_infinitely_imprecise() {
        let c = calibrator(Arc::new(SteppingClock::new(1e6, 10)));
        let m = c.measure(0.0);
        assert_eq!(m.frequency, 0.0);
        assert!(m.error.is_infinite());
    }

    #[test]
    fn test_coarse_timer_is_imprecise() {
        // 1 kHz timer: 25 ticks per window, each overshoot is 1/25
        let mut c = calibrator(Arc::new(SteppingClock::new(1e3, 1_000_000)));
        c.calibrate();
        assert!(matches!(c.precision(), Err(CorewatchError::CalibrationImprecise { .. })));
    }

    #[test]
    fn test_refinement_uses_counter_delta() {
        let source = Arc::new(SteppingClock::new(1e6, 1));
        let mut c = calibrator(source);
        c.set_frequency(2000.0);

        // First sample only sets the baseline.
        c.observe(0, 0, 10);
        assert_eq!(c.frequency(), 2000.0);

        // One second later, 3.6e9 cycles elapsed.
        c.observe(1_000_000, 3_600_000_000, 1_000_010);
        assert!((c.frequency() - 3600.0).abs() < 1e-6);
    }

    #[test]
    fn test_refinement_ignores_out_of_range_windows() {
        let mut c = calibrator(Arc::new(SteppingClock::new(1e6, 1)));
        c.set_frequency(2000.0);
        c.observe(0, 0, 10);
        // 0.2 s window: baseline moves, estimate does not
        c.observe(200_000, 1_000_000_000, 200_010);
        assert_eq!(c.frequency(), 2000.0);
        // 3 s window from the new baseline
        c.observe(3_200_000, 9_000_000_000, 3_200_010);
        assert_eq!(c.frequency(), 2000.0);
    }

    #[test]
    fn test_refinement_rejects_noisy_samples() {
        let mut c = calibrator(Arc::new(SteppingClock::new(1e6, 1)));
        c.set_frequency(2000.0);
        c.observe(0, 0, 10);
        // 200 us between the two time reads
        c.observe(1_000_000, 3_000_000_000, 1_000_200);
        assert_eq!(c.frequency(), 2000.0);
        c.observe(1_000_000, 3_000_000_000, 1_000_010);
        assert!((c.frequency() - 3000.0).abs() < 1.0);
    }

    #[test]
    fn test_refinement_counter_wraps() {
        let mut c = calibrator(Arc::new(SteppingClock::new(1e6, 1)));
        c.observe(0, u64::MAX - 99, 10);
        c.observe(1_000_000, 1_000_000_000 - 100, 1_000_010);
        assert!((c.frequency() - 1000.0).abs() < 1e-6);
    }
}
