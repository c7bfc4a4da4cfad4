//! Processor utilisation from OS time accounting

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::constants::{load, paths};

/// `(idle, total)` time per logical CPU in 100 ns units, indexed by CPU
/// number. `None` marks a CPU the OS has no row for, e.g. one taken offline.
pub type CpuTimes = Vec<Option<(i64, i64)>>;

#[cfg_attr(test, mockall::automock)]
pub trait ProcessorTimes: Send + Sync {
    fn read(&self) -> Option<CpuTimes>;
}

/// `/proc/stat` backed times.
#[derive(Debug, Clone)]
pub struct ProcStat {
    path: PathBuf,
    units_per_tick: f64,
}

impl ProcStat {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            units_per_tick: load::UNITS_PER_SECOND / clock_ticks_per_second(),
        }
    }

    /// Parse `/proc/stat` contents into per-CPU times.
    ///
    /// idle is `idle + iowait`, total is the sum of the first eight fields
    /// (guest time is already included in user).
    pub fn parse(&self, contents: &str) -> Option<CpuTimes> {
        let mut times: Vec<(usize, i64, i64)> = Vec::new();
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let Some(label) = fields.next() else {
                continue;
            };
            let Some(cpu) = label.strip_prefix("cpu").and_then(|n| n.parse::<usize>().ok()) else {
                continue;
            };
            let values: Vec<i64> = fields.take(8).filter_map(|f| f.parse().ok()).collect();
            if values.len() < 4 {
                continue;
            }
            let idle = values[3] + values.get(4).copied().unwrap_or(0);
            let total: i64 = values.iter().sum();
            times.push((
                cpu,
                (idle as f64 * self.units_per_tick) as i64,
                (total as f64 * self.units_per_tick) as i64,
            ));
        }
        if times.is_empty() {
            return None;
        }

        let len = times.iter().map(|(cpu, _, _)| cpu + 1).max().unwrap_or(0);
        let mut out = vec![None; len];
        for (cpu, idle, total) in times {
            out[cpu] = Some((idle, total));
        }
        Some(out)
    }
}

impl Default for ProcStat {
    fn default() -> Self {
        Self::new(paths::PROC_STAT)
    }
}

impl ProcessorTimes for ProcStat {
    fn read(&self) -> Option<CpuTimes> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => self.parse(&contents),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Processor times unavailable");
                None
            }
        }
    }
}

fn clock_ticks_per_second() -> f64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

/// Load of one processor package, per core and in total.
pub struct CpuLoad {
    source: Arc<dyn ProcessorTimes>,
    cores: Vec<Vec<usize>>,
    last: Option<CpuTimes>,
    core_loads: Vec<f32>,
    total_load: f32,
}

impl CpuLoad {
    /// `cores` lists the logical CPU numbers of each core.
    pub fn new(source: Arc<dyn ProcessorTimes>, cores: Vec<Vec<usize>>) -> Self {
        let last = source.read();
        let core_loads = vec![0.0; cores.len()];
        Self {
            source,
            cores,
            last,
            core_loads,
            total_load: 0.0,
        }
    }

    pub fn is_available(&self) -> bool {
        self.last.is_some()
    }

    pub fn core_load(&self, core: usize) -> f32 {
        self.core_loads.get(core).copied().unwrap_or(0.0)
    }

    pub fn total_load(&self) -> f32 {
        self.total_load
    }

    pub fn update(&mut self) {
        let Some(last) = self.last.as_ref() else {
            return;
        };
        let Some(now) = self.source.read() else {
            return;
        };

        // CPUs missing from either sample contribute nothing
        let delta = |cpu: usize| -> Option<(i64, i64)> {
            let n = now.get(cpu).copied().flatten()?;
            let l = last.get(cpu).copied().flatten()?;
            Some((n.0 - l.0, n.1 - l.1))
        };

        if self
            .cores
            .iter()
            .flatten()
            .filter_map(|&t| delta(t))
            .any(|d| d.1 < load::MIN_ELAPSED_UNITS)
        {
            trace!("Load sample too close to the previous one");
            return;
        }

        let (mut all_idle, mut all_total) = (0i64, 0i64);
        for (i, threads) in self.cores.iter().enumerate() {
            let (mut idle, mut total) = (0i64, 0i64);
            for d in threads.iter().filter_map(|&t| delta(t)) {
                idle += d.0;
                total += d.1;
            }
            all_idle += idle;
            all_total += total;
            self.core_loads[i] = utilisation(idle, total);
        }
        self.total_load = utilisation(all_idle, all_total);
        self.last = Some(now);
    }
}

fn utilisation(idle: i64, total: i64) -> f32 {
    if total <= 0 {
        return 0.0;
    }
    let busy = 1.0 - idle as f64 / total as f64;
    (busy.max(0.0) * 100.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    const STAT: &str = "cpu  100 0 100 800 0 0 0 0 0 0\n\
cpu0 50 0 50 400 0 0 0 0 0 0\n\
cpu1 50 0 50 380 20 0 0 0 0 0\n\
intr 12345\n";

    fn sample(rows: &[(i64, i64)]) -> Option<CpuTimes> {
        Some(rows.iter().copied().map(Some).collect())
    }

    fn scripted(samples: Vec<Option<CpuTimes>>) -> Arc<dyn ProcessorTimes> {
        let mut mock = MockProcessorTimes::new();
        let mut seq = Sequence::new();
        for sample in samples {
            mock.expect_read()
                .times(1)
                .in_sequence(&mut seq)
                .return_const(sample);
        }
        Arc::new(mock)
    }

    #[test]
    fn test_parse_proc_stat() {
        let stat = ProcStat { path: PathBuf::new(), units_per_tick: 1.0 };
        let times = stat.parse(STAT).unwrap();
        assert_eq!(times, vec![Some((400, 500)), Some((400, 500))]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let stat = ProcStat { path: PathBuf::new(), units_per_tick: 1.0 };
        assert!(stat.parse("intr 1 2 3\n").is_none());
    }

    #[test]
    fn test_per_core_and_total_load() {
        let source = scripted(vec![
            sample(&[(0, 0), (0, 0), (0, 0), (0, 0)]),
            sample(&[(250_000, 1_000_000), (750_000, 1_000_000), (1_000_000, 1_000_000), (1_000_000, 1_000_000)]),
        ]);
        let mut load = CpuLoad::new(source, vec![vec![0, 1], vec![2, 3]]);
        assert!(load.is_available());
        load.update();
        assert!((load.core_load(0) - 50.0).abs() < 1e-3);
        assert_eq!(load.core_load(1), 0.0);
        assert!((load.total_load() - 25.0).abs() < 1e-3);
    }

    #[test]
    fn test_short_interval_is_skipped() {
        let source = scripted(vec![
            sample(&[(0, 0), (0, 0)]),
            sample(&[(0, 1_000_000), (0, 50_000)]),
        ]);
        let mut load = CpuLoad::new(source, vec![vec![0], vec![1]]);
        load.update();
        assert_eq!(load.core_load(0), 0.0);
        assert_eq!(load.total_load(), 0.0);
    }

    #[test]
    fn test_unavailable_source() {
        let source = scripted(vec![None]);
        let mut load = CpuLoad::new(source, vec![vec![0]]);
        assert!(!load.is_available());
        load.update();
        assert_eq!(load.total_load(), 0.0);
    }

    #[test]
    fn test_idle_above_total_clamps_to_zero() {
        let source = scripted(vec![
            sample(&[(0, 0)]),
            sample(&[(2_000_000, 1_000_000)]),
        ]);
        let mut load = CpuLoad::new(source, vec![vec![0]]);
        load.update();
        assert_eq!(load.core_load(0), 0.0);
    }

    #[test]
    fn test_parse_leaves_gaps_for_offline_cpus() {
        let stat = ProcStat { path: PathBuf::new(), units_per_tick: 1.0 };
        let times = stat
            .parse("cpu  1 0 1 8 0 0 0 0\ncpu0 1 0 1 4 0 0 0 0\ncpu2 0 0 0 4 0 0 0 0\n")
            .unwrap();
        assert_eq!(times, vec![Some((4, 6)), None, Some((4, 4))]);
    }

    #[test]
    fn test_offline_cpu_does_not_stall_load() {
        let stat = ProcStat { path: PathBuf::new(), units_per_tick: 100_000.0 };
        let before = "cpu0 0 0 0 0 0 0 0 0\ncpu2 0 0 0 0 0 0 0 0\n";
        let after = "cpu0 50 0 0 50 0 0 0 0\ncpu2 100 0 0 0 0 0 0 0\n";
        let source = scripted(vec![stat.parse(before), stat.parse(after)]);

        // cpu1 is offline but still listed in the topology
        let mut load = CpuLoad::new(source, vec![vec![0], vec![1], vec![2]]);
        load.update();
        assert!((load.core_load(0) - 50.0).abs() < 1e-3);
        assert_eq!(load.core_load(1), 0.0);
        assert!((load.core_load(2) - 100.0).abs() < 1e-3);
        assert!((load.total_load() - 75.0).abs() < 1e-3);
    }
}
