//! Host CPU and memory sampling
//!
//! On Linux both readings come from procfs. Elsewhere on Unix CPU load is
//! approximated from the load average. A reading that cannot be taken is
//! logged and reported as 0 so the controller keeps working.

use crate::error::ResourceSampleError;
use std::time::Duration;
use tracing::{debug, warn};

/// One utilization reading, both values in percent (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Source of utilization readings consulted at pool checkpoints.
pub trait ResourceMonitor: Send + Sync {
    /// Take a reading. May block for a short sampling window; never fails.
    fn sample(&self) -> ResourceSample;
}

/// Reads utilization of the machine the process runs on.
#[derive(Debug, Clone)]
pub struct SystemMonitor {
    window: Duration,
}

impl SystemMonitor {
    /// `window` is how long CPU counters are observed for each sample.
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    #[cfg(target_os = "linux")]
    fn cpu_percent(&self) -> Result<f32, ResourceSampleError> {
        let before = read_cpu_times()?;
        std::thread::sleep(self.window);
        let after = read_cpu_times()?;
        Ok(before.busy_percent_until(&after))
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    fn cpu_percent(&self) -> Result<f32, ResourceSampleError> {
        let mut load = [0f64; 1];
        // SAFETY: the buffer holds exactly the one sample requested.
        let read = unsafe { libc::getloadavg(load.as_mut_ptr(), 1) };
        if read < 1 {
            return Err(ResourceSampleError::Read {
                source_name: "getloadavg",
                message: "no load average available".to_string(),
            });
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        Ok(((load[0] / cpus) * 100.0).clamp(0.0, 100.0) as f32)
    }

    #[cfg(not(unix))]
    fn cpu_percent(&self) -> Result<f32, ResourceSampleError> {
        Err(ResourceSampleError::Unsupported("CPU utilization"))
    }

    #[cfg(target_os = "linux")]
    fn memory_percent(&self) -> Result<f32, ResourceSampleError> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").map_err(|e| {
            ResourceSampleError::Read {
                source_name: "/proc/meminfo",
                message: e.to_string(),
            }
        })?;
        parse_memory_percent(&meminfo).ok_or(ResourceSampleError::Read {
            source_name: "/proc/meminfo",
            message: "MemTotal/MemAvailable missing".to_string(),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn memory_percent(&self) -> Result<f32, ResourceSampleError> {
        Err(ResourceSampleError::Unsupported("memory utilization"))
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl ResourceMonitor for SystemMonitor {
    fn sample(&self) -> ResourceSample {
        let cpu_percent = self.cpu_percent().unwrap_or_else(|e| {
            warn!(error = %e, "CPU sample failed, assuming 0%");
            0.0
        });
        let memory_percent = self.memory_percent().unwrap_or_else(|e| {
            warn!(error = %e, "Memory sample failed, assuming 0%");
            0.0
        });
        debug!(cpu_percent, memory_percent, "Resource sample");
        ResourceSample {
            cpu_percent,
            memory_percent,
        }
    }
}

/// Aggregate jiffy counters from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

impl CpuTimes {
    fn busy_percent_until(&self, later: &CpuTimes) -> f32 {
        let total = later.total.saturating_sub(self.total);
        if total == 0 {
            return 0.0;
        }
        let idle = later.idle.saturating_sub(self.idle).min(total);
        ((total - idle) as f64 / total as f64 * 100.0) as f32
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Result<CpuTimes, ResourceSampleError> {
    let stat = std::fs::read_to_string("/proc/stat").map_err(|e| ResourceSampleError::Read {
        source_name: "/proc/stat",
        message: e.to_string(),
    })?;
    parse_cpu_times(&stat).ok_or(ResourceSampleError::Read {
        source_name: "/proc/stat",
        message: "no aggregate cpu line".to_string(),
    })
}

/// Parse `cpu  user nice system idle iowait irq softirq steal ...`.
/// Guest time is already counted in user time and is skipped.
fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|f| f.parse().ok())
        .collect::<Option<_>>()?;
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

/// Used memory as `(MemTotal - MemAvailable) / MemTotal`.
fn parse_memory_percent(meminfo: &str) -> Option<f32> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some((used as f64 / total as f64 * 100.0) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aggregate_cpu_line() {
        let stat = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\n";
        let times = parse_cpu_times(stat).unwrap();
        assert_eq!(times, CpuTimes { idle: 850, total: 1000 });
    }

    #[test]
    fn busy_percent_from_deltas() {
        let before = CpuTimes { idle: 850, total: 1000 };
        let after = CpuTimes { idle: 900, total: 1200 };
        // 200 jiffies elapsed, 50 idle
        assert_eq!(before.busy_percent_until(&after), 75.0);
        assert_eq!(before.busy_percent_until(&before), 0.0);
    }

    #[test]
    fn rejects_garbage_stat() {
        assert!(parse_cpu_times("intr 1 2 3\n").is_none());
        assert!(parse_cpu_times("cpu  a b c d\n").is_none());
    }

    #[test]
    fn parses_meminfo() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        assert_eq!(parse_memory_percent(meminfo), Some(75.0));
        assert_eq!(parse_memory_percent("MemTotal: 0 kB\nMemAvailable: 0 kB\n"), None);
        assert_eq!(parse_memory_percent("MemFree: 1 kB\n"), None);
    }

    #[test]
    fn system_sample_stays_in_range() {
        let sample = SystemMonitor::new(Duration::from_millis(10)).sample();
        assert!((0.0..=100.0).contains(&sample.cpu_percent));
        assert!((0.0..=100.0).contains(&sample.memory_percent));
    }
}
