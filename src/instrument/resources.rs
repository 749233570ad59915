//! Process resource sampling around instrumented calls

use crate::events::ResourceUsage;
use std::sync::Mutex;
use sysinfo::{Pid, System};

/// Samples the current process's resident memory and CPU usage
///
/// One sampler is shared by every wrapper of a monitor. CPU usage reported by
/// sysinfo covers the time since the previous refresh, so concurrent calls
/// get an estimate rather than an exact per-call figure.
pub struct ResourceSampler {
    system: Mutex<System>,
    pid: Pid,
}

#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub memory_bytes: u64,
    pub cpu_percent: f64,
}

impl ResourceSampler {
    pub fn new() -> Self {
        let pid = Pid::from_u32(std::process::id());
        let mut system = System::new();
        system.refresh_process(pid);
        Self {
            system: Mutex::new(system),
            pid,
        }
    }

    pub fn sample(&self) -> Sample {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        if !system.refresh_process(self.pid) {
            return Sample {
                memory_bytes: 0,
                cpu_percent: 0.0,
            };
        }
        system
            .process(self.pid)
            .map(|p| Sample {
                memory_bytes: p.memory(),
                cpu_percent: p.cpu_usage() as f64,
            })
            .unwrap_or(Sample {
                memory_bytes: 0,
                cpu_percent: 0.0,
            })
    }

    /// Combine the samples taken before and after a call
    pub fn usage_between(before: Sample, after: Sample) -> ResourceUsage {
        ResourceUsage {
            memory_peak_bytes: before.memory_bytes.max(after.memory_bytes),
            cpu_percent: after.cpu_percent,
        }
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_is_max_of_samples() {
        let usage = ResourceSampler::usage_between(
            Sample { memory_bytes: 10, cpu_percent: 1.0 },
            Sample { memory_bytes: 7, cpu_percent: 3.5 },
        );
        assert_eq!(usage.memory_peak_bytes, 10);
        assert_eq!(usage.cpu_percent, 3.5);
    }

    #[test]
    fn test_sampling_current_process() {
        let sampler = ResourceSampler::new();
        let sample = sampler.sample();
        assert!(sample.cpu_percent >= 0.0);
    }
}
