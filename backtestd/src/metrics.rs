//! Process resource sampling for heartbeat status reports.
//!
//! Samples CPU and memory of this process via sysinfo. Readings feed the
//! advisory metrics in each heartbeat; staleness of one interval is fine.

use parking_lot::Mutex;
use sysinfo::{Pid, System};
use tracing::debug;

/// One CPU/memory reading for this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// Reusable sampler; keeps the sysinfo state between refreshes so CPU
/// percentages are computed against the previous reading.
pub struct ResourceSampler {
    system: Mutex<System>,
    pid: Pid,
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// Refresh and read CPU/memory for this process.
    pub fn sample(&self) -> ResourceSample {
        let mut system = self.system.lock();
        system.refresh_process(self.pid);
        match system.process(self.pid) {
            Some(process) => ResourceSample {
                cpu_percent: process.cpu_usage(),
                memory_bytes: process.memory(),
            },
            None => {
                debug!("own process not visible to sysinfo, reporting zeros");
                ResourceSample::default()
            }
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
    fn samples_own_process() {
        let sampler = ResourceSampler::new();
        let sample = sampler.sample();
        // We exist, so memory cannot be zero.
        assert!(sample.memory_bytes > 0);
    }
}
