use std::time::Instant;
use sysinfo::{System, MINIMUM_CPU_UPDATE_INTERVAL};
use tracing::{debug, warn};

use crate::admission::SystemMetrics;

/// Samples host CPU and memory load for admission and overload checks.
///
/// CPU usage is a delta between two refreshes, and refreshes closer together
/// than `MINIMUM_CPU_UPDATE_INTERVAL` give noise. Readings are cached and only
/// renewed once that interval has passed.
pub struct SystemSampler {
    sys: System,
    last_refresh: Instant,
    cpu_usage_percent: f32,
    memory_usage_percent: f32,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        // Baseline for the first CPU delta.
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let memory_usage_percent = memory_percent(&sys);
        Self {
            sys,
            last_refresh: Instant::now(),
            cpu_usage_percent: 0.0,
            memory_usage_percent,
        }
    }

    pub fn sample(&mut self, voice_queue_length: usize) -> SystemMetrics {
        if self.last_refresh.elapsed() >= MINIMUM_CPU_UPDATE_INTERVAL {
            self.refresh();
        } else {
            debug!("telemetry: reusing cached load reading");
        }

        SystemMetrics {
            cpu_usage_percent: self.cpu_usage_percent,
            memory_usage_percent: self.memory_usage_percent,
            voice_queue_length,
        }
    }

    fn refresh(&mut self) {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.last_refresh = Instant::now();

        let cpu = self.sys.global_cpu_usage();
        self.cpu_usage_percent = if cpu.is_finite() {
            cpu.clamp(0.0, 100.0)
        } else {
            warn!(cpu, "telemetry: non-finite CPU reading, reporting 0%");
            0.0
        };
        self.memory_usage_percent = memory_percent(&self.sys);
    }
}

fn memory_percent(sys: &System) -> f32 {
    let total = sys.total_memory();
    if total == 0 {
        warn!("telemetry: total memory reported as 0, reporting 0%");
        return 0.0;
    }
    (sys.used_memory() as f64 / total as f64 * 100.0) as f32
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}
