//! Background overload watch.
//!
//! Samples host load on a fixed interval and sheds one unit of backend
//! concurrency once the host has stayed hot for several samples in a row.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::admission::SystemMetrics;
use crate::dispatcher::ResilientDispatcher;
use crate::telemetry::SystemSampler;

#[derive(Debug, Clone)]
pub struct OverloadConfig {
    pub interval: Duration,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    /// Consecutive hot samples before degrading. 0 disables degrading.
    pub degrade_after: u32,
}

impl Default for OverloadConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            cpu_percent: 90.0,
            memory_percent: 90.0,
            degrade_after: 3,
        }
    }
}

/// Counts consecutive hot samples.
#[derive(Debug)]
pub struct OverloadDetector {
    config: OverloadConfig,
    hot_streak: u32,
}

impl OverloadDetector {
    pub fn new(config: OverloadConfig) -> Self {
        Self {
            config,
            hot_streak: 0,
        }
    }

    /// Feed one sample. Returns true when the caller should degrade now; the
    /// streak restarts after every trigger.
    pub fn observe(&mut self, metrics: &SystemMetrics) -> bool {
        let hot = metrics.cpu_usage_percent > self.config.cpu_percent
            || metrics.memory_usage_percent > self.config.memory_percent;
        if !hot {
            self.hot_streak = 0;
            return false;
        }
        self.hot_streak += 1;
        if self.config.degrade_after > 0 && self.hot_streak >= self.config.degrade_after {
            self.hot_streak = 0;
            return true;
        }
        false
    }

    pub fn hot_streak(&self) -> u32 {
        self.hot_streak
    }
}

pub struct OverloadMonitor {
    dispatcher: Arc<ResilientDispatcher>,
    sampler: Arc<Mutex<SystemSampler>>,
    detector: OverloadDetector,
    interval: Duration,
}

impl OverloadMonitor {
    pub fn new(
        dispatcher: Arc<ResilientDispatcher>,
        sampler: Arc<Mutex<SystemSampler>>,
        config: OverloadConfig,
    ) -> Self {
        Self {
            dispatcher,
            sampler,
            interval: config.interval,
            detector: OverloadDetector::new(config),
        }
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                let metrics = self
                    .sampler
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .sample(0);
                debug!(
                    cpu = metrics.cpu_usage_percent,
                    memory = metrics.memory_usage_percent,
                    "overload: sample"
                );
                if self.detector.observe(&metrics) {
                    let capacity = self.dispatcher.degrade();
                    warn!(
                        cpu = metrics.cpu_usage_percent,
                        memory = metrics.memory_usage_percent,
                        capacity,
                        "overload: host stayed hot, degraded backend concurrency"
                    );
                }
            }
        })
    }
}
