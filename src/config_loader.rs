use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::admission::AdmissionPolicy;
use crate::backends::GenerateOptions;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dispatcher::DispatcherConfig;
use crate::overload::OverloadConfig;
use crate::request_queue::QueueConfig;
use crate::router::RouterConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Local backend
    pub ollama_url: String,
    pub ollama_model: String,
    pub ollama_keep_alive: String,
    pub default_temperature: f32,
    pub default_max_tokens: u32,
    // Guardian ("" disables the intake probe)
    pub guardian_url: String,
    pub guardian_timeout_ms: u64,
    pub guardian_fail_closed: bool,
    // Router
    pub default_latency_budget_ms: u32,
    pub latency_override_threshold_ms: u32,
    // Admission
    pub rate_window_secs: u64,
    pub burst_rps: u32,
    pub sustained_rps: f64,
    pub max_queue_length: usize,
    pub cpu_emergency_percent: f32,
    pub memory_emergency_percent: f32,
    pub emergency_min_duration_secs: u64,
    pub admission_failure_threshold: u32,
    pub block_probe_interval_secs: u64,
    // Circuit breaker and queue
    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_recovery_timeout_secs: u64,
    pub backend_timeout_secs: u64,
    pub max_concurrent: usize,
    // Overload monitor
    pub overload_check_interval_secs: u64,
    pub overload_degrade_after: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3".to_string(),
            ollama_keep_alive: "5m".to_string(),
            default_temperature: 0.7,
            default_max_tokens: 256,
            guardian_url: String::new(),
            guardian_timeout_ms: 500,
            guardian_fail_closed: false,
            default_latency_budget_ms: 500,
            latency_override_threshold_ms: 300,
            rate_window_secs: 60,
            burst_rps: 10,
            sustained_rps: 5.0,
            max_queue_length: 10,
            cpu_emergency_percent: 90.0,
            memory_emergency_percent: 90.0,
            emergency_min_duration_secs: 30,
            admission_failure_threshold: 3,
            block_probe_interval_secs: 30,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_recovery_timeout_secs: 30,
            backend_timeout_secs: 45,
            max_concurrent: 2,
            overload_check_interval_secs: 10,
            overload_degrade_after: 3,
        }
    }
}

/// `$XDG_CONFIG_HOME/speechd-gate/Gate`, if a config directory exists.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("speechd-gate").join("Gate"))
}

impl Settings {
    /// Defaults, then `./Gate.*`, then the per-user config file, then `GATE_*`
    /// environment variables.
    pub fn new() -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::with_name("Gate").required(false));
        if let Some(path) = user_config_path() {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings: Settings = builder
            .add_source(Environment::with_prefix("GATE").try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults overlaid with a single explicit file (used by `--config`).
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::Message(msg));

        if self.max_concurrent == 0 {
            return fail("max_concurrent must be greater than 0".to_string());
        }
        if self.burst_rps == 0 {
            return fail("burst_rps must be greater than 0".to_string());
        }
        if self.sustained_rps <= 0.0 {
            return fail(format!(
                "Invalid sustained_rps: {}. Must be positive",
                self.sustained_rps
            ));
        }
        if self.rate_window_secs == 0 {
            return fail("rate_window_secs must be greater than 0".to_string());
        }
        for (name, value) in [
            ("cpu_emergency_percent", self.cpu_emergency_percent),
            ("memory_emergency_percent", self.memory_emergency_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return fail(format!(
                    "Invalid {}: {}. Must be between 0 and 100",
                    name, value
                ));
            }
        }
        if self.admission_failure_threshold == 0
            || self.breaker_failure_threshold == 0
            || self.breaker_success_threshold == 0
        {
            return fail("failure and success thresholds must be greater than 0".to_string());
        }
        if self.backend_timeout_secs == 0 {
            return fail("backend_timeout_secs must be greater than 0".to_string());
        }
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return fail(format!(
                "Invalid default_temperature: {}. Must be between 0.0 and 2.0",
                self.default_temperature
            ));
        }
        if self.overload_check_interval_secs == 0 {
            return fail("overload_check_interval_secs must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            default_latency_budget_ms: self.default_latency_budget_ms,
            latency_override_threshold_ms: self.latency_override_threshold_ms,
        }
    }

    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            window: Duration::from_secs(self.rate_window_secs),
            burst_rps: self.burst_rps,
            sustained_rps: self.sustained_rps,
            max_queue_length: self.max_queue_length,
            cpu_emergency_percent: self.cpu_emergency_percent,
            memory_emergency_percent: self.memory_emergency_percent,
            emergency_min_duration: Duration::from_secs(self.emergency_min_duration_secs),
            failure_threshold: self.admission_failure_threshold,
            block_probe_interval: Duration::from_secs(self.block_probe_interval_secs),
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            success_threshold: self.breaker_success_threshold,
            recovery_timeout: Duration::from_secs(self.breaker_recovery_timeout_secs),
            call_timeout: Duration::from_secs(self.backend_timeout_secs),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.max_concurrent,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            model: self.ollama_model.clone(),
            keep_alive: self.ollama_keep_alive.clone(),
            defaults: GenerateOptions {
                temperature: self.default_temperature,
                max_tokens: self.default_max_tokens,
            },
        }
    }

    pub fn overload_config(&self) -> OverloadConfig {
        OverloadConfig {
            interval: Duration::from_secs(self.overload_check_interval_secs),
            cpu_percent: self.cpu_emergency_percent,
            memory_percent: self.memory_emergency_percent,
            degrade_after: self.overload_degrade_after,
        }
    }

    pub fn guardian_timeout(&self) -> Duration {
        Duration::from_millis(self.guardian_timeout_ms)
    }
}
