//! Resilient dispatch to the local inference backend.
//!
//! One guarded call runs, in order: guardian intake check, circuit-breaker
//! admission, queue slot acquisition, then the backend call under a hard
//! timeout. The queue slot is a drop guard, so it is released on every exit
//! path including cancellation. No retries happen here.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backends::{GenerateOptions, GenerateRequest, InferenceBackend};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::GateError;
use crate::guardian::GuardianMonitor;
use crate::request_queue::BoundedRequestQueue;

/// Per-call overrides. Unset fields fall back to the dispatcher defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub response: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub model: String,
    pub keep_alive: String,
    pub defaults: GenerateOptions,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            model: "llama3".to_string(),
            keep_alive: "5m".to_string(),
            defaults: GenerateOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub calls: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub guardian_blocked: u64,
    pub circuit_rejected: u64,
    pub last_latency_ms: u64,
    pub avg_latency_ms: f64,
}

#[derive(Default)]
struct StatCounters {
    calls: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    guardian_blocked: AtomicU64,
    circuit_rejected: AtomicU64,
    total_latency_ms: AtomicU64,
    last_latency_ms: AtomicU64,
}

pub struct ResilientDispatcher {
    backend: Arc<dyn InferenceBackend>,
    guardian: Arc<GuardianMonitor>,
    breaker: Arc<CircuitBreaker>,
    queue: BoundedRequestQueue,
    config: DispatcherConfig,
    stats: StatCounters,
}

impl ResilientDispatcher {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        guardian: Arc<GuardianMonitor>,
        breaker: Arc<CircuitBreaker>,
        queue: BoundedRequestQueue,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            backend,
            guardian,
            breaker,
            queue,
            config,
            stats: StatCounters::default(),
        }
    }

    fn build_request(&self, prompt: &str, options: &DispatchOptions) -> GenerateRequest {
        GenerateRequest {
            model: options
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            prompt: prompt.to_string(),
            stream: false,
            keep_alive: self.config.keep_alive.clone(),
            options: GenerateOptions {
                temperature: options.temperature.unwrap_or(self.config.defaults.temperature),
                max_tokens: options.max_tokens.unwrap_or(self.config.defaults.max_tokens),
            },
        }
    }

    /// Run one guarded backend call.
    pub async fn dispatch(
        &self,
        prompt: &str,
        options: &DispatchOptions,
    ) -> Result<DispatchResponse, GateError> {
        self.stats.calls.fetch_add(1, Ordering::Relaxed);

        if self.guardian.intake_blocked().await {
            self.stats.guardian_blocked.fetch_add(1, Ordering::Relaxed);
            info!("dispatch: guardian has blocked intake");
            return Err(GateError::GuardianBlocked);
        }

        if let Err(retry_in) = self.breaker.admit() {
            self.stats.circuit_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(GateError::CircuitOpen { retry_in });
        }

        let _slot = self.queue.acquire().await?;

        let request = self.build_request(prompt, options);
        let timeout = self.breaker.config().call_timeout;
        let started = Instant::now();
        debug!(
            backend = self.backend.id(),
            model = %request.model,
            "dispatch: calling backend"
        );

        match tokio::time::timeout(timeout, self.backend.generate(&request)).await {
            Ok(Ok(response)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .total_latency_ms
                    .fetch_add(duration_ms, Ordering::Relaxed);
                self.stats
                    .last_latency_ms
                    .store(duration_ms, Ordering::Relaxed);
                self.breaker.record_success();
                debug!(duration_ms, "dispatch: backend call succeeded");
                Ok(DispatchResponse {
                    response,
                    duration_ms,
                })
            }
            Ok(Err(failure)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.breaker.record_failure();
                warn!(error = %failure, "dispatch: backend call failed");
                Err(GateError::BackendError(failure))
            }
            Err(elapsed) => {
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                self.breaker.record_failure();
                warn!(?timeout, "dispatch: backend call timed out");
                Err(GateError::BackendTimeout {
                    timeout,
                    source: elapsed,
                })
            }
        }
    }

    /// Shed one unit of backend concurrency. Returns the new capacity.
    pub fn degrade(&self) -> usize {
        self.queue.degrade()
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn queue(&self) -> &BoundedRequestQueue {
        &self.queue
    }

    pub fn guardian(&self) -> &GuardianMonitor {
        &self.guardian
    }

    pub fn stats(&self) -> DispatchStats {
        let s = &self.stats;
        let succeeded = s.succeeded.load(Ordering::Relaxed);
        let total_latency = s.total_latency_ms.load(Ordering::Relaxed);
        DispatchStats {
            calls: s.calls.load(Ordering::Relaxed),
            succeeded,
            failed: s.failed.load(Ordering::Relaxed),
            timed_out: s.timed_out.load(Ordering::Relaxed),
            guardian_blocked: s.guardian_blocked.load(Ordering::Relaxed),
            circuit_rejected: s.circuit_rejected.load(Ordering::Relaxed),
            last_latency_ms: s.last_latency_ms.load(Ordering::Relaxed),
            avg_latency_ms: if succeeded == 0 {
                0.0
            } else {
                total_latency as f64 / succeeded as f64
            },
        }
    }
}
