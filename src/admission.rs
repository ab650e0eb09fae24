//! Admission gate for voice and chat traffic.
//!
//! Checks run in strict precedence order and the first one that fails decides
//! the denial reason:
//!
//! 1. rate limiting (burst over the last second, sustained over the window)
//! 2. voice queue length
//! 3. sustained CPU/memory emergency
//! 4. failure hysteresis (blocked after N consecutive failures, one success unblocks)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const BURST_WINDOW: Duration = Duration::from_secs(1);

/// Host load as seen by the caller at request time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_usage_percent: f32,
    pub voice_queue_length: usize,
}

#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    /// Length of the sliding request window.
    pub window: Duration,
    /// Maximum requests admitted within any one second.
    pub burst_rps: u32,
    /// Maximum average rate over `window`.
    pub sustained_rps: f64,
    pub max_queue_length: usize,
    pub cpu_emergency_percent: f32,
    pub memory_emergency_percent: f32,
    /// How long an overload must persist before it denies traffic.
    pub emergency_min_duration: Duration,
    /// Consecutive failures before the gate blocks.
    pub failure_threshold: u32,
    /// While blocked, one probe request is let through this often.
    pub block_probe_interval: Duration,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            burst_rps: 10,
            sustained_rps: 5.0,
            max_queue_length: 10,
            cpu_emergency_percent: 90.0,
            memory_emergency_percent: 90.0,
            emergency_min_duration: Duration::from_secs(30),
            failure_threshold: 3,
            block_probe_interval: Duration::from_secs(30),
        }
    }
}

/// Why a request was not admitted.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDenial {
    BurstExceeded { count: usize, limit: u32 },
    SustainedRateExceeded { rate: f64, limit: f64 },
    QueueFull { length: usize, max: usize },
    SustainedOverload {
        cpu_percent: f32,
        memory_percent: f32,
        duration: Duration,
    },
    FailureBlocked { consecutive_failures: u32 },
}

impl AdmissionDenial {
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionDenial::BurstExceeded { .. } => "burst_exceeded",
            AdmissionDenial::SustainedRateExceeded { .. } => "sustained_rate_exceeded",
            AdmissionDenial::QueueFull { .. } => "queue_full",
            AdmissionDenial::SustainedOverload { .. } => "sustained_overload",
            AdmissionDenial::FailureBlocked { .. } => "failure_blocked",
        }
    }
}

impl fmt::Display for AdmissionDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionDenial::BurstExceeded { count, limit } => write!(
                f,
                "burst rate exceeded ({} requests in the last second, limit {})",
                count, limit
            ),
            AdmissionDenial::SustainedRateExceeded { rate, limit } => write!(
                f,
                "sustained rate exceeded ({:.2} req/s, limit {:.2})",
                rate, limit
            ),
            AdmissionDenial::QueueFull { length, max } => {
                write!(f, "voice queue full ({} >= {})", length, max)
            }
            AdmissionDenial::SustainedOverload {
                cpu_percent,
                memory_percent,
                duration,
            } => write!(
                f,
                "sustained overload for {}s (cpu {:.1}%, memory {:.1}%)",
                duration.as_secs(),
                cpu_percent,
                memory_percent
            ),
            AdmissionDenial::FailureBlocked {
                consecutive_failures,
            } => write!(
                f,
                "blocked after {} consecutive failures",
                consecutive_failures
            ),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DenialCounters {
    pub burst_exceeded: u64,
    pub sustained_rate_exceeded: u64,
    pub queue_full: u64,
    pub sustained_overload: u64,
    pub failure_blocked: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStatus {
    pub requests_in_window: usize,
    pub consecutive_failures: u32,
    pub is_blocked: bool,
    pub emergency_active: bool,
    pub emergency_elapsed_secs: Option<u64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub allowed_total: u64,
    pub denied: DenialCounters,
}

#[derive(Debug)]
struct AdmissionState {
    request_times: VecDeque<Instant>,
    consecutive_failures: u32,
    is_blocked: bool,
    last_probe: Option<Instant>,
    emergency_start: Option<Instant>,
    last_success_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    allowed: AtomicU64,
    burst_exceeded: AtomicU64,
    sustained_rate_exceeded: AtomicU64,
    queue_full: AtomicU64,
    sustained_overload: AtomicU64,
    failure_blocked: AtomicU64,
}

pub struct AdmissionGate {
    policy: AdmissionPolicy,
    state: Mutex<AdmissionState>,
    counters: Counters,
}

impl AdmissionGate {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(AdmissionState {
                request_times: VecDeque::new(),
                consecutive_failures: 0,
                is_blocked: false,
                last_probe: None,
                emergency_start: None,
                last_success_at: None,
            }),
            counters: Counters::default(),
        }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a request may proceed. On success the request is counted
    /// against the rate window.
    pub fn should_allow_request(&self, metrics: &SystemMetrics) -> Result<(), AdmissionDenial> {
        let now = Instant::now();
        let mut state = self.lock();

        // Every sample moves the overload timer, whatever the verdict.
        let overload_for = self.track_emergency(&mut state, metrics, now);

        let verdict = self
            .check_rate(&mut state, now)
            .and_then(|_| self.check_queue(metrics))
            .and_then(|_| self.check_emergency(metrics, overload_for))
            .and_then(|_| self.check_blocked(&mut state, now));

        match verdict {
            Ok(()) => {
                state.request_times.push_back(now);
                self.counters.allowed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    in_window = state.request_times.len(),
                    "admission: request allowed"
                );
                Ok(())
            }
            Err(denial) => {
                self.count_denial(&denial);
                warn!(reason = %denial, kind = denial.kind(), "admission: request denied");
                Err(denial)
            }
        }
    }

    fn check_rate(&self, state: &mut AdmissionState, now: Instant) -> Result<(), AdmissionDenial> {
        while let Some(&oldest) = state.request_times.front() {
            if now.duration_since(oldest) >= self.policy.window {
                state.request_times.pop_front();
            } else {
                break;
            }
        }

        let last_second = state
            .request_times
            .iter()
            .rev()
            .take_while(|&&t| now.duration_since(t) < BURST_WINDOW)
            .count();
        if last_second >= self.policy.burst_rps as usize {
            return Err(AdmissionDenial::BurstExceeded {
                count: last_second,
                limit: self.policy.burst_rps,
            });
        }

        let window_secs = self.policy.window.as_secs_f64().max(1.0);
        let rate = (state.request_times.len() + 1) as f64 / window_secs;
        if rate > self.policy.sustained_rps {
            return Err(AdmissionDenial::SustainedRateExceeded {
                rate,
                limit: self.policy.sustained_rps,
            });
        }
        Ok(())
    }

    fn check_queue(&self, metrics: &SystemMetrics) -> Result<(), AdmissionDenial> {
        if metrics.voice_queue_length >= self.policy.max_queue_length {
            return Err(AdmissionDenial::QueueFull {
                length: metrics.voice_queue_length,
                max: self.policy.max_queue_length,
            });
        }
        Ok(())
    }

    /// Start or clear the overload timer. Returns how long the host has been
    /// continuously overloaded, if it is overloaded now.
    fn track_emergency(
        &self,
        state: &mut AdmissionState,
        metrics: &SystemMetrics,
        now: Instant,
    ) -> Option<Duration> {
        let overloaded = metrics.cpu_usage_percent > self.policy.cpu_emergency_percent
            || metrics.memory_usage_percent > self.policy.memory_emergency_percent;

        if !overloaded {
            if state.emergency_start.take().is_some() {
                info!("admission: overload cleared");
            }
            return None;
        }

        let started = *state.emergency_start.get_or_insert_with(|| {
            warn!(
                cpu = metrics.cpu_usage_percent,
                memory = metrics.memory_usage_percent,
                "admission: overload observed, emergency timer started"
            );
            now
        });
        Some(now.duration_since(started))
    }

    fn check_emergency(
        &self,
        metrics: &SystemMetrics,
        overload_for: Option<Duration>,
    ) -> Result<(), AdmissionDenial> {
        match overload_for {
            Some(duration) if duration >= self.policy.emergency_min_duration => {
                Err(AdmissionDenial::SustainedOverload {
                    cpu_percent: metrics.cpu_usage_percent,
                    memory_percent: metrics.memory_usage_percent,
                    duration,
                })
            }
            _ => Ok(()),
        }
    }

    fn check_blocked(&self, state: &mut AdmissionState, now: Instant) -> Result<(), AdmissionDenial> {
        if !state.is_blocked {
            return Ok(());
        }
        let probe_due = state
            .last_probe
            .map_or(true, |t| now.duration_since(t) >= self.policy.block_probe_interval);
        if probe_due {
            state.last_probe = Some(now);
            info!("admission: letting one probe request through while blocked");
            return Ok(());
        }
        Err(AdmissionDenial::FailureBlocked {
            consecutive_failures: state.consecutive_failures,
        })
    }

    fn count_denial(&self, denial: &AdmissionDenial) {
        let counter = match denial {
            AdmissionDenial::BurstExceeded { .. } => &self.counters.burst_exceeded,
            AdmissionDenial::SustainedRateExceeded { .. } => &self.counters.sustained_rate_exceeded,
            AdmissionDenial::QueueFull { .. } => &self.counters.queue_full,
            AdmissionDenial::SustainedOverload { .. } => &self.counters.sustained_overload,
            AdmissionDenial::FailureBlocked { .. } => &self.counters.failure_blocked,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Report the outcome of an admitted request.
    pub fn record_request_result(&self, success: bool, error: Option<&str>) {
        let mut state = self.lock();
        if success {
            if state.is_blocked {
                info!("admission: success recorded, unblocking");
            }
            state.consecutive_failures = 0;
            state.is_blocked = false;
            state.last_probe = None;
            state.last_success_at = Some(Utc::now());
            return;
        }

        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        warn!(
            consecutive = state.consecutive_failures,
            error = error.unwrap_or("unknown"),
            "admission: request failure recorded"
        );
        if !state.is_blocked && state.consecutive_failures >= self.policy.failure_threshold {
            state.is_blocked = true;
            // The first probe waits a full interval after blocking.
            state.last_probe = Some(Instant::now());
            warn!(
                threshold = self.policy.failure_threshold,
                "admission: blocking requests after consecutive failures"
            );
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.lock().is_blocked
    }

    pub fn status(&self) -> AdmissionStatus {
        let state = self.lock();
        let c = &self.counters;
        AdmissionStatus {
            requests_in_window: state.request_times.len(),
            consecutive_failures: state.consecutive_failures,
            is_blocked: state.is_blocked,
            emergency_active: state.emergency_start.is_some(),
            emergency_elapsed_secs: state.emergency_start.map(|t| t.elapsed().as_secs()),
            last_success_at: state.last_success_at,
            allowed_total: c.allowed.load(Ordering::Relaxed),
            denied: DenialCounters {
                burst_exceeded: c.burst_exceeded.load(Ordering::Relaxed),
                sustained_rate_exceeded: c.sustained_rate_exceeded.load(Ordering::Relaxed),
                queue_full: c.queue_full.load(Ordering::Relaxed),
                sustained_overload: c.sustained_overload.load(Ordering::Relaxed),
                failure_blocked: c.failure_blocked.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(AdmissionPolicy::default())
    }
}
