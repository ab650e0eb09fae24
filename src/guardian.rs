//! Guardian intake-block probe.
//!
//! The guardian is an external watchdog that can ask every producer to stop
//! sending work to the local model. Its answer is cached so that a slow or
//! dead guardian never takes the voice path down with it.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum GuardianError {
    #[error("guardian unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    #[error("guardian returned status {0}")]
    Status(u16),
}

#[derive(Deserialize)]
struct HealthResponse {
    #[serde(default)]
    intake_blocked: bool,
}

#[async_trait]
pub trait IntakeProbe: Send + Sync {
    /// Current intake status straight from the guardian.
    async fn intake_blocked(&self) -> Result<bool, GuardianError>;
}

/// `GET {base_url}/health` returning `{"intake_blocked": bool}`.
pub struct HttpIntakeProbe {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpIntakeProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            url: format!("{}/health", base_url.trim_end_matches('/')),
            timeout,
        }
    }
}

#[async_trait]
impl IntakeProbe for HttpIntakeProbe {
    async fn intake_blocked(&self) -> Result<bool, GuardianError> {
        let resp = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GuardianError::Status(resp.status().as_u16()));
        }
        let health: HealthResponse = resp.json().await?;
        Ok(health.intake_blocked)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardianStatus {
    pub enabled: bool,
    pub last_known_blocked: bool,
    pub fail_closed: bool,
    pub probes: u64,
    pub unreachable: u64,
}

/// Wraps a probe with a last-known-value cache.
pub struct GuardianMonitor {
    probe: Option<Box<dyn IntakeProbe>>,
    last_known_blocked: AtomicBool,
    fail_closed: bool,
    probes: AtomicU64,
    unreachable: AtomicU64,
}

impl GuardianMonitor {
    pub fn new(probe: Box<dyn IntakeProbe>, fail_closed: bool) -> Self {
        Self {
            probe: Some(probe),
            last_known_blocked: AtomicBool::new(false),
            fail_closed,
            probes: AtomicU64::new(0),
            unreachable: AtomicU64::new(0),
        }
    }

    /// No guardian configured: intake is never blocked.
    pub fn disabled() -> Self {
        Self {
            probe: None,
            last_known_blocked: AtomicBool::new(false),
            fail_closed: false,
            probes: AtomicU64::new(0),
            unreachable: AtomicU64::new(0),
        }
    }

    /// Whether intake is blocked right now.
    ///
    /// When the guardian cannot be reached the cached answer is reused, or
    /// intake is treated as blocked if the monitor was built fail-closed.
    pub async fn intake_blocked(&self) -> bool {
        let Some(probe) = &self.probe else {
            return false;
        };
        self.probes.fetch_add(1, Ordering::Relaxed);

        match probe.intake_blocked().await {
            Ok(blocked) => {
                let previous = self.last_known_blocked.swap(blocked, Ordering::Relaxed);
                if previous != blocked {
                    warn!(blocked, "guardian: intake status changed");
                } else {
                    debug!(blocked, "guardian: intake status");
                }
                blocked
            }
            Err(e) => {
                self.unreachable.fetch_add(1, Ordering::Relaxed);
                let cached = self.last_known_blocked.load(Ordering::Relaxed);
                warn!(
                    error = %e,
                    cached,
                    fail_closed = self.fail_closed,
                    "guardian: probe failed, using fallback"
                );
                self.fail_closed || cached
            }
        }
    }

    pub fn status(&self) -> GuardianStatus {
        GuardianStatus {
            enabled: self.probe.is_some(),
            last_known_blocked: self.last_known_blocked.load(Ordering::Relaxed),
            fail_closed: self.fail_closed,
            probes: self.probes.load(Ordering::Relaxed),
            unreachable: self.unreachable.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_probe() -> HttpIntakeProbe {
        HttpIntakeProbe::new("http://127.0.0.1:9", Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_reads_intake_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status":"ok","intake_blocked":true}"#)
            .create_async()
            .await;

        let probe = HttpIntakeProbe::new(&server.url(), Duration::from_secs(1));
        assert!(probe.intake_blocked().await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_field_means_open() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status":"ok"}"#)
            .create_async()
            .await;

        let monitor = GuardianMonitor::new(
            Box::new(HttpIntakeProbe::new(&server.url(), Duration::from_secs(1))),
            false,
        );
        assert!(!monitor.intake_blocked().await);
    }

    /// Replays a fixed sequence of guardian answers.
    struct ScriptedProbe {
        answers: std::sync::Mutex<Vec<Result<bool, GuardianError>>>,
    }

    #[async_trait]
    impl IntakeProbe for ScriptedProbe {
        async fn intake_blocked(&self) -> Result<bool, GuardianError> {
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                Err(GuardianError::Status(503))
            } else {
                answers.remove(0)
            }
        }
    }

    #[tokio::test]
    async fn test_unreachable_reuses_cached_value() {
        let probe = ScriptedProbe {
            answers: std::sync::Mutex::new(vec![Ok(true)]),
        };
        let monitor = GuardianMonitor::new(Box::new(probe), false);

        assert!(monitor.intake_blocked().await);
        // Guardian gone: the last known answer (blocked) still holds.
        assert!(monitor.intake_blocked().await);
        let status = monitor.status();
        assert_eq!(status.probes, 2);
        assert_eq!(status.unreachable, 1);
        assert!(status.last_known_blocked);
    }

    #[tokio::test]
    async fn test_fail_open_by_default() {
        let monitor = GuardianMonitor::new(Box::new(unreachable_probe()), false);
        assert!(!monitor.intake_blocked().await);
        assert_eq!(monitor.status().probes, 1);
    }

    #[tokio::test]
    async fn test_fail_closed_when_configured() {
        let monitor = GuardianMonitor::new(Box::new(unreachable_probe()), true);
        assert!(monitor.intake_blocked().await);
    }

    #[tokio::test]
    async fn test_server_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/health")
            .with_status(500)
            .create_async()
            .await;
        let probe = HttpIntakeProbe::new(&server.url(), Duration::from_secs(1));
        assert!(matches!(
            probe.intake_blocked().await,
            Err(GuardianError::Status(500))
        ));
    }

    #[tokio::test]
    async fn test_disabled_never_blocks() {
        let monitor = GuardianMonitor::disabled();
        assert!(!monitor.intake_blocked().await);
        assert!(!monitor.status().enabled);
    }
}
