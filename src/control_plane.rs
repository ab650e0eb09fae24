//! Request-level composition: admission, then routing, then (for the local
//! lane) guarded dispatch, with the outcome fed back into admission.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionGate, SystemMetrics};
use crate::backends::ollama::OllamaBackend;
use crate::backends::InferenceBackend;
use crate::circuit_breaker::CircuitBreaker;
use crate::config_loader::Settings;
use crate::dispatcher::{DispatchOptions, ResilientDispatcher};
use crate::error::GateError;
use crate::guardian::{GuardianMonitor, HttpIntakeProbe};
use crate::metrics::ControlPlaneMetrics;
use crate::request_queue::BoundedRequestQueue;
use crate::router::{HybridRouter, Route, RouteDecision};

#[derive(Debug, Clone, Default)]
pub struct GateRequest {
    pub text: String,
    pub context_flags: HashMap<String, bool>,
    pub latency_budget_ms: Option<u32>,
    pub options: DispatchOptions,
}

impl GateRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_budget(mut self, latency_budget_ms: u32) -> Self {
        self.latency_budget_ms = Some(latency_budget_ms);
        self
    }

    pub fn with_flag(mut self, flag: &str, value: bool) -> Self {
        self.context_flags.insert(flag.to_string(), value);
        self
    }
}

/// What happened to an admitted request.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    /// Hand off to the realtime lane. The caller reports the outcome through
    /// [`ControlPlane::report_result`].
    Realtime(RouteDecision),
    Local {
        decision: RouteDecision,
        response: String,
        duration_ms: u64,
    },
}

impl Handled {
    pub fn decision(&self) -> &RouteDecision {
        match self {
            Handled::Realtime(decision) => decision,
            Handled::Local { decision, .. } => decision,
        }
    }
}

pub struct ControlPlane {
    admission: Arc<AdmissionGate>,
    router: Arc<HybridRouter>,
    dispatcher: Arc<ResilientDispatcher>,
}

impl ControlPlane {
    pub fn new(
        admission: Arc<AdmissionGate>,
        router: Arc<HybridRouter>,
        dispatcher: Arc<ResilientDispatcher>,
    ) -> Self {
        Self {
            admission,
            router,
            dispatcher,
        }
    }

    /// Wire every component from loaded settings, with Ollama as the local
    /// backend.
    pub fn from_settings(settings: &Settings) -> Self {
        let backend: Arc<dyn InferenceBackend> = Arc::new(OllamaBackend::new(&settings.ollama_url));
        Self::with_backend(settings, backend)
    }

    pub fn with_backend(settings: &Settings, backend: Arc<dyn InferenceBackend>) -> Self {
        let guardian = if settings.guardian_url.is_empty() {
            GuardianMonitor::disabled()
        } else {
            GuardianMonitor::new(
                Box::new(HttpIntakeProbe::new(
                    &settings.guardian_url,
                    settings.guardian_timeout(),
                )),
                settings.guardian_fail_closed,
            )
        };
        let dispatcher = ResilientDispatcher::new(
            backend,
            Arc::new(guardian),
            Arc::new(CircuitBreaker::new(settings.breaker_config())),
            BoundedRequestQueue::new(settings.queue_config()),
            settings.dispatcher_config(),
        );
        Self::new(
            Arc::new(AdmissionGate::new(settings.admission_policy())),
            Arc::new(HybridRouter::new(settings.router_config())),
            Arc::new(dispatcher),
        )
    }

    /// Admit, route and, for the local lane, dispatch one request.
    pub async fn handle(
        &self,
        request: &GateRequest,
        metrics: &SystemMetrics,
    ) -> Result<Handled, GateError> {
        self.admission
            .should_allow_request(metrics)
            .map_err(GateError::AdmissionDenied)?;

        let decision = self.router.route_request(
            &request.text,
            &request.context_flags,
            request.latency_budget_ms,
        );
        debug!(
            route = %decision.route,
            intent = %decision.intent,
            privacy = %decision.privacy_level,
            "control plane: routed"
        );

        if decision.route == Route::Realtime {
            return Ok(Handled::Realtime(decision));
        }

        match self
            .dispatcher
            .dispatch(&request.text, &request.options)
            .await
        {
            Ok(out) => {
                self.admission.record_request_result(true, None);
                Ok(Handled::Local {
                    decision,
                    response: out.response,
                    duration_ms: out.duration_ms,
                })
            }
            Err(e) => {
                // Only a real backend attempt says anything about backend health.
                if e.is_backend_failure() {
                    self.admission
                        .record_request_result(false, Some(&e.to_string()));
                }
                if e.suggests_alternate_lane() {
                    info!(kind = e.kind(), "control plane: local lane unavailable");
                } else {
                    warn!(kind = e.kind(), error = %e, "control plane: local dispatch failed");
                }
                Err(e)
            }
        }
    }

    /// Outcome of a request handled outside `handle`, e.g. on the realtime lane.
    pub fn report_result(&self, success: bool, error: Option<&str>) {
        self.admission.record_request_result(success, error);
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    pub fn admission(&self) -> &Arc<AdmissionGate> {
        &self.admission
    }

    pub fn router(&self) -> &Arc<HybridRouter> {
        &self.router
    }

    pub fn dispatcher(&self) -> &Arc<ResilientDispatcher> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> ControlPlaneMetrics {
        ControlPlaneMetrics {
            collected_at: Utc::now(),
            router: self.router.metrics(),
            admission: self.admission.status(),
            circuit: self.dispatcher.breaker().snapshot(),
            queue: self.dispatcher.queue().snapshot(),
            dispatch: self.dispatcher.stats(),
            guardian: self.dispatcher.guardian().status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendFailure, GenerateRequest};
    use crate::router::{Intent, PrivacyLevel};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FlakyBackend {
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InferenceBackend for FlakyBackend {
        async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(BackendFailure::Malformed("boom".into()))
            } else {
                Ok(format!("ok: {}", request.prompt))
            }
        }

        fn id(&self) -> &'static str {
            "flaky"
        }
    }

    fn plane(fail: bool) -> (ControlPlane, Arc<FlakyBackend>) {
        let backend = Arc::new(FlakyBackend {
            fail: AtomicBool::new(fail),
            calls: AtomicUsize::new(0),
        });
        let settings = Settings {
            breaker_failure_threshold: 10,
            ..Settings::default()
        };
        (ControlPlane::with_backend(&settings, backend.clone()), backend)
    }

    #[tokio::test]
    async fn test_private_request_dispatched_locally() {
        let (plane, backend) = plane(false);
        let request = GateRequest::new("skicka mail till chef@company.com");

        let handled = plane
            .handle(&request, &SystemMetrics::default())
            .await
            .unwrap();
        match handled {
            Handled::Local {
                decision, response, ..
            } => {
                assert_eq!(decision.intent, Intent::EmailLookup);
                assert_eq!(decision.privacy_level, PrivacyLevel::Sensitive);
                assert!(decision.no_cloud);
                assert_eq!(response, "ok: skicka mail till chef@company.com");
            }
            other => panic!("expected local, got {:?}", other),
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_realtime_request_skips_backend() {
        let (plane, backend) = plane(false);
        let request = GateRequest::new("hej, hur mår du").with_budget(200);

        let handled = plane
            .handle(&request, &SystemMetrics::default())
            .await
            .unwrap();
        assert_eq!(handled.decision().route, Route::Realtime);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_backend_failures_block_admission() {
        let (plane, backend) = plane(true);
        let request = GateRequest::new("läs min kalender");

        for _ in 0..3 {
            let err = plane
                .handle(&request, &SystemMetrics::default())
                .await
                .unwrap_err();
            assert!(err.is_backend_failure());
        }
        assert!(plane.admission().is_blocked());

        let err = plane
            .handle(&request, &SystemMetrics::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "failure_blocked");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

        backend.fail.store(false, Ordering::SeqCst);
        plane.report_result(true, None);
        assert!(!plane.admission().is_blocked());
        assert!(plane.handle(&request, &SystemMetrics::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_full_denies_before_routing() {
        let (plane, backend) = plane(false);
        let metrics = SystemMetrics {
            voice_queue_length: 10,
            ..SystemMetrics::default()
        };
        let err = plane
            .handle(&GateRequest::new("läs min kalender"), &metrics)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::AdmissionDenied(_)));
        assert_eq!(plane.router().metrics().total_requests, 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_metrics_snapshot_serializes() {
        let (plane, _backend) = plane(false);
        plane
            .handle(&GateRequest::new("hej"), &SystemMetrics::default())
            .await
            .unwrap();
        let json = plane.metrics().to_json().unwrap();
        assert!(json.contains("\"circuit\""));
        assert!(json.contains("\"closed\""));
        assert!(json.contains("\"total_requests\": 1"));
    }
}
