use crate::admission::SystemMetrics;
use crate::control_plane::{ControlPlane, GateRequest, Handled};
use crate::error::GateError;
use crate::router::NO_CLOUD_FLAG;
use crate::telemetry::SystemSampler;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;
use zbus::interface;

pub struct GateService {
    pub plane: Arc<ControlPlane>,
    pub sampler: Arc<Mutex<SystemSampler>>,
}

impl GateService {
    fn system_metrics(&self, voice_queue_length: u32) -> SystemMetrics {
        self.sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sample(voice_queue_length as usize)
    }
}

/// D-Bus has no optional integers; 0 means "use the configured default".
fn budget_arg(latency_budget_ms: u32) -> Option<u32> {
    (latency_budget_ms > 0).then_some(latency_budget_ms)
}

fn to_fdo(e: GateError) -> zbus::fdo::Error {
    let message = format!("{}: {}", e.kind(), e);
    match e {
        GateError::AdmissionDenied(_) => zbus::fdo::Error::LimitsExceeded(message),
        _ => zbus::fdo::Error::Failed(message),
    }
}

#[interface(name = "org.speech.Gate")]
impl GateService {
    #[zbus(name = "Ping")]
    async fn ping(&self) -> String {
        "pong".to_string()
    }

    #[zbus(name = "GetVersion")]
    async fn get_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    /// Returns (route, intent, confidence, latency_budget_ms, privacy_level,
    /// reasoning, no_cloud).
    #[zbus(name = "Route")]
    async fn route(
        &self,
        text: String,
        latency_budget_ms: u32,
        no_cloud: bool,
    ) -> (String, String, f64, u32, String, String, bool) {
        let mut flags = HashMap::new();
        if no_cloud {
            flags.insert(NO_CLOUD_FLAG.to_string(), true);
        }
        let d = self
            .plane
            .router()
            .route_request(&text, &flags, budget_arg(latency_budget_ms));
        (
            d.route.to_string(),
            d.intent.to_string(),
            d.confidence as f64,
            d.latency_budget_ms,
            d.privacy_level.to_string(),
            d.reasoning,
            d.no_cloud,
        )
    }

    /// Admission check only, for callers that run their own lanes.
    #[zbus(name = "Admit")]
    async fn admit(&self, voice_queue_length: u32) -> (bool, String) {
        let metrics = self.system_metrics(voice_queue_length);
        match self.plane.admission().should_allow_request(&metrics) {
            Ok(()) => (true, String::new()),
            Err(denial) => (false, denial.to_string()),
        }
    }

    #[zbus(name = "ReportResult")]
    async fn report_result(&self, success: bool, error: String) {
        let error = (!error.is_empty()).then_some(error.as_str());
        self.plane.report_result(success, error);
    }

    /// Full pipeline. Returns (lane, response); the response is empty when the
    /// request belongs on the realtime lane.
    #[zbus(name = "Think")]
    async fn think(
        &self,
        text: String,
        latency_budget_ms: u32,
        voice_queue_length: u32,
    ) -> zbus::fdo::Result<(String, String)> {
        let metrics = self.system_metrics(voice_queue_length);
        let mut request = GateRequest::new(text);
        request.latency_budget_ms = budget_arg(latency_budget_ms);

        match self.plane.handle(&request, &metrics).await.map_err(to_fdo)? {
            Handled::Realtime(decision) => Ok((decision.route.to_string(), String::new())),
            Handled::Local {
                decision, response, ..
            } => Ok((decision.route.to_string(), response)),
        }
    }

    #[zbus(name = "Degrade")]
    async fn degrade(&self) -> u32 {
        let capacity = self.plane.dispatcher().degrade();
        info!(capacity, "service: degrade requested over D-Bus");
        capacity as u32
    }

    /// JSON snapshot of every component.
    #[zbus(name = "GetStatus")]
    async fn get_status(&self) -> zbus::fdo::Result<String> {
        self.plane
            .metrics()
            .to_json()
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}
