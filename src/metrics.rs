use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::admission::AdmissionStatus;
use crate::circuit_breaker::CircuitSnapshot;
use crate::dispatcher::DispatchStats;
use crate::guardian::GuardianStatus;
use crate::request_queue::QueueSnapshot;
use crate::router::RouterMetrics;

/// Point-in-time view of every control-plane component.
#[derive(Debug, Clone, Serialize)]
pub struct ControlPlaneMetrics {
    pub collected_at: DateTime<Utc>,
    pub router: RouterMetrics,
    pub admission: AdmissionStatus,
    pub circuit: CircuitSnapshot,
    pub queue: QueueSnapshot,
    pub dispatch: DispatchStats,
    pub guardian: GuardianStatus,
}

impl ControlPlaneMetrics {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
