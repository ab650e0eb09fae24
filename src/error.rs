//! Error taxonomy for the request gate.
//!
//! Every failure a caller can see is one of these variants, so the layer that
//! composes the final answer can tell "try the other lane" from "don't retry
//! yet" from "this one call failed".

use std::time::Duration;

use crate::admission::AdmissionDenial;
use crate::backends::BackendFailure;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Rate limited, queue full, sustained overload or failure-blocked.
    #[error("Admission denied: {0}")]
    AdmissionDenied(AdmissionDenial),

    /// The guardian reported that intake is blocked.
    #[error("Guardian has blocked intake")]
    GuardianBlocked,

    /// The local backend is presumed unhealthy.
    #[error("Circuit open (retry in {retry_in:?})")]
    CircuitOpen { retry_in: Duration },

    #[error("Backend call timed out after {timeout:?}")]
    BackendTimeout {
        timeout: Duration,
        #[source]
        source: tokio::time::error::Elapsed,
    },

    #[error("Backend call failed: {0}")]
    BackendError(#[source] BackendFailure),

    /// The request queue was closed while waiting for a slot.
    #[error("Request gate is shutting down")]
    Shutdown,
}

impl GateError {
    /// Short stable tag, used for metrics labels and D-Bus error strings.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::AdmissionDenied(denial) => denial.kind(),
            GateError::GuardianBlocked => "guardian_blocked",
            GateError::CircuitOpen { .. } => "circuit_open",
            GateError::BackendTimeout { .. } => "backend_timeout",
            GateError::BackendError(_) => "backend_error",
            GateError::Shutdown => "shutdown",
        }
    }

    /// The caller may retry this request right away (on the same or another lane).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GateError::BackendTimeout { .. } | GateError::BackendError(_)
        )
    }

    /// The local lane is unavailable for now; the realtime lane may still serve
    /// the request if privacy allows it.
    pub fn suggests_alternate_lane(&self) -> bool {
        matches!(
            self,
            GateError::GuardianBlocked | GateError::CircuitOpen { .. } | GateError::Shutdown
        )
    }

    /// Counts as a failed backend attempt for admission hysteresis.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            GateError::BackendTimeout { .. } | GateError::BackendError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let open = GateError::CircuitOpen {
            retry_in: Duration::from_secs(5),
        };
        assert!(!open.is_retryable());
        assert!(open.suggests_alternate_lane());
        assert!(!open.is_backend_failure());
        assert_eq!(open.kind(), "circuit_open");

        let failed = GateError::BackendError(BackendFailure::Status {
            status: 500,
            body: "boom".into(),
        });
        assert!(failed.is_retryable());
        assert!(failed.is_backend_failure());
        assert!(std::error::Error::source(&failed).is_some());
        assert!(failed.to_string().contains("500"));
    }

    #[test]
    fn test_admission_denial_kind_passthrough() {
        let err = GateError::AdmissionDenied(AdmissionDenial::QueueFull {
            length: 12,
            max: 10,
        });
        assert_eq!(err.kind(), "queue_full");
        assert!(!err.is_retryable());
    }
}
