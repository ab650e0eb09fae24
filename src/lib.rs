pub mod admission;
pub mod backends;
pub mod circuit_breaker;
pub mod config_loader;
pub mod control_plane;
pub mod dispatcher;
pub mod error;
pub mod guardian;
pub mod metrics;
pub mod overload;
pub mod request_queue;
pub mod router;
pub mod service;
pub mod telemetry;

pub use control_plane::{ControlPlane, GateRequest, Handled};
pub use error::GateError;
