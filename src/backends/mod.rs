pub mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Sampling options forwarded to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 256,
        }
    }
}

/// One non-streaming generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
    pub keep_alive: String,
    pub options: GenerateOptions,
}

/// Why a single backend call failed.
#[derive(Debug, thiserror::Error)]
pub enum BackendFailure {
    #[error("connection error: {0}")]
    Connection(#[from] reqwest::Error),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed backend response: {0}")]
    Malformed(String),
}

/// Trait implemented by every local inference endpoint the dispatcher can
/// guard. Implementations make exactly one attempt per call; retries belong
/// to the caller.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendFailure>;

    /// Unique ID of the backend (e.g., "ollama")
    fn id(&self) -> &'static str;
}
