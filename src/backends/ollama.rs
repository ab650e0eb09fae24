use super::{BackendFailure, GenerateRequest, InferenceBackend};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

#[derive(Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

/// Local Ollama server, `/api/generate` in non-streaming mode.
pub struct OllamaBackend {
    client: Client,
    base_url: String,
}

impl OllamaBackend {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendFailure> {
        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendFailure::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| BackendFailure::Malformed(e.to_string()))?;
        parsed
            .response
            .ok_or_else(|| BackendFailure::Malformed("missing 'response' field".to_string()))
    }

    fn id(&self) -> &'static str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::GenerateOptions;
    use mockito::Matcher;
    use serde_json::json;

    fn request() -> GenerateRequest {
        GenerateRequest {
            model: "llama3".to_string(),
            prompt: "hej".to_string(),
            stream: false,
            keep_alive: "5m".to_string(),
            options: GenerateOptions {
                temperature: 0.5,
                max_tokens: 64,
            },
        }
    }

    #[tokio::test]
    async fn test_generate_posts_contract_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/generate")
            .match_body(Matcher::PartialJson(json!({
                "model": "llama3",
                "prompt": "hej",
                "stream": false,
                "keep_alive": "5m",
                "options": { "temperature": 0.5, "max_tokens": 64 }
            })))
            .with_status(200)
            .with_body(r#"{"response":"Hej hej!","done":true}"#)
            .create_async()
            .await;

        let backend = OllamaBackend::new(&format!("{}/", server.url()));
        let answer = backend.generate(&request()).await.unwrap();
        assert_eq!(answer, "Hej hej!");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/generate")
            .with_status(503)
            .with_body("model loading")
            .create_async()
            .await;

        let backend = OllamaBackend::new(&server.url());
        match backend.generate(&request()).await {
            Err(BackendFailure::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "model loading");
            }
            other => panic!("expected status failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_response_field_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/generate")
            .with_status(200)
            .with_body(r#"{"done":true}"#)
            .create_async()
            .await;

        let backend = OllamaBackend::new(&server.url());
        assert!(matches!(
            backend.generate(&request()).await,
            Err(BackendFailure::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_is_connection_failure() {
        let backend = OllamaBackend::new("http://127.0.0.1:9");
        assert!(matches!(
            backend.generate(&request()).await,
            Err(BackendFailure::Connection(_))
        ));
    }
}
