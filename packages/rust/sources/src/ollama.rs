//! LLM client for an Ollama-compatible `/api/generate` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use recordfill_shared::{RecordfillError, Result};

use crate::{Llm, transport_error};

const SOURCE: &str = "llm";

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    /// Ask the server to constrain output to JSON.
    format: &'a str,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Non-streaming completion client.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecordfillError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Llm for OllamaClient {
    async fn infer(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            format: "json",
            options: GenerateOptions { temperature: 0.0 },
        };
        debug!(model = %self.model, prompt_chars = prompt.len(), "LLM request");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(SOURCE, &url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecordfillError::source(SOURCE, format!("{url}: HTTP {status}")));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| RecordfillError::source(SOURCE, format!("{url}: bad JSON: {e}")))?;
        Ok(body.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn returns_raw_completion_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({ "model": "tiny", "stream": false, "format": "json" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "tiny",
                "response": "{\"email\": null}",
                "done": true
            })))
            .mount(&server)
            .await;

        let llm = OllamaClient::new(&server.uri(), "tiny", Duration::from_secs(5)).unwrap();
        assert_eq!(llm.infer("prompt").await.unwrap(), "{\"email\": null}");
    }

    #[tokio::test]
    async fn server_errors_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let llm = OllamaClient::new(&server.uri(), "tiny", Duration::from_secs(5)).unwrap();
        assert!(llm.infer("prompt").await.unwrap_err().is_source_unavailable());
    }
}
