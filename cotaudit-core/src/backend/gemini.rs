//! Google Gemini completion client.
//!
//! Key differences from OpenAI-compatible APIs:
//! - Auth via `?key=API_KEY` query parameter (not header-based)
//! - Roles are `"user"` / `"model"` and text lives in `parts`
//! - Sampling settings go in a `generationConfig` object

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use super::hosted::CompletionClient;
use crate::config::BackendConfig;
use crate::error::BackendError;

/// The default Google Gemini API base URL.
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// `generateContent` transport for Gemini models.
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    /// Create a new Gemini client from configuration.
    ///
    /// Returns `BackendError::AuthFailed` if no API key is available.
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let api_key_env = config.effective_api_key_env();
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(&api_key_env).ok())
            .ok_or_else(|| BackendError::AuthFailed {
                provider: format!("Gemini (env var '{api_key_env}' not set)"),
            })?;
        Self::new_with_key(config, api_key)
    }

    /// Create a new Gemini client with an explicitly provided API key.
    pub fn new_with_key(config: &BackendConfig, api_key: String) -> Result<Self, BackendError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::Connection {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.effective_model(),
        })
    }

    fn build_request_body(prompt: &str, temperature: f32, max_tokens: usize) -> Value {
        json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": temperature,
                "maxOutputTokens": max_tokens,
            },
        })
    }

    /// Concatenate the text parts of the first candidate.
    fn parse_response(body: &Value) -> Result<String, BackendError> {
        let candidates = body["candidates"]
            .as_array()
            .ok_or_else(|| BackendError::ResponseParse {
                message: "Missing 'candidates' array in response".to_string(),
            })?;

        let candidate = candidates.first().ok_or_else(|| BackendError::ResponseParse {
            message: "Empty 'candidates' array in response".to_string(),
        })?;

        let parts = candidate["content"]["parts"]
            .as_array()
            .ok_or_else(|| BackendError::ResponseParse {
                message: "Missing 'parts' array in candidate content".to_string(),
            })?;

        let text: String = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .collect();
        Ok(text)
    }

    /// Map an HTTP status code to the appropriate `BackendError`.
    fn map_http_error(status: reqwest::StatusCode, body_text: &str) -> BackendError {
        match status.as_u16() {
            401 | 403 => BackendError::AuthFailed {
                provider: "Gemini".to_string(),
            },
            429 => BackendError::RateLimited {
                retry_after_secs: 30,
            },
            s if s >= 500 => BackendError::Connection {
                message: format!("HTTP {} from Gemini API: {}", status, body_text),
            },
            _ => BackendError::ApiRequest {
                message: format!("HTTP {} from Gemini API: {}", status, body_text),
            },
        }
    }

    fn endpoint_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        )
    }
}

#[async_trait]
impl CompletionClient for GeminiClient {
    fn provider_name(&self) -> &str {
        "gemini"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: usize,
    ) -> Result<String, BackendError> {
        let body = Self::build_request_body(prompt, temperature, max_tokens);

        debug!(model = self.model.as_str(), "Sending Gemini completion request");

        let response = self
            .client
            .post(self.endpoint_url())
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Connection {
                // reqwest errors embed the URL, which carries the key
                message: format!("Request to Gemini API failed: {}", e.without_url()),
            })?;

        let status = response.status();
        let body_text = response.text().await.map_err(|e| BackendError::ResponseParse {
            message: format!("Failed to read response body: {}", e.without_url()),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, &body_text));
        }

        let response_json: Value =
            serde_json::from_str(&body_text).map_err(|e| BackendError::ResponseParse {
                message: format!("Invalid JSON in response: {}", e),
            })?;

        Self::parse_response(&response_json)
    }
}
