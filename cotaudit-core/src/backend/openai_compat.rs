//! OpenAI-compatible completion client.
//!
//! Supports OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio, and any
//! endpoint that follows the OpenAI chat completions API format.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use super::hosted::CompletionClient;
use crate::config::BackendConfig;
use crate::error::BackendError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat-completions transport for OpenAI-style APIs.
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatibleClient {
    /// Create a new client from configuration.
    ///
    /// Uses `config.api_key` when set, otherwise reads the key from the
    /// configured environment variable. Local endpoints need no key.
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let is_local = config
            .base_url
            .as_ref()
            .map(|u| u.contains("localhost") || u.contains("127.0.0.1"))
            .unwrap_or(false);

        let api_key_env = config.effective_api_key_env();
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(&api_key_env).ok())
            .or_else(|| {
                if is_local {
                    debug!("No API key set for local provider; using dummy bearer token");
                    Some("ollama".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| BackendError::AuthFailed {
                provider: format!("OpenAI-compatible: env var '{api_key_env}' not set"),
            })?;
        Self::new_with_key(config, api_key)
    }

    /// Create a new client with an explicitly provided API key.
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

    fn build_request_body(&self, prompt: &str, temperature: f32, max_tokens: usize) -> Value {
        json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": false,
        })
    }

    /// Extract the assistant text from an OpenAI-format response body.
    fn parse_response(body: &Value) -> Result<String, BackendError> {
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| BackendError::ResponseParse {
                message: "No choices in response".to_string(),
            })?;

        choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BackendError::ResponseParse {
                message: "No text content in choice".to_string(),
            })
    }

    /// Map an HTTP status code to the appropriate BackendError.
    fn map_http_error(status: reqwest::StatusCode, body: &str) -> BackendError {
        match status.as_u16() {
            401 | 403 => {
                debug!(body = %body, "Authentication failed");
                BackendError::AuthFailed {
                    provider: "OpenAI-compatible".to_string(),
                }
            }
            429 => {
                // "Rate limit reached ... try again in 20s"
                let retry_secs = serde_json::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| {
                        v.get("error")?
                            .get("message")?
                            .as_str()
                            .map(|s| s.to_string())
                    })
                    .and_then(|msg| {
                        msg.split("in ").last().and_then(|s| {
                            s.trim()
                                .trim_end_matches('.')
                                .trim_end_matches('s')
                                .parse::<u64>()
                                .ok()
                        })
                    })
                    .unwrap_or(5);
                BackendError::RateLimited {
                    retry_after_secs: retry_secs,
                }
            }
            s if s >= 500 => BackendError::Connection {
                message: format!("Server error ({}): {}", status, body),
            },
            _ => BackendError::ApiRequest {
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatibleClient {
    fn provider_name(&self) -> &str {
        "openai"
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
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request_body(prompt, temperature, max_tokens);

        debug!(url = %url, model = %self.model, "Sending OpenAI completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Connection {
                message: format!("Request failed: {}", e),
            })?;

        let status = response.status();
        let response_body = response.text().await.map_err(|e| BackendError::ApiRequest {
            message: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, &response_body));
        }

        let json: Value =
            serde_json::from_str(&response_body).map_err(|e| BackendError::ResponseParse {
                message: format!("Invalid JSON: {}", e),
            })?;

        Self::parse_response(&json)
    }
}
