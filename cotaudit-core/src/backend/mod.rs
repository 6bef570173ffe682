//! Model Backend capability and shared call plumbing.
//!
//! The core depends only on the [`ModelBackend`] trait. Concrete variants:
//! - [`MockBackend`]: deterministic offline backend for tests and demos
//! - [`HostedBackend`] over [`OpenAiCompatibleClient`] or [`GeminiClient`]:
//!   hosted LLMs used both as chain generators and as judges
//!
//! Use [`create_backend()`] to build the variant named in the configuration.

pub mod gemini;
pub mod hosted;
pub mod mock;
pub mod openai_compat;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{BackendConfig, BackendKind, RetryConfig};
use crate::error::BackendError;

pub use gemini::GeminiClient;
pub use hosted::{CompletionClient, HostedBackend};
pub use mock::MockBackend;
pub use openai_compat::OpenAiCompatibleClient;

/// Cue that ends every re-derivation prompt.
pub const ANSWER_CUE: &str = "Final answer:";

/// First line of every re-derivation prompt.
pub const REDERIVE_HEADER: &str = "Answer the question using only the reasoning steps given below.";

/// The capability set every backend provides.
///
/// Scores are expected in `[0, 1]`; callers clamp defensively anyway.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Short identifier reported in result metadata.
    fn name(&self) -> &str;

    /// Produce `n` raw completions for `prompt`.
    async fn generate(&self, prompt: &str, n: usize) -> Result<Vec<String>, BackendError>;

    /// How strongly `premise` supports `hypothesis`.
    async fn score_entailment(&self, premise: &str, hypothesis: &str)
    -> Result<f64, BackendError>;

    /// Likelihood that `text` is evasive or obfuscated.
    async fn classify_obfuscation(&self, text: &str) -> Result<f64, BackendError>;

    /// Whether one `generate(prompt, n)` call yields `n` independent candidates.
    fn supports_batch(&self) -> bool {
        false
    }
}

/// Per-request bounds applied to every backend call: a timeout and a
/// cancellation token shared by all calls of the request.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    timeout: Duration,
    cancel: CancellationToken,
}

impl CallPolicy {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one backend call under the timeout, aborting on cancellation.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BackendError::Cancelled),
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(BackendError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                }),
            },
        }
    }
}

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// Retries on `RateLimited` (respects `retry_after_secs`), `Connection`, and
/// `Timeout`. Permanent errors (auth, parse) return immediately.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, BackendError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !e.is_transient() || attempt >= config.max_retries {
                    return Err(e);
                }

                let backoff_ms = compute_backoff(config, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

/// Compute backoff delay, respecting rate limit retry-after hints.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &BackendError) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    if let BackendError::RateLimited { retry_after_secs } = err {
        return retry_after_secs.saturating_mul(1000).max(computed);
    }
    computed
}

fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    base.min(config.max_backoff_ms as f64) as u64
}

/// Create the backend named by `config.provider`.
///
/// Hosted providers fail here with `AuthFailed` when no API key is available.
pub fn create_backend(config: &BackendConfig) -> Result<Arc<dyn ModelBackend>, BackendError> {
    let kind = config.kind().map_err(|e| BackendError::NotConfigured {
        message: e.to_string(),
    })?;
    match kind {
        BackendKind::Mock => Ok(Arc::new(MockBackend::new())),
        BackendKind::OpenAi => Ok(Arc::new(HostedBackend::new(
            OpenAiCompatibleClient::new(config)?,
            config,
        ))),
        BackendKind::Gemini => Ok(Arc::new(HostedBackend::new(
            GeminiClient::new(config)?,
            config,
        ))),
    }
}

/// Prompt asking for a step-by-step chain ending in an answer line.
pub fn chain_prompt(input: &str, context: Option<&BTreeMap<String, Value>>) -> String {
    let mut prompt = String::from(
        "Solve the following problem step by step.\n\
         Write each reasoning step on its own line as \"Step 1: ...\", \"Step 2: ...\", and so on.\n\
         Each step should state a single inference.\n\
         Finish with one line of the form \"Answer: <final answer>\".\n\n",
    );
    prompt.push_str("Question: ");
    prompt.push_str(input.trim());
    prompt.push('\n');

    if let Some(context) = context
        && !context.is_empty()
    {
        let rendered: Vec<String> = context
            .iter()
            .map(|(key, value)| format!("{key}: {}", render_context_value(value)))
            .collect();
        prompt.push_str("Context: ");
        prompt.push_str(&rendered.join(", "));
        prompt.push('\n');
    }
    prompt
}

/// Prompt asking for a single answer given only the listed steps.
///
/// Steps are renumbered from 1 so the model cannot tell which were removed.
pub fn rederive_prompt(input: &str, steps: &[&str]) -> String {
    let mut prompt = String::from(REDERIVE_HEADER);
    prompt.push_str("\nReply with a single short answer and nothing else.\n\n");
    prompt.push_str("Question: ");
    prompt.push_str(input.trim());
    prompt.push('\n');
    if steps.is_empty() {
        prompt.push_str("(no reasoning steps provided)\n");
    }
    for (i, step) in steps.iter().enumerate() {
        prompt.push_str(&format!("Step {}: {}\n", i + 1, step));
    }
    prompt.push_str(ANSWER_CUE);
    prompt
}

fn render_context_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
