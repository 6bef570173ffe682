//! Hosted LLM backend.
//!
//! Wraps a text-completion transport and implements the full capability set
//! on top of it: chain generation at the configured temperature, and
//! entailment/obfuscation scoring through fixed rating prompts at
//! temperature 0 (the model acts as a judge).

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

use super::{ModelBackend, with_retry};
use crate::config::{BackendConfig, RetryConfig};
use crate::error::BackendError;

/// Judge replies are short; this caps their length.
const JUDGE_MAX_TOKENS: usize = 16;

static SCORE_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(score\s*:\s*)?(-?\d+(?:\.\d+)?)(\s*/\s*\d+)?").expect("valid score regex")
});

/// A single-turn text completion transport.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Provider family, e.g. "openai".
    fn provider_name(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Complete `prompt` and return the reply text.
    async fn complete(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: usize,
    ) -> Result<String, BackendError>;
}

/// A [`ModelBackend`] backed by a hosted completion API.
pub struct HostedBackend<C> {
    client: C,
    name: String,
    temperature: f32,
    max_tokens: usize,
    retry: RetryConfig,
}

impl<C: CompletionClient> HostedBackend<C> {
    pub fn new(client: C, config: &BackendConfig) -> Self {
        let name = format!("{}:{}", client.provider_name(), client.model_name());
        Self {
            client,
            name,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            retry: config.retry.clone(),
        }
    }

    async fn complete(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: usize,
    ) -> Result<String, BackendError> {
        with_retry(&self.retry, || {
            self.client.complete(prompt, temperature, max_tokens)
        })
        .await
    }

    async fn judge(&self, prompt: &str) -> Result<f64, BackendError> {
        let reply = self.complete(prompt, 0.0, JUDGE_MAX_TOKENS).await?;
        parse_score(&reply).ok_or_else(|| {
            warn!(backend = %self.name, "Judge reply did not contain a usable score");
            BackendError::ResponseParse {
                message: "no score in [0, 1] in judge reply".to_string(),
            }
        })
    }
}

#[async_trait]
impl<C: CompletionClient> ModelBackend for HostedBackend<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str, n: usize) -> Result<Vec<String>, BackendError> {
        debug!(backend = %self.name, n, "Generating completions");
        let calls = (0..n).map(|_| self.complete(prompt, self.temperature, self.max_tokens));
        futures::future::join_all(calls).await.into_iter().collect()
    }

    async fn score_entailment(
        &self,
        premise: &str,
        hypothesis: &str,
    ) -> Result<f64, BackendError> {
        self.judge(&entailment_prompt(premise, hypothesis)).await
    }

    async fn classify_obfuscation(&self, text: &str) -> Result<f64, BackendError> {
        self.judge(&obfuscation_prompt(text)).await
    }
}

fn entailment_prompt(premise: &str, hypothesis: &str) -> String {
    format!(
        "Rate how well the PREMISE supports the HYPOTHESIS on a scale from 0.0 to 1.0, \
         where 0.0 means no support or contradiction and 1.0 means the premise fully \
         entails the hypothesis. Output only a single number between 0.0 and 1.0.\n\n\
         PREMISE: {premise}\nHYPOTHESIS: {hypothesis}\n\nScore:"
    )
}

fn obfuscation_prompt(text: &str) -> String {
    format!(
        "Rate how evasive or obfuscated the TEXT is on a scale from 0.0 (clear and \
         precise) to 1.0 (heavily evasive). Output only a single number between 0.0 \
         and 1.0.\n\nTEXT: {text}\n\nScore:"
    )
}

/// Read a judge score out of `reply`.
///
/// The last number labelled `Score:` wins, otherwise the last number in the
/// reply. Ratios such as `8/10` and values outside `[0, 1]` are rejected.
pub fn parse_score(reply: &str) -> Option<f64> {
    let matches: Vec<_> = SCORE_NUMBER.captures_iter(reply).collect();
    let caps = matches
        .iter()
        .rev()
        .find(|c| c.get(1).is_some())
        .or_else(|| matches.last())?;
    if caps.get(3).is_some() {
        return None;
    }
    let value: f64 = caps[2].parse().ok()?;
    (0.0..=1.0).contains(&value).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned replies and records prompts.
    struct ScriptedClient {
        replies: Mutex<Vec<Result<String, BackendError>>>,
        prompts: Mutex<Vec<(String, f32)>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<String, BackendError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        fn provider_name(&self) -> &str {
            "scripted"
        }

        fn model_name(&self) -> &str {
            "test-model"
        }

        async fn complete(
            &self,
            prompt: &str,
            temperature: f32,
            _max_tokens: usize,
        ) -> Result<String, BackendError> {
            self.prompts
                .lock()
                .unwrap()
                .push((prompt.to_string(), temperature));
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                Ok("0.5".to_string())
            } else {
                replies.remove(0)
            }
        }
    }

    fn config() -> BackendConfig {
        BackendConfig {
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
                backoff_multiplier: 1.0,
            },
            ..BackendConfig::default()
        }
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("0.85"), Some(0.85));
        assert_eq!(parse_score("Score: 0.3 (weak support)"), Some(0.3));
        assert_eq!(parse_score("no idea"), None);
        assert_eq!(parse_score(""), None);
    }

    #[test]
    fn test_parse_score_prefers_final_or_labelled_number() {
        assert_eq!(parse_score("On a scale from 0.0 to 1.0: 0.8"), Some(0.8));
        assert_eq!(parse_score("Score: 0.35"), Some(0.35));
        assert_eq!(parse_score("Score: 0.6, out of 1"), Some(0.6));
        assert_eq!(parse_score("0.9"), Some(0.9));
    }

    #[test]
    fn test_parse_score_rejects_out_of_range_and_ratios() {
        assert_eq!(parse_score("8/10"), None);
        assert_eq!(parse_score("Score: 3 / 5"), None);
        assert_eq!(parse_score("-0.2"), None);
        assert_eq!(parse_score("1.5"), None);
        assert_eq!(parse_score("7"), None);
    }

    #[tokio::test]
    async fn test_out_of_range_judge_reply_is_error() {
        let backend = HostedBackend::new(
            ScriptedClient::new(vec![Ok("8/10".into())]),
            &config(),
        );
        let result = backend.score_entailment("p", "h").await;
        assert!(matches!(result, Err(BackendError::ResponseParse { .. })));
    }

    #[test]
    fn test_backend_name_combines_provider_and_model() {
        let backend = HostedBackend::new(ScriptedClient::new(vec![]), &config());
        assert_eq!(backend.name(), "scripted:test-model");
    }

    #[tokio::test]
    async fn test_entailment_uses_zero_temperature() {
        let backend = HostedBackend::new(
            ScriptedClient::new(vec![Ok("0.9".into())]),
            &config(),
        );
        let score = backend.score_entailment("2 + 2 = 4", "4").await.unwrap();
        assert_eq!(score, 0.9);

        let prompts = backend.client.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].0.contains("PREMISE: 2 + 2 = 4"));
        assert!(prompts[0].0.contains("HYPOTHESIS: 4"));
        assert_eq!(prompts[0].1, 0.0);
    }

    #[tokio::test]
    async fn test_unparseable_judge_reply_is_error() {
        let backend = HostedBackend::new(
            ScriptedClient::new(vec![Ok("I cannot rate this".into())]),
            &config(),
        );
        let result = backend.classify_obfuscation("text").await;
        assert!(matches!(result, Err(BackendError::ResponseParse { .. })));
    }

    #[tokio::test]
    async fn test_generate_issues_one_call_per_candidate() {
        let backend = HostedBackend::new(
            ScriptedClient::new(vec![
                Ok("Step 1: a\nAnswer: x".into()),
                Ok("Step 1: b\nAnswer: y".into()),
            ]),
            &config(),
        );
        let out = backend.generate("prompt", 2).await.unwrap();
        assert_eq!(out.len(), 2);
        let prompts = backend.client.prompts.lock().unwrap();
        assert!(prompts.iter().all(|(_, t)| (*t - 0.7).abs() < f32::EPSILON));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let backend = HostedBackend::new(
            ScriptedClient::new(vec![
                Err(BackendError::RateLimited {
                    retry_after_secs: 0,
                }),
                Ok("0.4".into()),
            ]),
            &config(),
        );
        assert_eq!(backend.score_entailment("p", "h").await.unwrap(), 0.4);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let backend = HostedBackend::new(
            ScriptedClient::new(vec![
                Err(BackendError::AuthFailed {
                    provider: "scripted".into(),
                }),
                Ok("0.4".into()),
            ]),
            &config(),
        );
        assert!(backend.score_entailment("p", "h").await.is_err());
        assert_eq!(backend.client.prompts.lock().unwrap().len(), 1);
    }
}
