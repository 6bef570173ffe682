//! Candidate Generator.
//!
//! Drives the Model Backend to produce N candidate chains for one request
//! and parses each completion into steps and an answer.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::{CallPolicy, ModelBackend, chain_prompt};
use crate::error::{AuditError, BackendError, ConfigError};
use crate::parser::{ParsedChain, parse_chain};
use crate::types::{Candidate, ReasoningRequest};

/// Produces parsed candidate chains.
pub struct CandidateGenerator {
    backend: Arc<dyn ModelBackend>,
}

impl CandidateGenerator {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }

    /// Generate up to `n` candidates in generation order.
    ///
    /// Backends that support batching get one `generate(prompt, n)` call;
    /// others get `n` concurrent single calls, and individual failures only
    /// drop that candidate. The request fails with `BackendUnavailable` when
    /// no candidate could be produced.
    pub async fn generate(
        &self,
        request: &ReasoningRequest,
        n: usize,
        policy: &CallPolicy,
    ) -> Result<Vec<Candidate>, AuditError> {
        if n == 0 {
            return Err(ConfigError::Invalid {
                message: "candidate count must be at least 1".to_string(),
            }
            .into());
        }
        let prompt = chain_prompt(&request.input, request.context.as_ref());

        let raws = if self.backend.supports_batch() {
            self.generate_batch(&prompt, n, policy).await?
        } else {
            self.generate_each(&prompt, n, policy).await?
        };

        let candidates: Vec<Candidate> = raws
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                let parsed = parse_chain(&raw);
                match &parsed {
                    ParsedChain::Steps { steps, .. } => {
                        debug!(candidate = i, steps = steps.len(), "Parsed candidate");
                    }
                    ParsedChain::FallbackLastStep { steps } => {
                        warn!(
                            candidate = i,
                            steps = steps.len(),
                            "No answer marker; using last step as answer"
                        );
                    }
                    ParsedChain::Failure => {
                        warn!(candidate = i, "No reasoning steps parsed from completion");
                    }
                }
                parsed.into_candidate(raw)
            })
            .collect();
        Ok(candidates)
    }

    async fn generate_batch(
        &self,
        prompt: &str,
        n: usize,
        policy: &CallPolicy,
    ) -> Result<Vec<String>, AuditError> {
        match policy.call(self.backend.generate(prompt, n)).await {
            Ok(mut raws) => {
                if raws.len() != n {
                    warn!(
                        requested = n,
                        received = raws.len(),
                        "Backend returned an unexpected number of completions"
                    );
                    raws.truncate(n);
                }
                if raws.is_empty() {
                    return Err(AuditError::BackendUnavailable {
                        message: "backend returned no completions".to_string(),
                    });
                }
                Ok(raws)
            }
            Err(e) => Err(unavailable(e, n)),
        }
    }

    async fn generate_each(
        &self,
        prompt: &str,
        n: usize,
        policy: &CallPolicy,
    ) -> Result<Vec<String>, AuditError> {
        let calls = (0..n).map(|_| policy.call(self.backend.generate(prompt, 1)));
        let results = futures::future::join_all(calls).await;

        let mut raws = Vec::with_capacity(n);
        let mut last_err = None;
        for (i, result) in results.into_iter().enumerate() {
            match result {
                Ok(completions) => match completions.into_iter().next() {
                    Some(raw) => raws.push(raw),
                    None => warn!(candidate = i, "Backend returned an empty completion list"),
                },
                Err(e) => {
                    warn!(candidate = i, error = %e, "Candidate generation failed");
                    last_err = Some(e);
                }
            }
        }

        if raws.is_empty() {
            let err = last_err.unwrap_or(BackendError::ResponseParse {
                message: "no completions returned".to_string(),
            });
            return Err(unavailable(err, n));
        }
        Ok(raws)
    }
}

fn unavailable(err: BackendError, n: usize) -> AuditError {
    match err {
        BackendError::Cancelled => AuditError::Cancelled,
        other => AuditError::BackendUnavailable {
            message: format!("all {n} candidate generations failed: {other}"),
        },
    }
}
