//! Perturbation Engine.
//!
//! Removes every subset of steps up to a size cap, asks the backend to
//! re-derive the answer from what remains, and reports the fraction of
//! removals that changed the answer as the chain's causal influence.

use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{CallPolicy, ModelBackend, rederive_prompt};
use crate::config::PipelineConfig;
use crate::parser::extract_answer;
use crate::types::{Candidate, PerturbationResult, PerturbedOutcome};

/// Runs step-removal experiments on a single candidate.
pub struct PerturbationEngine {
    backend: Arc<dyn ModelBackend>,
    max_steps: usize,
    max_concurrent: usize,
}

impl PerturbationEngine {
    pub fn new(backend: Arc<dyn ModelBackend>, pipeline: &PipelineConfig) -> Self {
        Self {
            backend,
            max_steps: pipeline.perturb_steps_max,
            max_concurrent: pipeline.max_concurrent_calls.max(1),
        }
    }

    /// Run the experiment. Outcomes follow enumeration order.
    pub async fn run(
        &self,
        original_input: &str,
        candidate: &Candidate,
        policy: &CallPolicy,
    ) -> PerturbationResult {
        let subsets = enumerate_subsets(candidate.steps.len(), self.max_steps);
        debug!(
            steps = candidate.steps.len(),
            subsets = subsets.len(),
            "Starting perturbation run"
        );

        let outcomes: Vec<PerturbedOutcome> = futures::stream::iter(subsets)
            .map(|removed| self.evaluate(original_input, candidate, removed, policy))
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let changed = outcomes.iter().filter(|o| o.changed).count();
        let causal_influence_score = if outcomes.is_empty() {
            0.0
        } else {
            changed as f64 / outcomes.len() as f64
        };
        info!(
            subsets = outcomes.len(),
            changed,
            failed = outcomes.iter().filter(|o| o.failed).count(),
            causal_influence_score,
            "Perturbation run complete"
        );

        PerturbationResult {
            original_answer: candidate.answer.clone(),
            outcomes,
            causal_influence_score,
        }
    }

    async fn evaluate(
        &self,
        original_input: &str,
        candidate: &Candidate,
        removed: Vec<usize>,
        policy: &CallPolicy,
    ) -> PerturbedOutcome {
        let remaining: Vec<&str> = candidate
            .steps
            .iter()
            .enumerate()
            .filter(|(i, _)| !removed.contains(i))
            .map(|(_, s)| s.as_str())
            .collect();
        let prompt = rederive_prompt(original_input, &remaining);
        let removed_steps: Vec<usize> = removed.iter().map(|i| i + 1).collect();

        match policy.call(self.backend.generate(&prompt, 1)).await {
            Ok(replies) => {
                let new_answer = replies
                    .first()
                    .map(|r| extract_answer(r))
                    .unwrap_or_default();
                let changed = !answers_match(&candidate.answer, &new_answer);
                PerturbedOutcome {
                    removed_steps,
                    new_answer,
                    changed,
                    failed: false,
                }
            }
            Err(e) => {
                warn!(removed = ?removed_steps, error = %e, "Re-derivation failed");
                PerturbedOutcome {
                    removed_steps,
                    new_answer: String::new(),
                    changed: false,
                    failed: true,
                }
            }
        }
    }
}

/// All index subsets of `0..k` with size `1..=min(k, cap)`, sizes ascending,
/// each size in lexicographic order.
pub fn enumerate_subsets(k: usize, cap: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::with_capacity(subset_count(k, cap));
    for size in 1..=k.min(cap) {
        push_combinations(k, size, &mut out);
    }
    out
}

fn push_combinations(k: usize, size: usize, out: &mut Vec<Vec<usize>>) {
    let mut idx: Vec<usize> = (0..size).collect();
    loop {
        out.push(idx.clone());
        // Rightmost position that can still advance.
        let mut i = size;
        loop {
            if i == 0 {
                return;
            }
            i -= 1;
            if idx[i] < k - size + i {
                break;
            }
        }
        idx[i] += 1;
        for j in i + 1..size {
            idx[j] = idx[j - 1] + 1;
        }
    }
}

/// Σ C(k, s) for s = 1..=min(k, cap).
pub fn subset_count(k: usize, cap: usize) -> usize {
    (1..=k.min(cap)).map(|s| binomial(k, s)).sum()
}

fn binomial(n: usize, k: usize) -> usize {
    let k = k.min(n - k);
    (0..k).fold(1, |acc, i| acc * (n - i) / (i + 1))
}

/// Case-insensitive, whitespace-collapsed form of an answer.
pub fn normalize_answer(answer: &str) -> String {
    answer
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn answers_match(a: &str, b: &str) -> bool {
    normalize_answer(a) == normalize_answer(b)
}
