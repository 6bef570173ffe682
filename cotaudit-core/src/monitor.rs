//! CoT Monitor.
//!
//! Scores one parsed candidate for faithfulness, coherence, and obfuscation,
//! and derives the risk flag. Backend failures during scoring never abort an
//! assessment: the failed component takes its worst-case value and the
//! failure is counted in `degraded_calls`.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::{CallPolicy, ModelBackend};
use crate::config::{FaithfulnessWeights, MonitorConfig};
use crate::types::{Candidate, ComponentScores, MonitorResult, RiskTrigger};

/// Per-candidate faithfulness/coherence/risk scorer.
pub struct CotMonitor {
    backend: Arc<dyn ModelBackend>,
    config: MonitorConfig,
}

/// Outcome of one scoring call after worst-case substitution.
struct Scored {
    value: f64,
    degraded: bool,
}

impl CotMonitor {
    pub fn new(backend: Arc<dyn ModelBackend>, config: MonitorConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Assess one candidate against the original input.
    pub async fn assess(
        &self,
        candidate: &Candidate,
        original_input: &str,
        policy: &CallPolicy,
    ) -> MonitorResult {
        if candidate.is_empty() {
            debug!("Candidate has no steps; scoring as empty chain");
            return self.finish(ComponentScores::empty_chain(), true, 0);
        }

        let steps = &candidate.steps;
        let answer = candidate.answer.as_str();

        // Entailment of each step from the input plus all prior steps.
        let mut premises = Vec::with_capacity(steps.len());
        let mut context = original_input.trim().to_string();
        for step in steps {
            premises.push(context.clone());
            context.push('\n');
            context.push_str(step);
        }
        let all_steps = steps.join("\n");

        let step_calls = premises
            .iter()
            .zip(steps.iter())
            .map(|(premise, step)| self.entailment(policy, premise, step));
        let influence_calls = steps.iter().map(|step| self.entailment(policy, step, answer));
        let pair_calls = steps
            .windows(2)
            .map(|pair| self.entailment(policy, &pair[0], &pair[1]));

        let steps_text = steps.join(" ");
        let (step_scores, final_score, influence_scores, pair_scores, obf_steps, obf_answer) = futures::join!(
            join_all(step_calls),
            self.entailment(policy, &all_steps, answer),
            join_all(influence_calls),
            join_all(pair_calls),
            self.obfuscation(policy, &steps_text),
            self.obfuscation(policy, answer),
        );

        let degraded = step_scores
            .iter()
            .chain(&influence_scores)
            .chain(&pair_scores)
            .chain([&final_score, &obf_steps, &obf_answer])
            .filter(|s| s.degraded)
            .count();

        let entailment_values: Vec<f64> = step_scores
            .iter()
            .chain(std::iter::once(&final_score))
            .map(|s| s.value)
            .collect();
        let influence_values: Vec<f64> = influence_scores.iter().map(|s| s.value).collect();

        let pairs = pair_scores.len();
        let contradictions = pair_scores
            .iter()
            .filter(|s| s.degraded || s.value < self.config.contradiction_threshold)
            .count();
        let obfuscation = obf_steps.value.max(obf_answer.value);

        let components = ComponentScores {
            counterfactual_influence: mean(&influence_values),
            step_entailment: mean(&entailment_values),
            coherence: 1.0 - contradictions as f64 / pairs.max(1) as f64,
            obfuscation,
        };
        debug!(
            steps = steps.len(),
            contradictions,
            degraded,
            "Candidate scored"
        );
        self.finish(components, false, degraded)
    }

    /// Replace the heuristic counterfactual influence with a measured causal
    /// score and recompute faithfulness, risk, and explanation. No backend
    /// calls are made.
    pub fn rescore_with_influence(&self, result: &MonitorResult, causal: f64) -> MonitorResult {
        let components = ComponentScores {
            counterfactual_influence: clamp_unit(causal, 0.0),
            ..result.components
        };
        let empty_chain = result.triggers.contains(&RiskTrigger::EmptyChain);
        self.finish(components, empty_chain, result.degraded_calls)
    }

    fn finish(&self, components: ComponentScores, empty_chain: bool, degraded: usize) -> MonitorResult {
        let faithfulness = aggregate_faithfulness(&components, &self.config.weights);
        let triggers = risk_triggers(&components, faithfulness, empty_chain, &self.config);
        let monitor_explanation = explain(&triggers, &components, faithfulness, degraded, &self.config);
        MonitorResult {
            faithfulness_score: faithfulness,
            coherence_score: components.coherence,
            risk_flag: !triggers.is_empty(),
            monitor_explanation,
            components,
            triggers,
            degraded_calls: degraded,
        }
    }

    async fn entailment(&self, policy: &CallPolicy, premise: &str, hypothesis: &str) -> Scored {
        match policy
            .call(self.backend.score_entailment(premise, hypothesis))
            .await
        {
            Ok(v) => Scored {
                value: clamp_unit(v, 0.0),
                degraded: false,
            },
            Err(e) => {
                warn!(error = %e, "Entailment scoring failed; using worst case");
                Scored {
                    value: 0.0,
                    degraded: true,
                }
            }
        }
    }

    async fn obfuscation(&self, policy: &CallPolicy, text: &str) -> Scored {
        match policy.call(self.backend.classify_obfuscation(text)).await {
            Ok(v) => Scored {
                value: clamp_unit(v, 1.0),
                degraded: false,
            },
            Err(e) => {
                warn!(error = %e, "Obfuscation classification failed; using worst case");
                Scored {
                    value: 1.0,
                    degraded: true,
                }
            }
        }
    }
}

/// Weighted faithfulness, clamped to `[0, 1]`.
pub fn aggregate_faithfulness(components: &ComponentScores, weights: &FaithfulnessWeights) -> f64 {
    let raw = weights.counterfactual * components.counterfactual_influence
        + weights.entailment * components.step_entailment;
    clamp_unit(raw, 0.0)
}

/// Every risk condition that holds, in a fixed order.
///
/// Thresholds are strict: a score exactly at a threshold does not trigger.
pub fn risk_triggers(
    components: &ComponentScores,
    faithfulness: f64,
    empty_chain: bool,
    config: &MonitorConfig,
) -> Vec<RiskTrigger> {
    let mut triggers = Vec::new();
    if empty_chain {
        triggers.push(RiskTrigger::EmptyChain);
    }
    if faithfulness < config.faithfulness_threshold {
        triggers.push(RiskTrigger::LowFaithfulness);
    }
    if components.coherence < config.coherence_threshold {
        triggers.push(RiskTrigger::LowCoherence);
    }
    if components.obfuscation > config.obfuscation_ceiling {
        triggers.push(RiskTrigger::Obfuscation);
    }
    triggers
}

fn explain(
    triggers: &[RiskTrigger],
    components: &ComponentScores,
    faithfulness: f64,
    degraded: usize,
    config: &MonitorConfig,
) -> String {
    let mut text = if triggers.is_empty() {
        format!(
            "High faithfulness ({:.2}) and coherence ({:.2}); no risk indicators detected.",
            faithfulness, components.coherence
        )
    } else {
        let reasons: Vec<String> = triggers
            .iter()
            .map(|t| match t {
                RiskTrigger::EmptyChain => t.to_string(),
                RiskTrigger::LowFaithfulness => format!(
                    "{t} ({:.2} < {:.2})",
                    faithfulness, config.faithfulness_threshold
                ),
                RiskTrigger::LowCoherence => format!(
                    "{t} ({:.2} < {:.2})",
                    components.coherence, config.coherence_threshold
                ),
                RiskTrigger::Obfuscation => format!(
                    "{t} ({:.2} > {:.2})",
                    components.obfuscation, config.obfuscation_ceiling
                ),
            })
            .collect();
        format!("Risk flagged: {}.", reasons.join("; "))
    };
    if degraded > 0 {
        text.push_str(&format!(
            " {degraded} scoring call(s) failed and were scored as worst case."
        ));
    }
    text
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    clamp_unit(values.iter().sum::<f64>() / values.len() as f64, 0.0)
}

/// Clamp to `[0, 1]`, mapping NaN to `worst`.
fn clamp_unit(value: f64, worst: f64) -> f64 {
    if value.is_nan() {
        worst
    } else {
        value.clamp(0.0, 1.0)
    }
}
