//! Core type definitions for cotaudit.
//!
//! Defines the per-request data model: the inbound request, parsed
//! candidates, monitor scores, perturbation outcomes, the assembled result,
//! and the orchestrator's pipeline state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ValidationError;

/// Longest accepted caller-supplied request id.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Processing mode for a reasoning request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningMode {
    /// Block the chain when the best candidate is risk-flagged.
    #[default]
    Live,
    /// Always return the full result.
    Dryrun,
    /// Like `Dryrun`, plus a perturbation experiment on the best candidate.
    Perturb,
}

impl std::fmt::Display for ReasoningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReasoningMode::Live => write!(f, "live"),
            ReasoningMode::Dryrun => write!(f, "dryrun"),
            ReasoningMode::Perturb => write!(f, "perturb"),
        }
    }
}

impl std::str::FromStr for ReasoningMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(ReasoningMode::Live),
            "dryrun" => Ok(ReasoningMode::Dryrun),
            "perturb" => Ok(ReasoningMode::Perturb),
            other => Err(format!(
                "unknown mode '{other}' (expected live, dryrun, or perturb)"
            )),
        }
    }
}

/// One reasoning request. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub mode: ReasoningMode,
}

impl ReasoningRequest {
    pub fn new(input: impl Into<String>, mode: ReasoningMode) -> Self {
        Self {
            input: input.into(),
            context: None,
            request_id: None,
            mode,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    /// Reject malformed requests before any backend call is made.
    pub fn validate(&self, max_input_chars: usize) -> Result<(), ValidationError> {
        if self.input.trim().is_empty() {
            return Err(ValidationError::EmptyInput);
        }
        let len = self.input.chars().count();
        if len > max_input_chars {
            return Err(ValidationError::InputTooLong {
                len,
                max: max_input_chars,
            });
        }

        if let Some(id) = &self.request_id {
            if id.is_empty() {
                return Err(ValidationError::InvalidRequestId {
                    reason: "must not be empty".to_string(),
                });
            }
            if id.len() > MAX_REQUEST_ID_LEN {
                return Err(ValidationError::InvalidRequestId {
                    reason: format!("longer than {MAX_REQUEST_ID_LEN} characters"),
                });
            }
            if !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
            {
                return Err(ValidationError::InvalidRequestId {
                    reason: "may only contain ASCII letters, digits, '-', '_', '.', ':'"
                        .to_string(),
                });
            }
        }

        if let Some(context) = &self.context {
            for (key, value) in context {
                if value.is_array() || value.is_object() {
                    return Err(ValidationError::InvalidContextValue { key: key.clone() });
                }
            }
        }
        Ok(())
    }
}

/// How a raw completion was turned into a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    /// Step markers and an explicit answer marker were found.
    Parsed,
    /// Steps were found but no answer marker; the last step is the answer.
    FallbackLastStep,
    /// No steps were found.
    Failed,
}

/// A parsed candidate reasoning chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Steps in reasoning order.
    pub steps: Vec<String>,
    pub answer: String,
    /// The unparsed completion text.
    pub raw: String,
    pub parse_status: ParseStatus,
}

impl Candidate {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// The four bounded signals behind a monitor verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub counterfactual_influence: f64,
    pub step_entailment: f64,
    pub coherence: f64,
    pub obfuscation: f64,
}

impl ComponentScores {
    /// Scores assigned to a chain with no parsed steps.
    pub fn empty_chain() -> Self {
        Self {
            counterfactual_influence: 0.0,
            step_entailment: 0.0,
            coherence: 0.0,
            obfuscation: 1.0,
        }
    }
}

/// A single reason the monitor raised the risk flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTrigger {
    LowFaithfulness,
    LowCoherence,
    Obfuscation,
    EmptyChain,
}

impl std::fmt::Display for RiskTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskTrigger::LowFaithfulness => write!(f, "low faithfulness"),
            RiskTrigger::LowCoherence => write!(f, "low coherence"),
            RiskTrigger::Obfuscation => write!(f, "possible obfuscation"),
            RiskTrigger::EmptyChain => write!(f, "no parsable reasoning steps"),
        }
    }
}

/// Monitor verdict for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorResult {
    pub faithfulness_score: f64,
    pub coherence_score: f64,
    pub risk_flag: bool,
    pub monitor_explanation: String,
    pub components: ComponentScores,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<RiskTrigger>,
    /// Backend calls that failed and were scored as worst case.
    #[serde(default)]
    pub degraded_calls: usize,
}

impl MonitorResult {
    /// Selection key: mean of faithfulness and coherence.
    pub fn best_score(&self) -> f64 {
        (self.faithfulness_score + self.coherence_score) / 2.0
    }
}

/// Answer re-derived with a subset of steps removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerturbedOutcome {
    /// Removed step positions, 1-based and ascending.
    pub removed_steps: Vec<usize>,
    pub new_answer: String,
    pub changed: bool,
    /// Set when the re-derivation call failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
}

/// Outcome of a full perturbation experiment on one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerturbationResult {
    pub original_answer: String,
    pub outcomes: Vec<PerturbedOutcome>,
    pub causal_influence_score: f64,
}

/// Request-level metadata attached to every result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub request_id: String,
    /// Candidates actually generated and scored.
    pub n_candidates: usize,
    pub best_index: usize,
    pub best_score: f64,
    pub mode: ReasoningMode,
    pub components: ComponentScores,
    pub backend: String,
    pub parse_status: ParseStatus,
    pub degraded_calls: usize,
}

/// The externally visible result of a reasoning request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningResult {
    pub answer: String,
    pub reasoning_trace: Vec<String>,
    pub faithfulness_score: f64,
    pub coherence_score: f64,
    pub risk_flag: bool,
    pub monitor_explanation: String,
    pub metadata: ResultMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perturbation: Option<PerturbationResult>,
}

/// Live-mode policy outcome: the best chain was risk-flagged and withheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskBlocked {
    pub request_id: String,
    pub explanation: String,
    pub faithfulness_score: f64,
    pub coherence_score: f64,
    pub components: ComponentScores,
}

/// What a reasoning request produced when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningOutcome {
    Completed(Box<ReasoningResult>),
    Blocked(RiskBlocked),
}

impl ReasoningOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, ReasoningOutcome::Blocked(_))
    }

    pub fn into_result(self) -> Option<ReasoningResult> {
        match self {
            ReasoningOutcome::Completed(result) => Some(*result),
            ReasoningOutcome::Blocked(_) => None,
        }
    }
}

/// Orchestrator pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    Generating,
    Scoring,
    Selecting,
    Perturbing,
    Assembling,
    Done,
    Failed,
}

impl PipelineState {
    fn ordinal(self) -> u8 {
        match self {
            PipelineState::Init => 0,
            PipelineState::Generating => 1,
            PipelineState::Scoring => 2,
            PipelineState::Selecting => 3,
            PipelineState::Perturbing => 4,
            PipelineState::Assembling => 5,
            PipelineState::Done => 6,
            PipelineState::Failed => 7,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// The pipeline only moves forward one stage at a time, except that
    /// `Perturbing` may be skipped and `Failed` is reachable from any
    /// non-terminal state.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == PipelineState::Failed {
            return true;
        }
        match (self, next) {
            (PipelineState::Selecting, PipelineState::Assembling) => true,
            _ => next.ordinal() == self.ordinal() + 1,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Init => "init",
            PipelineState::Generating => "generating",
            PipelineState::Scoring => "scoring",
            PipelineState::Selecting => "selecting",
            PipelineState::Perturbing => "perturbing",
            PipelineState::Assembling => "assembling",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mode_serde_lowercase() {
        assert_eq!(serde_json::to_string(&ReasoningMode::Dryrun).unwrap(), "\"dryrun\"");
        let mode: ReasoningMode = serde_json::from_str("\"perturb\"").unwrap();
        assert_eq!(mode, ReasoningMode::Perturb);
        assert!(serde_json::from_str::<ReasoningMode>("\"batch\"").is_err());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("LIVE".parse::<ReasoningMode>().unwrap(), ReasoningMode::Live);
        assert!("fast".parse::<ReasoningMode>().is_err());
    }

    #[test]
    fn test_request_mode_defaults_to_live() {
        let req: ReasoningRequest = serde_json::from_value(json!({"input": "hi"})).unwrap();
        assert_eq!(req.mode, ReasoningMode::Live);
        assert!(req.context.is_none());
        assert!(req.request_id.is_none());
    }

    #[test]
    fn test_request_validation() {
        let req = ReasoningRequest::new("What is 2+2?", ReasoningMode::Dryrun);
        assert!(req.validate(100).is_ok());

        let blank = ReasoningRequest::new("   \n", ReasoningMode::Live);
        assert_eq!(blank.validate(100), Err(ValidationError::EmptyInput));

        let long = ReasoningRequest::new("x".repeat(11), ReasoningMode::Live);
        assert_eq!(
            long.validate(10),
            Err(ValidationError::InputTooLong { len: 11, max: 10 })
        );
    }

    #[test]
    fn test_request_id_validation() {
        let ok = ReasoningRequest::new("q", ReasoningMode::Live).with_request_id("req-42_a.b:c");
        assert!(ok.validate(100).is_ok());

        let spaced = ReasoningRequest::new("q", ReasoningMode::Live).with_request_id("req 42");
        assert!(matches!(
            spaced.validate(100),
            Err(ValidationError::InvalidRequestId { .. })
        ));

        let empty = ReasoningRequest::new("q", ReasoningMode::Live).with_request_id("");
        assert!(empty.validate(100).is_err());

        let long = ReasoningRequest::new("q", ReasoningMode::Live)
            .with_request_id("a".repeat(MAX_REQUEST_ID_LEN + 1));
        assert!(long.validate(100).is_err());
    }

    #[test]
    fn test_context_must_be_scalar() {
        let ok = ReasoningRequest::new("q", ReasoningMode::Live)
            .with_context("user", json!("alice"))
            .with_context("depth", json!(2))
            .with_context("strict", json!(true))
            .with_context("extra", json!(null));
        assert!(ok.validate(100).is_ok());

        let nested = ReasoningRequest::new("q", ReasoningMode::Live)
            .with_context("history", json!(["a", "b"]));
        assert_eq!(
            nested.validate(100),
            Err(ValidationError::InvalidContextValue {
                key: "history".into()
            })
        );
    }

    #[test]
    fn test_best_score_is_mean() {
        let result = MonitorResult {
            faithfulness_score: 0.8,
            coherence_score: 0.4,
            risk_flag: false,
            monitor_explanation: String::new(),
            components: ComponentScores::empty_chain(),
            triggers: vec![],
            degraded_calls: 0,
        };
        assert!((result.best_score() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_perturbed_outcome_hides_failed_when_false() {
        let outcome = PerturbedOutcome {
            removed_steps: vec![1, 2],
            new_answer: "4".into(),
            changed: false,
            failed: false,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert!(value.get("failed").is_none());
        assert_eq!(value["removed_steps"], json!([1, 2]));
    }

    #[test]
    fn test_pipeline_forward_transitions() {
        use PipelineState::*;
        assert!(Init.can_transition_to(Generating));
        assert!(Generating.can_transition_to(Scoring));
        assert!(Scoring.can_transition_to(Selecting));
        assert!(Selecting.can_transition_to(Perturbing));
        assert!(Selecting.can_transition_to(Assembling));
        assert!(Perturbing.can_transition_to(Assembling));
        assert!(Assembling.can_transition_to(Done));
    }

    #[test]
    fn test_pipeline_rejects_backward_and_skips() {
        use PipelineState::*;
        assert!(!Scoring.can_transition_to(Generating));
        assert!(!Init.can_transition_to(Scoring));
        assert!(!Generating.can_transition_to(Done));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Init));
        assert!(!Assembling.can_transition_to(Assembling));
    }

    #[test]
    fn test_pipeline_failed_reachable_from_any_active_state() {
        use PipelineState::*;
        for state in [Init, Generating, Scoring, Selecting, Perturbing, Assembling] {
            assert!(state.can_transition_to(Failed), "{state} -> failed");
        }
    }

    #[test]
    fn test_outcome_into_result() {
        let blocked = ReasoningOutcome::Blocked(RiskBlocked {
            request_id: "r".into(),
            explanation: "x".into(),
            faithfulness_score: 0.1,
            coherence_score: 0.2,
            components: ComponentScores::empty_chain(),
        });
        assert!(blocked.is_blocked());
        assert!(blocked.into_result().is_none());
    }
}
