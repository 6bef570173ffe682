//! Reasoning Orchestrator.
//!
//! Runs one request through the pipeline
//! `Init → Generating → Scoring → Selecting → (Perturbing) → Assembling → Done`
//! and applies the mode policy. Any unrecoverable error moves the request to
//! `Failed`. Requests share nothing but the read-only configuration and the
//! backend handle.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::backend::{CallPolicy, ModelBackend, create_backend};
use crate::config::AuditConfig;
use crate::error::AuditError;
use crate::generator::CandidateGenerator;
use crate::monitor::CotMonitor;
use crate::perturbation::PerturbationEngine;
use crate::types::{
    MonitorResult, PipelineState, ReasoningMode, ReasoningOutcome, ReasoningRequest,
    ReasoningResult, ResultMetadata, RiskBlocked,
};

/// Top-level coordinator for reasoning requests.
pub struct ReasoningOrchestrator {
    backend: Arc<dyn ModelBackend>,
    config: Arc<AuditConfig>,
    generator: CandidateGenerator,
    monitor: CotMonitor,
    perturbation: PerturbationEngine,
}

impl ReasoningOrchestrator {
    pub fn new(backend: Arc<dyn ModelBackend>, config: Arc<AuditConfig>) -> Self {
        Self {
            generator: CandidateGenerator::new(backend.clone()),
            monitor: CotMonitor::new(backend.clone(), config.monitor.clone()),
            perturbation: PerturbationEngine::new(backend.clone(), &config.pipeline),
            backend,
            config,
        }
    }

    /// Build the backend named in `config` and wire an orchestrator around it.
    pub fn from_config(config: Arc<AuditConfig>) -> Result<Self, AuditError> {
        let backend = create_backend(&config.backend).map_err(|e| {
            warn!(provider = %config.backend.provider, error = %e, "Backend initialization failed");
            AuditError::BackendUnavailable {
                message: e.to_string(),
            }
        })?;
        Ok(Self::new(backend, config))
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Process one request to completion.
    pub async fn reason(&self, request: ReasoningRequest) -> Result<ReasoningOutcome, AuditError> {
        self.reason_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Process one request; cancelling `cancel` aborts its outstanding
    /// backend calls and fails the request with `AuditError::Cancelled`.
    pub async fn reason_with_cancel(
        &self,
        request: ReasoningRequest,
        cancel: CancellationToken,
    ) -> Result<ReasoningOutcome, AuditError> {
        request.validate(self.config.pipeline.max_input_chars)?;

        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = info_span!("reason", request_id = %request_id, mode = %request.mode);

        let mut pipeline = Pipeline::new();
        let outcome = self
            .run(&request, &request_id, &mut pipeline, cancel)
            .instrument(span)
            .await;
        if let Err(e) = &outcome {
            let failed_from = pipeline.fail();
            warn!(
                request_id = %request_id,
                kind = e.kind(),
                from = %failed_from,
                state = %pipeline.state,
                error = %e,
                "Reasoning request failed"
            );
        }
        outcome
    }

    async fn run(
        &self,
        request: &ReasoningRequest,
        request_id: &str,
        pipeline: &mut Pipeline,
        cancel: CancellationToken,
    ) -> Result<ReasoningOutcome, AuditError> {
        let started = Instant::now();
        let policy = CallPolicy::new(self.config.pipeline.call_timeout(), cancel);

        pipeline.advance(PipelineState::Generating)?;
        let candidates = self
            .generator
            .generate(request, self.config.pipeline.n_candidates, &policy)
            .await?;

        pipeline.advance(PipelineState::Scoring)?;
        let assessments: Vec<MonitorResult> = join_all(
            candidates
                .iter()
                .map(|c| self.monitor.assess(c, &request.input, &policy)),
        )
        .await;
        if policy.is_cancelled() {
            return Err(AuditError::Cancelled);
        }

        pipeline.advance(PipelineState::Selecting)?;
        let best_index = select_best(&assessments).ok_or_else(|| AuditError::BackendUnavailable {
            message: "no candidates to select from".to_string(),
        })?;
        let candidate = &candidates[best_index];
        let mut verdict = assessments[best_index].clone();
        let best_score = verdict.best_score();
        let degraded_calls: usize = assessments.iter().map(|a| a.degraded_calls).sum();
        debug!(best_index, best_score, candidates = candidates.len(), "Selected best candidate");

        let mut perturbation = None;
        if request.mode == ReasoningMode::Perturb {
            pipeline.advance(PipelineState::Perturbing)?;
            let result = self
                .perturbation
                .run(&request.input, candidate, &policy)
                .await;
            if policy.is_cancelled() {
                return Err(AuditError::Cancelled);
            }
            verdict = self
                .monitor
                .rescore_with_influence(&verdict, result.causal_influence_score);
            perturbation = Some(result);
        }

        pipeline.advance(PipelineState::Assembling)?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if request.mode == ReasoningMode::Live && verdict.risk_flag {
            pipeline.advance(PipelineState::Done)?;
            info!(
                elapsed_ms,
                faithfulness = verdict.faithfulness_score,
                coherence = verdict.coherence_score,
                "Best candidate risk-flagged; blocking live response"
            );
            return Ok(ReasoningOutcome::Blocked(RiskBlocked {
                request_id: request_id.to_string(),
                explanation: verdict.monitor_explanation,
                faithfulness_score: verdict.faithfulness_score,
                coherence_score: verdict.coherence_score,
                components: verdict.components,
            }));
        }

        let result = ReasoningResult {
            answer: candidate.answer.clone(),
            reasoning_trace: candidate.steps.clone(),
            faithfulness_score: verdict.faithfulness_score,
            coherence_score: verdict.coherence_score,
            risk_flag: verdict.risk_flag,
            monitor_explanation: verdict.monitor_explanation,
            metadata: ResultMetadata {
                request_id: request_id.to_string(),
                n_candidates: candidates.len(),
                best_index,
                best_score,
                mode: request.mode,
                components: verdict.components,
                backend: self.backend.name().to_string(),
                parse_status: candidate.parse_status,
                degraded_calls,
            },
            perturbation,
        };
        pipeline.advance(PipelineState::Done)?;
        info!(
            elapsed_ms,
            faithfulness = result.faithfulness_score,
            coherence = result.coherence_score,
            risk_flag = result.risk_flag,
            "Reasoning request complete"
        );
        Ok(ReasoningOutcome::Completed(Box::new(result)))
    }
}

/// Index of the candidate with the highest `(faithfulness + coherence) / 2`.
///
/// Ties resolve to the lowest index.
pub fn select_best(results: &[MonitorResult]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, result) in results.iter().enumerate() {
        let score = result.best_score();
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((i, score)),
        }
    }
    best.map(|(i, _)| i)
}

/// Per-request state machine guard.
struct Pipeline {
    state: PipelineState,
}

impl Pipeline {
    fn new() -> Self {
        Self {
            state: PipelineState::Init,
        }
    }

    fn advance(&mut self, next: PipelineState) -> Result<(), AuditError> {
        if !self.state.can_transition_to(next) {
            return Err(AuditError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(from = %self.state, to = %next, "Pipeline transition");
        self.state = next;
        Ok(())
    }

    /// Move to `Failed` unless already terminal; returns the prior state.
    fn fail(&mut self) -> PipelineState {
        let previous = self.state;
        if !previous.is_terminal() {
            self.state = PipelineState::Failed;
        }
        previous
    }
}
