//! End-to-end pipeline scenarios against the deterministic mock backend.

use cotaudit_core::backend::mock::Capability;
use cotaudit_core::{
    AuditConfig, BackendError, MockBackend, ParseStatus, ReasoningMode, ReasoningOrchestrator,
    ReasoningOutcome, ReasoningRequest, RiskTrigger,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TWO_PLUS_TWO: &str = "What is 2+2?";

fn orchestrator(backend: Arc<MockBackend>) -> ReasoningOrchestrator {
    ReasoningOrchestrator::new(backend, Arc::new(AuditConfig::default()))
}

fn orchestrator_with(
    backend: Arc<MockBackend>,
    tweak: impl FnOnce(&mut AuditConfig),
) -> ReasoningOrchestrator {
    let mut config = AuditConfig::default();
    tweak(&mut config);
    ReasoningOrchestrator::new(backend, Arc::new(config))
}

#[tokio::test]
async fn test_dryrun_arithmetic_is_faithful() {
    let orch = orchestrator(Arc::new(MockBackend::new()));
    let outcome = orch
        .reason(ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Dryrun))
        .await
        .unwrap();

    let result = outcome.into_result().expect("dryrun never blocks");
    assert_eq!(result.answer, "4");
    assert_eq!(result.reasoning_trace.len(), 3);
    assert!(result.faithfulness_score >= 0.6);
    assert!(!result.risk_flag);
    assert!(result.perturbation.is_none());
    assert_eq!(result.metadata.n_candidates, 3);
    assert_eq!(result.metadata.best_index, 0);
    assert_eq!(result.metadata.mode, ReasoningMode::Dryrun);
    assert_eq!(result.metadata.parse_status, ParseStatus::Parsed);
    assert_eq!(result.metadata.degraded_calls, 0);
    assert!(result.monitor_explanation.starts_with("High faithfulness"));
}

#[tokio::test]
async fn test_live_arithmetic_is_returned() {
    let orch = orchestrator(Arc::new(MockBackend::new()));
    let outcome = orch
        .reason(ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Live))
        .await
        .unwrap();
    assert!(!outcome.is_blocked());
    assert_eq!(outcome.into_result().unwrap().answer, "4");
}

#[tokio::test]
async fn test_context_is_accepted() {
    let orch = orchestrator(Arc::new(MockBackend::new()));
    let request = ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Dryrun)
        .with_context("unit", serde_json::json!("apples"))
        .with_context("strict", serde_json::json!(true));
    let result = orch.reason(request).await.unwrap().into_result().unwrap();
    assert_eq!(result.answer, "4");
}

#[tokio::test]
async fn test_no_steps_is_risk_flagged() {
    let backend = Arc::new(MockBackend::new().with_completions(["It is just 4, trust me."]));
    let orch = orchestrator(backend);
    let result = orch
        .reason(ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Dryrun))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert!(result.risk_flag);
    assert!(result.reasoning_trace.is_empty());
    assert_eq!(result.faithfulness_score, 0.0);
    assert_eq!(result.metadata.parse_status, ParseStatus::Failed);
    assert!(result
        .monitor_explanation
        .contains(&RiskTrigger::EmptyChain.to_string()));
}

#[tokio::test]
async fn test_live_mode_blocks_risky_reasoning() {
    let backend = Arc::new(MockBackend::new().with_entailment(0.1));
    let orch = orchestrator(backend);
    let outcome = orch
        .reason(ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Live).with_request_id("req-blocked"))
        .await
        .unwrap();

    match outcome {
        ReasoningOutcome::Blocked(blocked) => {
            assert_eq!(blocked.request_id, "req-blocked");
            assert!(blocked.faithfulness_score < 0.6);
            assert!(blocked.explanation.starts_with("Risk flagged"));
        }
        ReasoningOutcome::Completed(_) => panic!("expected a blocked outcome"),
    }
}

#[tokio::test]
async fn test_dryrun_returns_risky_reasoning_with_flag() {
    let backend = Arc::new(MockBackend::new().with_entailment(0.1));
    let orch = orchestrator(backend);
    let result = orch
        .reason(ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Dryrun))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert!(result.risk_flag);
    assert_eq!(result.answer, "4");
}

#[tokio::test]
async fn test_perturb_with_stable_answer_has_zero_influence() {
    let backend = Arc::new(
        MockBackend::new()
            .with_completions(["Step 1: Two plus two.\nStep 2: That makes 4.\nAnswer: 4"])
            .with_answer("4"),
    );
    let orch = orchestrator(backend);
    let result = orch
        .reason(ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Perturb))
        .await
        .unwrap()
        .into_result()
        .expect("perturb never blocks");

    let perturbation = result.perturbation.expect("perturbation result attached");
    assert_eq!(perturbation.outcomes.len(), 3);
    assert!(perturbation.outcomes.iter().all(|o| !o.changed));
    assert_eq!(perturbation.causal_influence_score, 0.0);
    assert_eq!(result.metadata.components.counterfactual_influence, 0.0);
}

#[tokio::test]
async fn test_perturb_ignores_commentary_after_answer() {
    let backend = Arc::new(
        MockBackend::new()
            .with_completions([
                "Step 1: Two plus two.\nStep 2: That makes 4.\nAnswer: 4\nThis follows from basic arithmetic.",
            ])
            .with_answer("4"),
    );
    let orch = orchestrator(backend);
    let result = orch
        .reason(ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Perturb))
        .await
        .unwrap()
        .into_result()
        .expect("perturb never blocks");

    assert_eq!(result.answer, "4");
    let perturbation = result.perturbation.expect("perturbation result attached");
    assert_eq!(perturbation.original_answer, "4");
    assert!(perturbation.outcomes.iter().all(|o| !o.changed));
    assert_eq!(perturbation.causal_influence_score, 0.0);
}

#[tokio::test]
async fn test_perturb_three_steps_default_cap() {
    let orch = orchestrator(Arc::new(MockBackend::new()));
    let result = orch
        .reason(ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Perturb))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let perturbation = result.perturbation.unwrap();
    assert_eq!(perturbation.outcomes.len(), 6);
    assert_eq!(perturbation.original_answer, "4");
    assert!((perturbation.causal_influence_score - 1.0 / 6.0).abs() < 1e-9);
    // The measured influence replaces the heuristic one.
    assert!(
        (result.metadata.components.counterfactual_influence - perturbation.causal_influence_score)
            .abs()
            < 1e-9
    );
}

#[tokio::test]
async fn test_selection_prefers_coherent_candidate() {
    let backend = Arc::new(MockBackend::new().with_completions([
        "Step 1: The result is 4.\nStep 2: The result is not 4.\nAnswer: 4",
        "Step 1: The question asks for the sum of 2 and 2.\n\
         Step 2: Adding 2 and 2 gives 4.\n\
         Step 3: Therefore the result is 4.\n\
         Answer: 4",
    ]));
    let orch = orchestrator_with(backend, |c| c.pipeline.n_candidates = 2);
    let result = orch
        .reason(ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Dryrun))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert_eq!(result.metadata.n_candidates, 2);
    assert_eq!(result.metadata.best_index, 1);
    assert_eq!(result.coherence_score, 1.0);
    assert_eq!(result.reasoning_trace.len(), 3);
}

#[tokio::test]
async fn test_same_request_id_is_deterministic() {
    let orch = orchestrator(Arc::new(MockBackend::new()));
    let request = ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Perturb).with_request_id("fixed-1");

    let first = orch.reason(request.clone()).await.unwrap();
    let second = orch.reason(request).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_all_generation_failures_are_backend_unavailable() {
    let backend = Arc::new(MockBackend::new().with_failure(
        Capability::Generate,
        BackendError::Connection {
            message: "upstream exploded at 10.0.0.7".into(),
        },
    ));
    let orch = orchestrator(backend.clone());
    let err = orch
        .reason(ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Dryrun))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "backend_unavailable");
    assert!(!err.public_message().contains("10.0.0.7"));
    assert_eq!(backend.calls(Capability::Entailment), 0);
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let backend = Arc::new(MockBackend::new().with_delay(Duration::from_millis(500)));
    let orch = orchestrator_with(backend, |c| c.pipeline.call_timeout_ms = 20);
    let err = orch
        .reason(ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Dryrun))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "backend_unavailable");
}

#[tokio::test]
async fn test_cancelled_request_fails() {
    let backend = Arc::new(MockBackend::new().with_delay(Duration::from_millis(200)));
    let orch = orchestrator(backend);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = orch
        .reason_with_cancel(ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Dryrun), cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "cancelled");
}

#[tokio::test]
async fn test_scoring_failures_degrade_but_complete() {
    let backend = Arc::new(MockBackend::new().with_failure(
        Capability::Obfuscation,
        BackendError::Timeout { timeout_ms: 5 },
    ));
    let orch = orchestrator(backend);
    let result = orch
        .reason(ReasoningRequest::new(TWO_PLUS_TWO, ReasoningMode::Dryrun))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    assert!(result.risk_flag);
    assert_eq!(result.metadata.components.obfuscation, 1.0);
    // Two obfuscation calls per candidate, three candidates.
    assert_eq!(result.metadata.degraded_calls, 6);
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let backend = Arc::new(MockBackend::new());
    let orch = orchestrator_with(backend.clone(), |c| c.pipeline.max_input_chars = 10);

    let too_long = orch
        .reason(ReasoningRequest::new("This input is far too long", ReasoningMode::Dryrun))
        .await
        .unwrap_err();
    assert_eq!(too_long.kind(), "validation_error");

    let bad_id = orch
        .reason(ReasoningRequest::new("2+2?", ReasoningMode::Dryrun).with_request_id("has space"))
        .await
        .unwrap_err();
    assert_eq!(bad_id.kind(), "validation_error");

    let nested = orch
        .reason(
            ReasoningRequest::new("2+2?", ReasoningMode::Dryrun)
                .with_context("nested", serde_json::json!({"a": 1})),
        )
        .await
        .unwrap_err();
    assert_eq!(nested.kind(), "validation_error");

    assert_eq!(backend.total_calls(), 0);
}
