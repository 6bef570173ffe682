//! Gateway server: router, handlers, and the serve loop.

use axum::Router;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::AuditError;
use crate::orchestrator::ReasoningOrchestrator;
use crate::types::{ReasoningMode, ReasoningOutcome, ReasoningRequest};

/// Shared, read-only gateway state.
pub struct GatewayState {
    orchestrator: Arc<ReasoningOrchestrator>,
    started_at: Instant,
}

impl GatewayState {
    pub fn new(orchestrator: Arc<ReasoningOrchestrator>) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

pub type SharedState = Arc<GatewayState>;

#[derive(Debug, Default, Deserialize)]
struct ModeQuery {
    mode: Option<ReasoningMode>,
}

/// Build the axum router with the reasoning and health routes.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/reason", post(reason_handler))
        .route("/api/v1/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run one reasoning request.
///
/// A `?mode=` query parameter overrides the mode in the body.
async fn reason_handler(
    State(state): State<SharedState>,
    query: Result<Query<ModeQuery>, QueryRejection>,
    body: Result<axum::Json<ReasoningRequest>, JsonRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(rejection) => return rejected(&rejection.body_text()),
    };
    let axum::Json(mut request) = match body {
        Ok(b) => b,
        Err(rejection) => return rejected(&rejection.body_text()),
    };
    if let Some(mode) = query.mode {
        request.mode = mode;
    }

    // Dropping this handler (client disconnect) cancels the request.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match state
        .orchestrator
        .reason_with_cancel(request, cancel)
        .await
    {
        Ok(ReasoningOutcome::Completed(result)) => {
            (StatusCode::OK, axum::Json(*result)).into_response()
        }
        Ok(ReasoningOutcome::Blocked(blocked)) => {
            let body = json!({
                "kind": "risk_blocked",
                "message": blocked.explanation,
                "request_id": blocked.request_id,
                "faithfulness_score": blocked.faithfulness_score,
                "coherence_score": blocked.coherence_score,
            });
            (StatusCode::CONFLICT, axum::Json(body)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Health check endpoint.
async fn health_handler(State(state): State<SharedState>) -> impl IntoResponse {
    axum::Json(json!({
        "service": "ok",
        "monitor": "ok",
        "backend": state.orchestrator.backend_name(),
        "uptime_secs": state.uptime_secs(),
    }))
}

fn error_response(err: &AuditError) -> Response {
    let status = match err {
        AuditError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AuditError::BackendUnavailable { .. } | AuditError::Cancelled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        AuditError::Config(_) | AuditError::InvalidStateTransition { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_body(status, err.kind(), &err.public_message())
}

/// Malformed body or query string.
fn rejected(message: &str) -> Response {
    error_body(StatusCode::UNPROCESSABLE_ENTITY, "validation_error", message)
}

fn error_body(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        axum::Json(json!({
            "kind": kind,
            "message": message,
        })),
    )
        .into_response()
}

/// Start the gateway on the configured address and serve until `shutdown`
/// is cancelled.
pub async fn run(state: SharedState, shutdown: CancellationToken) -> Result<(), std::io::Error> {
    let addr = state.orchestrator.config().gateway.bind_addr();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("Gateway stopped");
    Ok(())
}
