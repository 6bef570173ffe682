//! # Cotaudit Core
//!
//! Chain-of-thought auditing for LLM reasoning. Generates several reasoning
//! candidates per request, scores each for faithfulness and coherence, picks
//! the best one, optionally measures how much its steps actually drive the
//! answer, and flags or blocks risky reasoning.

pub mod backend;
pub mod config;
pub mod error;
pub mod gateway;
pub mod generator;
pub mod monitor;
pub mod orchestrator;
pub mod parser;
pub mod perturbation;
pub mod types;

// Re-export commonly used types at the crate root.
pub use backend::{CallPolicy, MockBackend, ModelBackend, create_backend};
pub use config::{AuditConfig, BackendConfig, MonitorConfig, PipelineConfig, load_config};
pub use error::{AuditError, BackendError, ConfigError, Result, ValidationError};
pub use gateway::{GatewayConfig, GatewayState};
pub use monitor::CotMonitor;
pub use orchestrator::{ReasoningOrchestrator, select_best};
pub use parser::{ParsedChain, parse_chain};
pub use perturbation::PerturbationEngine;
pub use types::{
    Candidate, ComponentScores, MonitorResult, ParseStatus, PerturbationResult, PerturbedOutcome,
    PipelineState, ReasoningMode, ReasoningOutcome, ReasoningRequest, ReasoningResult,
    ResultMetadata, RiskBlocked, RiskTrigger,
};
