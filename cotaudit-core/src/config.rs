//! Configuration system for cotaudit.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment.
//! Configuration is loaded from `~/.config/cotaudit/config.toml` and/or
//! `.cotaudit/config.toml` in the workspace directory. The flat service variables
//! (`FAITHFULNESS_THRESHOLD`, `COHERENCE_THRESHOLD`, `N_CANDIDATES`,
//! `PERTURB_STEPS_MAX`, `MODEL_BACKEND`) are honored as well as nested
//! `COTAUDIT_SECTION__FIELD` variables.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::gateway::GatewayConfig;

/// Largest accepted `perturb_steps_max`; keeps the subset count polynomial in K.
pub const MAX_PERTURB_STEPS: usize = 3;

/// Flat environment variables and the nested keys they populate.
const SERVICE_ENV_KEYS: &[(&str, &str)] = &[
    ("FAITHFULNESS_THRESHOLD", "monitor.faithfulness_threshold"),
    ("COHERENCE_THRESHOLD", "monitor.coherence_threshold"),
    ("N_CANDIDATES", "pipeline.n_candidates"),
    ("PERTURB_STEPS_MAX", "pipeline.perturb_steps_max"),
    ("MODEL_BACKEND", "backend.provider"),
];

/// Top-level configuration, read once at startup and immutable per request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuditConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Thresholds and weights used by the CoT monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    /// Faithfulness strictly below this value raises the risk flag.
    pub faithfulness_threshold: f64,
    /// Coherence strictly below this value raises the risk flag.
    pub coherence_threshold: f64,
    /// Obfuscation strictly above this value raises the risk flag.
    pub obfuscation_ceiling: f64,
    /// Adjacent-step entailment strictly below this value counts as a contradiction.
    pub contradiction_threshold: f64,
    /// Weights combining counterfactual influence and step entailment.
    #[serde(default)]
    pub weights: FaithfulnessWeights,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            faithfulness_threshold: 0.6,
            coherence_threshold: 0.5,
            obfuscation_ceiling: 0.7,
            contradiction_threshold: 0.3,
            weights: FaithfulnessWeights::default(),
        }
    }
}

/// Weights for `faithfulness = counterfactual * ci + entailment * se`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FaithfulnessWeights {
    pub counterfactual: f64,
    pub entailment: f64,
}

impl Default for FaithfulnessWeights {
    fn default() -> Self {
        Self {
            counterfactual: 0.5,
            entailment: 0.5,
        }
    }
}

/// Candidate generation and perturbation limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Number of candidate chains generated per request.
    pub n_candidates: usize,
    /// Largest subset of steps removed in one perturbation.
    pub perturb_steps_max: usize,
    /// Upper bound for a single backend call.
    pub call_timeout_ms: u64,
    /// Maximum backend calls in flight for one perturbation run.
    pub max_concurrent_calls: usize,
    /// Longest accepted input, in characters.
    pub max_input_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            n_candidates: 3,
            perturb_steps_max: 2,
            call_timeout_ms: 30_000,
            max_concurrent_calls: 8,
            max_input_chars: 16_000,
        }
    }
}

impl PipelineConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Which Model Backend implementation is wired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Mock,
    OpenAi,
    Gemini,
}

impl std::str::FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(BackendKind::Mock),
            "openai" => Ok(BackendKind::OpenAi),
            "gemini" => Ok(BackendKind::Gemini),
            other => Err(ConfigError::UnknownBackend {
                name: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Mock => write!(f, "mock"),
            BackendKind::OpenAi => write!(f, "openai"),
            BackendKind::Gemini => write!(f, "gemini"),
        }
    }
}

/// Model Backend selection and hosted-provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Provider name: "mock", "openai", or "gemini".
    pub provider: String,
    /// Model identifier; provider default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Environment variable holding the API key; provider default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Explicit API key, never written back to disk.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Optional base URL override (Azure, Ollama, vLLM, proxies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Sampling temperature for chain generation.
    pub temperature: f32,
    /// Completion length limit.
    pub max_tokens: usize,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: None,
            api_key_env: None,
            api_key: None,
            base_url: None,
            temperature: 0.7,
            max_tokens: 1000,
            retry: RetryConfig::default(),
        }
    }
}

impl BackendConfig {
    pub fn kind(&self) -> Result<BackendKind, ConfigError> {
        self.provider.parse()
    }

    /// Model identifier with the provider's default applied.
    pub fn effective_model(&self) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        match self.kind() {
            Ok(BackendKind::OpenAi) => "gpt-4o-mini".to_string(),
            Ok(BackendKind::Gemini) => "gemini-2.0-flash".to_string(),
            _ => "mock-cot".to_string(),
        }
    }

    /// API key environment variable with the provider's default applied.
    pub fn effective_api_key_env(&self) -> String {
        if let Some(env) = &self.api_key_env {
            return env.clone();
        }
        match self.kind() {
            Ok(BackendKind::Gemini) => "GEMINI_API_KEY".to_string(),
            _ => "OPENAI_API_KEY".to_string(),
        }
    }
}

/// Exponential backoff settings for transient hosted-provider errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 8000,
            backoff_multiplier: 2.0,
        }
    }
}

impl AuditConfig {
    /// Check ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.monitor;
        for (name, value) in [
            ("monitor.faithfulness_threshold", m.faithfulness_threshold),
            ("monitor.coherence_threshold", m.coherence_threshold),
            ("monitor.obfuscation_ceiling", m.obfuscation_ceiling),
            ("monitor.contradiction_threshold", m.contradiction_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!(
                    "{name} must be between 0.0 and 1.0, got {value}"
                )));
            }
        }

        let w = m.weights;
        if w.counterfactual < 0.0 || w.entailment < 0.0 {
            return Err(invalid("monitor.weights must be non-negative".to_string()));
        }
        if ((w.counterfactual + w.entailment) - 1.0).abs() > 1e-6 {
            return Err(invalid(format!(
                "monitor.weights must sum to 1.0, got {}",
                w.counterfactual + w.entailment
            )));
        }

        let p = &self.pipeline;
        if p.n_candidates == 0 {
            return Err(invalid("pipeline.n_candidates must be at least 1".to_string()));
        }
        if p.perturb_steps_max == 0 || p.perturb_steps_max > MAX_PERTURB_STEPS {
            return Err(invalid(format!(
                "pipeline.perturb_steps_max must be between 1 and {MAX_PERTURB_STEPS}, got {}",
                p.perturb_steps_max
            )));
        }
        if p.call_timeout_ms == 0 {
            return Err(invalid("pipeline.call_timeout_ms must be positive".to_string()));
        }
        if p.max_concurrent_calls == 0 {
            return Err(invalid(
                "pipeline.max_concurrent_calls must be at least 1".to_string(),
            ));
        }
        if p.max_input_chars == 0 {
            return Err(invalid("pipeline.max_input_chars must be positive".to_string()));
        }

        self.backend.kind()?;
        if !(0.0..=2.0).contains(&self.backend.temperature) {
            return Err(invalid(format!(
                "backend.temperature must be between 0.0 and 2.0, got {}",
                self.backend.temperature
            )));
        }
        Ok(())
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid { message }
}

/// Environment provider for the flat service variables.
fn service_env() -> Env {
    let keys: Vec<&str> = SERVICE_ENV_KEYS.iter().map(|(k, _)| *k).collect();
    Env::raw().only(&keys).map(|key| {
        SERVICE_ENV_KEYS
            .iter()
            .find(|(env, _)| key.as_str().eq_ignore_ascii_case(env))
            .map(|(_, path)| (*path).into())
            .unwrap_or_else(|| key.as_str().to_string().into())
    })
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "cotaudit", "cotaudit")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Path of the workspace-local config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".cotaudit").join("config.toml")
}

/// Load configuration from layered sources and validate it.
///
/// Priority (highest to lowest):
/// 1. `COTAUDIT_`-prefixed variables (`COTAUDIT_MONITOR__OBFUSCATION_CEILING`)
/// 2. Flat service variables (`FAITHFULNESS_THRESHOLD`, `N_CANDIDATES`, ...)
/// 3. Workspace-local config (`.cotaudit/config.toml`)
/// 4. User config (`~/.config/cotaudit/config.toml`)
/// 5. Built-in defaults
pub fn load_config(workspace: Option<&Path>) -> Result<AuditConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(AuditConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    figment = figment
        .merge(service_env())
        .merge(Env::prefixed("COTAUDIT_").split("__"));

    let config: AuditConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

/// Write a default config file into the workspace unless one already exists.
///
/// Returns the path and whether a new file was written.
pub fn init_workspace_config(workspace: &Path) -> Result<(PathBuf, bool), ConfigError> {
    let path = workspace_config_path(workspace);
    if path.exists() {
        return Ok((path, false));
    }
    let io_error = |e: std::io::Error| ConfigError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    let toml_str = toml::to_string_pretty(&AuditConfig::default()).map_err(|e| {
        ConfigError::ParseError {
            message: e.to_string(),
        }
    })?;
    std::fs::write(&path, toml_str).map_err(io_error)?;
    Ok((path, true))
}
