//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use cotaudit_core::gateway::{GatewayState, run_gateway};
use cotaudit_core::{
    AuditConfig, ReasoningOrchestrator, ReasoningOutcome, ReasoningRequest, ReasoningResult,
    RiskBlocked,
};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Global flags that override the loaded configuration.
#[derive(Debug, Default)]
pub struct Overrides {
    pub backend: Option<String>,
    pub model: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut AuditConfig) {
        if let Some(backend) = &self.backend {
            config.backend.provider = backend.clone();
        }
        if let Some(model) = &self.model {
            config.backend.model = Some(model.clone());
        }
    }
}

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    overrides: &Overrides,
) -> anyhow::Result<()> {
    match command {
        Commands::Reason {
            input,
            mode,
            context,
            request_id,
            json,
        } => {
            let mut request = ReasoningRequest::new(input, mode);
            for (key, value) in parse_context(&context)? {
                request = request.with_context(key, value);
            }
            if let Some(id) = request_id {
                request = request.with_request_id(id);
            }
            handle_reason(request, json, workspace, overrides).await
        }
        Commands::Serve { host, port } => handle_serve(host, port, workspace, overrides).await,
        Commands::Config { action } => handle_config(action, workspace, overrides).await,
    }
}

fn load(workspace: &Path, overrides: &Overrides) -> anyhow::Result<AuditConfig> {
    let mut config = cotaudit_core::load_config(Some(workspace))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    overrides.apply(&mut config);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    Ok(config)
}

async fn handle_reason(
    request: ReasoningRequest,
    json: bool,
    workspace: &Path,
    overrides: &Overrides,
) -> anyhow::Result<()> {
    let config = Arc::new(load(workspace, overrides)?);
    let orchestrator = ReasoningOrchestrator::from_config(config)?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    let outcome = orchestrator.reason_with_cancel(request, cancel).await;
    ctrl_c.abort();

    match outcome? {
        ReasoningOutcome::Completed(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print!("{}", render_result(&result));
            }
            Ok(())
        }
        ReasoningOutcome::Blocked(blocked) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&blocked)?);
            } else {
                print!("{}", render_blocked(&blocked));
            }
            anyhow::bail!("Reasoning blocked by the monitor: {}", blocked.explanation)
        }
    }
}

async fn handle_serve(
    host: Option<String>,
    port: Option<u16>,
    workspace: &Path,
    overrides: &Overrides,
) -> anyhow::Result<()> {
    let mut config = load(workspace, overrides)?;
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }
    let addr = config.gateway.bind_addr();

    let orchestrator = ReasoningOrchestrator::from_config(Arc::new(config))?;
    let backend = orchestrator.backend_name().to_string();
    let state = Arc::new(GatewayState::new(Arc::new(orchestrator)));

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            trigger.cancel();
        }
    });

    println!("cotaudit gateway listening on http://{addr} (backend: {backend})");
    println!("Press Ctrl-C to stop.");
    run_gateway(state, shutdown).await?;
    Ok(())
}

async fn handle_config(
    action: ConfigAction,
    workspace: &Path,
    overrides: &Overrides,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let (path, created) = cotaudit_core::config::init_workspace_config(workspace)?;
            if created {
                println!("Created default configuration at: {}", path.display());
            } else {
                println!("Configuration file already exists at: {}", path.display());
            }
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace, overrides)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

/// Parse `key=value` context entries. Numbers, booleans, and `null` keep
/// their JSON type; anything else is a string.
fn parse_context(entries: &[String]) -> anyhow::Result<Vec<(String, serde_json::Value)>> {
    entries
        .iter()
        .map(|entry| {
            let (key, raw) = entry.split_once('=').ok_or_else(|| {
                anyhow::anyhow!("Invalid context entry '{}': expected key=value", entry)
            })?;
            let key = key.trim();
            if key.is_empty() {
                anyhow::bail!("Invalid context entry '{}': empty key", entry);
            }
            let value = match serde_json::from_str::<serde_json::Value>(raw.trim()) {
                Ok(v) if v.is_number() || v.is_boolean() || v.is_null() => v,
                _ => serde_json::Value::String(raw.to_string()),
            };
            Ok((key.to_string(), value))
        })
        .collect()
}

fn render_result(result: &ReasoningResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Answer: {}", result.answer);
    let _ = writeln!(out);

    if result.reasoning_trace.is_empty() {
        let _ = writeln!(out, "Reasoning: (no steps parsed)");
    } else {
        let _ = writeln!(out, "Reasoning:");
        for (i, step) in result.reasoning_trace.iter().enumerate() {
            let _ = writeln!(out, "  {}. {}", i + 1, step);
        }
    }
    let _ = writeln!(out);

    let risk = if result.risk_flag { "FLAGGED" } else { "none" };
    let _ = writeln!(
        out,
        "Faithfulness: {:.2}  Coherence: {:.2}  Risk: {}",
        result.faithfulness_score, result.coherence_score, risk
    );
    let c = &result.metadata.components;
    let _ = writeln!(
        out,
        "Components: counterfactual {:.2}, entailment {:.2}, coherence {:.2}, obfuscation {:.2}",
        c.counterfactual_influence, c.step_entailment, c.coherence, c.obfuscation
    );
    let _ = writeln!(out, "Monitor: {}", result.monitor_explanation);

    if let Some(perturbation) = &result.perturbation {
        let changed = perturbation.outcomes.iter().filter(|o| o.changed).count();
        let _ = writeln!(
            out,
            "Perturbation: {} of {} removals changed the answer (causal influence {:.2})",
            changed,
            perturbation.outcomes.len(),
            perturbation.causal_influence_score
        );
        for outcome in &perturbation.outcomes {
            let status = if outcome.failed {
                "failed"
            } else if outcome.changed {
                "changed"
            } else {
                "same"
            };
            let _ = writeln!(
                out,
                "  removed {:?} -> {} ({})",
                outcome.removed_steps, outcome.new_answer, status
            );
        }
    }

    let m = &result.metadata;
    let _ = writeln!(
        out,
        "Request {} ({} mode, backend {}, best of {} candidates: #{})",
        m.request_id, m.mode, m.backend, m.n_candidates, m.best_index
    );
    out
}

fn render_blocked(blocked: &RiskBlocked) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Response withheld: the best reasoning chain was risk-flagged.");
    let _ = writeln!(
        out,
        "Faithfulness: {:.2}  Coherence: {:.2}",
        blocked.faithfulness_score, blocked.coherence_score
    );
    let _ = writeln!(out, "Monitor: {}", blocked.explanation);
    let _ = writeln!(out, "Request {}", blocked.request_id);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cotaudit_core::ReasoningMode;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn mock_overrides() -> Overrides {
        Overrides {
            backend: Some("mock".into()),
            model: None,
        }
    }

    #[tokio::test]
    async fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();

        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, workspace, &Overrides::default())
            .await
            .unwrap();

        let config_path = workspace.join(".cotaudit").join("config.toml");
        assert!(config_path.exists());

        // Verify it's valid TOML
        let content = std::fs::read_to_string(&config_path).unwrap();
        let parsed: AuditConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed, AuditConfig::default());
    }

    #[tokio::test]
    async fn test_config_init_idempotent() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();
        let config_path = workspace.join(".cotaudit").join("config.toml");
        std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        std::fs::write(&config_path, "[pipeline]\nn_candidates = 5\n").unwrap();

        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, workspace, &Overrides::default())
            .await
            .unwrap();

        let content = std::fs::read_to_string(&config_path).unwrap();
        assert_eq!(content, "[pipeline]\nn_candidates = 5\n");
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = AuditConfig::default();
        Overrides {
            backend: Some("gemini".into()),
            model: Some("gemini-1.5-pro".into()),
        }
        .apply(&mut config);
        assert_eq!(config.backend.provider, "gemini");
        assert_eq!(config.backend.model.as_deref(), Some("gemini-1.5-pro"));
    }

    #[test]
    fn test_unknown_backend_override_is_rejected() {
        let dir = TempDir::new().unwrap();
        let overrides = Overrides {
            backend: Some("nonexistent".into()),
            model: None,
        };
        let err = load(dir.path(), &overrides).unwrap_err();
        assert!(err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_parse_context() {
        let entries = vec![
            "unit=apples".to_string(),
            "count=3".to_string(),
            "strict=true".to_string(),
            "note=a=b".to_string(),
        ];
        let parsed = parse_context(&entries).unwrap();
        assert_eq!(
            parsed,
            vec![
                ("unit".to_string(), serde_json::json!("apples")),
                ("count".to_string(), serde_json::json!(3)),
                ("strict".to_string(), serde_json::json!(true)),
                ("note".to_string(), serde_json::json!("a=b")),
            ]
        );
    }

    #[test]
    fn test_parse_context_rejects_malformed() {
        assert!(parse_context(&["novalue".to_string()]).is_err());
        assert!(parse_context(&["=x".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_reason_with_mock_backend() {
        let dir = TempDir::new().unwrap();
        let command = Commands::Reason {
            input: "What is 2+2?".into(),
            mode: ReasoningMode::Dryrun,
            context: vec![],
            request_id: Some("cli-1".into()),
            json: true,
        };
        handle_command(command, dir.path(), &mock_overrides())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocked_reason_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join(".cotaudit").join("config.toml");
        std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        std::fs::write(&config_path, "[monitor]\nfaithfulness_threshold = 0.99\n").unwrap();

        let command = Commands::Reason {
            input: "What is 2+2?".into(),
            mode: ReasoningMode::Live,
            context: vec![],
            request_id: None,
            json: false,
        };
        let err = handle_command(command, dir.path(), &mock_overrides())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("blocked"));
    }

    #[tokio::test]
    async fn test_render_result_text() {
        let orchestrator = ReasoningOrchestrator::new(
            Arc::new(cotaudit_core::MockBackend::new()),
            Arc::new(AuditConfig::default()),
        );
        let result = orchestrator
            .reason(ReasoningRequest::new("What is 2+2?", ReasoningMode::Perturb).with_request_id("r-1"))
            .await
            .unwrap()
            .into_result()
            .unwrap();

        let text = render_result(&result);
        assert!(text.starts_with("Answer: 4\n"));
        assert!(text.contains("  2. Adding 2 and 2 gives 4."));
        assert!(text.contains("Perturbation: 1 of 6 removals changed the answer"));
        assert!(text.contains("removed [2, 3] -> 2 (changed)"));
        assert!(text.contains("Request r-1 (perturb mode, backend mock"));
    }
}
