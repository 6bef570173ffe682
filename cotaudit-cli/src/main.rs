//! cotaudit CLI: audit chain-of-thought reasoning from the terminal, or
//! serve the audit pipeline over HTTP.

mod commands;

use clap::Parser;
use cotaudit_core::ReasoningMode;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// cotaudit: generate, monitor, and stress-test chain-of-thought reasoning
#[derive(Parser, Debug)]
#[command(name = "cotaudit", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (its .cotaudit/config.toml is layered in)
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Model backend to use: mock, openai, gemini
    #[arg(short, long, global = true)]
    backend: Option<String>,

    /// Model name for the selected backend
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run one reasoning request and print the audited result
    Reason {
        /// The question or task to reason about
        input: String,

        /// Policy mode: live, dryrun, perturb
        #[arg(long, default_value = "live")]
        mode: ReasoningMode,

        /// Context entries as key=value pairs (repeatable)
        #[arg(short, long = "context", value_name = "KEY=VALUE")]
        context: Vec<String>,

        /// Caller-supplied request id
        #[arg(long)]
        request_id: Option<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve the HTTP gateway until Ctrl-C
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default .cotaudit/config.toml into the workspace
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_filter = if cli.verbose == 0 && !cli.quiet {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter))
    } else {
        EnvFilter::new(filter)
    };

    // Human-readable layer for stderr (always active)
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter);

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "cotaudit", "cotaudit")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "cotaudit.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    // Resolve workspace
    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let overrides = commands::Overrides {
        backend: cli.backend,
        model: cli.model,
    };
    commands::handle_command(cli.command, &workspace, &overrides).await
}
