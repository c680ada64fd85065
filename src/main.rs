mod backoff;
mod compiler;
mod config;
mod error;
mod llm;
mod sandbox;
mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::llm::{LlmClient, OpenAiClient};
use crate::sandbox::Workspace;
use crate::server::AppState;

fn print_help() {
    println!(
        "\
burrow-agent v{}

An HTTP task agent that plans natural-language tasks with an LLM and
runs them inside a confined data directory.

USAGE:
    burrow-agent [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/agent.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG         Log level filter for tracing
                     (e.g. debug, burrow_agent=debug,warn)
    AIPROXY_TOKEN    Bearer token for the chat-completions endpoint

ENDPOINTS:
    POST /run?task=...[&image=...]    Plan and execute a task
    GET  /read?path=...               Read a file under the data directory
    GET  /health                      Liveness check

EXAMPLES:
    burrow-agent                           # uses config/agent.toml
    burrow-agent /etc/burrow/agent.toml    # custom config path
    RUST_LOG=debug burrow-agent            # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("burrow-agent v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("burrow_agent=info")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/agent.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    let workspace = Arc::new(Workspace::open(&config.sandbox)?);
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(config.llm.clone())?);

    info!("Data directory: {}", workspace.root().display());
    info!("LLM: {}", llm.description());
    info!(
        "Denied command tokens: {}",
        config.sandbox.denied_tokens.join(", ")
    );
    info!(
        "Timeouts: command {}s, fragment {}s, model {}s",
        config.sandbox.command_timeout_secs,
        config.sandbox.execution_timeout_secs,
        config.llm.timeout_secs
    );

    let state = AppState::new(workspace, llm, &config.sandbox);

    let bind_address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("cannot bind {bind_address}"))?;
    info!("Listening on http://{bind_address}");

    server::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, draining requests");
    })
    .await?;

    info!("Server stopped");
    Ok(())
}
