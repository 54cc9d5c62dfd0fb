//! raccoonai-mcp - MCP server for the Raccoon AI LAM API
//!
//! This binary exposes the Raccoon LAM web-automation API as MCP tools for
//! AI assistants like Claude Desktop.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use raccoonai_mcp::client::{LamClient, RetryPolicy, RetryingBackend};
use raccoonai_mcp::poller::PollPolicy;
use raccoonai_mcp::tools::{ToolContext, ToolRegistry};
use raccoonai_mcp::{Config, Gateway, McpServer};

/// MCP server for the Raccoon AI LAM web-automation API.
#[derive(Parser, Debug)]
#[command(name = "raccoonai-mcp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run in stdio mode (standard MCP transport).
    #[arg(long, default_value = "true")]
    stdio: bool,

    /// Overall deadline for a single LAM task, in seconds.
    #[arg(long, default_value = "300")]
    max_wait: u64,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Log to stderr (not stdout, which is used for MCP protocol)
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!(
        "Starting {} v{}",
        raccoonai_mcp::server::SERVER_NAME,
        raccoonai_mcp::server::SERVER_VERSION
    );

    // Refuse to start without credentials, before any tool is registered.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let client = match LamClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let backend = Arc::new(RetryingBackend::new(client, RetryPolicy::default()));

    let poll_policy = PollPolicy {
        max_wait: Duration::from_secs(args.max_wait),
        ..PollPolicy::default()
    };

    let registry = ToolRegistry::new(ToolContext::new(backend, poll_policy));
    let server = McpServer::new(Gateway::new(registry));

    if args.stdio {
        match server.run_stdio().await {
            Ok(()) => {
                tracing::info!("Server exited cleanly");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!("Server error: {}", e);
                ExitCode::FAILURE
            }
        }
    } else {
        tracing::error!("Only stdio mode is currently supported");
        ExitCode::FAILURE
    }
}
