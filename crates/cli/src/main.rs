//! toolbridge CLI, the main entry point.
//!
//! Commands:
//! - `serve`: Start the OpenAI-compatible HTTP gateway
//! - `ask`: Run one question through the agent loop locally
//! - `tools`: List the tools the configured MCP server offers

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "toolbridge",
    about = "toolbridge, an OpenAI-compatible agent gateway for Claude and MCP tools",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./toolbridge.toml when present)
    #[arg(short, long, global = true, env = "TOOLBRIDGE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Ask the agent a single question
    Ask {
        /// The question to send
        message: String,

        /// Wait for the full answer instead of streaming it
        #[arg(long)]
        no_stream: bool,

        /// Return the canned reply without calling the model or tools
        #[arg(long)]
        simulate: bool,
    },

    /// List tools offered by the MCP server
    Tools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Serve { port } => commands::serve::run(config, port).await?,
        Commands::Ask {
            message,
            no_stream,
            simulate,
        } => commands::ask::run(config, &message, !no_stream, simulate).await?,
        Commands::Tools => commands::tools::run(config).await?,
    }

    Ok(())
}
