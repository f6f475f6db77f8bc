//! SlowHands CLI, the main entry point.
//!
//! Commands:
//! - `serve`   start the WebSocket/HTTP gateway
//! - `agent`   run one task and print the answer
//! - `status`  show configuration and the last saved state
//! - `config`  validate or print the configuration

use clap::{Parser, Subcommand};
use std::future::Future;
use tokio_util::sync::CancellationToken;

mod commands;

#[derive(Parser)]
#[command(
    name = "slowhands",
    about = "SlowHands: a resilient, streaming coding-agent runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run the agent on a single message
    Agent {
        /// The task to run
        #[arg(short, long)]
        message: String,
    },

    /// Show configuration and the last saved state
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load and validate the configuration
    Validate,
    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json {
        fmt.json().init();
    } else {
        fmt.init();
    }

    match cli.command {
        Commands::Serve { port } => commands::serve::run(port, shutdown_on_signal()).await?,
        Commands::Agent { message } => commands::agent::run(message, shutdown_on_signal()).await?,
        Commands::Status => commands::status::run().await?,
        Commands::Config { action } => match action {
            ConfigAction::Validate => commands::config_cmd::validate().await?,
            ConfigAction::Show => commands::config_cmd::show().await?,
        },
    }

    Ok(())
}

/// A token cancelled on the first SIGINT (Ctrl-C) or, on Unix, SIGTERM.
fn shutdown_on_signal() -> CancellationToken {
    cancel_when(termination_signal())
}

/// Cancel the returned token once `signal` resolves to a signal name.
fn cancel_when<F>(signal: F) -> CancellationToken
where
    F: Future<Output = Option<&'static str>> + Send + 'static,
{
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Some(name) = signal.await {
            tracing::info!(signal = name, "Termination signal received, shutting down");
            trigger.cancel();
        }
    });
    token
}

async fn termination_signal() -> Option<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                return tokio::select! {
                    result = tokio::signal::ctrl_c() => result.ok().map(|()| "SIGINT"),
                    _ = term.recv() => Some("SIGTERM"),
                };
            }
            Err(e) => tracing::warn!(error = %e, "Cannot listen for SIGTERM, Ctrl-C only"),
        }
    }
    tokio::signal::ctrl_c().await.ok().map(|()| "SIGINT")
}
