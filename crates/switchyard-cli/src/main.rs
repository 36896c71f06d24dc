// ABOUTME: CLI entry point for switchyard.
// ABOUTME: Dispatches to the ask, init and config subcommands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::{Read, Write};
use std::path::PathBuf;
use switchyard_core::{BackendInvokeRequest, BackendMode, Config, Orchestrator};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "Route prompts to command-line AI backends with automatic failover")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.config/switchyard/config.toml)
    #[arg(long, global = true, env = "SWITCHYARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a prompt and print the reply
    Ask {
        /// Prompt text, or "-" to read it from stdin
        prompt: String,

        /// Backend to use: auto, claude or codex
        #[arg(short, long, default_value = "auto")]
        mode: BackendMode,

        /// Directory the backend runs in
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Wait for the whole reply and print it cleaned up
        #[arg(long)]
        once: bool,

        /// Session identifier passed to the backend (random if omitted)
        #[arg(long)]
        session: Option<String>,
    },

    /// Write the default config file if none exists
    Init,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before anything reads the environment
    dotenvy::dotenv().ok();
    switchyard_log::init_for("switchyard");

    let cli = Cli::parse();

    match cli.command {
        Commands::Ask {
            prompt,
            mode,
            workspace,
            once,
            session,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let prompt = resolve_prompt(prompt)?;
            let workspace = workspace.unwrap_or_else(|| config.workspace_path());
            let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let request = config.request(prompt, session, workspace);
            let orchestrator = config.orchestrator()?;
            run_ask(&orchestrator, request, mode, once).await
        }
        Commands::Init => {
            let path = match cli.config {
                Some(path) => Config::init_at(&path)?,
                None => Config::init()?,
            };
            println!("{}", path.display());
            Ok(())
        }
        Commands::Config => {
            let config = load_config(cli.config.as_ref())?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{rendered}");
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn resolve_prompt(prompt: String) -> Result<String> {
    if prompt != "-" {
        return Ok(prompt);
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("Failed to read prompt from stdin")?;
    Ok(buf)
}

/// Cancel `token` on the first Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling request");
            token.cancel();
        }
    });
}

async fn run_ask(
    orchestrator: &Orchestrator,
    request: BackendInvokeRequest,
    mode: BackendMode,
    once: bool,
) -> Result<()> {
    cancel_on_ctrl_c(request.cancellation.clone());

    if once {
        let reply = orchestrator.complete(request, mode).await?;
        println!("{reply}");
        return Ok(());
    }

    let mut events = orchestrator.stream(request, mode);
    let mut stdout = std::io::stdout();
    let mut ended_with_newline = true;
    while let Some(event) = events.next().await {
        let text = event?.text().to_string();
        if text.is_empty() {
            continue;
        }
        ended_with_newline = text.ends_with('\n');
        stdout.write_all(text.as_bytes())?;
        stdout.flush()?;
    }
    if !ended_with_newline {
        println!();
    }
    Ok(())
}
