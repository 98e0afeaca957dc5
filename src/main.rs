//! GDB/MI Shell
//!
//! Starts a GDB session and relays lines from stdin to it. Lines starting with
//! `-` are sent as MI commands, anything else as console commands. Replies
//! and session events are written to stdout as JSON lines.
//!
//! Usage:
//!   gdb-mi-shell --gdb arm-none-eabi-gdb -x "target-select remote :3333" -- --nx
//!   gdb-mi-shell --config session.json

use anyhow::{Context, Result};
use clap::Parser;
use gdb_mi_engine::gdb::{DebugOutput, GdbConfig, MiEvent, MiSession};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gdb-mi-shell", version, about = "Drive GDB through its machine interface")]
struct Args {
    /// JSON session configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debugger executable, overrides the configuration
    #[arg(long)]
    gdb: Option<String>,

    /// Echo MI traffic as log messages: off, parsed, raw or raw-only
    #[arg(long)]
    debug_output: Option<String>,

    /// MI command to run once the debugger is up; may be repeated
    #[arg(short = 'x', long = "init")]
    init: Vec<String>,

    /// Extra arguments for the debugger
    #[arg(last = true)]
    gdb_args: Vec<String>,
}

fn load_config(args: &Args) -> Result<GdbConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid configuration in {}", path.display()))?
        }
        None => GdbConfig::default(),
    };

    if let Some(gdb) = &args.gdb {
        config.gdb_path = gdb.clone();
    }
    if let Some(level) = &args.debug_output {
        config.debug_output = serde_json::from_value::<DebugOutput>(level.as_str().into())
            .with_context(|| format!("Unknown debug output level: {}", level))?;
    }
    config.gdb_args.extend(args.gdb_args.iter().cloned());

    Ok(config)
}

/// Write one JSON line to stdout
fn emit<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", line)?;
    stdout.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!("Starting gdb-mi-shell v{}", env!("CARGO_PKG_VERSION"));

    let session = Arc::new(MiSession::new(config));
    let mut events = session.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let quit = event == MiEvent::Quit;
                    if let Err(e) = emit(&event) {
                        error!("Failed to write event: {}", e);
                    }
                    if quit {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Dropped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    session
        .start(&args.init)
        .await
        .context("Failed to start GDB")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if session.has_exited() {
            warn!("GDB is gone, ignoring: {}", line);
            break;
        }

        debug!("Received: {}", line);
        match session.send_user_input(line).await {
            Ok(node) => emit(&serde_json::json!({ "reply": node }))?,
            Err(e) => {
                error!("Command failed: {}", e);
                emit(&serde_json::json!({ "error": e.to_string() }))?;
            }
        }
    }

    info!("gdb-mi-shell shutting down");
    session.stop().await?;
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        debug!("Event printer still running at exit");
    }
    Ok(())
}
