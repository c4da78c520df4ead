//! Collaborative editing server
//! Reads JSON commands from stdin, one per line, and writes replies and session events to stdout

mod protocol;

use anyhow::{Context, Result};
use clap::Parser;
use collab_core::{CollaborationConfig, CollaborationManager};
use protocol::{Command, Output, Reply};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

type Tx = mpsc::UnboundedSender<Output>;

#[derive(Parser)]
#[command(name = "collab-server")]
#[command(about = "Real-time collaborative editing sessions over a JSON line protocol")]
#[command(version)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the session tick interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the protocol, so logs go to stderr
    let default_filter = if args.verbose {
        "collab_server=trace,collab_core=trace"
    } else {
        "collab_server=debug,collab_core=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => CollaborationConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => CollaborationConfig::default(),
    };
    if let Some(tick_ms) = args.tick_ms {
        config.tick_interval_ms = tick_ms;
    }
    config.validate().context("invalid configuration")?;

    info!(
        "Starting collaboration server (tick {} ms, compose window {} ms)",
        config.tick_interval_ms, config.compose_window_ms
    );
    let manager = CollaborationManager::new(config);

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_output(rx));
    let forwarder = tokio::spawn(forward_events(manager.subscribe(), tx.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("reading stdin")? {
                    Some(line) => handle_line(&line, &manager, &tx).await,
                    None => {
                        info!("stdin closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    manager.shutdown().await;
    forwarder.abort();
    drop(tx);
    if let Err(e) = writer.await {
        error!("Output writer failed: {}", e);
    }

    info!("Collaboration server stopped");
    Ok(())
}

async fn handle_line(line: &str, manager: &CollaborationManager, tx: &Tx) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let reply = match serde_json::from_str::<Command>(line) {
        Ok(command) => {
            let name = command.name();
            debug!("Executing {} command", name);
            command.execute(manager).await.unwrap_or_else(|e| {
                warn!("{} command failed: {}", name, e);
                Reply::Error {
                    message: e.to_string(),
                }
            })
        }
        Err(e) => {
            warn!("Malformed command: {}", e);
            Reply::Error {
                message: format!("malformed command: {}", e),
            }
        }
    };

    if tx.send(Output::Reply(reply)).is_err() {
        error!("Output channel closed, dropping reply");
    }
}

/// Relay broadcast events into the output stream
async fn forward_events(mut events: broadcast::Receiver<collab_core::CollaborationEvent>, tx: Tx) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if tx.send(Output::Event(event)).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event stream lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn write_output(mut rx: mpsc::UnboundedReceiver<Output>) {
    let mut stdout = tokio::io::stdout();

    while let Some(output) = rx.recv().await {
        let mut json = match serde_json::to_string(&output) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize output: {}", e);
                continue;
            }
        };
        json.push('\n');

        if let Err(e) = stdout.write_all(json.as_bytes()).await {
            error!("Failed to write to stdout: {}", e);
            break;
        }
        if let Err(e) = stdout.flush().await {
            error!("Failed to flush stdout: {}", e);
            break;
        }
    }
}
