//! BlockLink daemon
//!
//! Bridges a serial device session to a line-delimited JSON protocol on
//! stdin/stdout. Each request line is `{"id": .., "method": .., "params": ..}`;
//! the daemon answers with `{"id": .., "result": ..}` or `{"id": .., "error": ..}`.
//! Push events (discovery hits, incoming data, upload progress) are written as
//! `{"method": .., "params": ..}` lines with no id.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use blocklink_core::{LinkConfig, SessionEvent};
use blocklink_hardware::SerialTransport;
use blocklink_link::dispatch::dispatch;
use blocklink_link::session::{DeviceSession, SerialSession};

/// BlockLink serial session daemon
#[derive(Parser, Debug)]
#[command(name = "blocklinkd")]
#[command(version, about = "Serial device session daemon", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// User data directory (overrides config file)
    #[arg(long)]
    user_data: Option<PathBuf>,

    /// Toolchain directory (overrides config file)
    #[arg(long)]
    tools: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// One inbound request line.
#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(args.verbose);

    info!("BlockLink daemon starting...");

    // Config path: CLI flag > env var > default
    let config_path = args.config.unwrap_or_else(|| {
        std::env::var("BLOCKLINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| blocklink_core::default_config_path())
    });
    let mut config = LinkConfig::load(&config_path)?;
    if let Some(dir) = args.user_data {
        config.user_data_dir = dir;
    }
    if let Some(dir) = args.tools {
        config.tools_dir = dir;
    }
    info!("Configuration file: {}", config_path.display());
    info!("  User data: {}", config.user_data_dir.display());
    info!("  Tools: {}", config.tools_dir.display());

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let session = SerialSession::new(Arc::new(SerialTransport::new()), config, event_tx);

    // Single writer task keeps event lines and response lines from interleaving.
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_lines(out_rx));
    let events = tokio::spawn(forward_events(event_rx, out_tx.clone()));

    serve_stdin(&session, &out_tx).await;

    info!("stdin closed, shutting down");
    session.dispose().await;

    drop(out_tx);
    events.abort();
    let _ = writer.await;

    info!("Shutdown complete");
    Ok(())
}

/// Read request lines from stdin and answer each on `out`.
async fn serve_stdin(session: &SerialSession, out: &mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("stdin read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("malformed request line: {}", e);
                let reply = json!({ "id": Value::Null, "error": { "message": e.to_string() } });
                let _ = out.send(reply.to_string());
                continue;
            }
        };

        let reply = match dispatch(session, &request.method, request.params).await {
            Ok(result) => json!({ "id": request.id, "result": result }),
            Err(e) => json!({ "id": request.id, "error": { "message": e.to_string() } }),
        };
        let _ = out.send(reply.to_string());
    }
}

/// Serialize push events onto the shared output channel.
async fn forward_events(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    out: mpsc::UnboundedSender<String>,
) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(line) => {
                let _ = out.send(line);
            }
            Err(e) => error!("failed to serialize event: {}", e),
        }
    }
}

/// Drain the output channel to stdout, one JSON document per line.
async fn write_lines(mut rx: mpsc::UnboundedReceiver<String>) {
    let mut stdout = io::stdout();
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if stdout.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        let _ = stdout.flush().await;
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Log to stderr; stdout carries the wire protocol.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
