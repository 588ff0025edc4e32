//! Whisper Journal server binary.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use whisper_journal::{AppState, ChildTable, JobRunner, JournalStore, RunnerConfig};

#[derive(Debug, Parser)]
#[command(name = "whisper-journal", about = "Local voice journal pipeline", version)]
struct Args {
    /// Address to serve the HTTP facade on.
    #[arg(long, default_value = "127.0.0.1:8765")]
    bind: String,

    /// Path to the SQLite database.
    #[arg(long, default_value = "whisper-journal.db")]
    db: PathBuf,

    /// Seconds between worker ticks.
    #[arg(long, default_value_t = 1)]
    tick_secs: u64,

    /// Heartbeat age (seconds) after which a running entry counts as stuck.
    #[arg(long, default_value_t = 300)]
    heartbeat_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let store = Arc::new(
        JournalStore::open(&args.db)
            .with_context(|| format!("opening database at {}", args.db.display()))?,
    );
    let children = Arc::new(ChildTable::new());
    let shutdown = CancellationToken::new();

    let runner = JobRunner::new(
        Arc::clone(&store),
        Arc::clone(&children),
        RunnerConfig {
            tick_interval: Duration::from_secs(args.tick_secs.max(1)),
            heartbeat_threshold: Duration::from_secs(args.heartbeat_secs.max(1)),
        },
        shutdown.clone(),
    );
    let runner_handle = runner.spawn();

    let app = whisper_journal::router(AppState { store, children });
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(addr = %args.bind, db = %args.db.display(), "whisper-journal listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                }
                () = serve_shutdown.cancelled() => {}
            }
        })
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    let _ = runner_handle.await;
    Ok(())
}
