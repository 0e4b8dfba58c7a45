//! `ChatRelay` Server
//!
//! HTTP relay that streams background AI responses to resumable SSE readers.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use chatrelay_core::config;
use chatrelay_server::agent::{OpenAiAgent, OpenAiAgentConfig};
use chatrelay_server::relay::{Consumer, EventLog, Producer, SessionRegistry};
use chatrelay_server::server::{AppState, build_router};
use chatrelay_server::storage::RelayDatabase;

#[derive(Parser, Debug)]
#[command(name = "chatrelay")]
#[command(version, about = "ChatRelay server - resumable SSE relay for AI responses")]
struct Args {
    /// Path to a JSON config file layered over the global one.
    #[arg(long, env = "CHATRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,

    /// OTLP endpoint for metrics export.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = config::load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(path) = args.db_path {
        config.server.database_path = Some(path);
    }
    if args.log_json {
        config.logging.json = true;
    }

    chatrelay_core::tracing_init::init_tracing(&config.logging);

    #[cfg(feature = "metrics")]
    let metrics_guard = args
        .otlp_endpoint
        .as_deref()
        .map(chatrelay_core::metrics::init_metrics)
        .transpose()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.addr,
        model = %config.agent.model,
        "Starting chatrelay"
    );

    let db_path = match config.server.database_path.clone() {
        Some(path) => path,
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening relay database");
    let db = RelayDatabase::open(&db_path).await?;

    let ttl = config.relay.turn_ttl_secs;
    let log = EventLog::new(db.clone(), ttl);
    let registry = SessionRegistry::new(db, ttl);
    let agent = OpenAiAgent::new(&OpenAiAgentConfig::from(&config.agent))?;
    info!(url = %agent.completions_url(), "Agent endpoint configured");
    let producer = Producer::new(
        log.clone(),
        registry.clone(),
        Arc::new(agent),
        &config.relay.answer_stage,
    );
    let consumer = Consumer::new(
        log,
        registry.clone(),
        config.relay.heartbeat_interval(),
        config.relay.read_block(),
    );

    // Background sweep of expired turns and logs
    let cleanup_interval = config.relay.cleanup_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            match registry.purge_expired().await {
                Ok(removed) if removed > 0 => {
                    info!(removed, "Expired relay state purged");
                }
                Err(e) => {
                    warn!(error = %e, "Expired relay state purge failed");
                }
                _ => {}
            }
        }
    });

    let app = build_router(
        AppState {
            producer: producer.clone(),
            consumer,
        },
        &config.server.cors_origins,
    );
    let listener = tokio::net::TcpListener::bind(config.server.addr).await?;
    info!(addr = %config.server.addr, "Relay server listening");

    // Open SSE readers never finish on their own, so the server is dropped
    // rather than drained.
    tokio::select! {
        result = axum::serve(listener, app).into_future() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    producer.shutdown().await;

    #[cfg(feature = "metrics")]
    if let Some(guard) = metrics_guard
        && let Err(e) = guard.shutdown()
    {
        warn!(error = %e, "Metrics shutdown failed");
    }

    info!("Relay stopped");
    Ok(())
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = config::database_path() {
        return Ok(path);
    }
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".chatrelay").join("relay.db"))
}
