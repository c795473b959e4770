//! Risk Cache
//!
//! Runs the cache engine with its background scheduler and ops endpoints.
//! The binary serves from an in-memory backing store; deployments with a real
//! store embed the library and supply their own `BackingStore`.

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::Parser;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use risk_cache::{
    server, Coordinator, EngineConfig, LocalNode, MemoryStore, Scheduler, SharedBackingStore,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Risk Cache - multi-tier caching and invalidation engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Engine configuration file (YAML, or JSON by extension)
    #[arg(long, env = "RISK_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Ops server bind address
    #[arg(long, env = "OPS_ADDR", default_value = "0.0.0.0:8080")]
    ops_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run with an in-memory backing store and in-process cache nodes
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// JSON object of key -> value records preloaded into the in-memory store
    #[arg(long, env = "SEED_FILE")]
    seed: Option<PathBuf>,

    /// Seconds to wait for write-behind and invalidations at shutdown
    #[arg(long, env = "DRAIN_TIMEOUT", default_value = "10")]
    drain_timeout_secs: u64,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    info!("Starting Risk Cache");
    info!("  Version: {}", risk_cache::VERSION);
    info!("  Ops server: {}", args.ops_addr);
    info!("  Standalone mode: {}", args.standalone);

    if !args.standalone {
        bail!("no backing store adapter is built into the binary; run with --standalone");
    }

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let ops_addr: SocketAddr = args
        .ops_addr
        .parse()
        .with_context(|| format!("invalid ops address {}", args.ops_addr))?;

    let store = Arc::new(MemoryStore::new());
    if let Some(path) = &args.seed {
        let seeded = seed_store(&store, path)?;
        info!(records = seeded, "Backing store seeded");
    }

    let nodes = LocalNode::shared_from_config(&config.distributed);
    let engine = Coordinator::new(config, store as SharedBackingStore, nodes)
        .context("building cache engine")?;

    let scheduler = Scheduler::start(Arc::clone(&engine));
    let token = scheduler.token();

    let server_token = token.clone();
    let server_engine = Arc::clone(&engine);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(ops_addr, server_engine, async move {
            server_token.cancelled().await
        })
        .await
        {
            error!("Ops server error: {}", e);
        }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for shutdown signal")?;
            info!("Shutdown signal received");
        }
        _ = token.cancelled() => {}
    }

    token.cancel();
    if let Err(e) = server_handle.await {
        error!("Ops server task failed: {}", e);
    }
    scheduler
        .stop(Duration::from_secs(args.drain_timeout_secs))
        .await;

    info!("Risk Cache shutdown complete");
    Ok(())
}

// =============================================================================
// Standalone Backing Store
// =============================================================================

fn seed_store(store: &MemoryStore, path: &Path) -> anyhow::Result<usize> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;
    let records: BTreeMap<String, String> =
        serde_json::from_str(&contents).context("seed file must be a JSON object of strings")?;
    let count = records.len();
    for (key, value) in records {
        store.seed(key, Bytes::from(value));
    }
    Ok(count)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("tower_http=info".parse()?)
        .add_directive("axum=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
