//! `aegis-agentd`: headless host for the six pipeline stages.
//!
//! Runs the same stages `aegis-server` embeds, minus the HTTP surface and
//! the push hub's clients, from the same `aegis.toml`. Pair it with a
//! server started with `agents.enabled = false`: both processes must then
//! share a store backend (`postgres`), and full bus fan-out between them
//! needs a networked `MessageBus` implementation -- the embedded log is
//! private to each process, so agentd also runs the store-side consumers
//! (track persistence, detection history, pruning) over its own bus.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use aegis_bus::{InMemoryBus, MessageBus, topology};
use aegis_core::{SigningKey, parse_signing_key};
use aegis_policy::PolicyClient;
use aegis_server::config::AegisConfig;
use aegis_server::persist::{PersistenceConfig, spawn_all};
use aegis_server::{pipeline, telemetry, ws};
use aegis_store::CanonicalStore;
use aegis_store_memory::MemoryStore;

/// Aegis pipeline agent daemon.
#[derive(Parser, Debug)]
#[command(name = "aegis-agentd", about = "Headless host for the Aegis pipeline stages")]
struct Cli {
    /// Path to the TOML configuration file (shared with aegis-server).
    #[arg(short, long, default_value = "aegis.toml")]
    config: String,
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration, or run on defaults when the file is absent.
    let mut config: AegisConfig = if Path::new(&cli.config).exists() {
        toml::from_str(&std::fs::read_to_string(&cli.config)?)?
    } else {
        toml::from_str("")?
    };
    config.apply_env();

    telemetry::init(&config.server);
    if !Path::new(&cli.config).exists() {
        info!(path = %cli.config, "config file not found, using defaults");
    }

    // Store backend. A standalone daemon normally points at postgres so
    // the API process reads the same rows.
    let store: Arc<dyn CanonicalStore> = match config.store.backend.as_str() {
        "memory" => {
            warn!("memory store is private to this process; the API server will not see it");
            Arc::new(MemoryStore::new())
        }
        #[cfg(feature = "postgres")]
        "postgres" => {
            let url = config
                .store
                .url
                .clone()
                .ok_or("store.url is required for the postgres backend")?;
            let pg = aegis_store_postgres::PostgresConfig {
                url,
                ..aegis_store_postgres::PostgresConfig::default()
            };
            Arc::new(aegis_store_postgres::PostgresStore::new(pg).await?)
        }
        other => {
            return Err(format!("unsupported store backend: {other}").into());
        }
    };
    info!(backend = %config.store.backend, "canonical store initialized");

    // The embedded bus and the pipeline's stream topology.
    let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
    for stream in topology::pipeline_streams() {
        bus.ensure_stream(stream).await?;
    }

    // Policy engine client.
    let policy = match config.policy.url {
        Some(ref url) => {
            info!(%url, "policy engine configured");
            Some(PolicyClient::new(url.clone())?)
        }
        None => {
            warn!("POLICY_URL unset, policy evaluation disabled");
            None
        }
    };

    // Envelope signing key.
    let key: Option<SigningKey> = config
        .agents
        .secret
        .as_deref()
        .map(parse_signing_key)
        .transpose()?;

    let shutdown = CancellationToken::new();
    let metrics = pipeline::stage_metrics_registry();

    let mut tasks = pipeline::spawn_stages(
        &config.agents,
        &bus,
        &store,
        policy,
        key,
        &metrics,
        &shutdown,
    );

    // Store-side consumers over this process's bus. The hub has no
    // WebSocket clients here; its frames go nowhere.
    let hub = ws::spawn_hub();
    tasks.extend(spawn_all(
        &bus,
        &store,
        &hub,
        PersistenceConfig {
            track_hard_ttl: Duration::from_secs(config.agents.track_hard_ttl_secs),
        },
        &shutdown,
    ));

    info!("aegis-agentd running");
    shutdown_signal().await;

    info!(
        timeout_secs = config.server.shutdown_timeout_seconds,
        "draining pipeline tasks"
    );
    shutdown.cancel();
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(
        Duration::from_secs(config.server.shutdown_timeout_seconds),
        drain,
    )
    .await
    .is_err()
    {
        warn!("shutdown deadline exceeded, aborting remaining tasks");
    }

    info!("aegis-agentd shut down");
    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM, then return to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received SIGINT"); }
        () = terminate => { info!("received SIGTERM"); }
    }
}
