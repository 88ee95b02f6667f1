use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use aegis_bus::{InMemoryBus, MessageBus, topology};
use aegis_core::{SigningKey, parse_signing_key};
use aegis_policy::PolicyClient;
use aegis_server::api::{AppState, router};
use aegis_server::config::AegisConfig;
use aegis_server::persist::{PersistenceConfig, spawn_all};
use aegis_server::{pipeline, telemetry, ws};
use aegis_store::CanonicalStore;
use aegis_store_memory::MemoryStore;

/// Aegis pipeline server.
#[derive(Parser, Debug)]
#[command(name = "aegis-server", about = "Decision-support pipeline host and HTTP API")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "aegis.toml")]
    config: String,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,
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

    // Store backend.
    let store: Arc<dyn CanonicalStore> = match config.store.backend.as_str() {
        "memory" => Arc::new(MemoryStore::new()),
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
    let hub = ws::spawn_hub();

    // Per-stage metrics registries, shared with the API layer. Registries
    // for stages hosted in aegis-agentd instead stay at zero here.
    let metrics = pipeline::stage_metrics_registry();

    let mut tasks = if config.agents.enabled {
        pipeline::spawn_stages(
            &config.agents,
            &bus,
            &store,
            policy.clone(),
            key.clone(),
            &metrics,
            &shutdown,
        )
    } else {
        info!("embedded pipeline disabled; aegis-agentd hosts the stages");
        Vec::new()
    };

    // API-layer background consumers: track persistence, detection
    // history, subject mirrors, pruning, metrics push.
    tasks.extend(spawn_all(
        &bus,
        &store,
        &hub,
        PersistenceConfig {
            track_hard_ttl: Duration::from_secs(config.agents.track_hard_ttl_secs),
        },
        &shutdown,
    ));

    let state = AppState {
        store,
        bus,
        policy,
        hub,
        agent_metrics: Arc::new(metrics),
        display_window: chrono::Duration::seconds(
            i64::try_from(config.agents.track_display_window_secs).unwrap_or(60),
        ),
    };
    let app = router(state);

    let host = cli.host.unwrap_or(config.server.host);
    let port = cli.port.unwrap_or(config.server.port);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(address = %addr, "aegis-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain the pipeline with a deadline, then force-close.
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

    info!("aegis-server shut down");
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
