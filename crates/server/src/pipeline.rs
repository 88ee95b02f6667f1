//! Wiring for the six pipeline stages.
//!
//! Shared by the two binaries: `aegis-server` hosts the stages next to the
//! HTTP API when `agents.enabled` is set, and `aegis-agentd` hosts them
//! headless. Both build the same per-stage metrics registry and spawn the
//! same task set from the same `[agents]` configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use aegis_agent::{AgentMetrics, ConsumerLoop, Processor};
use aegis_agents::{
    Authorizer, AuthorizerConfig, Classifier, Correlator, CorrelatorConfig, Effector,
    ExpirySweeper, Planner, PlannerConfig, Sensor, SensorConfig,
};
use aegis_bus::{MessageBus, topology};
use aegis_core::{AgentId, SigningKey};
use aegis_policy::PolicyClient;
use aegis_store::CanonicalStore;

use crate::config::AgentsConfig;

/// Stage names, in pipeline order.
pub const STAGES: [&str; 6] = [
    "sensor",
    "classifier",
    "correlator",
    "planner",
    "authorizer",
    "effector",
];

/// One metrics registry per stage, keyed by stage name. The API layer
/// serves these on `/api/v1/metrics/agents` and `/metrics`.
#[must_use]
pub fn stage_metrics_registry() -> HashMap<&'static str, Arc<AgentMetrics>> {
    STAGES
        .iter()
        .map(|name| (*name, Arc::new(AgentMetrics::default())))
        .collect()
}

/// Spawn a consuming stage on its consumer loop.
fn spawn_stage<P: Processor + 'static>(
    mut processor: P,
    consumer_loop: ConsumerLoop,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = consumer_loop.run(&mut processor).await {
            tracing::error!(error = %e, "stage terminated");
        }
    })
}

/// Spawn all six stages plus the authorizer's expiry sweeper. The tasks
/// run until `shutdown` fires.
#[allow(clippy::too_many_lines)]
pub fn spawn_stages(
    config: &AgentsConfig,
    bus: &Arc<dyn MessageBus>,
    store: &Arc<dyn CanonicalStore>,
    policy: Option<PolicyClient>,
    key: Option<SigningKey>,
    metrics: &HashMap<&'static str, Arc<AgentMetrics>>,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let agent_id = &config.agent_id;
    let mut tasks = Vec::new();

    // Sensor.
    let sensor_config = Arc::new(RwLock::new(SensorConfig {
        emission_interval: Duration::from_millis(config.emission_interval_ms),
        track_count: config.track_count,
        paused: config.sensor_paused,
        ..SensorConfig::default()
    }));
    let sensor = Sensor::new(
        format!("{agent_id}-sensor"),
        "radar",
        Arc::clone(bus),
        key.clone(),
        sensor_config,
        Arc::clone(&metrics["sensor"]),
        shutdown.clone(),
    );
    tasks.push(tokio::spawn(async move { sensor.run().await }));

    // Classifier.
    let classifier = Classifier::new(
        format!("{agent_id}-classifier"),
        Arc::clone(bus),
        key.clone(),
        Arc::clone(&metrics["classifier"]),
        shutdown.clone(),
    );
    tasks.push(spawn_stage(
        classifier,
        ConsumerLoop::new(
            AgentId::new(format!("{agent_id}-classifier")),
            "classifier",
            Arc::clone(bus),
            topology::detections(),
            topology::classifier_consumer(),
            Arc::clone(&metrics["classifier"]),
            shutdown.clone(),
        ),
    ));

    // Correlator.
    let correlator = Correlator::new(
        format!("{agent_id}-correlator"),
        Arc::clone(bus),
        key.clone(),
        CorrelatorConfig {
            correlation_window: chrono::Duration::seconds(
                i64::try_from(config.correlation_window_secs).unwrap_or(10),
            ),
            ..CorrelatorConfig::default()
        },
        Arc::clone(&metrics["correlator"]),
    );
    tasks.push(spawn_stage(
        correlator,
        ConsumerLoop::new(
            AgentId::new(format!("{agent_id}-correlator")),
            "correlator",
            Arc::clone(bus),
            topology::tracks(),
            topology::correlator_consumer(),
            Arc::clone(&metrics["correlator"]),
            shutdown.clone(),
        ),
    ));

    // Planner.
    let planner = Planner::new(
        format!("{agent_id}-planner"),
        Arc::clone(bus),
        key.clone(),
        policy.clone(),
        Some(Arc::clone(store)),
        PlannerConfig::default(),
        Arc::clone(&metrics["planner"]),
    );
    tasks.push(spawn_stage(
        planner,
        ConsumerLoop::new(
            AgentId::new(format!("{agent_id}-planner")),
            "planner",
            Arc::clone(bus),
            topology::tracks(),
            topology::planner_consumer(),
            Arc::clone(&metrics["planner"]),
            shutdown.clone(),
        ),
    ));

    // Authorizer and its expiry sweeper.
    let authorizer = Authorizer::new(
        format!("{agent_id}-authorizer"),
        Arc::clone(bus),
        key.clone(),
        Arc::clone(store),
        Arc::clone(&metrics["authorizer"]),
    );
    tasks.push(spawn_stage(
        authorizer,
        ConsumerLoop::new(
            AgentId::new(format!("{agent_id}-authorizer")),
            "authorizer",
            Arc::clone(bus),
            topology::proposals(),
            topology::authorizer_consumer(),
            Arc::clone(&metrics["authorizer"]),
            shutdown.clone(),
        ),
    ));
    let sweeper = ExpirySweeper::new(
        format!("{agent_id}-authorizer"),
        Arc::clone(bus),
        key.clone(),
        Arc::clone(store),
        AuthorizerConfig::default(),
        shutdown.clone(),
    );
    tasks.push(tokio::spawn(async move { sweeper.run().await }));

    // Effector.
    let effector = Effector::new(
        format!("{agent_id}-effector"),
        Arc::clone(bus),
        key.clone(),
        policy,
        Arc::clone(store),
        Arc::clone(&metrics["effector"]),
    );
    tasks.push(spawn_stage(
        effector,
        ConsumerLoop::new(
            AgentId::new(format!("{agent_id}-effector")),
            "effector",
            Arc::clone(bus),
            topology::decisions(),
            topology::effector_consumer(),
            Arc::clone(&metrics["effector"]),
            shutdown.clone(),
        ),
    ));

    info!(agent_id = %agent_id, "pipeline stages started");
    tasks
}
