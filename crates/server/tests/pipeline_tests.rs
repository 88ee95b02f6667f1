//! End-to-end pipeline tests: detection in, effect out, over the embedded
//! bus with every stage running on its consumer loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use aegis_agent::{AgentMetrics, ConsumerLoop, Processor};
use aegis_agents::{
    Authorizer, Classifier, Correlator, CorrelatorConfig, Effector, Planner, PlannerConfig,
};
use aegis_bus::{InMemoryBus, MessageBus, topology};
use aegis_core::{
    ActionType, AgentId, BusMessage, Detection, Envelope, GeoPosition, InterventionRule,
    ProposalStatus, RuleId, RuleVerdict, Subject, TrackId, Velocity,
};
use aegis_server::api::{AppState, router};
use aegis_server::persist::run_track_persistence;
use aegis_server::ws;
use aegis_store::{CanonicalStore, EffectQuery, ProposalQuery};
use aegis_store_memory::MemoryStore;

struct Pipeline {
    bus: Arc<InMemoryBus>,
    store: Arc<MemoryStore>,
    app: axum::Router,
    shutdown: CancellationToken,
}

fn spawn_stage<P: Processor + 'static>(mut processor: P, consumer_loop: ConsumerLoop) {
    tokio::spawn(async move {
        let _ = consumer_loop.run(&mut processor).await;
    });
}

async fn start_pipeline() -> Pipeline {
    let bus = Arc::new(InMemoryBus::new());
    let dyn_bus: Arc<dyn MessageBus> = Arc::clone(&bus) as _;
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn CanonicalStore> = Arc::clone(&store) as _;
    let shutdown = CancellationToken::new();
    let hub = ws::spawn_hub();

    for stream in topology::pipeline_streams() {
        dyn_bus.ensure_stream(stream).await.unwrap();
    }

    let metrics = || Arc::new(AgentMetrics::default());

    spawn_stage(
        Classifier::new("classifier-1", Arc::clone(&dyn_bus), None, metrics(), shutdown.clone()),
        ConsumerLoop::new(
            AgentId::new("classifier-1"),
            "classifier",
            Arc::clone(&dyn_bus),
            topology::detections(),
            topology::classifier_consumer(),
            metrics(),
            shutdown.clone(),
        ),
    );
    spawn_stage(
        Correlator::new(
            "correlator-1",
            Arc::clone(&dyn_bus),
            None,
            CorrelatorConfig::default(),
            metrics(),
        ),
        ConsumerLoop::new(
            AgentId::new("correlator-1"),
            "correlator",
            Arc::clone(&dyn_bus),
            topology::tracks(),
            topology::correlator_consumer(),
            metrics(),
            shutdown.clone(),
        ),
    );
    spawn_stage(
        Planner::new(
            "planner-1",
            Arc::clone(&dyn_bus),
            None,
            None,
            Some(Arc::clone(&dyn_store)),
            PlannerConfig::default(),
            metrics(),
        ),
        ConsumerLoop::new(
            AgentId::new("planner-1"),
            "planner",
            Arc::clone(&dyn_bus),
            topology::tracks(),
            topology::planner_consumer(),
            metrics(),
            shutdown.clone(),
        ),
    );
    spawn_stage(
        Authorizer::new(
            "authorizer-1",
            Arc::clone(&dyn_bus),
            None,
            Arc::clone(&dyn_store),
            metrics(),
        ),
        ConsumerLoop::new(
            AgentId::new("authorizer-1"),
            "authorizer",
            Arc::clone(&dyn_bus),
            topology::proposals(),
            topology::authorizer_consumer(),
            metrics(),
            shutdown.clone(),
        ),
    );
    spawn_stage(
        Effector::new(
            "effector-1",
            Arc::clone(&dyn_bus),
            None,
            None,
            Arc::clone(&dyn_store),
            metrics(),
        ),
        ConsumerLoop::new(
            AgentId::new("effector-1"),
            "effector",
            Arc::clone(&dyn_bus),
            topology::decisions(),
            topology::effector_consumer(),
            metrics(),
            shutdown.clone(),
        ),
    );

    tokio::spawn(run_track_persistence(
        Arc::clone(&dyn_bus),
        Arc::clone(&dyn_store),
        hub.clone(),
        shutdown.clone(),
    ));

    let app = router(AppState {
        store: Arc::clone(&dyn_store),
        bus: Arc::clone(&dyn_bus),
        policy: None,
        hub,
        agent_metrics: Arc::new(HashMap::new()),
        display_window: chrono::Duration::seconds(60),
    });

    Pipeline {
        bus,
        store,
        app,
        shutdown,
    }
}

async fn emit_detection(pipeline: &Pipeline, track_id: &str, hint: &str, type_hint: &str, speed: f64) {
    let detection = Detection {
        track_id: TrackId::new(track_id),
        type_hint: Some(type_hint.to_owned()),
        classification_hint: Some(hint.to_owned()),
        position: GeoPosition { lat: 10.0, lon: 20.0, alt: 1000.0 },
        velocity: Velocity { speed, heading: 90.0 },
        confidence: 0.9,
        sensor_id: "radar-1".into(),
        sensor_type: "radar".into(),
        observed_at: Utc::now(),
    };
    let message = BusMessage::new(Envelope::root("radar-1", "sensor"), detection);
    pipeline
        .bus
        .publish(
            &Subject::detect("radar-1", "radar"),
            message.to_bytes().unwrap(),
        )
        .await
        .unwrap();
}

async fn wait_for<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn decide(pipeline: &Pipeline, proposal_id: &str, approved: bool) -> (StatusCode, Value) {
    let body = json!({"approved": approved, "approved_by": "op1", "reason": "cleared"});
    let response = pipeline
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/v1/proposals/{proposal_id}/decide"))
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

/// S1: hostile missile, human approval, exactly one effect, second
/// decision attempt conflicts.
#[tokio::test]
async fn hostile_missile_flows_to_a_single_effect() {
    let pipeline = start_pipeline().await;
    emit_detection(&pipeline, "T1", "hostile", "missile", 600.0).await;

    // The planner's engage proposal lands pending in the store.
    let store = Arc::clone(&pipeline.store);
    let arrived = wait_for(Duration::from_secs(5), || {
        let store = Arc::clone(&store);
        async move {
            store
                .list_proposals(&ProposalQuery {
                    status: Some(ProposalStatus::Pending),
                    ..ProposalQuery::default()
                })
                .await
                .unwrap()
                .iter()
                .any(|p| p.action_type == ActionType::Engage && p.priority == 10)
        }
    })
    .await;
    assert!(arrived, "engage proposal never reached the store");

    // The canonical track was upserted as critical.
    let track = pipeline.store.get_track(&TrackId::new("T1")).await.unwrap();
    assert!(track.is_some(), "track persistence consumer missed the upsert");

    let pending = pipeline
        .store
        .list_proposals(&ProposalQuery {
            status: Some(ProposalStatus::Pending),
            ..ProposalQuery::default()
        })
        .await
        .unwrap();
    let proposal_id = pending[0].proposal_id.as_str().to_owned();

    // Operator approves; the effector executes exactly once.
    let (status, _) = decide(&pipeline, &proposal_id, true).await;
    assert_eq!(status, StatusCode::CREATED);

    let store = Arc::clone(&pipeline.store);
    let executed = wait_for(Duration::from_secs(5), || {
        let store = Arc::clone(&store);
        async move {
            store
                .list_effects(&EffectQuery::default())
                .await
                .unwrap()
                .iter()
                .any(|e| e.status == aegis_core::EffectStatus::Executed)
        }
    })
    .await;
    assert!(executed, "effect never executed");

    let effects = pipeline.store.list_effects(&EffectQuery::default()).await.unwrap();
    assert_eq!(effects.len(), 1, "exactly one effect row expected");

    // A second decision attempt on the same proposal conflicts.
    let (status, body) = decide(&pipeline, &proposal_id, true).await;
    assert_eq!(status, StatusCode::CONFLICT, "body: {body}");

    pipeline.shutdown.cancel();
}

/// S2: friendly monitor auto-approved by rule, executed without a human.
#[tokio::test]
async fn friendly_monitor_is_auto_approved_by_rule() {
    let pipeline = start_pipeline().await;
    pipeline
        .store
        .insert_rule(&InterventionRule {
            rule_id: RuleId::new("r-auto"),
            name: "auto-monitor".into(),
            description: None,
            action_types: vec![ActionType::Monitor],
            threat_levels: vec![],
            classifications: vec![],
            track_types: vec![],
            min_priority: 1,
            max_priority: 10,
            verdict: RuleVerdict::AutoApprove,
            evaluation_order: 1,
            enabled: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    emit_detection(&pipeline, "T2", "friendly", "aircraft", 200.0).await;

    let store = Arc::clone(&pipeline.store);
    let executed = wait_for(Duration::from_secs(5), || {
        let store = Arc::clone(&store);
        async move {
            store
                .list_effects(&EffectQuery::default())
                .await
                .unwrap()
                .iter()
                .any(|e| {
                    e.action_type == ActionType::Monitor
                        && e.status == aegis_core::EffectStatus::Executed
                })
        }
    })
    .await;
    assert!(executed, "auto-approved monitor never executed");

    let decisions = pipeline
        .store
        .list_decisions(&aegis_store::DecisionQuery::default())
        .await
        .unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].approved_by, "system-r-auto");

    pipeline.shutdown.cancel();
}

/// S3: two in-window detections of one track yield a single pending
/// proposal with a bumped hit counter.
#[tokio::test]
async fn duplicate_pending_proposals_are_suppressed() {
    let pipeline = start_pipeline().await;
    emit_detection(&pipeline, "T3", "hostile", "aircraft", 500.0).await;
    emit_detection(&pipeline, "T3", "hostile", "aircraft", 510.0).await;

    let store = Arc::clone(&pipeline.store);
    let folded = wait_for(Duration::from_secs(5), || {
        let store = Arc::clone(&store);
        async move {
            store
                .list_proposals(&ProposalQuery {
                    track_id: Some(TrackId::new("T3")),
                    status: Some(ProposalStatus::Pending),
                    ..ProposalQuery::default()
                })
                .await
                .unwrap()
                .first()
                .is_some_and(|p| p.hit_count >= 1)
        }
    })
    .await;
    assert!(folded, "duplicate proposal was not folded into the first");

    let pending = pipeline
        .store
        .list_proposals(&ProposalQuery {
            track_id: Some(TrackId::new("T3")),
            status: Some(ProposalStatus::Pending),
            ..ProposalQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 1, "exactly one pending proposal per track");

    pipeline.shutdown.cancel();
}
