//! The planner: turns correlated tracks into action proposals.
//!
//! Synthesis follows a fixed decision table (action and priority from
//! classification and threat), appends per-action constraints, derives a
//! priority-dependent expiry, and runs the `proposals` policy. A policy
//! denial is *not* a drop: the proposal is published with
//! `policy_decision.allowed = false` so the denial is auditable. The
//! planner never writes to the canonical store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use aegis_agent::{AgentMetrics, Processor};
use aegis_bus::{Delivery, MessageBus};
use aegis_core::{
    ActionProposal, BusMessage, CorrelatedTrack, Envelope, PipelineError, PolicyVerdict,
    ProposalId, ProposalStatus, SigningKey, Subject, constraints_for, expiry_for, plan_action,
};
use aegis_policy::{PolicyClient, PolicyError};
use aegis_store::{CanonicalStore, ProposalQuery};

/// Planner configuration.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Policy path queried for each proposal.
    pub policy_path: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            policy_path: "aegis/proposals".to_owned(),
        }
    }
}

/// The planner stage. Consumes `track.correlated.>`, emits
/// `proposal.pending.<bucket>`.
pub struct Planner {
    agent_id: String,
    bus: Arc<dyn MessageBus>,
    key: Option<SigningKey>,
    policy: Option<PolicyClient>,
    /// Read-only handle used to include the track's pending set in policy
    /// input. The planner never writes.
    store: Option<Arc<dyn CanonicalStore>>,
    config: PlannerConfig,
    metrics: Arc<AgentMetrics>,
}

impl Planner {
    /// Create a planner. `policy` and `store` are optional collaborators;
    /// without a policy client every proposal carries a disabled-evaluation
    /// warning.
    pub fn new(
        agent_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        key: Option<SigningKey>,
        policy: Option<PolicyClient>,
        store: Option<Arc<dyn CanonicalStore>>,
        config: PlannerConfig,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
            key,
            policy,
            store,
            config,
            metrics,
        }
    }

    /// Build the proposal for a correlated track per the decision table.
    fn synthesize(track: &CorrelatedTrack) -> ActionProposal {
        let (action_type, priority) =
            plan_action(track.classification, track.track_type, track.threat_level);
        let now = Utc::now();
        ActionProposal {
            proposal_id: ProposalId::new_random(),
            track_id: track.track_id.clone(),
            action_type,
            priority,
            rationale: format!(
                "{} {} at threat level {} (speed {:.0} m/s, {} detections)",
                track.classification,
                track.track_type,
                track.threat_level,
                track.velocity.speed,
                track.detection_count,
            ),
            constraints: constraints_for(action_type, track.classification),
            classification: track.classification,
            threat_level: track.threat_level,
            track_type: track.track_type,
            status: ProposalStatus::Pending,
            expires_at: expiry_for(priority, now),
            policy_decision: PolicyVerdict::default(),
            hit_count: 0,
            last_hit_at: None,
            created_at: now,
        }
    }

    /// Evaluate the `proposals` policy.
    ///
    /// Unreachable engine: fail open with a warning (losing the proposal
    /// would blind the operator). Malformed or erroring engine: fail
    /// closed with a warning, published for audit. Denial: `allowed=false`
    /// with the engine's reasons.
    async fn evaluate_policy(
        &self,
        proposal: &ActionProposal,
        track: &CorrelatedTrack,
    ) -> PolicyVerdict {
        let Some(ref client) = self.policy else {
            return PolicyVerdict {
                allowed: true,
                reasons: vec![],
                warnings: vec!["policy evaluation disabled".to_owned()],
            };
        };

        let pending = if let Some(ref store) = self.store {
            store
                .list_proposals(&ProposalQuery {
                    track_id: Some(track.track_id.clone()),
                    status: Some(ProposalStatus::Pending),
                    ..ProposalQuery::default()
                })
                .await
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let input = json!({
            "proposal": proposal,
            "track": track,
            "track_exists": true,
            "pending_proposals": pending,
        });

        match client.evaluate(&self.config.policy_path, &input).await {
            Ok(decision) => PolicyVerdict {
                allowed: decision.allowed,
                reasons: decision.reasons,
                warnings: decision.warnings,
            },
            Err(PolicyError::Transport(e)) => {
                warn!(error = %e, "policy engine unreachable, proceeding open");
                PolicyVerdict {
                    allowed: true,
                    reasons: vec![],
                    warnings: vec![format!("policy engine unreachable: {e}")],
                }
            }
            Err(e) => {
                warn!(error = %e, "policy evaluation failed, recording denial");
                PolicyVerdict {
                    allowed: false,
                    reasons: vec![],
                    warnings: vec![format!("policy evaluation failed: {e}")],
                }
            }
        }
    }
}

#[async_trait]
impl Processor for Planner {
    async fn process(&mut self, delivery: &Delivery) -> Result<(), PipelineError> {
        let message: BusMessage<CorrelatedTrack> = BusMessage::from_bytes(&delivery.payload)?;
        let track = &message.body;

        let mut proposal = Self::synthesize(track);
        proposal.validate()?;
        proposal.policy_decision = self.evaluate_policy(&proposal, track).await;

        let subject = Subject::proposal_pending(proposal.priority);
        let priority = proposal.priority;
        let envelope = Envelope::child_of(&message.envelope, &self.agent_id, "planner");
        let mut outgoing = BusMessage::new(envelope, proposal);
        if let Some(ref key) = self.key {
            outgoing.sign(key)?;
        }

        self.bus
            .publish(&subject, outgoing.to_bytes()?)
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;
        self.metrics.record_published();
        debug!(
            proposal_id = %outgoing.body.proposal_id,
            track_id = %outgoing.body.track_id,
            action = %outgoing.body.action_type,
            priority,
            allowed = outgoing.body.policy_decision.allowed,
            "proposal published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use aegis_bus::InMemoryBus;
    use aegis_core::{
        ActionType, Classification, GeoPosition, ThreatLevel, TrackId, TrackType, Velocity,
    };

    fn track(
        classification: Classification,
        track_type: TrackType,
        threat: ThreatLevel,
    ) -> CorrelatedTrack {
        let now = Utc::now();
        CorrelatedTrack {
            track_id: TrackId::new("T1"),
            classification,
            track_type,
            position: GeoPosition { lat: 10.0, lon: 20.0, alt: 1000.0 },
            velocity: Velocity { speed: 600.0, heading: 45.0 },
            confidence: 0.9,
            threat_level: threat,
            merged_from: BTreeSet::from(["T1".to_owned()]),
            sources: BTreeSet::from(["s1".to_owned()]),
            detection_count: 3,
            window_start: now,
            window_end: now,
            first_seen: now,
            last_updated: now,
        }
    }

    #[test]
    fn synthesizes_engage_for_critical_hostile_missile() {
        let p = Planner::synthesize(&track(
            Classification::Hostile,
            TrackType::Missile,
            ThreatLevel::Critical,
        ));
        assert_eq!(p.action_type, ActionType::Engage);
        assert_eq!(p.priority, 10);
        assert!(p.rationale.chars().count() >= 10);
        assert!(p.constraints.iter().any(|c| c.contains("commander approval")));
        // Priority 10 expires within a minute.
        assert!(p.expires_at <= p.created_at + chrono::Duration::minutes(1));
    }

    #[test]
    fn synthesizes_monitor_for_low_friendly() {
        let p = Planner::synthesize(&track(
            Classification::Friendly,
            TrackType::Aircraft,
            ThreatLevel::Low,
        ));
        assert_eq!(p.action_type, ActionType::Monitor);
        assert_eq!(p.priority, 2);
        assert_eq!(p.constraints, vec!["IFF verification".to_owned()]);
        assert!(p.expires_at >= p.created_at + chrono::Duration::minutes(14));
    }

    #[tokio::test]
    async fn publishes_to_priority_bucket_without_policy() {
        let bus = Arc::new(InMemoryBus::new());
        let mut planner = Planner::new(
            "planner-1",
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            None,
            None,
            None,
            PlannerConfig::default(),
            Arc::new(AgentMetrics::default()),
        );

        let mut sub = bus.subscribe("proposal.pending.high");
        let message = BusMessage::new(
            Envelope::root("correlator-1", "correlator"),
            track(Classification::Hostile, TrackType::Missile, ThreatLevel::Critical),
        );
        let delivery = Delivery {
            stream: "TRACKS".into(),
            consumer: "planner".into(),
            stream_seq: 1,
            subject: "track.correlated.critical".into(),
            payload: message.to_bytes().unwrap(),
            deliver_count: 1,
        };
        planner.process(&delivery).await.unwrap();

        let event = sub.next().await.unwrap();
        let outgoing: BusMessage<ActionProposal> = BusMessage::from_bytes(&event.payload).unwrap();
        assert_eq!(outgoing.body.action_type, ActionType::Engage);
        assert!(outgoing.body.policy_decision.allowed);
        assert_eq!(
            outgoing.body.policy_decision.warnings,
            vec!["policy evaluation disabled".to_owned()]
        );
        assert_eq!(outgoing.envelope.correlation_id, message.envelope.correlation_id);
    }

    #[tokio::test]
    async fn unreachable_policy_fails_open_with_warning() {
        let bus = Arc::new(InMemoryBus::new());
        let client = PolicyClient::with_timeout(
            "http://127.0.0.1:9",
            std::time::Duration::from_millis(100),
        )
        .unwrap();
        let mut planner = Planner::new(
            "planner-1",
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            None,
            Some(client),
            None,
            PlannerConfig::default(),
            Arc::new(AgentMetrics::default()),
        );

        let mut sub = bus.subscribe("proposal.pending.>");
        let message = BusMessage::new(
            Envelope::root("correlator-1", "correlator"),
            track(Classification::Unknown, TrackType::Aircraft, ThreatLevel::Medium),
        );
        let delivery = Delivery {
            stream: "TRACKS".into(),
            consumer: "planner".into(),
            stream_seq: 1,
            subject: "track.correlated.medium".into(),
            payload: message.to_bytes().unwrap(),
            deliver_count: 1,
        };
        planner.process(&delivery).await.unwrap();

        let event = sub.next().await.unwrap();
        let outgoing: BusMessage<ActionProposal> = BusMessage::from_bytes(&event.payload).unwrap();
        assert!(outgoing.body.policy_decision.allowed);
        assert!(
            outgoing.body.policy_decision.warnings[0].contains("unreachable"),
            "warnings: {:?}",
            outgoing.body.policy_decision.warnings
        );
    }
}
