//! The effector: executes approved decisions at most once.
//!
//! The serialization point is the store's unique constraint on the
//! idempotent key, derived from `(decision_id, action_type, track_id)`.
//! The policy re-check before execution is defense-in-depth, not the
//! primary safeguard. The effector fails *closed* on an unreachable
//! policy engine: it is the last gate before an irreversible effect, so
//! the delivery is nacked and retried within the consumer's budget.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use aegis_agent::{AgentMetrics, Processor};
use aegis_bus::{Delivery, MessageBus};
use aegis_core::{
    BusMessage, Decision, EffectId, EffectRecord, EffectStatus, Envelope, PipelineError,
    SigningKey, Subject, idempotent_key, truncate_result,
};
use aegis_policy::{PolicyClient, PolicyError};
use aegis_store::{CanonicalStore, EffectInsert, StoreError};

const COUNTER_EXECUTED: &str = "effects_executed";
const COUNTER_REPLAYED: &str = "effects_replayed";

/// The effector stage. Consumes `decision.approved.>`.
pub struct Effector {
    agent_id: String,
    bus: Arc<dyn MessageBus>,
    key: Option<SigningKey>,
    policy: Option<PolicyClient>,
    store: Arc<dyn CanonicalStore>,
    policy_path: String,
    metrics: Arc<AgentMetrics>,
}

impl Effector {
    /// Create an effector.
    pub fn new(
        agent_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        key: Option<SigningKey>,
        policy: Option<PolicyClient>,
        store: Arc<dyn CanonicalStore>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
            key,
            policy,
            store,
            policy_path: "aegis/effects".to_owned(),
            metrics,
        }
    }

    /// Final policy gate. Fail-closed: transport errors become transient
    /// (nack, bounded retry); a denial is a validation error (ack, never
    /// execute).
    async fn recheck_policy(
        &self,
        decision: &Decision,
        already_executed: bool,
    ) -> Result<(), PipelineError> {
        let Some(ref client) = self.policy else {
            return Ok(());
        };

        let proposal = self
            .store
            .get_proposal(&decision.proposal_id)
            .await
            .map_err(store_error)?;

        let input = json!({
            "decision": decision,
            "proposal": proposal,
            "action_type": decision.action_type,
            "already_executed": already_executed,
        });

        match client.evaluate(&self.policy_path, &input).await {
            Ok(verdict) if verdict.allowed => Ok(()),
            Ok(verdict) => Err(PipelineError::Validation(format!(
                "effect release denied: {}",
                verdict.reasons.join("; ")
            ))),
            Err(PolicyError::Transport(e)) => Err(PipelineError::Transient(format!(
                "policy engine unreachable, refusing to release effect: {e}"
            ))),
            Err(e) => Err(PipelineError::Validation(format!(
                "effect policy evaluation failed: {e}"
            ))),
        }
    }

    /// Simulated execution of the approved action.
    fn execute(decision: &Decision) -> Result<String, String> {
        Ok(format!(
            "simulated {} against track {}",
            decision.action_type, decision.track_id
        ))
    }

    async fn publish_effect(
        &self,
        parent: &Envelope,
        effect: &EffectRecord,
    ) -> Result<(), PipelineError> {
        let subject = Subject::effect(effect.status, effect.action_type);
        let envelope = Envelope::child_of(parent, &self.agent_id, "effector");
        let mut message = BusMessage::new(envelope, effect.clone());
        if let Some(ref key) = self.key {
            message.sign(key)?;
        }
        self.bus
            .publish(&subject, message.to_bytes()?)
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;
        self.metrics.record_published();
        Ok(())
    }
}

fn store_error(e: StoreError) -> PipelineError {
    if e.is_transient() {
        PipelineError::Transient(e.to_string())
    } else {
        PipelineError::Conflict(e.to_string())
    }
}

#[async_trait]
impl Processor for Effector {
    async fn process(&mut self, delivery: &Delivery) -> Result<(), PipelineError> {
        let message: BusMessage<Decision> = BusMessage::from_bytes(&delivery.payload)?;
        let decision = &message.body;

        if !decision.approved {
            return Err(PipelineError::Validation(format!(
                "decision {} on the approved subject is not approved",
                decision.decision_id
            )));
        }

        let key = idempotent_key(&decision.decision_id, decision.action_type, &decision.track_id);

        // A terminal row means this delivery is a replay: report the stored
        // status and stop. A pending row is crash recovery: the process
        // died between insert and store transition, so execution resumes.
        let existing = self.store.get_effect_by_key(&key).await.map_err(store_error)?;
        if let Some(ref effect) = existing
            && effect.status.is_terminal()
        {
            debug!(
                decision_id = %decision.decision_id,
                status = %effect.status,
                "replayed decision, effect already terminal"
            );
            self.store
                .increment_counter(COUNTER_REPLAYED, 1)
                .await
                .map_err(store_error)?;
            self.publish_effect(&message.envelope, effect).await?;
            return Ok(());
        }

        self.recheck_policy(decision, existing.is_some()).await?;

        let effect = match existing {
            Some(pending_row) => {
                info!(
                    decision_id = %decision.decision_id,
                    "resuming execution of pending effect after restart"
                );
                pending_row
            }
            None => {
                let row = EffectRecord {
                    effect_id: EffectId::new_random(),
                    decision_id: decision.decision_id.clone(),
                    proposal_id: decision.proposal_id.clone(),
                    track_id: decision.track_id.clone(),
                    action_type: decision.action_type,
                    status: EffectStatus::Pending,
                    executed_at: None,
                    result: String::new(),
                    idempotent_key: key.clone(),
                    created_at: Utc::now(),
                };
                match self.store.insert_effect(&row).await.map_err(store_error)? {
                    EffectInsert::Inserted => {
                        self.publish_effect(&message.envelope, &row).await?;
                        row
                    }
                    // Another delivery won the insert race.
                    EffectInsert::Replay(existing) => {
                        if existing.status.is_terminal() {
                            self.publish_effect(&message.envelope, &existing).await?;
                            return Ok(());
                        }
                        existing
                    }
                }
            }
        };

        let (status, result) = match Self::execute(decision) {
            Ok(result) => (EffectStatus::Executed, result),
            Err(error) => (EffectStatus::Failed, error),
        };

        let updated = self
            .store
            .transition_effect(
                &effect.idempotent_key,
                status,
                Utc::now(),
                &truncate_result(&result),
            )
            .await
            .map_err(store_error)?;

        self.publish_effect(&message.envelope, &updated).await?;
        self.store
            .increment_counter(COUNTER_EXECUTED, 1)
            .await
            .map_err(store_error)?;
        info!(
            effect_id = %updated.effect_id,
            decision_id = %decision.decision_id,
            action = %decision.action_type,
            status = %updated.status,
            "effect recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_bus::InMemoryBus;
    use aegis_core::{ActionType, DecisionId, ProposalId, TrackId};
    use aegis_store::EffectQuery;
    use aegis_store_memory::MemoryStore;

    fn decision(id: &str, approved: bool) -> Decision {
        Decision {
            decision_id: DecisionId::new(id),
            proposal_id: ProposalId::new("p1"),
            track_id: TrackId::new("T1"),
            action_type: ActionType::Engage,
            approved,
            approved_by: "op1".into(),
            approved_at: Utc::now(),
            reason: "cleared".into(),
            conditions: vec![],
        }
    }

    fn delivery(d: &Decision) -> Delivery {
        let message = BusMessage::new(Envelope::root("authorizer-1", "authorizer"), d.clone());
        Delivery {
            stream: "DECISIONS".into(),
            consumer: "effector".into(),
            stream_seq: 1,
            subject: Subject::decision(d.approved, d.action_type),
            payload: message.to_bytes().unwrap(),
            deliver_count: 1,
        }
    }

    fn effector(bus: &Arc<InMemoryBus>, store: &Arc<MemoryStore>) -> Effector {
        Effector::new(
            "effector-1",
            Arc::clone(bus) as Arc<dyn MessageBus>,
            None,
            None,
            Arc::clone(store) as Arc<dyn CanonicalStore>,
            Arc::new(AgentMetrics::default()),
        )
    }

    #[tokio::test]
    async fn executes_once_and_records_the_effect() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(MemoryStore::new());
        let mut effector = effector(&bus, &store);

        let mut sub = bus.subscribe("effect.executed.engage");
        let d = decision("d1", true);
        effector.process(&delivery(&d)).await.unwrap();

        let event = sub.next().await.unwrap();
        let effect: BusMessage<EffectRecord> = BusMessage::from_bytes(&event.payload).unwrap();
        assert_eq!(effect.body.status, EffectStatus::Executed);
        assert!(effect.body.result.contains("simulated engage"));

        let rows = store.list_effects(&EffectQuery::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, EffectStatus::Executed);
    }

    #[tokio::test]
    async fn replaying_the_same_decision_yields_one_row() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(MemoryStore::new());
        let mut effector = effector(&bus, &store);

        let d = decision("d1", true);
        effector.process(&delivery(&d)).await.unwrap();
        // Redelivery after ack loss: replay path, no second execution.
        effector.process(&delivery(&d)).await.unwrap();

        let rows = store.list_effects(&EffectQuery::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, EffectStatus::Executed);

        let counters = store.counters().await.unwrap();
        assert_eq!(counters.get("effects_executed"), Some(&1));
        assert_eq!(counters.get("effects_replayed"), Some(&1));
    }

    #[tokio::test]
    async fn crash_between_insert_and_execute_recovers_exactly_once() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(MemoryStore::new());
        let d = decision("d1", true);

        // Simulate the first attempt dying after the pending insert.
        let key = idempotent_key(&d.decision_id, d.action_type, &d.track_id);
        store
            .insert_effect(&EffectRecord {
                effect_id: EffectId::new_random(),
                decision_id: d.decision_id.clone(),
                proposal_id: d.proposal_id.clone(),
                track_id: d.track_id.clone(),
                action_type: d.action_type,
                status: EffectStatus::Pending,
                executed_at: None,
                result: String::new(),
                idempotent_key: key.clone(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut effector = effector(&bus, &store);
        effector.process(&delivery(&d)).await.unwrap();

        let row = store.get_effect_by_key(&key).await.unwrap().unwrap();
        assert_eq!(row.status, EffectStatus::Executed);
        let rows = store.list_effects(&EffectQuery::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn unapproved_decision_is_rejected() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(MemoryStore::new());
        let mut effector = effector(&bus, &store);

        let err = effector
            .process(&delivery(&decision("d1", false)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(store.list_effects(&EffectQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_policy_fails_closed() {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(MemoryStore::new());
        let client = PolicyClient::with_timeout(
            "http://127.0.0.1:9",
            std::time::Duration::from_millis(100),
        )
        .unwrap();
        let mut effector = Effector::new(
            "effector-1",
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            None,
            Some(client),
            Arc::clone(&store) as Arc<dyn CanonicalStore>,
            Arc::new(AgentMetrics::default()),
        );

        let err = effector
            .process(&delivery(&decision("d1", true)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transient(_)));
        // Nothing was written or executed.
        assert!(store.list_effects(&EffectQuery::default()).await.unwrap().is_empty());
    }
}
