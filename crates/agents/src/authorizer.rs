//! The authorizer: materializes proposals as pending rows and routes them
//! through the intervention rules.
//!
//! Consumes the proposal work queue (consume-once). Duplicate pending
//! proposals for a track are folded into the existing row by the store's
//! partial-unique discipline. Auto-approve verdicts decide immediately as
//! `system-<rule_id>`; everything else waits for the HTTP decide endpoint.
//! A sweeper task expires overdue proposals and publishes the denial for
//! audit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aegis_agent::{AgentMetrics, Processor};
use aegis_bus::{Delivery, MessageBus};
use aegis_core::{
    ActionProposal, BusMessage, Decision, DecisionId, Envelope, PipelineError, ProposalStatus,
    RuleVerdict, SigningKey, Subject, evaluate_rules,
};
use aegis_store::{CanonicalStore, ProposalInsert, StoreError};

/// Counter names the authorizer maintains in the store.
const COUNTER_PROCESSED: &str = "proposals_processed";
const COUNTER_AUTO_APPROVED: &str = "proposals_auto_approved";
const COUNTER_EXPIRED: &str = "proposals_expired";

/// Authorizer configuration.
#[derive(Debug, Clone)]
pub struct AuthorizerConfig {
    /// How often the expiry sweeper runs.
    pub sweep_interval: Duration,
}

impl Default for AuthorizerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// The authorizer stage. Consumes `proposal.>` as a work queue.
pub struct Authorizer {
    agent_id: String,
    bus: Arc<dyn MessageBus>,
    key: Option<SigningKey>,
    store: Arc<dyn CanonicalStore>,
    metrics: Arc<AgentMetrics>,
}

impl Authorizer {
    /// Create an authorizer.
    pub fn new(
        agent_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        key: Option<SigningKey>,
        store: Arc<dyn CanonicalStore>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
            key,
            store,
            metrics,
        }
    }

    /// Decide a proposal on behalf of a matched auto-approve rule:
    /// insert the decision, flip the proposal, publish
    /// `decision.approved.<action_type>`.
    async fn auto_approve(
        &self,
        envelope: &Envelope,
        proposal: &ActionProposal,
        rule_id: &str,
        rule_name: &str,
    ) -> Result<(), PipelineError> {
        let decision = Decision {
            decision_id: DecisionId::new_random(),
            proposal_id: proposal.proposal_id.clone(),
            track_id: proposal.track_id.clone(),
            action_type: proposal.action_type,
            approved: true,
            approved_by: format!("system-{rule_id}"),
            approved_at: Utc::now(),
            reason: format!("auto-approved by rule {rule_name}"),
            conditions: vec![],
        };
        decision.validate()?;

        self.store
            .insert_decision(&decision)
            .await
            .map_err(store_error)?;
        self.store
            .transition_proposal(&proposal.proposal_id, ProposalStatus::Approved)
            .await
            .map_err(store_error)?;

        publish_decision(
            &*self.bus,
            &self.agent_id,
            self.key.as_ref(),
            envelope,
            &decision,
        )
        .await?;
        self.metrics.record_published();
        self.store
            .increment_counter(COUNTER_AUTO_APPROVED, 1)
            .await
            .map_err(store_error)?;

        info!(
            proposal_id = %proposal.proposal_id,
            rule = rule_name,
            action = %proposal.action_type,
            "proposal auto-approved"
        );
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

/// Publish a decision on `decision.{approved|denied}.<action_type>` as a
/// child of `parent`.
async fn publish_decision(
    bus: &dyn MessageBus,
    agent_id: &str,
    key: Option<&SigningKey>,
    parent: &Envelope,
    decision: &Decision,
) -> Result<(), PipelineError> {
    let subject = Subject::decision(decision.approved, decision.action_type);
    let envelope = Envelope::child_of(parent, agent_id, "authorizer");
    let mut message = BusMessage::new(envelope, decision.clone());
    if let Some(key) = key {
        message.sign(key)?;
    }
    bus.publish(&subject, message.to_bytes()?)
        .await
        .map_err(|e| PipelineError::Transient(e.to_string()))
}

#[async_trait]
impl Processor for Authorizer {
    async fn process(&mut self, delivery: &Delivery) -> Result<(), PipelineError> {
        let message: BusMessage<ActionProposal> = BusMessage::from_bytes(&delivery.payload)?;
        let proposal = &message.body;

        match self
            .store
            .insert_proposal(proposal)
            .await
            .map_err(store_error)?
        {
            ProposalInsert::DuplicatePending(existing) => {
                debug!(
                    track_id = %proposal.track_id,
                    existing = %existing.proposal_id,
                    hit_count = existing.hit_count,
                    "duplicate pending proposal folded"
                );
                return Ok(());
            }
            ProposalInsert::Inserted => {}
        }
        self.store
            .increment_counter(COUNTER_PROCESSED, 1)
            .await
            .map_err(store_error)?;

        // A policy-denied proposal is stored for audit only; it waits in
        // pending until the sweeper expires it or an operator denies it.
        if !proposal.policy_decision.allowed {
            info!(
                proposal_id = %proposal.proposal_id,
                reasons = ?proposal.policy_decision.reasons,
                "policy-denied proposal persisted for audit"
            );
            return Ok(());
        }

        let rules = self.store.list_rules().await.map_err(store_error)?;
        let matched = evaluate_rules(&rules, proposal);

        match matched {
            Some(rule) if rule.verdict == RuleVerdict::AutoApprove => {
                if proposal.action_type.requires_human() {
                    warn!(
                        proposal_id = %proposal.proposal_id,
                        rule = %rule.name,
                        action = %proposal.action_type,
                        "auto-approve rule matched a human-required action, leaving pending"
                    );
                    return Ok(());
                }
                self.auto_approve(
                    &message.envelope,
                    proposal,
                    rule.rule_id.as_str(),
                    &rule.name,
                )
                .await
            }
            Some(rule) => {
                debug!(
                    proposal_id = %proposal.proposal_id,
                    rule = %rule.name,
                    "proposal requires human approval"
                );
                Ok(())
            }
            // No matching rule: the default is human approval.
            None => {
                debug!(
                    proposal_id = %proposal.proposal_id,
                    "no intervention rule matched, awaiting human decision"
                );
                Ok(())
            }
        }
    }
}

/// The expiry sweeper: marks overdue pending proposals `expired` and
/// publishes `decision.denied.<action_type>` as `system-expired`.
pub struct ExpirySweeper {
    agent_id: String,
    bus: Arc<dyn MessageBus>,
    key: Option<SigningKey>,
    store: Arc<dyn CanonicalStore>,
    config: AuthorizerConfig,
    shutdown: CancellationToken,
}

impl ExpirySweeper {
    /// Create a sweeper sharing the authorizer's collaborators.
    pub fn new(
        agent_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        key: Option<SigningKey>,
        store: Arc<dyn CanonicalStore>,
        config: AuthorizerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            bus,
            key,
            store,
            config,
            shutdown,
        }
    }

    /// Run the sweep loop until cancelled.
    pub async fn run(&self) {
        let mut timer = tokio::time::interval(self.config.sweep_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("expiry sweeper stopped");
                    return;
                }
                _ = timer.tick() => {}
            }
            if let Err(e) = self.sweep_once().await {
                warn!(error = %e, "expiry sweep failed");
            }
        }
    }

    /// One sweep pass. Public for tests.
    pub async fn sweep_once(&self) -> Result<usize, PipelineError> {
        let expired = self
            .store
            .expire_due_proposals(Utc::now())
            .await
            .map_err(store_error)?;
        let count = expired.len();

        for proposal in expired {
            let decision = Decision {
                decision_id: DecisionId::new_random(),
                proposal_id: proposal.proposal_id.clone(),
                track_id: proposal.track_id.clone(),
                action_type: proposal.action_type,
                approved: false,
                approved_by: "system-expired".to_owned(),
                approved_at: Utc::now(),
                reason: "proposal expired undecided".to_owned(),
                conditions: vec![],
            };
            if let Err(e) = self.store.insert_decision(&decision).await {
                // A racing human decision landed between the sweep and the
                // insert; the expiry stands, the decision is theirs.
                warn!(proposal_id = %proposal.proposal_id, error = %e, "expiry decision insert failed");
                continue;
            }
            let root = Envelope::root(&self.agent_id, "authorizer");
            if let Err(e) = publish_decision(
                &*self.bus,
                &self.agent_id,
                self.key.as_ref(),
                &root,
                &decision,
            )
            .await
            {
                warn!(proposal_id = %proposal.proposal_id, error = %e, "expiry publish failed");
            }
            self.store
                .increment_counter(COUNTER_EXPIRED, 1)
                .await
                .map_err(store_error)?;
            info!(proposal_id = %proposal.proposal_id, "proposal expired");
        }
        Ok(count)
    }
}
