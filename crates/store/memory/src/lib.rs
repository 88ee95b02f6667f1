//! In-memory implementation of [`CanonicalStore`].
//!
//! The reference backend: every cross-row invariant the Postgres schema
//! enforces with indexes and checks is enforced here with explicit lookups
//! under one lock. Used by unit and API tests, and usable as a single-node
//! deployment substrate.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use aegis_core::{
    ActionProposal, CorrelatedTrack, Decision, DecisionId, Detection, EffectRecord, EffectStatus,
    InterventionRule, ProposalId, ProposalStatus, RuleId, TrackId,
};
use aegis_store::{
    ActiveTrack, AuditEntry, CanonicalStore, ClearCounts, DecisionQuery, EffectInsert,
    EffectQuery, ProposalInsert, ProposalQuery, StageLatency, StoreError, TrackQuery,
    percentile_ms,
};

#[derive(Default)]
struct Inner {
    tracks: HashMap<TrackId, CorrelatedTrack>,
    detections: HashMap<TrackId, Vec<Detection>>,
    detection_count: u64,
    /// Insertion-ordered proposal ids for stable listing.
    proposal_order: Vec<ProposalId>,
    proposals: HashMap<ProposalId, ActionProposal>,
    /// The partial-unique-index surrogate: track id -> its pending proposal.
    pending_by_track: HashMap<TrackId, ProposalId>,
    decision_order: Vec<DecisionId>,
    decisions: HashMap<DecisionId, Decision>,
    decision_by_proposal: HashMap<ProposalId, DecisionId>,
    effect_order: Vec<String>,
    effects: HashMap<String, EffectRecord>,
    rules: HashMap<RuleId, InterventionRule>,
    counters: HashMap<String, i64>,
}

/// In-memory store. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T>(items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}

#[async_trait]
impl CanonicalStore for MemoryStore {
    async fn upsert_track(&self, track: &CorrelatedTrack) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let mut incoming = track.clone();
        if let Some(existing) = inner.tracks.get(&track.track_id) {
            // Detection counts are monotonic per track id.
            incoming.detection_count = incoming.detection_count.max(existing.detection_count);
            incoming.first_seen = incoming.first_seen.min(existing.first_seen);
        }
        inner.tracks.insert(track.track_id.clone(), incoming);
        Ok(())
    }

    async fn get_track(&self, id: &TrackId) -> Result<Option<CorrelatedTrack>, StoreError> {
        Ok(self.inner.read().tracks.get(id).cloned())
    }

    async fn list_tracks(&self, query: &TrackQuery) -> Result<Vec<CorrelatedTrack>, StoreError> {
        let inner = self.inner.read();
        let mut tracks: Vec<CorrelatedTrack> = inner
            .tracks
            .values()
            .filter(|t| {
                query.classification.is_none_or(|c| t.classification == c)
                    && query.threat_level.is_none_or(|l| t.threat_level == l)
                    && query.track_type.is_none_or(|ty| t.track_type == ty)
                    && query.since.is_none_or(|s| t.last_updated >= s)
            })
            .cloned()
            .collect();
        tracks.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(page(tracks, query.limit, query.offset))
    }

    async fn active_tracks(&self, since: DateTime<Utc>) -> Result<Vec<ActiveTrack>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<ActiveTrack> = inner
            .tracks
            .values()
            .filter(|t| t.last_updated >= since)
            .map(|t| {
                let pending = u64::from(inner.pending_by_track.contains_key(&t.track_id));
                ActiveTrack {
                    track: t.clone(),
                    pending_proposals: pending,
                }
            })
            .collect();
        rows.sort_by(|a, b| b.track.last_updated.cmp(&a.track.last_updated));
        Ok(rows)
    }

    async fn prune_tracks(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let before = inner.tracks.len();
        inner.tracks.retain(|_, t| t.last_updated >= cutoff);
        Ok((before - inner.tracks.len()) as u64)
    }

    async fn insert_detection(&self, detection: &Detection) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .detections
            .entry(detection.track_id.clone())
            .or_default()
            .push(detection.clone());
        inner.detection_count += 1;
        Ok(())
    }

    async fn track_history(
        &self,
        id: &TrackId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Detection>, StoreError> {
        let inner = self.inner.read();
        let mut history = inner.detections.get(id).cloned().unwrap_or_default();
        history.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
        Ok(page(history, limit, offset))
    }

    async fn insert_proposal(
        &self,
        proposal: &ActionProposal,
    ) -> Result<ProposalInsert, StoreError> {
        let mut inner = self.inner.write();
        if let Some(existing_id) = inner.pending_by_track.get(&proposal.track_id).cloned() {
            let existing = inner
                .proposals
                .get_mut(&existing_id)
                .ok_or_else(|| StoreError::Backend("dangling pending index entry".to_owned()))?;
            existing.hit_count += 1;
            existing.last_hit_at = Some(Utc::now());
            return Ok(ProposalInsert::DuplicatePending(existing.clone()));
        }
        if inner.proposals.contains_key(&proposal.proposal_id) {
            return Err(StoreError::Conflict(format!(
                "proposal {} already exists",
                proposal.proposal_id
            )));
        }
        let mut row = proposal.clone();
        row.status = ProposalStatus::Pending;
        inner
            .pending_by_track
            .insert(row.track_id.clone(), row.proposal_id.clone());
        inner.proposal_order.push(row.proposal_id.clone());
        inner.proposals.insert(row.proposal_id.clone(), row);
        Ok(ProposalInsert::Inserted)
    }

    async fn get_proposal(&self, id: &ProposalId) -> Result<Option<ActionProposal>, StoreError> {
        Ok(self.inner.read().proposals.get(id).cloned())
    }

    async fn list_proposals(
        &self,
        query: &ProposalQuery,
    ) -> Result<Vec<ActionProposal>, StoreError> {
        let inner = self.inner.read();
        let rows: Vec<ActionProposal> = inner
            .proposal_order
            .iter()
            .rev()
            .filter_map(|id| inner.proposals.get(id))
            .filter(|p| {
                query.status.is_none_or(|s| p.status == s)
                    && query.track_id.as_ref().is_none_or(|t| &p.track_id == t)
                    && query.action_type.is_none_or(|a| p.action_type == a)
                    && query.threat_level.is_none_or(|l| p.threat_level == l)
            })
            .cloned()
            .collect();
        Ok(page(rows, query.limit, query.offset))
    }

    async fn pending_queue(&self, now: DateTime<Utc>) -> Result<Vec<ActionProposal>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<ActionProposal> = inner
            .proposals
            .values()
            .filter(|p| p.status == ProposalStatus::Pending && p.expires_at > now)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(rows)
    }

    async fn transition_proposal(
        &self,
        id: &ProposalId,
        to: ProposalStatus,
    ) -> Result<ActionProposal, StoreError> {
        let mut inner = self.inner.write();
        let proposal = inner
            .proposals
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("proposal {id}")))?;
        if !proposal.status.can_transition(to) {
            return Err(StoreError::Conflict(format!(
                "proposal {id} is {} and cannot become {to}",
                proposal.status
            )));
        }
        proposal.status = to;
        let updated = proposal.clone();
        inner.pending_by_track.remove(&updated.track_id);
        Ok(updated)
    }

    async fn expire_due_proposals(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActionProposal>, StoreError> {
        let mut inner = self.inner.write();
        let due: Vec<ProposalId> = inner
            .proposals
            .values()
            .filter(|p| p.status == ProposalStatus::Pending && p.is_expired(now))
            .map(|p| p.proposal_id.clone())
            .collect();
        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            if let Some(p) = inner.proposals.get_mut(&id) {
                p.status = ProposalStatus::Expired;
                let row = p.clone();
                inner.pending_by_track.remove(&row.track_id);
                expired.push(row);
            }
        }
        Ok(expired)
    }

    async fn insert_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.proposals.contains_key(&decision.proposal_id) {
            return Err(StoreError::NotFound(format!(
                "proposal {}",
                decision.proposal_id
            )));
        }
        if inner.decision_by_proposal.contains_key(&decision.proposal_id) {
            return Err(StoreError::Conflict(format!(
                "proposal {} already has a decision",
                decision.proposal_id
            )));
        }
        inner
            .decision_by_proposal
            .insert(decision.proposal_id.clone(), decision.decision_id.clone());
        inner.decision_order.push(decision.decision_id.clone());
        inner
            .decisions
            .insert(decision.decision_id.clone(), decision.clone());
        Ok(())
    }

    async fn list_decisions(&self, query: &DecisionQuery) -> Result<Vec<Decision>, StoreError> {
        let inner = self.inner.read();
        let rows: Vec<Decision> = inner
            .decision_order
            .iter()
            .rev()
            .filter_map(|id| inner.decisions.get(id))
            .filter(|d| {
                query.approved.is_none_or(|a| d.approved == a)
                    && query.track_id.as_ref().is_none_or(|t| &d.track_id == t)
                    && query.action_type.is_none_or(|a| d.action_type == a)
                    && query.since.is_none_or(|s| d.approved_at >= s)
            })
            .cloned()
            .collect();
        Ok(page(rows, query.limit, query.offset))
    }

    async fn insert_effect(&self, effect: &EffectRecord) -> Result<EffectInsert, StoreError> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.effects.get(&effect.idempotent_key) {
            return Ok(EffectInsert::Replay(existing.clone()));
        }
        inner.effect_order.push(effect.idempotent_key.clone());
        inner
            .effects
            .insert(effect.idempotent_key.clone(), effect.clone());
        Ok(EffectInsert::Inserted)
    }

    async fn transition_effect(
        &self,
        idempotent_key: &str,
        to: EffectStatus,
        executed_at: DateTime<Utc>,
        result: &str,
    ) -> Result<EffectRecord, StoreError> {
        let mut inner = self.inner.write();
        let effect = inner
            .effects
            .get_mut(idempotent_key)
            .ok_or_else(|| StoreError::NotFound(format!("effect key {idempotent_key}")))?;
        if !effect.status.can_transition(to) {
            return Err(StoreError::Conflict(format!(
                "effect {} is {} and cannot become {to}",
                effect.effect_id, effect.status
            )));
        }
        effect.status = to;
        effect.executed_at = Some(executed_at);
        effect.result = result.to_owned();
        Ok(effect.clone())
    }

    async fn get_effect_by_key(
        &self,
        idempotent_key: &str,
    ) -> Result<Option<EffectRecord>, StoreError> {
        Ok(self.inner.read().effects.get(idempotent_key).cloned())
    }

    async fn list_effects(&self, query: &EffectQuery) -> Result<Vec<EffectRecord>, StoreError> {
        let inner = self.inner.read();
        let rows: Vec<EffectRecord> = inner
            .effect_order
            .iter()
            .rev()
            .filter_map(|key| inner.effects.get(key))
            .filter(|e| {
                query.status.is_none_or(|s| e.status == s)
                    && query.track_id.as_ref().is_none_or(|t| &e.track_id == t)
                    && query.action_type.is_none_or(|a| e.action_type == a)
                    && query.since.is_none_or(|s| e.created_at >= s)
            })
            .cloned()
            .collect();
        Ok(page(rows, query.limit, query.offset))
    }

    async fn audit_trail(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let inner = self.inner.read();
        let rows: Vec<AuditEntry> = inner
            .proposal_order
            .iter()
            .rev()
            .filter_map(|id| inner.proposals.get(id))
            .map(|p| {
                let decision = inner
                    .decision_by_proposal
                    .get(&p.proposal_id)
                    .and_then(|d| inner.decisions.get(d))
                    .cloned();
                let effect = decision.as_ref().and_then(|d| {
                    inner
                        .effects
                        .values()
                        .find(|e| e.decision_id == d.decision_id)
                        .cloned()
                });
                AuditEntry {
                    proposal: p.clone(),
                    decision,
                    effect,
                }
            })
            .collect();
        Ok(page(rows, limit, offset))
    }

    async fn stage_metrics(&self) -> Result<Vec<StageLatency>, StoreError> {
        let inner = self.inner.read();

        let mut plan_to_decision: Vec<f64> = Vec::new();
        let mut decision_to_effect: Vec<f64> = Vec::new();
        let mut plan_to_effect: Vec<f64> = Vec::new();

        for decision in inner.decisions.values() {
            if let Some(p) = inner.proposals.get(&decision.proposal_id) {
                let ms = (decision.approved_at - p.created_at).num_milliseconds();
                plan_to_decision.push(ms.max(0) as f64);
            }
        }
        for effect in inner.effects.values() {
            let Some(executed_at) = effect.executed_at else {
                continue;
            };
            if let Some(d) = inner.decisions.get(&effect.decision_id) {
                let ms = (executed_at - d.approved_at).num_milliseconds();
                decision_to_effect.push(ms.max(0) as f64);
            }
            if let Some(p) = inner.proposals.get(&effect.proposal_id) {
                let ms = (executed_at - p.created_at).num_milliseconds();
                plan_to_effect.push(ms.max(0) as f64);
            }
        }

        let aggregate = |stage: &str, mut samples: Vec<f64>| -> StageLatency {
            samples.sort_by(f64::total_cmp);
            let count = samples.len() as u64;
            let avg = if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<f64>() / samples.len() as f64
            };
            StageLatency {
                stage: stage.to_owned(),
                count,
                avg_ms: avg,
                p50_ms: percentile_ms(&samples, 50.0),
                p95_ms: percentile_ms(&samples, 95.0),
                p99_ms: percentile_ms(&samples, 99.0),
            }
        };

        Ok(vec![
            aggregate("proposal_to_decision", plan_to_decision),
            aggregate("decision_to_effect", decision_to_effect),
            aggregate("proposal_to_effect", plan_to_effect),
        ])
    }

    async fn insert_rule(&self, rule: &InterventionRule) -> Result<(), StoreError> {
        rule.validate()
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        let mut inner = self.inner.write();
        if inner.rules.values().any(|r| r.name == rule.name) {
            return Err(StoreError::Conflict(format!(
                "rule name {} already exists",
                rule.name
            )));
        }
        inner.rules.insert(rule.rule_id.clone(), rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &InterventionRule) -> Result<(), StoreError> {
        rule.validate()
            .map_err(|e| StoreError::Conflict(e.to_string()))?;
        let mut inner = self.inner.write();
        if !inner.rules.contains_key(&rule.rule_id) {
            return Err(StoreError::NotFound(format!("rule {}", rule.rule_id)));
        }
        if inner
            .rules
            .values()
            .any(|r| r.name == rule.name && r.rule_id != rule.rule_id)
        {
            return Err(StoreError::Conflict(format!(
                "rule name {} already exists",
                rule.name
            )));
        }
        inner.rules.insert(rule.rule_id.clone(), rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, id: &RuleId) -> Result<bool, StoreError> {
        Ok(self.inner.write().rules.remove(id).is_some())
    }

    async fn get_rule(&self, id: &RuleId) -> Result<Option<InterventionRule>, StoreError> {
        Ok(self.inner.read().rules.get(id).cloned())
    }

    async fn list_rules(&self) -> Result<Vec<InterventionRule>, StoreError> {
        let mut rules: Vec<InterventionRule> = self.inner.read().rules.values().cloned().collect();
        rules.sort_by_key(|r| r.evaluation_order);
        Ok(rules)
    }

    async fn increment_counter(&self, name: &str, delta: i64) -> Result<i64, StoreError> {
        let mut inner = self.inner.write();
        let value = inner.counters.entry(name.to_owned()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn counters(&self) -> Result<HashMap<String, i64>, StoreError> {
        Ok(self.inner.read().counters.clone())
    }

    async fn clear_all(&self) -> Result<ClearCounts, StoreError> {
        let mut inner = self.inner.write();
        let counts = ClearCounts {
            effects: inner.effects.len() as u64,
            decisions: inner.decisions.len() as u64,
            proposals: inner.proposals.len() as u64,
            detections: inner.detection_count,
            tracks: inner.tracks.len() as u64,
        };
        inner.effects.clear();
        inner.effect_order.clear();
        inner.decisions.clear();
        inner.decision_order.clear();
        inner.decision_by_proposal.clear();
        inner.proposals.clear();
        inner.proposal_order.clear();
        inner.pending_by_track.clear();
        inner.detections.clear();
        inner.detection_count = 0;
        inner.tracks.clear();
        inner.counters.clear();
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
