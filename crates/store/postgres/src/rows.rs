//! `sqlx` row adapters mapping table rows to and from domain types.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::FromRow;

use aegis_core::{
    ActionProposal, CorrelatedTrack, Decision, DecisionId, Detection, EffectId, EffectRecord,
    InterventionRule, ProposalId, RuleId, TrackId,
};
use aegis_store::StoreError;

/// Parse a lowercase enum token stored as TEXT back into its serde enum.
pub(crate) fn parse_enum<T: DeserializeOwned>(token: &str) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::String(token.to_owned()))
        .map_err(|e| StoreError::Serialization(format!("bad enum token {token}: {e}")))
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

#[derive(FromRow)]
pub(crate) struct TrackRow {
    pub track_id: String,
    pub classification: String,
    pub track_type: String,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub speed: f64,
    pub heading: f64,
    pub confidence: f64,
    pub threat_level: String,
    pub merged_from: serde_json::Value,
    pub sources: serde_json::Value,
    pub detection_count: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl TryFrom<TrackRow> for CorrelatedTrack {
    type Error = StoreError;

    fn try_from(row: TrackRow) -> Result<Self, StoreError> {
        Ok(Self {
            track_id: TrackId::new(row.track_id),
            classification: parse_enum(&row.classification)?,
            track_type: parse_enum(&row.track_type)?,
            position: aegis_core::GeoPosition {
                lat: row.lat,
                lon: row.lon,
                alt: row.alt,
            },
            velocity: aegis_core::Velocity {
                speed: row.speed,
                heading: row.heading,
            },
            confidence: row.confidence,
            threat_level: parse_enum(&row.threat_level)?,
            merged_from: from_json(row.merged_from)?,
            sources: from_json(row.sources)?,
            detection_count: u64::try_from(row.detection_count).unwrap_or_default(),
            window_start: row.window_start,
            window_end: row.window_end,
            first_seen: row.first_seen,
            last_updated: row.last_updated,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct DetectionRow {
    pub payload: serde_json::Value,
}

impl TryFrom<DetectionRow> for Detection {
    type Error = StoreError;

    fn try_from(row: DetectionRow) -> Result<Self, StoreError> {
        from_json(row.payload)
    }
}

#[derive(FromRow)]
pub(crate) struct ProposalRow {
    pub proposal_id: String,
    pub track_id: String,
    pub action_type: String,
    pub priority: i16,
    pub rationale: String,
    pub constraints: serde_json::Value,
    pub classification: String,
    pub threat_level: String,
    pub track_type: String,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub policy_decision: serde_json::Value,
    pub hit_count: i64,
    pub last_hit_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ProposalRow> for ActionProposal {
    type Error = StoreError;

    fn try_from(row: ProposalRow) -> Result<Self, StoreError> {
        Ok(Self {
            proposal_id: ProposalId::new(row.proposal_id),
            track_id: TrackId::new(row.track_id),
            action_type: parse_enum(&row.action_type)?,
            priority: u8::try_from(row.priority)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            rationale: row.rationale,
            constraints: from_json(row.constraints)?,
            classification: parse_enum(&row.classification)?,
            threat_level: parse_enum(&row.threat_level)?,
            track_type: parse_enum(&row.track_type)?,
            status: parse_enum(&row.status)?,
            expires_at: row.expires_at,
            policy_decision: from_json(row.policy_decision)?,
            hit_count: u64::try_from(row.hit_count).unwrap_or_default(),
            last_hit_at: row.last_hit_at,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct DecisionRow {
    pub decision_id: String,
    pub proposal_id: String,
    pub track_id: String,
    pub action_type: String,
    pub approved: bool,
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    pub reason: String,
    pub conditions: serde_json::Value,
}

impl TryFrom<DecisionRow> for Decision {
    type Error = StoreError;

    fn try_from(row: DecisionRow) -> Result<Self, StoreError> {
        Ok(Self {
            decision_id: DecisionId::new(row.decision_id),
            proposal_id: ProposalId::new(row.proposal_id),
            track_id: TrackId::new(row.track_id),
            action_type: parse_enum(&row.action_type)?,
            approved: row.approved,
            approved_by: row.approved_by,
            approved_at: row.approved_at,
            reason: row.reason,
            conditions: from_json(row.conditions)?,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct EffectRow {
    pub effect_id: String,
    pub idempotent_key: String,
    pub decision_id: String,
    pub proposal_id: String,
    pub track_id: String,
    pub action_type: String,
    pub status: String,
    pub executed_at: Option<DateTime<Utc>>,
    pub result: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<EffectRow> for EffectRecord {
    type Error = StoreError;

    fn try_from(row: EffectRow) -> Result<Self, StoreError> {
        Ok(Self {
            effect_id: EffectId::new(row.effect_id),
            idempotent_key: row.idempotent_key,
            decision_id: DecisionId::new(row.decision_id),
            proposal_id: ProposalId::new(row.proposal_id),
            track_id: TrackId::new(row.track_id),
            action_type: parse_enum(&row.action_type)?,
            status: parse_enum(&row.status)?,
            executed_at: row.executed_at,
            result: row.result,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct RuleRow {
    pub rule_id: String,
    pub name: String,
    pub description: Option<String>,
    pub action_types: serde_json::Value,
    pub threat_levels: serde_json::Value,
    pub classifications: serde_json::Value,
    pub track_types: serde_json::Value,
    pub min_priority: i16,
    pub max_priority: i16,
    pub verdict: String,
    pub evaluation_order: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<RuleRow> for InterventionRule {
    type Error = StoreError;

    fn try_from(row: RuleRow) -> Result<Self, StoreError> {
        Ok(Self {
            rule_id: RuleId::new(row.rule_id),
            name: row.name,
            description: row.description,
            action_types: from_json(row.action_types)?,
            threat_levels: from_json(row.threat_levels)?,
            classifications: from_json(row.classifications)?,
            track_types: from_json(row.track_types)?,
            min_priority: u8::try_from(row.min_priority)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            max_priority: u8::try_from(row.max_priority)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            verdict: parse_enum(&row.verdict)?,
            evaluation_order: row.evaluation_order,
            enabled: row.enabled,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::{Classification, ProposalStatus, RuleVerdict, ThreatLevel};

    #[test]
    fn parse_enum_roundtrips_wire_tokens() {
        assert_eq!(
            parse_enum::<Classification>("hostile").unwrap(),
            Classification::Hostile
        );
        assert_eq!(parse_enum::<ThreatLevel>("critical").unwrap(), ThreatLevel::Critical);
        assert_eq!(parse_enum::<ProposalStatus>("pending").unwrap(), ProposalStatus::Pending);
        assert_eq!(
            parse_enum::<RuleVerdict>("auto_approve").unwrap(),
            RuleVerdict::AutoApprove
        );
        assert!(parse_enum::<Classification>("martian").is_err());
    }
}
