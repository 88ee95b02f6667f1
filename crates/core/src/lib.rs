//! Core types and shared abstractions for the Aegis decision pipeline.
//!
//! Everything that flows between pipeline stages is defined here: the signed
//! message envelope, the subject naming scheme, the domain objects
//! (detections, tracks, proposals, decisions, effects), the intervention
//! rules that route proposals to a human or to auto-approval, and the error
//! taxonomy shared by every stage.

pub mod decision;
pub mod detection;
pub mod effect;
pub mod envelope;
pub mod error;
pub mod proposal;
pub mod rule;
pub mod subject;
pub mod threat;
pub mod track;
pub mod types;

pub use decision::Decision;
pub use detection::{Detection, GeoPosition, Velocity};
pub use effect::{EffectRecord, EffectStatus, idempotent_key, truncate_result};
pub use envelope::{BusMessage, Envelope, SigningKey, parse_signing_key};
pub use error::PipelineError;
pub use proposal::{
    ActionProposal, ActionType, PolicyVerdict, ProposalStatus, constraints_for, expiry_for,
    plan_action, priority_bucket,
};
pub use rule::{InterventionRule, RuleVerdict, evaluate_rules};
pub use subject::{Subject, subject_matches};
pub use threat::{ThreatConfig, assess_threat, is_approaching};
pub use track::{Classification, ClassifiedTrack, CorrelatedTrack, ThreatLevel, TrackType};
pub use types::{AgentId, DecisionId, EffectId, ProposalId, RuleId, TrackId};
