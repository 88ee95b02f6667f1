//! Classified and correlated track objects, and the enums that label them.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detection::{GeoPosition, Velocity};
use crate::types::TrackId;

/// Identity assessment of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Friendly,
    Hostile,
    Neutral,
    Unknown,
}

impl Classification {
    /// Parse a sensor hint; anything unrecognized is `Unknown`.
    #[must_use]
    pub fn from_hint(hint: Option<&str>) -> Self {
        match hint {
            Some("friendly") => Self::Friendly,
            Some("hostile") => Self::Hostile,
            Some("neutral") => Self::Neutral,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Friendly => "friendly",
            Self::Hostile => "hostile",
            Self::Neutral => "neutral",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Platform category of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Aircraft,
    Vessel,
    Ground,
    Missile,
    Unknown,
}

impl TrackType {
    /// Parse a sensor hint; anything unrecognized is `Unknown`.
    #[must_use]
    pub fn from_hint(hint: Option<&str>) -> Self {
        match hint {
            Some("aircraft") => Self::Aircraft,
            Some("vessel") => Self::Vessel,
            Some("ground") => Self::Ground,
            Some("missile") => Self::Missile,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Aircraft => "aircraft",
            Self::Vessel => "vessel",
            Self::Ground => "ground",
            Self::Missile => "missile",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Ordinal threat label: `low < medium < high < critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A detection enriched with classification, emitted on
/// `track.classified.<classification>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedTrack {
    /// External track id.
    pub track_id: TrackId,
    /// Identity assessment.
    pub classification: Classification,
    /// Platform category.
    pub track_type: TrackType,
    /// Latest observed position.
    pub position: GeoPosition,
    /// Latest observed velocity.
    pub velocity: Velocity,
    /// Classifier confidence in `[0, 1]`.
    pub confidence: f64,
    /// Number of detections contributing to this track so far.
    pub detection_count: u64,
    /// First observation time.
    pub first_seen: DateTime<Utc>,
    /// Most recent observation time.
    pub last_updated: DateTime<Utc>,
    /// Sensor ids that have contributed.
    pub sources: BTreeSet<String>,
}

/// The canonical fused track, emitted on `track.correlated.<threat_level>`
/// and upserted into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatedTrack {
    /// External track id (the merge key).
    pub track_id: TrackId,
    /// Identity assessment after fusion.
    pub classification: Classification,
    /// Platform category after fusion.
    pub track_type: TrackType,
    /// Latest position.
    pub position: GeoPosition,
    /// Latest velocity.
    pub velocity: Velocity,
    /// Confidence of the winning classification.
    pub confidence: f64,
    /// Threat label assigned at commit time.
    pub threat_level: ThreatLevel,
    /// Source track ids merged into this one.
    pub merged_from: BTreeSet<String>,
    /// Contributing sensor ids.
    pub sources: BTreeSet<String>,
    /// Monotonic count of contributing detections.
    pub detection_count: u64,
    /// Start of the correlation window.
    pub window_start: DateTime<Utc>,
    /// End of the correlation window.
    pub window_end: DateTime<Utc>,
    /// First observation time.
    pub first_seen: DateTime<Utc>,
    /// Most recent update time.
    pub last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threat_levels_are_ordered() {
        assert!(ThreatLevel::Low < ThreatLevel::Medium);
        assert!(ThreatLevel::Medium < ThreatLevel::High);
        assert!(ThreatLevel::High < ThreatLevel::Critical);
    }

    #[test]
    fn enums_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&Classification::Hostile).unwrap(),
            "\"hostile\""
        );
        assert_eq!(serde_json::to_string(&TrackType::Missile).unwrap(), "\"missile\"");
        assert_eq!(
            serde_json::to_string(&ThreatLevel::Critical).unwrap(),
            "\"critical\""
        );
    }

    #[test]
    fn hints_fall_back_to_unknown() {
        assert_eq!(Classification::from_hint(Some("hostile")), Classification::Hostile);
        assert_eq!(Classification::from_hint(Some("martian")), Classification::Unknown);
        assert_eq!(Classification::from_hint(None), Classification::Unknown);
        assert_eq!(TrackType::from_hint(Some("vessel")), TrackType::Vessel);
        assert_eq!(TrackType::from_hint(None), TrackType::Unknown);
    }

    #[test]
    fn display_matches_subject_tokens() {
        assert_eq!(Classification::Friendly.to_string(), "friendly");
        assert_eq!(TrackType::Ground.to_string(), "ground");
        assert_eq!(ThreatLevel::Medium.to_string(), "medium");
    }
}
