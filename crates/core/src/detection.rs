use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TrackId;

/// Geodetic position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    /// Latitude in degrees, positive north.
    pub lat: f64,
    /// Longitude in degrees, positive east.
    pub lon: f64,
    /// Altitude in meters above sea level.
    pub alt: f64,
}

/// Speed and direction of travel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    /// Ground speed in meters per second.
    pub speed: f64,
    /// Heading in degrees clockwise from true north, in `[0, 360)`.
    pub heading: f64,
}

/// A raw sensor detection as emitted on `detect.<sensor_id>.<sensor_type>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// External track id reported by the sensor.
    pub track_id: TrackId,

    /// Optional platform-type hint (e.g. `aircraft`, `missile`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<String>,

    /// Optional classification hint (e.g. `hostile`, `friendly`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_hint: Option<String>,

    /// Observed position.
    pub position: GeoPosition,

    /// Observed velocity.
    pub velocity: Velocity,

    /// Sensor confidence in `[0, 1]`.
    pub confidence: f64,

    /// Reporting sensor id.
    pub sensor_id: String,

    /// Reporting sensor type (e.g. `radar`, `eo`).
    pub sensor_type: String,

    /// Observation time.
    pub observed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_serde_roundtrip() {
        let d = Detection {
            track_id: TrackId::new("T1"),
            type_hint: Some("missile".into()),
            classification_hint: Some("hostile".into()),
            position: GeoPosition { lat: 10.0, lon: 20.0, alt: 1000.0 },
            velocity: Velocity { speed: 600.0, heading: 90.0 },
            confidence: 0.9,
            sensor_id: "s1".into(),
            sensor_type: "radar".into(),
            observed_at: Utc::now(),
        };
        let json = serde_json::to_string(&d).unwrap();
        let back: Detection = serde_json::from_str(&json).unwrap();
        assert_eq!(back.track_id, d.track_id);
        assert_eq!(back.position, d.position);
        assert_eq!(back.velocity, d.velocity);
    }

    #[test]
    fn hints_are_optional_on_the_wire() {
        let json = r#"{
            "track_id": "T2",
            "position": {"lat": 0.0, "lon": 0.0, "alt": 0.0},
            "velocity": {"speed": 100.0, "heading": 180.0},
            "confidence": 0.5,
            "sensor_id": "s1",
            "sensor_type": "radar",
            "observed_at": "2026-01-01T00:00:00Z"
        }"#;
        let d: Detection = serde_json::from_str(json).unwrap();
        assert!(d.type_hint.is_none());
        assert!(d.classification_hint.is_none());
    }
}
