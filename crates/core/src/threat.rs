//! Threat-level assignment.
//!
//! The assignment is a pure, total function of the fused track state; ties
//! break in rule order (missile before speed before approach). Speed
//! thresholds are configuration, not code.

use crate::detection::{GeoPosition, Velocity};
use crate::track::{Classification, ThreatLevel, TrackType};

/// Tunable thresholds for [`assess_threat`].
#[derive(Debug, Clone, Copy)]
pub struct ThreatConfig {
    /// Ground speed (m/s) above which a hostile track is high threat.
    pub high_speed: f64,
    /// Minimum closing speed (m/s) for a track to count as approaching.
    pub approach_speed: f64,
    /// Reference point approaches are measured against.
    pub defended_position: GeoPosition,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            high_speed: 300.0,
            approach_speed: 50.0,
            defended_position: GeoPosition { lat: 0.0, lon: 0.0, alt: 0.0 },
        }
    }
}

/// Whether a track is closing on the defended position: its heading points
/// within 45 degrees of the bearing to the defended point and its speed
/// exceeds the approach threshold.
#[must_use]
pub fn is_approaching(position: &GeoPosition, velocity: &Velocity, config: &ThreatConfig) -> bool {
    if velocity.speed < config.approach_speed {
        return false;
    }
    let d_lat = config.defended_position.lat - position.lat;
    let d_lon = config.defended_position.lon - position.lon;
    if d_lat == 0.0 && d_lon == 0.0 {
        // Already on top of the defended point.
        return true;
    }
    let bearing = d_lon.atan2(d_lat).to_degrees().rem_euclid(360.0);
    let diff = (velocity.heading - bearing).rem_euclid(360.0);
    diff <= 45.0 || diff >= 315.0
}

/// Assign a threat level to the fused state. Deterministic and total; the
/// first matching rule wins:
///
/// 1. hostile missile -> critical
/// 2. hostile at or above the high-speed threshold -> high
/// 3. unknown and approaching -> medium
/// 4. everything else (including friendly/neutral) -> low
#[must_use]
pub fn assess_threat(
    classification: Classification,
    track_type: TrackType,
    position: &GeoPosition,
    velocity: &Velocity,
    config: &ThreatConfig,
) -> ThreatLevel {
    match classification {
        Classification::Hostile if track_type == TrackType::Missile => ThreatLevel::Critical,
        Classification::Hostile if velocity.speed >= config.high_speed => ThreatLevel::High,
        Classification::Hostile => ThreatLevel::Medium,
        Classification::Unknown if is_approaching(position, velocity, config) => ThreatLevel::Medium,
        _ => ThreatLevel::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ThreatConfig {
        ThreatConfig::default()
    }

    fn at(lat: f64, lon: f64) -> GeoPosition {
        GeoPosition { lat, lon, alt: 1000.0 }
    }

    fn moving(speed: f64, heading: f64) -> Velocity {
        Velocity { speed, heading }
    }

    #[test]
    fn hostile_missile_is_critical_regardless_of_speed() {
        let t = assess_threat(
            Classification::Hostile,
            TrackType::Missile,
            &at(10.0, 10.0),
            &moving(10.0, 0.0),
            &cfg(),
        );
        assert_eq!(t, ThreatLevel::Critical);
    }

    #[test]
    fn fast_hostile_is_high() {
        let t = assess_threat(
            Classification::Hostile,
            TrackType::Aircraft,
            &at(10.0, 10.0),
            &moving(600.0, 0.0),
            &cfg(),
        );
        assert_eq!(t, ThreatLevel::High);
    }

    #[test]
    fn slow_hostile_is_medium() {
        let t = assess_threat(
            Classification::Hostile,
            TrackType::Vessel,
            &at(10.0, 10.0),
            &moving(20.0, 0.0),
            &cfg(),
        );
        assert_eq!(t, ThreatLevel::Medium);
    }

    #[test]
    fn approaching_unknown_is_medium() {
        // South of the defended origin, heading due north (000) at speed.
        let t = assess_threat(
            Classification::Unknown,
            TrackType::Aircraft,
            &at(-5.0, 0.0),
            &moving(200.0, 0.0),
            &cfg(),
        );
        assert_eq!(t, ThreatLevel::Medium);
    }

    #[test]
    fn receding_unknown_is_low() {
        // South of the origin, heading due south (180).
        let t = assess_threat(
            Classification::Unknown,
            TrackType::Aircraft,
            &at(-5.0, 0.0),
            &moving(200.0, 180.0),
            &cfg(),
        );
        assert_eq!(t, ThreatLevel::Low);
    }

    #[test]
    fn friendly_and_neutral_are_low() {
        for c in [Classification::Friendly, Classification::Neutral] {
            let t = assess_threat(c, TrackType::Missile, &at(0.0, 0.0), &moving(900.0, 0.0), &cfg());
            assert_eq!(t, ThreatLevel::Low);
        }
    }

    #[test]
    fn slow_mover_never_counts_as_approaching() {
        assert!(!is_approaching(&at(-5.0, 0.0), &moving(10.0, 0.0), &cfg()));
    }

    #[test]
    fn missile_rule_wins_over_speed_rule() {
        // Both rules match; the missile rule is evaluated first.
        let t = assess_threat(
            Classification::Hostile,
            TrackType::Missile,
            &at(1.0, 1.0),
            &moving(900.0, 0.0),
            &cfg(),
        );
        assert_eq!(t, ThreatLevel::Critical);
    }
}
