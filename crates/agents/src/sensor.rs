//! The synthetic sensor: emits detections on a timer.
//!
//! Each simulated track follows a simple kinematic model. Emission mix is
//! controlled by two integer weight tables (type hints and classification
//! hints) that always sum to 100; editing one weight proportionally
//! redistributes the others so the invariant holds. Configuration changes
//! take effect on the next tick; `paused` halts emission cleanly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aegis_agent::AgentMetrics;
use aegis_bus::MessageBus;
use aegis_core::{
    BusMessage, Detection, Envelope, GeoPosition, PipelineError, SigningKey, Subject, TrackId,
    Velocity,
};

/// An integer weight table over named categories. Invariant: weights sum
/// to exactly 100.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WeightTable {
    entries: Vec<(String, u8)>,
}

impl WeightTable {
    /// Build a table from `(name, weight)` pairs. Fails unless the weights
    /// sum to 100.
    pub fn new(entries: Vec<(String, u8)>) -> Result<Self, PipelineError> {
        let sum: u32 = entries.iter().map(|(_, w)| u32::from(*w)).sum();
        if sum != 100 {
            return Err(PipelineError::Validation(format!(
                "weights must sum to 100, got {sum}"
            )));
        }
        Ok(Self { entries })
    }

    /// The current weights.
    #[must_use]
    pub fn entries(&self) -> &[(String, u8)] {
        &self.entries
    }

    /// Set one category's weight, proportionally redistributing the rest so
    /// the total stays exactly 100.
    pub fn set_weight(&mut self, name: &str, new_weight: u8) -> Result<(), PipelineError> {
        if new_weight > 100 {
            return Err(PipelineError::Validation(format!(
                "weight {new_weight} exceeds 100"
            )));
        }
        let index = self
            .entries
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| PipelineError::Validation(format!("unknown category {name}")))?;
        if self.entries.len() == 1 && new_weight != 100 {
            return Err(PipelineError::Validation(
                "sole category must keep weight 100".to_owned(),
            ));
        }

        let others_total: u32 = self
            .entries
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(_, (_, w))| u32::from(*w))
            .sum();
        let remaining = 100 - u32::from(new_weight);

        // Scale the other weights to the remaining budget, tracking the
        // fractional remainders so the largest ones absorb the rounding gap.
        // When every other weight is zero there is no ratio to preserve;
        // split the budget evenly instead.
        let other_count = u32::try_from(self.entries.len() - 1).unwrap_or(1);
        let mut scaled: Vec<(usize, u32, u32)> = Vec::new();
        let mut allocated = 0u32;
        for (i, (_, w)) in self.entries.iter().enumerate() {
            if i == index {
                continue;
            }
            let (share, frac) = if others_total == 0 {
                if other_count == 0 {
                    (0, 0)
                } else {
                    (remaining / other_count, 0)
                }
            } else {
                let numerator = u32::from(*w) * remaining;
                (numerator / others_total, numerator % others_total)
            };
            allocated += share;
            scaled.push((i, share, frac));
        }

        // The floor division leaves at most one unit per entry unallocated.
        let mut shortfall = remaining - allocated;
        scaled.sort_by(|a, b| b.2.cmp(&a.2).then(a.0.cmp(&b.0)));
        for entry in &mut scaled {
            if shortfall == 0 {
                break;
            }
            entry.1 += 1;
            shortfall -= 1;
        }

        #[allow(clippy::cast_possible_truncation)]
        for (i, share, _) in scaled {
            self.entries[i].1 = share as u8;
        }
        self.entries[index].1 = new_weight;

        debug_assert_eq!(
            self.entries.iter().map(|(_, w)| u32::from(*w)).sum::<u32>(),
            100
        );
        Ok(())
    }

    /// Sample a category name in proportion to the weights.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> &str {
        let roll = rng.gen_range(0u32..100);
        let mut cumulative = 0u32;
        for (name, weight) in &self.entries {
            cumulative += u32::from(*weight);
            if roll < cumulative {
                return name;
            }
        }
        // Unreachable while the sum invariant holds; fall back to the last
        // entry rather than panicking.
        self.entries.last().map_or("", |(n, _)| n.as_str())
    }
}

/// Runtime configuration of the sensor. Changes apply on the next tick.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Milliseconds between emission ticks.
    pub emission_interval: Duration,
    /// Number of simulated tracks.
    pub track_count: usize,
    /// Weight table for platform-type hints.
    pub type_weights: WeightTable,
    /// Weight table for classification hints.
    pub classification_weights: WeightTable,
    /// When set, ticks pass without emitting.
    pub paused: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            emission_interval: Duration::from_millis(1000),
            track_count: 10,
            type_weights: WeightTable::new(vec![
                ("aircraft".into(), 50),
                ("vessel".into(), 20),
                ("ground".into(), 20),
                ("missile".into(), 10),
            ])
            .expect("default weights sum to 100"),
            classification_weights: WeightTable::new(vec![
                ("friendly".into(), 30),
                ("neutral".into(), 30),
                ("unknown".into(), 25),
                ("hostile".into(), 15),
            ])
            .expect("default weights sum to 100"),
            paused: false,
        }
    }
}

struct SimTrack {
    track_id: TrackId,
    type_hint: String,
    classification_hint: String,
    position: GeoPosition,
    velocity: Velocity,
}

impl SimTrack {
    /// Advance the kinematic model by `dt` seconds: constant speed along
    /// the heading with a little wander.
    fn step<R: Rng>(&mut self, dt: f64, rng: &mut R) {
        // Degrees of latitude per meter; longitude scaled by cos(lat).
        const DEG_PER_METER: f64 = 1.0 / 111_111.0;
        let heading_rad = self.velocity.heading.to_radians();
        let distance = self.velocity.speed * dt;
        self.position.lat += distance * heading_rad.cos() * DEG_PER_METER;
        self.position.lon +=
            distance * heading_rad.sin() * DEG_PER_METER / self.position.lat.to_radians().cos().max(0.01);
        self.velocity.heading =
            (self.velocity.heading + rng.gen_range(-3.0..3.0)).rem_euclid(360.0);
    }
}

/// The sensor agent: a producer loop over simulated tracks.
pub struct Sensor {
    sensor_id: String,
    sensor_type: String,
    bus: Arc<dyn MessageBus>,
    key: Option<SigningKey>,
    config: Arc<RwLock<SensorConfig>>,
    metrics: Arc<AgentMetrics>,
    shutdown: CancellationToken,
}

impl Sensor {
    /// Create a sensor publishing to `detect.<sensor_id>.<sensor_type>`.
    pub fn new(
        sensor_id: impl Into<String>,
        sensor_type: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        key: Option<SigningKey>,
        config: Arc<RwLock<SensorConfig>>,
        metrics: Arc<AgentMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            sensor_type: sensor_type.into(),
            bus,
            key,
            config,
            metrics,
            shutdown,
        }
    }

    /// Run the emission loop until cancelled.
    pub async fn run(&self) {
        // The task holds the generator across await points, so it must be
        // Send; thread-local generators are not.
        let mut rng = StdRng::from_entropy();
        let mut tracks: Vec<SimTrack> = Vec::new();
        info!(sensor_id = %self.sensor_id, "sensor started");

        loop {
            let (interval, paused) = {
                let config = self.config.read();
                (config.emission_interval, config.paused)
            };

            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!(sensor_id = %self.sensor_id, "sensor stopped");
                    return;
                }
                () = tokio::time::sleep(interval) => {}
            }

            if paused {
                continue;
            }

            self.resize_fleet(&mut tracks, &mut rng);
            #[allow(clippy::cast_precision_loss)]
            let dt = interval.as_millis() as f64 / 1000.0;
            for track in &mut tracks {
                track.step(dt, &mut rng);
                if let Err(e) = self.emit(track, &mut rng).await {
                    warn!(sensor_id = %self.sensor_id, error = %e, "detection emit failed");
                }
            }
        }
    }

    fn resize_fleet<R: Rng>(&self, tracks: &mut Vec<SimTrack>, rng: &mut R) {
        let config = self.config.read();
        while tracks.len() < config.track_count {
            let n = tracks.len();
            let type_hint = config.type_weights.sample(rng).to_owned();
            let classification_hint = config.classification_weights.sample(rng).to_owned();
            let speed = match type_hint.as_str() {
                "missile" => rng.gen_range(400.0..900.0),
                "aircraft" => rng.gen_range(100.0..400.0),
                "vessel" => rng.gen_range(2.0..20.0),
                _ => rng.gen_range(1.0..30.0),
            };
            tracks.push(SimTrack {
                track_id: TrackId::new(format!("{}-T{n:03}", self.sensor_id)),
                type_hint,
                classification_hint,
                position: GeoPosition {
                    lat: rng.gen_range(-10.0..10.0),
                    lon: rng.gen_range(-10.0..10.0),
                    alt: rng.gen_range(0.0..12_000.0),
                },
                velocity: Velocity {
                    speed,
                    heading: rng.gen_range(0.0..360.0),
                },
            });
        }
        tracks.truncate(config.track_count);
    }

    async fn emit<R: Rng>(&self, track: &SimTrack, rng: &mut R) -> Result<(), PipelineError> {
        let detection = Detection {
            track_id: track.track_id.clone(),
            type_hint: Some(track.type_hint.clone()),
            classification_hint: Some(track.classification_hint.clone()),
            position: track.position,
            velocity: track.velocity,
            confidence: rng.gen_range(0.5..1.0),
            sensor_id: self.sensor_id.clone(),
            sensor_type: self.sensor_type.clone(),
            observed_at: Utc::now(),
        };

        let envelope = Envelope::root(&self.sensor_id, "sensor");
        let mut message = BusMessage::new(envelope, detection);
        if let Some(ref key) = self.key {
            message.sign(key)?;
        }

        let subject = Subject::detect(&self.sensor_id, &self.sensor_type);
        self.bus
            .publish(&subject, message.to_bytes()?)
            .await
            .map_err(|e| PipelineError::Transient(e.to_string()))?;
        self.metrics.record_published();
        debug!(track_id = %message.body.track_id, subject = %subject, "detection emitted");
        Ok(())
    }
}
