//! The six Aegis pipeline stages.
//!
//! sensor -> classifier -> correlator -> planner -> authorizer -> effector
//!
//! Each consuming stage implements [`aegis_agent::Processor`] and runs on
//! the shared [`aegis_agent::ConsumerLoop`]. The sensor is a producer on a
//! timer. Stages communicate exclusively through the bus; only the
//! authorizer and effector write to the canonical store.

pub mod authorizer;
pub mod classifier;
pub mod correlator;
pub mod effector;
pub mod planner;
pub mod sensor;

pub use authorizer::{Authorizer, AuthorizerConfig, ExpirySweeper};
pub use classifier::Classifier;
pub use correlator::{Correlator, CorrelatorConfig};
pub use effector::Effector;
pub use planner::{Planner, PlannerConfig};
pub use sensor::{Sensor, SensorConfig, WeightTable};
