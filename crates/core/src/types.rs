//! Newtype identifiers used across the pipeline.
//!
//! Each id wraps a `String` so that a proposal id can never be passed where
//! a track id is expected. Constructors accept anything `Into<String>`;
//! `new_random()` produces a UUIDv7 so ids sort by creation time.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh time-sortable identifier.
            #[must_use]
            pub fn new_random() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// View the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id! {
    /// External track identifier reported by a sensor. The correlator merges
    /// on this key, so all stages treat it as the identity of the physical
    /// object.
    TrackId
}

string_id! {
    /// Identifier of an action proposal.
    ProposalId
}

string_id! {
    /// Identifier of a decision (human or system) on a proposal.
    DecisionId
}

string_id! {
    /// Identifier of an executed (or attempted) effect.
    EffectId
}

string_id! {
    /// Identifier of an intervention rule row.
    RuleId
}

string_id! {
    /// Identity of a running agent process.
    AgentId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_roundtrip() {
        let id = TrackId::new("T-17");
        assert_eq!(id.as_str(), "T-17");
        assert_eq!(id.to_string(), "T-17");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"T-17\"");
        let back: TrackId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn random_ids_are_distinct_and_sortable() {
        let a = ProposalId::new_random();
        let b = ProposalId::new_random();
        assert_ne!(a, b);
        // UUIDv7 embeds a millisecond timestamp, so later ids compare greater
        // or equal lexicographically.
        assert!(b.as_str() >= a.as_str());
    }
}
