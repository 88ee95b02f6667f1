//! The signed message envelope attached to every bus payload.
//!
//! An envelope carries identity (`message_id`), causality
//! (`correlation_id` / `causation_id`), provenance (`source`,
//! `source_type`), timing, and integrity: `signature` is a hex-encoded
//! HMAC-SHA256 over the serialized message *with the signature field
//! empty*, keyed by the source agent's symmetric key.
//!
//! Causality invariant: the first message of a chain sets
//! `correlation_id = message_id`; every downstream message copies the
//! upstream `correlation_id` and sets its own `causation_id` to the
//! upstream `message_id`.

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::PipelineError;

type HmacSha256 = Hmac<Sha256>;

/// A 32-byte symmetric signing key. The `Debug` implementation is redacted
/// to keep key material out of logs.
#[derive(Clone)]
pub struct SigningKey([u8; 32]);

impl SigningKey {
    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey([REDACTED])")
    }
}

/// Parse a 32-byte signing key from 64 hex characters.
pub fn parse_signing_key(raw: &str) -> Result<SigningKey, PipelineError> {
    let trimmed = raw.trim();
    let bytes = hex::decode(trimmed)
        .map_err(|e| PipelineError::Fatal(format!("invalid signing key hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(PipelineError::Fatal(format!(
            "signing key must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(SigningKey(key))
}

/// Metadata attached to every bus message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Time-sortable unique message identifier (UUIDv7).
    pub message_id: String,

    /// Identifier shared by all messages derived from one originating event.
    pub correlation_id: String,

    /// The immediate parent message's id; empty for chain roots.
    #[serde(default)]
    pub causation_id: String,

    /// Emitting agent id.
    pub source: String,

    /// Emitting agent kind (e.g. `sensor`, `planner`).
    pub source_type: String,

    /// Emission time (UTC).
    pub timestamp: DateTime<Utc>,

    /// Hex-encoded HMAC-SHA256 over the serialized message with this field
    /// empty. Empty when the message is unsigned.
    #[serde(default)]
    pub signature: String,

    /// Version of the policy bundle the source was built against.
    #[serde(default)]
    pub policy_version: String,

    /// Distributed trace id, when one is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Span id within `trace_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

impl Envelope {
    /// Create the root envelope of a new causal chain.
    /// `correlation_id` is set to the fresh `message_id`.
    #[must_use]
    pub fn root(source: impl Into<String>, source_type: impl Into<String>) -> Self {
        let message_id = Uuid::now_v7().to_string();
        Self {
            correlation_id: message_id.clone(),
            message_id,
            causation_id: String::new(),
            source: source.into(),
            source_type: source_type.into(),
            timestamp: Utc::now(),
            signature: String::new(),
            policy_version: String::new(),
            trace_id: None,
            span_id: None,
        }
    }

    /// Create a child envelope downstream of `parent`: the correlation id is
    /// copied forward and `causation_id` records the parent's message id.
    #[must_use]
    pub fn child_of(
        parent: &Envelope,
        source: impl Into<String>,
        source_type: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::now_v7().to_string(),
            correlation_id: parent.correlation_id.clone(),
            causation_id: parent.message_id.clone(),
            source: source.into(),
            source_type: source_type.into(),
            timestamp: Utc::now(),
            signature: String::new(),
            policy_version: parent.policy_version.clone(),
            trace_id: parent.trace_id.clone(),
            span_id: None,
        }
    }

    /// Set the policy bundle version.
    #[must_use]
    pub fn with_policy_version(mut self, version: impl Into<String>) -> Self {
        self.policy_version = version.into();
        self
    }

    /// Whether this envelope starts its causal chain.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.causation_id.is_empty() && self.correlation_id == self.message_id
    }
}

/// A self-describing bus message: the envelope plus a flattened domain body.
///
/// The wire form is a single JSON object whose `envelope` field carries the
/// metadata and whose remaining fields belong to `body`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage<T> {
    /// Message metadata and integrity.
    pub envelope: Envelope,
    /// Domain payload, flattened into the outer object.
    #[serde(flatten)]
    pub body: T,
}

impl<T: Serialize + DeserializeOwned> BusMessage<T> {
    /// Wrap a body in an envelope. The message is unsigned until
    /// [`sign`](Self::sign) is called.
    pub fn new(envelope: Envelope, body: T) -> Self {
        Self { envelope, body }
    }

    /// Compute and store the signature: HMAC-SHA256 over the message
    /// serialized with an empty signature field, hex-encoded.
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), PipelineError> {
        self.envelope.signature = String::new();
        let bytes = self.canonical_bytes()?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| PipelineError::Fatal(format!("invalid MAC key: {e}")))?;
        mac.update(&bytes);
        self.envelope.signature = hex::encode(mac.finalize().into_bytes());
        Ok(())
    }

    /// Verify the stored signature against `key` in constant time.
    ///
    /// Returns `false` for unsigned messages, malformed hex, and MAC
    /// mismatches alike; only a `Decode` error from re-serialization is
    /// surfaced as an error.
    pub fn verify(&self, key: &SigningKey) -> Result<bool, PipelineError> {
        if self.envelope.signature.is_empty() {
            return Ok(false);
        }
        let Ok(claimed) = hex::decode(&self.envelope.signature) else {
            return Ok(false);
        };
        let mut unsigned = Self {
            envelope: self.envelope.clone(),
            body: self.reserialize_body()?,
        };
        unsigned.envelope.signature = String::new();
        let bytes = unsigned.canonical_bytes()?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| PipelineError::Fatal(format!("invalid MAC key: {e}")))?;
        mac.update(&bytes);
        let expected = mac.finalize().into_bytes();
        Ok(expected.ct_eq(claimed.as_slice()).into())
    }

    /// Serialize for publication.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        self.canonical_bytes()
    }

    /// Decode a received message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(bytes).map_err(|e| PipelineError::Decode(e.to_string()))
    }

    fn canonical_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        serde_json::to_vec(self).map_err(|e| PipelineError::Decode(e.to_string()))
    }

    // Round-trips the body through its own serialization so that `verify`
    // operates on exactly the field set that `sign` saw.
    fn reserialize_body(&self) -> Result<T, PipelineError> {
        let v = serde_json::to_value(&self.body).map_err(|e| PipelineError::Decode(e.to_string()))?;
        serde_json::from_value(v).map_err(|e| PipelineError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SigningKey {
        parse_signing_key(&"ab".repeat(32)).unwrap()
    }

    fn other_key() -> SigningKey {
        parse_signing_key(&"cd".repeat(32)).unwrap()
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u64,
        note: String,
    }

    #[test]
    fn root_sets_correlation_to_message_id() {
        let env = Envelope::root("sensor-1", "sensor");
        assert_eq!(env.correlation_id, env.message_id);
        assert!(env.causation_id.is_empty());
        assert!(env.is_root());
    }

    #[test]
    fn child_copies_correlation_and_sets_causation() {
        let root = Envelope::root("sensor-1", "sensor");
        let child = Envelope::child_of(&root, "classifier-1", "classifier");
        assert_eq!(child.correlation_id, root.correlation_id);
        assert_eq!(child.causation_id, root.message_id);
        assert_ne!(child.message_id, root.message_id);
        assert!(!child.is_root());
    }

    #[test]
    fn sign_verify_roundtrip() {
        let key = test_key();
        let mut msg = BusMessage::new(
            Envelope::root("sensor-1", "sensor"),
            Ping {
                seq: 7,
                note: "hello".into(),
            },
        );
        msg.sign(&key).unwrap();
        assert!(!msg.envelope.signature.is_empty());

        let wire = msg.to_bytes().unwrap();
        let back: BusMessage<Ping> = BusMessage::from_bytes(&wire).unwrap();
        assert_eq!(back.body, msg.body);
        assert!(back.verify(&key).unwrap());
    }

    #[test]
    fn verify_fails_with_wrong_key() {
        let mut msg = BusMessage::new(Envelope::root("s", "sensor"), Ping { seq: 1, note: "n".into() });
        msg.sign(&test_key()).unwrap();
        assert!(!msg.verify(&other_key()).unwrap());
    }

    #[test]
    fn verify_fails_after_tamper() {
        let mut msg = BusMessage::new(Envelope::root("s", "sensor"), Ping { seq: 1, note: "n".into() });
        msg.sign(&test_key()).unwrap();
        msg.body.seq = 2;
        assert!(!msg.verify(&test_key()).unwrap());
    }

    #[test]
    fn unsigned_message_does_not_verify() {
        let msg = BusMessage::new(Envelope::root("s", "sensor"), Ping { seq: 1, note: "n".into() });
        assert!(!msg.verify(&test_key()).unwrap());
    }

    #[test]
    fn wire_format_has_outer_envelope_field() {
        let msg = BusMessage::new(Envelope::root("s", "sensor"), Ping { seq: 3, note: "x".into() });
        let v: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert!(v.get("envelope").is_some());
        // Body fields are flattened onto the outer object.
        assert_eq!(v.get("seq").and_then(serde_json::Value::as_u64), Some(3));
    }

    #[test]
    fn parse_signing_key_rejects_bad_input() {
        assert!(parse_signing_key("not-hex").is_err());
        assert!(parse_signing_key("abcd").is_err());
        assert!(parse_signing_key(&"ab".repeat(32)).is_ok());
    }

    #[test]
    fn signing_key_debug_is_redacted() {
        let key = test_key();
        assert_eq!(format!("{key:?}"), "SigningKey([REDACTED])");
    }
}
