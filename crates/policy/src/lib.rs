//! Thin synchronous client for the declarative policy engine.
//!
//! Each policy path (`proposals`, `effects`) is queried with a structured
//! input and answers `{allowed, reasons[], warnings[], metadata}`. Rule
//! authors return the allow flag under several names in the wild
//! (`allow`, `allowed`, `allow_effect`, or nested `decision.allowed`,
//! with or without an OPA-style `result` wrapper), so decision parsing is
//! tolerant of all of them. Transport failures are a distinct error from a
//! policy denial; the caller decides fail-open vs fail-closed.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the policy client. `Transport` means the engine could not be
/// reached or answered malformed content -- it is *not* a denial.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Client construction failed.
    #[error("policy client configuration: {0}")]
    Configuration(String),

    /// The engine was unreachable or timed out.
    #[error("policy engine unreachable: {0}")]
    Transport(String),

    /// The engine answered with a non-success HTTP status.
    #[error("policy engine returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body (possibly truncated).
        body: String,
    },

    /// The response body could not be interpreted as a decision.
    #[error("unparseable policy response: {0}")]
    Parse(String),
}

/// A policy evaluation result.
#[derive(Debug, Clone, Default)]
pub struct PolicyDecision {
    /// Whether the action is allowed.
    pub allowed: bool,
    /// Reasons accompanying a denial.
    pub reasons: Vec<String>,
    /// Non-blocking warnings.
    pub warnings: Vec<String>,
    /// Any additional fields the policy returned.
    pub metadata: HashMap<String, serde_json::Value>,
}

/// HTTP client for the policy engine.
#[derive(Debug, Clone)]
pub struct PolicyClient {
    client: reqwest::Client,
    base_url: String,
}

impl PolicyClient {
    /// Create a client against `base_url` (e.g. `http://localhost:8181`)
    /// with the default 5 s timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self, PolicyError> {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Create a client with an explicit timeout.
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PolicyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PolicyError::Configuration(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    /// Evaluate the policy at `path` (e.g. `aegis/proposals`) against
    /// `input`.
    pub async fn evaluate<T: Serialize + Sync>(
        &self,
        path: &str,
        input: &T,
    ) -> Result<PolicyDecision, PolicyError> {
        let url = format!("{}/v1/data/{}", self.base_url, path.trim_matches('/'));
        debug!(%url, "querying policy engine");

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await
            .map_err(|e| PolicyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PolicyError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PolicyError::Parse(e.to_string()))?;
        parse_decision(&body)
    }
}

/// Interpret an engine response as a [`PolicyDecision`].
///
/// Unwraps an optional `result` envelope, then accepts the allow flag as
/// `allow`, `allowed`, `allow_effect`, or `decision.allowed`. An empty
/// `result` (undefined policy) is a denial with an explanatory reason.
pub fn parse_decision(body: &serde_json::Value) -> Result<PolicyDecision, PolicyError> {
    let doc = body.get("result").unwrap_or(body);

    if doc.is_null() {
        return Ok(PolicyDecision {
            allowed: false,
            reasons: vec!["policy result undefined".to_owned()],
            ..PolicyDecision::default()
        });
    }

    // A bare boolean result is the simplest rule shape.
    if let Some(b) = doc.as_bool() {
        return Ok(PolicyDecision {
            allowed: b,
            ..PolicyDecision::default()
        });
    }

    let obj = doc
        .as_object()
        .ok_or_else(|| PolicyError::Parse(format!("expected object, got {doc}")))?;

    let allowed = ["allow", "allowed", "allow_effect"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(serde_json::Value::as_bool))
        .or_else(|| {
            obj.get("decision")
                .and_then(|d| d.get("allowed"))
                .and_then(serde_json::Value::as_bool)
        })
        .ok_or_else(|| PolicyError::Parse("no allow flag in policy response".to_owned()))?;

    let strings = |key: &str| -> Vec<String> {
        obj.get(key)
            .and_then(serde_json::Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    };

    let known = ["allow", "allowed", "allow_effect", "decision", "reasons", "warnings"];
    let metadata = obj
        .iter()
        .filter(|(k, _)| !known.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    Ok(PolicyDecision {
        allowed,
        reasons: strings("reasons"),
        warnings: strings("warnings"),
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_allow_variants() {
        for key in ["allow", "allowed", "allow_effect"] {
            let d = parse_decision(&json!({ key: true })).unwrap();
            assert!(d.allowed, "key {key}");
            let d = parse_decision(&json!({ key: false })).unwrap();
            assert!(!d.allowed, "key {key}");
        }
    }

    #[test]
    fn parses_nested_decision_allowed() {
        let d = parse_decision(&json!({"decision": {"allowed": true}})).unwrap();
        assert!(d.allowed);
    }

    #[test]
    fn unwraps_result_envelope() {
        let d = parse_decision(&json!({"result": {"allow": false, "reasons": ["priority too low"]}}))
            .unwrap();
        assert!(!d.allowed);
        assert_eq!(d.reasons, vec!["priority too low"]);
    }

    #[test]
    fn bare_boolean_result() {
        let d = parse_decision(&json!({"result": true})).unwrap();
        assert!(d.allowed);
    }

    #[test]
    fn undefined_result_is_a_denial() {
        let d = parse_decision(&json!({"result": null})).unwrap();
        assert!(!d.allowed);
        assert_eq!(d.reasons, vec!["policy result undefined"]);
    }

    #[test]
    fn reasons_warnings_and_metadata() {
        let d = parse_decision(&json!({
            "allowed": false,
            "reasons": ["r1", "r2"],
            "warnings": ["w1"],
            "rule_version": "v3"
        }))
        .unwrap();
        assert_eq!(d.reasons, vec!["r1", "r2"]);
        assert_eq!(d.warnings, vec!["w1"]);
        assert_eq!(d.metadata.get("rule_version"), Some(&json!("v3")));
        assert!(!d.metadata.contains_key("reasons"));
    }

    #[test]
    fn missing_allow_flag_is_a_parse_error() {
        let err = parse_decision(&json!({"verdict": "yes"})).unwrap_err();
        assert!(matches!(err, PolicyError::Parse(_)));
    }

    #[test]
    fn non_object_is_a_parse_error() {
        let err = parse_decision(&json!(42)).unwrap_err();
        assert!(matches!(err, PolicyError::Parse(_)));
    }

    #[tokio::test]
    async fn unreachable_engine_is_a_transport_error() {
        // Port 9 is the discard service; nothing is listening in CI.
        let client =
            PolicyClient::with_timeout("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let err = client
            .evaluate("aegis/proposals", &json!({"x": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Transport(_)));
    }
}
