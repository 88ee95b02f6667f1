//! Health, Prometheus exposition, and aggregated pipeline metrics.

use std::fmt::Write as _;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::ApiError;

use super::{AppState, CorrelationId, respond};

/// Prometheus text exposition content type.
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// `GET /health` -- component status for the store, bus, and policy engine.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    summary = "Health check",
    responses(
        (status = 200, description = "All components healthy", body = Object),
        (status = 503, description = "A component is down", body = Object),
    )
)]
pub async fn health(State(state): State<AppState>, correlation_id: CorrelationId) -> Response {
    let store_status = match state.store.ping().await {
        Ok(()) => "ok",
        Err(_) => "down",
    };
    let bus_status = if state.bus.is_connected() { "ok" } else { "down" };
    let policy_status = if state.policy.is_some() {
        "configured"
    } else {
        "disabled"
    };

    let healthy = store_status == "ok" && bus_status == "ok";
    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "components": {
            "store": store_status,
            "bus": bus_status,
            "policy": policy_status,
        },
        "correlation_id": correlation_id.0,
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, axum::Json(body)).into_response()
}

/// `GET /api/v1/metrics` -- counters plus stage latency aggregates.
#[utoipa::path(
    get,
    path = "/api/v1/metrics",
    tag = "Metrics",
    summary = "Aggregated pipeline metrics",
    responses((status = 200, description = "Counters and stage latencies", body = Object))
)]
pub async fn pipeline_metrics(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
) -> Response {
    let result = async {
        let counters = state.store.counters().await.map_err(ApiError::from)?;
        let stages = state.store.stage_metrics().await.map_err(ApiError::from)?;
        Ok(json!({ "counters": counters, "stages": stages }))
    }
    .await;
    respond(&correlation_id, result)
}

/// `GET /api/v1/metrics/stages` -- stage latency aggregates only.
#[utoipa::path(
    get,
    path = "/api/v1/metrics/stages",
    tag = "Metrics",
    summary = "Stage latency percentiles",
    responses((status = 200, description = "Latency per stage transition", body = Object))
)]
pub async fn stage_metrics(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
) -> Response {
    let result = async {
        let stages = state.store.stage_metrics().await.map_err(ApiError::from)?;
        Ok(json!({ "stages": stages }))
    }
    .await;
    respond(&correlation_id, result)
}

/// `GET /api/v1/metrics/agents` -- per-agent processing counters.
#[utoipa::path(
    get,
    path = "/api/v1/metrics/agents",
    tag = "Metrics",
    summary = "Per-agent metrics",
    responses((status = 200, description = "Processing counters per stage", body = Object))
)]
pub async fn agent_metrics(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
) -> Response {
    let agents: serde_json::Map<String, serde_json::Value> = state
        .agent_metrics
        .iter()
        .map(|(name, metrics)| {
            let snap = metrics.snapshot();
            (
                (*name).to_owned(),
                json!({
                    "received": snap.received,
                    "acked": snap.acked,
                    "nacked": snap.nacked,
                    "published": snap.published,
                    "decode_errors": snap.decode_errors,
                    "validation_errors": snap.validation_errors,
                    "transient_errors": snap.transient_errors,
                    "conflict_errors": snap.conflict_errors,
                    "avg_latency_ms": snap.avg_latency_ms,
                    "p50_latency_ms": snap.p50_latency_ms,
                    "p95_latency_ms": snap.p95_latency_ms,
                    "p99_latency_ms": snap.p99_latency_ms,
                }),
            )
        })
        .collect();
    respond(
        &correlation_id,
        Ok(json!({ "agents": serde_json::Value::Object(agents) })),
    )
}

/// `GET /metrics` -- Prometheus text exposition of store counters and
/// per-agent processing metrics. Label values are escaped per the format.
#[utoipa::path(
    get,
    path = "/metrics",
    tag = "Health",
    summary = "Prometheus metrics",
    responses((status = 200, description = "Prometheus text format", content_type = "text/plain"))
)]
pub async fn prometheus(State(state): State<AppState>) -> Response {
    let mut buf = String::new();

    if let Ok(counters) = state.store.counters().await {
        writeln!(
            buf,
            "# HELP aegis_counter Named monotonic pipeline counters.\n# TYPE aegis_counter counter"
        )
        .ok();
        let mut names: Vec<&String> = counters.keys().collect();
        names.sort();
        for name in names {
            writeln!(
                buf,
                "aegis_counter{{name=\"{}\"}} {}",
                escape_label(name),
                counters[name]
            )
            .ok();
        }
    }

    writeln!(
        buf,
        "# HELP aegis_agent_messages_total Deliveries processed per agent, by disposition.\n# TYPE aegis_agent_messages_total counter"
    )
    .ok();
    let mut names: Vec<&&str> = state.agent_metrics.keys().collect();
    names.sort();
    for name in &names {
        let snap = state.agent_metrics[**name].snapshot();
        let agent = escape_label(name);
        writeln!(buf, "aegis_agent_messages_total{{agent=\"{agent}\",disposition=\"acked\"}} {}", snap.acked).ok();
        writeln!(buf, "aegis_agent_messages_total{{agent=\"{agent}\",disposition=\"nacked\"}} {}", snap.nacked).ok();
    }

    writeln!(
        buf,
        "# HELP aegis_agent_published_total Messages published per agent.\n# TYPE aegis_agent_published_total counter"
    )
    .ok();
    for name in &names {
        let snap = state.agent_metrics[**name].snapshot();
        writeln!(
            buf,
            "aegis_agent_published_total{{agent=\"{}\"}} {}",
            escape_label(name),
            snap.published
        )
        .ok();
    }

    writeln!(
        buf,
        "# HELP aegis_agent_errors_total Errors per agent, by class.\n# TYPE aegis_agent_errors_total counter"
    )
    .ok();
    for name in &names {
        let snap = state.agent_metrics[**name].snapshot();
        let agent = escape_label(name);
        for (class, value) in [
            ("decode", snap.decode_errors),
            ("validation", snap.validation_errors),
            ("transient", snap.transient_errors),
            ("conflict", snap.conflict_errors),
        ] {
            writeln!(
                buf,
                "aegis_agent_errors_total{{agent=\"{agent}\",class=\"{class}\"}} {value}"
            )
            .ok();
        }
    }

    writeln!(
        buf,
        "# HELP aegis_agent_latency_ms Processing latency percentiles per agent.\n# TYPE aegis_agent_latency_ms gauge"
    )
    .ok();
    for name in &names {
        let snap = state.agent_metrics[**name].snapshot();
        let agent = escape_label(name);
        for (quantile, value) in [
            ("0.5", snap.p50_latency_ms),
            ("0.95", snap.p95_latency_ms),
            ("0.99", snap.p99_latency_ms),
        ] {
            writeln!(
                buf,
                "aegis_agent_latency_ms{{agent=\"{agent}\",quantile=\"{quantile}\"}} {value}"
            )
            .ok();
        }
    }

    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], buf).into_response()
}

/// Escape a Prometheus label value (backslash, double-quote, newline).
fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_escaping() {
        assert_eq!(escape_label("plain"), "plain");
        assert_eq!(escape_label("a\"b"), "a\\\"b");
        assert_eq!(escape_label("a\\b"), "a\\\\b");
        assert_eq!(escape_label("a\nb"), "a\\nb");
    }
}
