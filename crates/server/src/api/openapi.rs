//! OpenAPI document aggregation for the Swagger UI.

use utoipa::OpenApi;

/// The aggregated API document.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Aegis API",
        description = "Decision-support pipeline: tracks, proposals, decisions, effects, intervention rules, and metrics.",
    ),
    paths(
        super::tracks::list_tracks,
        super::tracks::get_track,
        super::tracks::track_history,
        super::proposals::list_proposals,
        super::proposals::get_proposal,
        super::proposals::decide,
        super::decisions::list_decisions,
        super::effects::list_effects,
        super::audit::audit_trail,
        super::rules::list_rules,
        super::rules::create_rule,
        super::rules::get_rule,
        super::rules::update_rule,
        super::rules::delete_rule,
        super::admin::clear,
        super::metrics::health,
        super::metrics::pipeline_metrics,
        super::metrics::stage_metrics,
        super::metrics::agent_metrics,
        super::metrics::prometheus,
    ),
    tags(
        (name = "Tracks", description = "Canonical track queries"),
        (name = "Proposals", description = "Action proposals and the human decision"),
        (name = "Decisions", description = "Decision history"),
        (name = "Effects", description = "Executed effects"),
        (name = "Audit", description = "Flattened audit trail"),
        (name = "Rules", description = "Intervention rule management"),
        (name = "Admin", description = "Operational endpoints"),
        (name = "Metrics", description = "Aggregated pipeline metrics"),
        (name = "Health", description = "Liveness and scrape endpoints"),
    )
)]
pub struct ApiDoc;
