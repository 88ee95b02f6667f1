use sqlx::PgPool;

use crate::config::PostgresConfig;

/// Create the required tables and indexes if they do not exist.
pub async fn run_migrations(pool: &PgPool, config: &PostgresConfig) -> Result<(), sqlx::Error> {
    let tracks = config.table("tracks");
    let detections = config.table("detections");
    let proposals = config.table("proposals");
    let decisions = config.table("decisions");
    let effects = config.table("effects");
    let rules = config.table("intervention_rules");
    let counters = config.table("counters");
    let prefix = &config.table_prefix;

    let create_tracks = format!(
        "CREATE TABLE IF NOT EXISTS {tracks} (
            track_id TEXT PRIMARY KEY,
            classification TEXT NOT NULL,
            track_type TEXT NOT NULL,
            lat DOUBLE PRECISION NOT NULL,
            lon DOUBLE PRECISION NOT NULL,
            alt DOUBLE PRECISION NOT NULL,
            speed DOUBLE PRECISION NOT NULL,
            heading DOUBLE PRECISION NOT NULL,
            confidence DOUBLE PRECISION NOT NULL,
            threat_level TEXT NOT NULL,
            merged_from JSONB NOT NULL DEFAULT '[]',
            sources JSONB NOT NULL DEFAULT '[]',
            detection_count BIGINT NOT NULL DEFAULT 0,
            window_start TIMESTAMPTZ NOT NULL,
            window_end TIMESTAMPTZ NOT NULL,
            first_seen TIMESTAMPTZ NOT NULL,
            last_updated TIMESTAMPTZ NOT NULL
        )"
    );

    let create_tracks_updated_idx = format!(
        "CREATE INDEX IF NOT EXISTS {prefix}tracks_last_updated_idx \
         ON {tracks} (last_updated DESC)"
    );

    let create_detections = format!(
        "CREATE TABLE IF NOT EXISTS {detections} (
            id BIGSERIAL PRIMARY KEY,
            track_id TEXT NOT NULL,
            payload JSONB NOT NULL,
            observed_at TIMESTAMPTZ NOT NULL
        )"
    );

    let create_detections_track_idx = format!(
        "CREATE INDEX IF NOT EXISTS {prefix}detections_track_idx \
         ON {detections} (track_id, observed_at DESC)"
    );

    let create_proposals = format!(
        "CREATE TABLE IF NOT EXISTS {proposals} (
            proposal_id TEXT PRIMARY KEY,
            track_id TEXT NOT NULL,
            action_type TEXT NOT NULL,
            priority SMALLINT NOT NULL CHECK (priority BETWEEN 1 AND 10),
            rationale TEXT NOT NULL,
            constraints JSONB NOT NULL DEFAULT '[]',
            classification TEXT NOT NULL,
            threat_level TEXT NOT NULL,
            track_type TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'approved', 'denied', 'expired')),
            expires_at TIMESTAMPTZ NOT NULL,
            policy_decision JSONB NOT NULL DEFAULT '{{}}',
            hit_count BIGINT NOT NULL DEFAULT 0,
            last_hit_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL
        )"
    );

    // The load-bearing partial unique index: at most one pending proposal
    // per track, enforced by the database itself.
    let create_pending_unique = format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {prefix}proposals_pending_track_uniq \
         ON {proposals} (track_id) WHERE status = 'pending'"
    );

    let create_proposals_status_idx = format!(
        "CREATE INDEX IF NOT EXISTS {prefix}proposals_status_idx \
         ON {proposals} (status, expires_at)"
    );

    let create_decisions = format!(
        "CREATE TABLE IF NOT EXISTS {decisions} (
            decision_id TEXT PRIMARY KEY,
            proposal_id TEXT NOT NULL UNIQUE REFERENCES {proposals} (proposal_id),
            track_id TEXT NOT NULL,
            action_type TEXT NOT NULL,
            approved BOOLEAN NOT NULL,
            approved_by TEXT NOT NULL CHECK (approved_by <> ''),
            approved_at TIMESTAMPTZ NOT NULL,
            reason TEXT NOT NULL DEFAULT '',
            conditions JSONB NOT NULL DEFAULT '[]'
        )"
    );

    let create_effects = format!(
        "CREATE TABLE IF NOT EXISTS {effects} (
            effect_id TEXT PRIMARY KEY,
            idempotent_key TEXT NOT NULL UNIQUE,
            decision_id TEXT NOT NULL REFERENCES {decisions} (decision_id),
            proposal_id TEXT NOT NULL,
            track_id TEXT NOT NULL,
            action_type TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'executed', 'failed', 'simulated')),
            executed_at TIMESTAMPTZ,
            result TEXT NOT NULL DEFAULT '',
            created_at TIMESTAMPTZ NOT NULL
        )"
    );

    let create_rules = format!(
        "CREATE TABLE IF NOT EXISTS {rules} (
            rule_id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            action_types JSONB NOT NULL DEFAULT '[]',
            threat_levels JSONB NOT NULL DEFAULT '[]',
            classifications JSONB NOT NULL DEFAULT '[]',
            track_types JSONB NOT NULL DEFAULT '[]',
            min_priority SMALLINT NOT NULL,
            max_priority SMALLINT NOT NULL,
            verdict TEXT NOT NULL CHECK (verdict IN ('requires_approval', 'auto_approve')),
            evaluation_order INTEGER NOT NULL,
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL,
            CHECK (min_priority <= max_priority)
        )"
    );

    let create_counters = format!(
        "CREATE TABLE IF NOT EXISTS {counters} (
            name TEXT PRIMARY KEY,
            value BIGINT NOT NULL DEFAULT 0
        )"
    );

    for ddl in [
        create_tracks,
        create_tracks_updated_idx,
        create_detections,
        create_detections_track_idx,
        create_proposals,
        create_pending_unique,
        create_proposals_status_idx,
        create_decisions,
        create_effects,
        create_rules,
        create_counters,
    ] {
        sqlx::query(&ddl).execute(pool).await?;
    }

    Ok(())
}
