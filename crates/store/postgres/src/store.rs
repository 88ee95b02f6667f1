use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Row};

use aegis_core::{
    ActionProposal, CorrelatedTrack, Decision, Detection, EffectRecord, EffectStatus,
    InterventionRule, ProposalId, ProposalStatus, RuleId, TrackId,
};
use aegis_store::{
    ActiveTrack, AuditEntry, CanonicalStore, ClearCounts, DecisionQuery, EffectInsert,
    EffectQuery, ProposalInsert, ProposalQuery, StageLatency, StoreError, TrackQuery,
};

use crate::config::PostgresConfig;
use crate::migrations;
use crate::rows::{
    DecisionRow, DetectionRow, EffectRow, ProposalRow, RuleRow, TrackRow, to_json,
};

/// PostgreSQL-backed [`CanonicalStore`] using `sqlx::PgPool`.
pub struct PostgresStore {
    pool: PgPool,
    config: PostgresConfig,
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[allow(clippy::cast_possible_wrap)]
fn as_i64(n: usize) -> i64 {
    n as i64
}

impl PostgresStore {
    /// Connect, create the pool, and run migrations.
    pub async fn new(config: PostgresConfig) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Self::from_pool(pool, config).await
    }

    /// Build a store over an existing pool (shared across backends in
    /// tests). Runs migrations.
    pub async fn from_pool(pool: PgPool, config: PostgresConfig) -> Result<Self, StoreError> {
        migrations::run_migrations(&pool, &config).await.map_err(backend)?;
        Ok(Self { pool, config })
    }

    fn table(&self, name: &str) -> String {
        self.config.table(name)
    }

    async fn fetch_proposal(
        &self,
        id: &ProposalId,
    ) -> Result<Option<ActionProposal>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE proposal_id = $1",
            self.table("proposals")
        );
        let row: Option<ProposalRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn stage_latency(
        &self,
        stage: &str,
        sample_sql: &str,
    ) -> Result<StageLatency, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS count,
                    COALESCE(AVG(ms), 0)::double precision AS avg_ms,
                    COALESCE(percentile_cont(0.5) WITHIN GROUP (ORDER BY ms), 0)::double precision AS p50_ms,
                    COALESCE(percentile_cont(0.95) WITHIN GROUP (ORDER BY ms), 0)::double precision AS p95_ms,
                    COALESCE(percentile_cont(0.99) WITHIN GROUP (ORDER BY ms), 0)::double precision AS p99_ms
             FROM ({sample_sql}) samples"
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await.map_err(backend)?;
        Ok(StageLatency {
            stage: stage.to_owned(),
            count: u64::try_from(row.try_get::<i64, _>("count").map_err(backend)?)
                .unwrap_or_default(),
            avg_ms: row.try_get("avg_ms").map_err(backend)?,
            p50_ms: row.try_get("p50_ms").map_err(backend)?,
            p95_ms: row.try_get("p95_ms").map_err(backend)?,
            p99_ms: row.try_get("p99_ms").map_err(backend)?,
        })
    }
}

#[async_trait]
impl CanonicalStore for PostgresStore {
    async fn upsert_track(&self, track: &CorrelatedTrack) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {t} (
                track_id, classification, track_type, lat, lon, alt, speed, heading,
                confidence, threat_level, merged_from, sources, detection_count,
                window_start, window_end, first_seen, last_updated
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (track_id) DO UPDATE SET
                classification = EXCLUDED.classification,
                track_type = EXCLUDED.track_type,
                lat = EXCLUDED.lat, lon = EXCLUDED.lon, alt = EXCLUDED.alt,
                speed = EXCLUDED.speed, heading = EXCLUDED.heading,
                confidence = EXCLUDED.confidence,
                threat_level = EXCLUDED.threat_level,
                merged_from = EXCLUDED.merged_from,
                sources = EXCLUDED.sources,
                detection_count = GREATEST({t}.detection_count, EXCLUDED.detection_count),
                window_start = EXCLUDED.window_start,
                window_end = EXCLUDED.window_end,
                first_seen = LEAST({t}.first_seen, EXCLUDED.first_seen),
                last_updated = EXCLUDED.last_updated",
            t = self.table("tracks")
        );

        sqlx::query(&sql)
            .bind(track.track_id.as_str())
            .bind(track.classification.to_string())
            .bind(track.track_type.to_string())
            .bind(track.position.lat)
            .bind(track.position.lon)
            .bind(track.position.alt)
            .bind(track.velocity.speed)
            .bind(track.velocity.heading)
            .bind(track.confidence)
            .bind(track.threat_level.to_string())
            .bind(to_json(&track.merged_from)?)
            .bind(to_json(&track.sources)?)
            .bind(i64::try_from(track.detection_count).unwrap_or(i64::MAX))
            .bind(track.window_start)
            .bind(track.window_end)
            .bind(track.first_seen)
            .bind(track.last_updated)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get_track(&self, id: &TrackId) -> Result<Option<CorrelatedTrack>, StoreError> {
        let sql = format!("SELECT * FROM {} WHERE track_id = $1", self.table("tracks"));
        let row: Option<TrackRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_tracks(&self, query: &TrackQuery) -> Result<Vec<CorrelatedTrack>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT * FROM {} WHERE TRUE", self.table("tracks")));
        if let Some(c) = query.classification {
            qb.push(" AND classification = ").push_bind(c.to_string());
        }
        if let Some(l) = query.threat_level {
            qb.push(" AND threat_level = ").push_bind(l.to_string());
        }
        if let Some(t) = query.track_type {
            qb.push(" AND track_type = ").push_bind(t.to_string());
        }
        if let Some(since) = query.since {
            qb.push(" AND last_updated >= ").push_bind(since);
        }
        qb.push(" ORDER BY last_updated DESC LIMIT ")
            .push_bind(as_i64(query.limit))
            .push(" OFFSET ")
            .push_bind(as_i64(query.offset));

        let rows: Vec<TrackRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn active_tracks(&self, since: DateTime<Utc>) -> Result<Vec<ActiveTrack>, StoreError> {
        let sql = format!(
            "SELECT t.*, COALESCE(p.pending, 0) AS pending_proposals
             FROM {tracks} t
             LEFT JOIN (
                 SELECT track_id, COUNT(*) AS pending
                 FROM {proposals}
                 WHERE status = 'pending'
                 GROUP BY track_id
             ) p USING (track_id)
             WHERE t.last_updated >= $1
             ORDER BY t.last_updated DESC",
            tracks = self.table("tracks"),
            proposals = self.table("proposals"),
        );

        let rows = sqlx::query(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let pending: i64 = row.try_get("pending_proposals").map_err(backend)?;
                let track_row = TrackRow::from_row(&row).map_err(backend)?;
                Ok(ActiveTrack {
                    track: track_row.try_into()?,
                    pending_proposals: u64::try_from(pending).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn prune_tracks(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {} WHERE last_updated < $1", self.table("tracks"));
        let result = sqlx::query(&sql)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn insert_detection(&self, detection: &Detection) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (track_id, payload, observed_at) VALUES ($1, $2, $3)",
            self.table("detections")
        );
        sqlx::query(&sql)
            .bind(detection.track_id.as_str())
            .bind(to_json(detection)?)
            .bind(detection.observed_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn track_history(
        &self,
        id: &TrackId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Detection>, StoreError> {
        let sql = format!(
            "SELECT payload FROM {} WHERE track_id = $1 \
             ORDER BY observed_at DESC LIMIT $2 OFFSET $3",
            self.table("detections")
        );
        let rows: Vec<DetectionRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .bind(as_i64(limit))
            .bind(as_i64(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_proposal(
        &self,
        proposal: &ActionProposal,
    ) -> Result<ProposalInsert, StoreError> {
        // The partial unique index rejects a second pending row per track;
        // ON CONFLICT DO NOTHING turns that into rows_affected = 0.
        let insert = format!(
            "INSERT INTO {} (
                proposal_id, track_id, action_type, priority, rationale, constraints,
                classification, threat_level, track_type, status, expires_at,
                policy_decision, hit_count, last_hit_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10, $11, $12, $13, $14)
            ON CONFLICT (track_id) WHERE status = 'pending' DO NOTHING",
            self.table("proposals")
        );

        let result = sqlx::query(&insert)
            .bind(proposal.proposal_id.as_str())
            .bind(proposal.track_id.as_str())
            .bind(proposal.action_type.to_string())
            .bind(i16::from(proposal.priority))
            .bind(&proposal.rationale)
            .bind(to_json(&proposal.constraints)?)
            .bind(proposal.classification.to_string())
            .bind(proposal.threat_level.to_string())
            .bind(proposal.track_type.to_string())
            .bind(proposal.expires_at)
            .bind(to_json(&proposal.policy_decision)?)
            .bind(i64::try_from(proposal.hit_count).unwrap_or_default())
            .bind(proposal.last_hit_at)
            .bind(proposal.created_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() > 0 {
            return Ok(ProposalInsert::Inserted);
        }

        let bump = format!(
            "UPDATE {} SET hit_count = hit_count + 1, last_hit_at = NOW() \
             WHERE track_id = $1 AND status = 'pending' RETURNING *",
            self.table("proposals")
        );
        let row: Option<ProposalRow> = sqlx::query_as(&bump)
            .bind(proposal.track_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(existing) => Ok(ProposalInsert::DuplicatePending(existing.try_into()?)),
            // The pending row vanished between insert and bump (decided or
            // expired concurrently); retry the insert once.
            None => Err(StoreError::Conflict(format!(
                "pending proposal for track {} was decided concurrently",
                proposal.track_id
            ))),
        }
    }

    async fn get_proposal(&self, id: &ProposalId) -> Result<Option<ActionProposal>, StoreError> {
        self.fetch_proposal(id).await
    }

    async fn list_proposals(
        &self,
        query: &ProposalQuery,
    ) -> Result<Vec<ActionProposal>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT * FROM {} WHERE TRUE", self.table("proposals")));
        if let Some(s) = query.status {
            qb.push(" AND status = ").push_bind(s.to_string());
        }
        if let Some(ref t) = query.track_id {
            qb.push(" AND track_id = ").push_bind(t.as_str().to_owned());
        }
        if let Some(a) = query.action_type {
            qb.push(" AND action_type = ").push_bind(a.to_string());
        }
        if let Some(l) = query.threat_level {
            qb.push(" AND threat_level = ").push_bind(l.to_string());
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(as_i64(query.limit))
            .push(" OFFSET ")
            .push_bind(as_i64(query.offset));

        let rows: Vec<ProposalRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn pending_queue(&self, now: DateTime<Utc>) -> Result<Vec<ActionProposal>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE status = 'pending' AND expires_at > $1 \
             ORDER BY priority DESC, created_at ASC",
            self.table("proposals")
        );
        let rows: Vec<ProposalRow> = sqlx::query_as(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn transition_proposal(
        &self,
        id: &ProposalId,
        to: ProposalStatus,
    ) -> Result<ActionProposal, StoreError> {
        if to == ProposalStatus::Pending {
            return Err(StoreError::Conflict("cannot transition into pending".to_owned()));
        }
        let sql = format!(
            "UPDATE {} SET status = $2 WHERE proposal_id = $1 AND status = 'pending' RETURNING *",
            self.table("proposals")
        );
        let row: Option<ProposalRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .bind(to.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        if let Some(row) = row {
            return row.try_into();
        }
        match self.fetch_proposal(id).await? {
            Some(existing) => Err(StoreError::Conflict(format!(
                "proposal {id} is {} and cannot become {to}",
                existing.status
            ))),
            None => Err(StoreError::NotFound(format!("proposal {id}"))),
        }
    }

    async fn expire_due_proposals(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ActionProposal>, StoreError> {
        let sql = format!(
            "UPDATE {} SET status = 'expired' \
             WHERE status = 'pending' AND expires_at <= $1 RETURNING *",
            self.table("proposals")
        );
        let rows: Vec<ProposalRow> = sqlx::query_as(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (
                decision_id, proposal_id, track_id, action_type, approved,
                approved_by, approved_at, reason, conditions
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.table("decisions")
        );
        let result = sqlx::query(&sql)
            .bind(decision.decision_id.as_str())
            .bind(decision.proposal_id.as_str())
            .bind(decision.track_id.as_str())
            .bind(decision.action_type.to_string())
            .bind(decision.approved)
            .bind(&decision.approved_by)
            .bind(decision.approved_at)
            .bind(&decision.reason)
            .bind(to_json(&decision.conditions)?)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Conflict(format!(
                    "proposal {} already has a decision",
                    decision.proposal_id
                )))
            }
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => Err(
                StoreError::NotFound(format!("proposal {}", decision.proposal_id)),
            ),
            Err(e) => Err(backend(e)),
        }
    }

    async fn list_decisions(&self, query: &DecisionQuery) -> Result<Vec<Decision>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT * FROM {} WHERE TRUE", self.table("decisions")));
        if let Some(approved) = query.approved {
            qb.push(" AND approved = ").push_bind(approved);
        }
        if let Some(ref t) = query.track_id {
            qb.push(" AND track_id = ").push_bind(t.as_str().to_owned());
        }
        if let Some(a) = query.action_type {
            qb.push(" AND action_type = ").push_bind(a.to_string());
        }
        if let Some(since) = query.since {
            qb.push(" AND approved_at >= ").push_bind(since);
        }
        qb.push(" ORDER BY approved_at DESC LIMIT ")
            .push_bind(as_i64(query.limit))
            .push(" OFFSET ")
            .push_bind(as_i64(query.offset));

        let rows: Vec<DecisionRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_effect(&self, effect: &EffectRecord) -> Result<EffectInsert, StoreError> {
        let sql = format!(
            "INSERT INTO {} (
                effect_id, idempotent_key, decision_id, proposal_id, track_id,
                action_type, status, executed_at, result, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (idempotent_key) DO NOTHING",
            self.table("effects")
        );
        let result = sqlx::query(&sql)
            .bind(effect.effect_id.as_str())
            .bind(&effect.idempotent_key)
            .bind(effect.decision_id.as_str())
            .bind(effect.proposal_id.as_str())
            .bind(effect.track_id.as_str())
            .bind(effect.action_type.to_string())
            .bind(effect.status.to_string())
            .bind(effect.executed_at)
            .bind(&effect.result)
            .bind(effect.created_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() > 0 {
            return Ok(EffectInsert::Inserted);
        }
        match self.get_effect_by_key(&effect.idempotent_key).await? {
            Some(existing) => Ok(EffectInsert::Replay(existing)),
            None => Err(StoreError::Backend(
                "effect insert conflicted but no row found".to_owned(),
            )),
        }
    }

    async fn transition_effect(
        &self,
        idempotent_key: &str,
        to: EffectStatus,
        executed_at: DateTime<Utc>,
        result: &str,
    ) -> Result<EffectRecord, StoreError> {
        if to == EffectStatus::Pending {
            return Err(StoreError::Conflict("cannot transition into pending".to_owned()));
        }
        let sql = format!(
            "UPDATE {} SET status = $2, executed_at = $3, result = $4 \
             WHERE idempotent_key = $1 AND status = 'pending' RETURNING *",
            self.table("effects")
        );
        let row: Option<EffectRow> = sqlx::query_as(&sql)
            .bind(idempotent_key)
            .bind(to.to_string())
            .bind(executed_at)
            .bind(result)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        if let Some(row) = row {
            return row.try_into();
        }
        match self.get_effect_by_key(idempotent_key).await? {
            Some(existing) => Err(StoreError::Conflict(format!(
                "effect {} is {} and cannot become {to}",
                existing.effect_id, existing.status
            ))),
            None => Err(StoreError::NotFound(format!("effect key {idempotent_key}"))),
        }
    }

    async fn get_effect_by_key(
        &self,
        idempotent_key: &str,
    ) -> Result<Option<EffectRecord>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE idempotent_key = $1",
            self.table("effects")
        );
        let row: Option<EffectRow> = sqlx::query_as(&sql)
            .bind(idempotent_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_effects(&self, query: &EffectQuery) -> Result<Vec<EffectRecord>, StoreError> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT * FROM {} WHERE TRUE", self.table("effects")));
        if let Some(s) = query.status {
            qb.push(" AND status = ").push_bind(s.to_string());
        }
        if let Some(ref t) = query.track_id {
            qb.push(" AND track_id = ").push_bind(t.as_str().to_owned());
        }
        if let Some(a) = query.action_type {
            qb.push(" AND action_type = ").push_bind(a.to_string());
        }
        if let Some(since) = query.since {
            qb.push(" AND created_at >= ").push_bind(since);
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(as_i64(query.limit))
            .push(" OFFSET ")
            .push_bind(as_i64(query.offset));

        let rows: Vec<EffectRow> = qb
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn audit_trail(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        // Three aligned fetches beat one wide row-splitting join here: the
        // row adapters stay reusable and the page is small.
        let sql = format!(
            "SELECT * FROM {} ORDER BY created_at DESC LIMIT $1 OFFSET $2",
            self.table("proposals")
        );
        let proposal_rows: Vec<ProposalRow> = sqlx::query_as(&sql)
            .bind(as_i64(limit))
            .bind(as_i64(offset))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        let mut entries = Vec::with_capacity(proposal_rows.len());
        for row in proposal_rows {
            let proposal: ActionProposal = row.try_into()?;

            let decision_sql = format!(
                "SELECT * FROM {} WHERE proposal_id = $1",
                self.table("decisions")
            );
            let decision: Option<Decision> = sqlx::query_as::<_, DecisionRow>(&decision_sql)
                .bind(proposal.proposal_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?
                .map(TryInto::try_into)
                .transpose()?;

            let effect = if let Some(ref d) = decision {
                let effect_sql = format!(
                    "SELECT * FROM {} WHERE decision_id = $1",
                    self.table("effects")
                );
                sqlx::query_as::<_, EffectRow>(&effect_sql)
                    .bind(d.decision_id.as_str())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(backend)?
                    .map(TryInto::try_into)
                    .transpose()?
            } else {
                None
            };

            entries.push(AuditEntry {
                proposal,
                decision,
                effect,
            });
        }
        Ok(entries)
    }

    async fn stage_metrics(&self) -> Result<Vec<StageLatency>, StoreError> {
        let proposals = self.table("proposals");
        let decisions = self.table("decisions");
        let effects = self.table("effects");

        let plan_to_decision = format!(
            "SELECT (EXTRACT(EPOCH FROM (d.approved_at - p.created_at)) * 1000)::double precision AS ms
             FROM {decisions} d JOIN {proposals} p USING (proposal_id)"
        );
        let decision_to_effect = format!(
            "SELECT (EXTRACT(EPOCH FROM (e.executed_at - d.approved_at)) * 1000)::double precision AS ms
             FROM {effects} e JOIN {decisions} d USING (decision_id)
             WHERE e.executed_at IS NOT NULL"
        );
        let plan_to_effect = format!(
            "SELECT (EXTRACT(EPOCH FROM (e.executed_at - p.created_at)) * 1000)::double precision AS ms
             FROM {effects} e JOIN {proposals} p USING (proposal_id)
             WHERE e.executed_at IS NOT NULL"
        );

        Ok(vec![
            self.stage_latency("proposal_to_decision", &plan_to_decision).await?,
            self.stage_latency("decision_to_effect", &decision_to_effect).await?,
            self.stage_latency("proposal_to_effect", &plan_to_effect).await?,
        ])
    }

    async fn insert_rule(&self, rule: &InterventionRule) -> Result<(), StoreError> {
        rule.validate().map_err(|e| StoreError::Conflict(e.to_string()))?;
        let sql = format!(
            "INSERT INTO {} (
                rule_id, name, description, action_types, threat_levels,
                classifications, track_types, min_priority, max_priority,
                verdict, evaluation_order, enabled, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            self.table("intervention_rules")
        );
        let verdict = match rule.verdict {
            aegis_core::RuleVerdict::RequiresApproval => "requires_approval",
            aegis_core::RuleVerdict::AutoApprove => "auto_approve",
        };
        let result = sqlx::query(&sql)
            .bind(rule.rule_id.as_str())
            .bind(&rule.name)
            .bind(&rule.description)
            .bind(to_json(&rule.action_types)?)
            .bind(to_json(&rule.threat_levels)?)
            .bind(to_json(&rule.classifications)?)
            .bind(to_json(&rule.track_types)?)
            .bind(i16::from(rule.min_priority))
            .bind(i16::from(rule.max_priority))
            .bind(verdict)
            .bind(rule.evaluation_order)
            .bind(rule.enabled)
            .bind(rule.created_at)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                StoreError::Conflict(format!("rule name {} already exists", rule.name)),
            ),
            Err(e) => Err(backend(e)),
        }
    }

    async fn update_rule(&self, rule: &InterventionRule) -> Result<(), StoreError> {
        rule.validate().map_err(|e| StoreError::Conflict(e.to_string()))?;
        let sql = format!(
            "UPDATE {} SET
                name = $2, description = $3, action_types = $4, threat_levels = $5,
                classifications = $6, track_types = $7, min_priority = $8,
                max_priority = $9, verdict = $10, evaluation_order = $11, enabled = $12
             WHERE rule_id = $1",
            self.table("intervention_rules")
        );
        let verdict = match rule.verdict {
            aegis_core::RuleVerdict::RequiresApproval => "requires_approval",
            aegis_core::RuleVerdict::AutoApprove => "auto_approve",
        };
        let result = sqlx::query(&sql)
            .bind(rule.rule_id.as_str())
            .bind(&rule.name)
            .bind(&rule.description)
            .bind(to_json(&rule.action_types)?)
            .bind(to_json(&rule.threat_levels)?)
            .bind(to_json(&rule.classifications)?)
            .bind(to_json(&rule.track_types)?)
            .bind(i16::from(rule.min_priority))
            .bind(i16::from(rule.max_priority))
            .bind(verdict)
            .bind(rule.evaluation_order)
            .bind(rule.enabled)
            .execute(&self.pool)
            .await;
        match result {
            Ok(r) if r.rows_affected() == 0 => {
                Err(StoreError::NotFound(format!("rule {}", rule.rule_id)))
            }
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                StoreError::Conflict(format!("rule name {} already exists", rule.name)),
            ),
            Err(e) => Err(backend(e)),
        }
    }

    async fn delete_rule(&self, id: &RuleId) -> Result<bool, StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE rule_id = $1",
            self.table("intervention_rules")
        );
        let result = sqlx::query(&sql)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_rule(&self, id: &RuleId) -> Result<Option<InterventionRule>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} WHERE rule_id = $1",
            self.table("intervention_rules")
        );
        let row: Option<RuleRow> = sqlx::query_as(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_rules(&self) -> Result<Vec<InterventionRule>, StoreError> {
        let sql = format!(
            "SELECT * FROM {} ORDER BY evaluation_order ASC",
            self.table("intervention_rules")
        );
        let rows: Vec<RuleRow> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn increment_counter(&self, name: &str, delta: i64) -> Result<i64, StoreError> {
        let sql = format!(
            "INSERT INTO {t} (name, value) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET value = {t}.value + $2
             RETURNING value",
            t = self.table("counters")
        );
        let row: (i64,) = sqlx::query_as(&sql)
            .bind(name)
            .bind(delta)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.0)
    }

    async fn counters(&self) -> Result<HashMap<String, i64>, StoreError> {
        let sql = format!("SELECT name, value FROM {}", self.table("counters"));
        let rows: Vec<(String, i64)> = sqlx::query_as(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.into_iter().collect())
    }

    async fn clear_all(&self) -> Result<ClearCounts, StoreError> {
        // Single transaction, foreign-key order:
        // effects -> decisions -> proposals -> detections -> tracks.
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let mut delete = async |table: &str, tx: &mut sqlx::Transaction<'_, Postgres>| {
            let sql = format!("DELETE FROM {table}");
            sqlx::query(&sql)
                .execute(&mut **tx)
                .await
                .map(|r| r.rows_affected())
                .map_err(backend)
        };

        let effects = delete(&self.table("effects"), &mut tx).await?;
        let decisions = delete(&self.table("decisions"), &mut tx).await?;
        let proposals = delete(&self.table("proposals"), &mut tx).await?;
        let detections = delete(&self.table("detections"), &mut tx).await?;
        let tracks = delete(&self.table("tracks"), &mut tx).await?;
        delete(&self.table("counters"), &mut tx).await?;

        tx.commit().await.map_err(backend)?;

        Ok(ClearCounts {
            effects,
            decisions,
            proposals,
            detections,
            tracks,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }
}
