//! Postgres-backed checkpoint store, action audit and kill switch audit.

use async_trait::async_trait;
use marshal_core::audit::{AuditRecord, AuditSink};
use marshal_core::checkpoint::{CheckpointError, CheckpointStore};
use marshal_core::episode::{Episode, EpisodeCheckpoint};
use marshal_core::kill_switch::KillSwitchState;
use marshal_core::notify::{OperatorNotification, OperatorNotifier};
use serde_json::json;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

fn storage(err: sqlx::Error) -> CheckpointError {
    CheckpointError::Storage(err.to_string())
}

#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn upsert_episode<'e, E>(executor: E, episode: &Episode) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO episodes (id, parent_episode_id, client_id, agent_type, status, snapshot, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO UPDATE
        SET status = EXCLUDED.status,
            snapshot = EXCLUDED.snapshot,
            updated_at = NOW()
        "#,
    )
    .bind(episode.id)
    .bind(episode.parent_episode_id)
    .bind(&episode.client_id)
    .bind(&episode.agent_type)
    .bind(episode.status.as_str())
    .bind(Json(episode))
    .bind(episode.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn save(&self, episode: &Episode, checkpoint: &EpisodeCheckpoint) -> Result<(), CheckpointError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        upsert_episode(&mut *tx, episode).await.map_err(storage)?;
        sqlx::query(
            r#"
            INSERT INTO episode_checkpoints (id, episode_id, reason_code, body, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(checkpoint.id)
        .bind(checkpoint.episode_id)
        .bind(&checkpoint.reason.code)
        .bind(Json(checkpoint))
        .bind(checkpoint.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        tracing::debug!(
            episode_id = %episode.id,
            checkpoint_id = %checkpoint.id,
            reason = %checkpoint.reason.code,
            "checkpoint persisted"
        );
        Ok(())
    }

    async fn register(&self, episode: &Episode) -> Result<(), CheckpointError> {
        upsert_episode(&self.pool, episode).await.map_err(storage)
    }

    async fn load(
        &self,
        episode_id: Uuid,
        checkpoint_id: Option<Uuid>,
    ) -> Result<EpisodeCheckpoint, CheckpointError> {
        let row = match checkpoint_id {
            Some(id) => sqlx::query_scalar::<_, Json<EpisodeCheckpoint>>(
                "SELECT body FROM episode_checkpoints WHERE episode_id = $1 AND id = $2",
            )
            .bind(episode_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?,
            None => sqlx::query_scalar::<_, Json<EpisodeCheckpoint>>(
                r#"
                SELECT body FROM episode_checkpoints
                WHERE episode_id = $1
                ORDER BY recorded_at DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(episode_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?,
        };
        match (row, checkpoint_id) {
            (Some(Json(checkpoint)), _) => Ok(checkpoint),
            (None, Some(checkpoint_id)) => Err(CheckpointError::CheckpointNotFound {
                episode_id,
                checkpoint_id,
            }),
            (None, None) => {
                // Distinguish an unknown episode from one with no checkpoint yet.
                self.load_episode(episode_id).await?;
                Err(CheckpointError::NoCheckpoint(episode_id))
            }
        }
    }

    async fn load_episode(&self, episode_id: Uuid) -> Result<Episode, CheckpointError> {
        sqlx::query_scalar::<_, Json<Episode>>("SELECT snapshot FROM episodes WHERE id = $1")
            .bind(episode_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .map(|Json(episode)| episode)
            .ok_or(CheckpointError::EpisodeNotFound(episode_id))
    }

    async fn archive(&self, episode: &Episode) -> Result<(), CheckpointError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        upsert_episode(&mut *tx, episode).await.map_err(storage)?;
        sqlx::query("UPDATE episodes SET archived = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(episode.id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<Uuid>, CheckpointError> {
        sqlx::query_scalar::<_, Uuid>("SELECT id FROM episodes WHERE archived = FALSE ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)
    }
}

/// Appends action audit rows in the background; a failed insert is logged, never retried.
#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl AuditSink for PgAuditSink {
    fn append(&self, record: AuditRecord) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(err) = sqlx::query(
                r#"
                INSERT INTO action_audit (
                    id,
                    episode_id,
                    action_id,
                    client_id,
                    tool_id,
                    idempotency_key,
                    decision,
                    reason_code,
                    outcome,
                    proof,
                    recorded_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(record.id)
            .bind(record.episode_id)
            .bind(record.action_id)
            .bind(&record.client_id)
            .bind(&record.tool_id)
            .bind(&record.idempotency_key)
            .bind(record.decision.as_str())
            .bind(&record.reason_code)
            .bind(record.outcome.as_str())
            .bind(&record.proof)
            .bind(record.recorded_at)
            .execute(&pool)
            .await
            {
                tracing::warn!(
                    error = %err,
                    episode_id = %record.episode_id,
                    action_id = %record.action_id,
                    "failed to persist action audit record"
                );
            }
        });
    }
}

/// One kill switch audit row.
#[derive(Debug, Clone, PartialEq)]
pub struct KillSwitchAuditEvent {
    pub action: &'static str,
    pub actor: Option<String>,
    pub scope: Option<String>,
    pub target: Option<String>,
    pub path: Option<String>,
    pub method: Option<String>,
    pub reason: Option<String>,
    pub metadata: serde_json::Value,
}

impl KillSwitchAuditEvent {
    /// Audit row for a switch notification; other notifications have none.
    pub fn from_notification(notification: &OperatorNotification) -> Option<Self> {
        match notification {
            OperatorNotification::KillSwitchActivated { state } => Some(Self {
                actor: Some(state.activated_by.clone()),
                reason: Some(state.reason.clone()),
                ..Self::for_state("activated", state)
            }),
            OperatorNotification::KillSwitchDeactivated { state } => Some(Self {
                actor: state.deactivated_by.clone(),
                reason: state.deactivation_reason.clone(),
                ..Self::for_state("deactivated", state)
            }),
            _ => None,
        }
    }

    fn for_state(action: &'static str, state: &KillSwitchState) -> Self {
        Self {
            action,
            actor: None,
            scope: Some(state.scope.as_str().to_string()),
            target: state.target.clone(),
            path: None,
            method: None,
            reason: None,
            metadata: json!({
                "severity": state.severity,
                "incident_id": state.incident_id,
                "activated_at": state.activated_at,
                "scheduled_end": state.scheduled_end,
            }),
        }
    }
}

pub fn persist_kill_switch_audit_event(pool: PgPool, event: KillSwitchAuditEvent) {
    tokio::spawn(async move {
        if let Err(err) = sqlx::query(
            r#"
            INSERT INTO kill_switch_audit (
                action,
                actor,
                scope,
                target,
                path,
                method,
                reason,
                metadata
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.action)
        .bind(event.actor)
        .bind(event.scope)
        .bind(event.target)
        .bind(event.path)
        .bind(event.method)
        .bind(event.reason)
        .bind(event.metadata)
        .execute(&pool)
        .await
        {
            tracing::warn!(error = %err, "failed to persist kill-switch audit event");
        }
    });
}

/// Writes every kill switch change, manual or scheduled, to `kill_switch_audit`.
#[derive(Clone)]
pub struct KillSwitchAuditNotifier {
    pool: PgPool,
}

impl KillSwitchAuditNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl OperatorNotifier for KillSwitchAuditNotifier {
    fn notify(&self, notification: OperatorNotification) {
        if let Some(event) = KillSwitchAuditEvent::from_notification(&notification) {
            persist_kill_switch_audit_event(self.pool.clone(), event);
        }
    }
}
