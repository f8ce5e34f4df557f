use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Allow,
    Deny,
    /// Low-risk tool, the policy gate was not consulted.
    NotGated,
}

impl AuditDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::NotGated => "not_gated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    ConfirmedSuccess,
    /// Replayed from the idempotency ledger without dispatching.
    Deduplicated,
    FailedTransient,
    FailedPermanent,
    Unknown,
    VerifiedNotApplied,
    /// Denied by the policy gate or stopped before dispatch.
    NotAttempted,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfirmedSuccess => "confirmed_success",
            Self::Deduplicated => "deduplicated",
            Self::FailedTransient => "failed_transient",
            Self::FailedPermanent => "failed_permanent",
            Self::Unknown => "unknown",
            Self::VerifiedNotApplied => "verified_not_applied",
            Self::NotAttempted => "not_attempted",
        }
    }
}

/// One append-only line per action attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AuditRecord {
    pub id: Uuid,
    pub episode_id: Uuid,
    pub action_id: Uuid,
    pub client_id: String,
    pub tool_id: String,
    pub idempotency_key: Option<String>,
    pub decision: AuditDecision,
    pub reason_code: String,
    pub outcome: AuditOutcome,
    pub proof: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

pub trait AuditSink: Send + Sync {
    fn append(&self, record: AuditRecord);
}

#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn for_episode(&self, episode_id: Uuid) -> Vec<AuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.episode_id == episode_id)
            .collect()
    }

    pub fn count_outcome(&self, outcome: AuditOutcome) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.outcome == outcome)
            .count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, record: AuditRecord) {
        tracing::debug!(
            episode_id = %record.episode_id,
            action_id = %record.action_id,
            tool_id = %record.tool_id,
            outcome = record.outcome.as_str(),
            "audit record appended"
        );
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}
