use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::budget::{BudgetDimension, BudgetLimits, EpisodeBudget};
use crate::policy::Subject;
use crate::tool::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Initializing,
    Running,
    Perceiving,
    Planning,
    Acting,
    Observing,
    Suspended,
    Completed,
    Failed,
}

impl RunnerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Perceiving => "perceiving",
            Self::Planning => "planning",
            Self::Acting => "acting",
            Self::Observing => "observing",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// States in which wall-clock time counts against the budget.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Suspended | Self::Completed | Self::Failed)
    }

    pub fn phase(self) -> Option<Phase> {
        match self {
            Self::Perceiving => Some(Phase::Perceive),
            Self::Planning => Some(Phase::Plan),
            Self::Acting => Some(Phase::Act),
            Self::Observing => Some(Phase::Observe),
            _ => None,
        }
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Perceive,
    Plan,
    Act,
    Observe,
}

impl Phase {
    pub const CYCLE: [Phase; 4] = [Phase::Perceive, Phase::Plan, Phase::Act, Phase::Observe];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Perceive => "perceive",
            Self::Plan => "plan",
            Self::Act => "act",
            Self::Observe => "observe",
        }
    }

    pub fn state(self) -> RunnerState {
        match self {
            Self::Perceive => RunnerState::Perceiving,
            Self::Plan => RunnerState::Planning,
            Self::Act => RunnerState::Acting,
            Self::Observe => RunnerState::Observing,
        }
    }

    fn bit(self) -> u8 {
        match self {
            Self::Perceive => 0b0001,
            Self::Plan => 0b0010,
            Self::Act => 0b0100,
            Self::Observe => 0b1000,
        }
    }
}

/// Phases completed in the current perceive → plan → act → observe cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct CycleProgress(u8);

impl CycleProgress {
    pub fn mark(&mut self, phase: Phase) {
        self.0 |= phase.bit();
    }

    pub fn contains(self, phase: Phase) -> bool {
        self.0 & phase.bit() != 0
    }

    pub fn is_full(self) -> bool {
        Phase::CYCLE.iter().all(|p| self.contains(*p))
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }

    /// First phase of the cycle not yet completed.
    pub fn next_pending(self) -> Phase {
        Phase::CYCLE
            .into_iter()
            .find(|p| !self.contains(*p))
            .unwrap_or(Phase::Perceive)
    }

    pub fn completed(self) -> Vec<Phase> {
        Phase::CYCLE.into_iter().filter(|p| self.contains(*p)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FailureDetail {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl FailureDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Why an episode was suspended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SuspendReason {
    pub code: String,
    pub message: String,
    /// Set when a budget dimension forced the suspension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<BudgetDimension>,
}

impl SuspendReason {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            dimension: None,
        }
    }

    pub fn budget(code: impl Into<String>, dimension: BudgetDimension, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            dimension: Some(dimension),
        }
    }
}

/// An action whose outcome is unknown and must be verified before the
/// episode may act or observe again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PendingVerification {
    pub action_id: Uuid,
    pub call: ToolCall,
    pub gated: bool,
    pub since: DateTime<Utc>,
}

/// Inputs for a new episode.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EpisodeSpec {
    pub agent_type: String,
    pub task_type: String,
    pub client_id: String,
    #[serde(default)]
    pub parent_episode_id: Option<Uuid>,
    pub subject: Subject,
    #[serde(default)]
    pub budget: BudgetLimits,
    /// Task payload handed to the agent.
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Episode {
    pub id: Uuid,
    pub parent_episode_id: Option<Uuid>,
    pub agent_type: String,
    pub task_type: String,
    pub client_id: String,
    pub subject: Subject,
    pub input: serde_json::Value,
    pub budget: EpisodeBudget,
    pub status: RunnerState,
    pub checkpoints: Vec<EpisodeCheckpoint>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureDetail>,
}

impl Episode {
    pub fn new(spec: EpisodeSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            parent_episode_id: spec.parent_episode_id,
            agent_type: spec.agent_type,
            task_type: spec.task_type,
            client_id: spec.client_id.trim().to_string(),
            subject: spec.subject,
            input: spec.input,
            budget: EpisodeBudget::new(spec.budget),
            status: RunnerState::Idle,
            checkpoints: Vec::new(),
            created_at: now,
            started_at: None,
            ended_at: None,
            failure: None,
        }
    }

    pub fn latest_checkpoint(&self) -> Option<&EpisodeCheckpoint> {
        self.checkpoints.last()
    }
}

/// Immutable snapshot captured on suspension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EpisodeCheckpoint {
    pub id: Uuid,
    pub episode_id: Uuid,
    pub phase: Option<Phase>,
    #[schema(value_type = Object)]
    pub phase_data: serde_json::Map<String, serde_json::Value>,
    pub loop_count: u64,
    pub timestamp: DateTime<Utc>,
    pub reason: SuspendReason,
    pub state_before: RunnerState,
    pub cycle: CycleProgress,
    pub budget: EpisodeBudget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_verification: Option<PendingVerification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_action: Option<ToolCall>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_progress_tracks_next_phase() {
        let mut cycle = CycleProgress::default();
        assert_eq!(cycle.next_pending(), Phase::Perceive);
        cycle.mark(Phase::Perceive);
        cycle.mark(Phase::Plan);
        assert_eq!(cycle.next_pending(), Phase::Act);
        assert!(!cycle.is_full());
        cycle.mark(Phase::Act);
        cycle.mark(Phase::Observe);
        assert!(cycle.is_full());
        cycle.reset();
        assert_eq!(cycle.completed(), Vec::<Phase>::new());
    }

    #[test]
    fn only_working_states_consume_time() {
        assert!(RunnerState::Planning.is_active());
        assert!(RunnerState::Running.is_active());
        assert!(!RunnerState::Suspended.is_active());
        assert!(!RunnerState::Idle.is_active());
        assert!(RunnerState::Failed.is_terminal());
    }
}
