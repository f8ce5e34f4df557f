use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::budget::BudgetDimension;
use crate::episode::{EpisodeCheckpoint, FailureDetail, SuspendReason};
use crate::policy::StepUp;
use crate::tool::{ToolCall, ToolOutcome};

/// Everything that can be dispatched to a runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerEvent {
    Start,
    Perceive,
    PerceiveComplete {
        #[serde(default)]
        data: serde_json::Value,
    },
    Plan,
    PlanComplete {
        #[serde(default)]
        data: serde_json::Value,
        #[serde(default)]
        tokens_used: u64,
    },
    Act(ActRequest),
    ActComplete(ActResult),
    Observe,
    ObserveComplete {
        #[serde(default)]
        data: serde_json::Value,
        /// No further work remains once this cycle closes.
        #[serde(default)]
        done: bool,
    },
    Suspend {
        reason: SuspendReason,
        #[serde(default)]
        checkpoint: Option<Box<EpisodeCheckpoint>>,
    },
    Resume {
        #[serde(default)]
        from_checkpoint: Option<Uuid>,
        /// Step-up confirmation granted by the operator for the next action.
        #[serde(default)]
        grant_step_up: StepUp,
    },
    Complete {
        #[serde(default)]
        summary: Option<serde_json::Value>,
    },
    Fail(FailureDetail),
    BudgetWarning {
        dimension: BudgetDimension,
    },
    BudgetExceeded {
        dimension: BudgetDimension,
    },
    VerifyComplete {
        action_id: Uuid,
        verdict: VerificationVerdict,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActRequest {
    pub action_id: Uuid,
    pub call: ToolCall,
    /// Step-up confirmation already obtained for this action.
    #[serde(default)]
    pub step_up: StepUp,
}

impl ActRequest {
    pub fn new(call: ToolCall) -> Self {
        Self {
            action_id: Uuid::now_v7(),
            call,
            step_up: StepUp::None,
        }
    }

    pub fn with_step_up(mut self, step_up: StepUp) -> Self {
        self.step_up = step_up;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActResult {
    pub action_id: Uuid,
    pub outcome: ToolOutcome,
    #[serde(default)]
    pub tokens_used: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum VerificationVerdict {
    /// The effect exists.
    Confirmed { proof: Option<String> },
    /// The effect definitely did not happen.
    NotApplied,
    /// Still ambiguous after the bounded number of probes.
    Unresolved { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Perceive,
    PerceiveComplete,
    Plan,
    PlanComplete,
    Act,
    ActComplete,
    Observe,
    ObserveComplete,
    Suspend,
    Resume,
    Complete,
    Fail,
    BudgetWarning,
    BudgetExceeded,
    VerifyComplete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Perceive => "PERCEIVE",
            Self::PerceiveComplete => "PERCEIVE_COMPLETE",
            Self::Plan => "PLAN",
            Self::PlanComplete => "PLAN_COMPLETE",
            Self::Act => "ACT",
            Self::ActComplete => "ACT_COMPLETE",
            Self::Observe => "OBSERVE",
            Self::ObserveComplete => "OBSERVE_COMPLETE",
            Self::Suspend => "SUSPEND",
            Self::Resume => "RESUME",
            Self::Complete => "COMPLETE",
            Self::Fail => "FAIL",
            Self::BudgetWarning => "BUDGET_WARNING",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::VerifyComplete => "VERIFY_COMPLETE",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RunnerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Start => EventKind::Start,
            Self::Perceive => EventKind::Perceive,
            Self::PerceiveComplete { .. } => EventKind::PerceiveComplete,
            Self::Plan => EventKind::Plan,
            Self::PlanComplete { .. } => EventKind::PlanComplete,
            Self::Act(_) => EventKind::Act,
            Self::ActComplete(_) => EventKind::ActComplete,
            Self::Observe => EventKind::Observe,
            Self::ObserveComplete { .. } => EventKind::ObserveComplete,
            Self::Suspend { .. } => EventKind::Suspend,
            Self::Resume { .. } => EventKind::Resume,
            Self::Complete { .. } => EventKind::Complete,
            Self::Fail(_) => EventKind::Fail,
            Self::BudgetWarning { .. } => EventKind::BudgetWarning,
            Self::BudgetExceeded { .. } => EventKind::BudgetExceeded,
            Self::VerifyComplete { .. } => EventKind::VerifyComplete,
        }
    }

    pub fn suspend(reason: SuspendReason) -> Self {
        Self::Suspend {
            reason,
            checkpoint: None,
        }
    }

    pub fn resume() -> Self {
        Self::Resume {
            from_checkpoint: None,
            grant_step_up: StepUp::None,
        }
    }

    pub fn fail(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fail(FailureDetail::new(code, message))
    }

    pub fn perceive_complete(data: serde_json::Value) -> Self {
        Self::PerceiveComplete { data }
    }

    pub fn plan_complete(data: serde_json::Value, tokens_used: u64) -> Self {
        Self::PlanComplete { data, tokens_used }
    }

    pub fn observe_complete(data: serde_json::Value, done: bool) -> Self {
        Self::ObserveComplete { data, done }
    }
}
