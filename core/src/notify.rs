use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use uuid::Uuid;

use crate::budget::{BudgetDimension, ExceededAction};
use crate::kill_switch::KillSwitchState;

/// Events pushed to the operator channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorNotification {
    KillSwitchActivated {
        state: KillSwitchState,
    },
    KillSwitchDeactivated {
        state: KillSwitchState,
    },
    BudgetExceeded {
        episode_id: Uuid,
        client_id: String,
        dimension: BudgetDimension,
        used: u64,
        limit: u64,
        action: ExceededAction,
    },
    VerificationEscalated {
        episode_id: Uuid,
        client_id: String,
        action_id: Uuid,
        tool_id: String,
        attempts: u32,
    },
}

impl OperatorNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KillSwitchActivated { .. } => "kill_switch_activated",
            Self::KillSwitchDeactivated { .. } => "kill_switch_deactivated",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::VerificationEscalated { .. } => "verification_escalated",
        }
    }
}

/// Fire-and-forget operator channel. Implementations must not block the caller.
pub trait OperatorNotifier: Send + Sync {
    fn notify(&self, notification: OperatorNotification);
}

/// Emits every notification as a structured `warn` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl OperatorNotifier for TracingNotifier {
    fn notify(&self, notification: OperatorNotification) {
        match &notification {
            OperatorNotification::KillSwitchActivated { state } => tracing::warn!(
                scope = state.scope.as_str(),
                target = state.target.as_deref().unwrap_or("-"),
                severity = state.severity.as_str(),
                activated_by = %state.activated_by,
                reason = %state.reason,
                "kill switch activated"
            ),
            OperatorNotification::KillSwitchDeactivated { state } => tracing::warn!(
                scope = state.scope.as_str(),
                target = state.target.as_deref().unwrap_or("-"),
                deactivated_by = state.deactivated_by.as_deref().unwrap_or("-"),
                "kill switch deactivated"
            ),
            OperatorNotification::BudgetExceeded {
                episode_id,
                client_id,
                dimension,
                used,
                limit,
                action,
            } => tracing::warn!(
                episode_id = %episode_id,
                client_id = %client_id,
                dimension = dimension.as_str(),
                used,
                limit,
                action = action.as_str(),
                "episode budget exceeded"
            ),
            OperatorNotification::VerificationEscalated {
                episode_id,
                client_id,
                action_id,
                tool_id,
                attempts,
            } => tracing::warn!(
                episode_id = %episode_id,
                client_id = %client_id,
                action_id = %action_id,
                tool_id = %tool_id,
                attempts,
                "unknown action outcome escalated to operator"
            ),
        }
    }
}

/// Collects notifications in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<OperatorNotification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OperatorNotification> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|n| n.kind() == kind)
            .count()
    }
}

impl OperatorNotifier for MemoryNotifier {
    fn notify(&self, notification: OperatorNotification) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notification);
    }
}

/// Delivers each notification to every inner notifier in order.
pub struct FanoutNotifier {
    inner: Vec<std::sync::Arc<dyn OperatorNotifier>>,
}

impl FanoutNotifier {
    pub fn new(inner: Vec<std::sync::Arc<dyn OperatorNotifier>>) -> Self {
        Self { inner }
    }
}

impl OperatorNotifier for FanoutNotifier {
    fn notify(&self, notification: OperatorNotification) {
        for notifier in &self.inner {
            notifier.notify(notification.clone());
        }
    }
}
