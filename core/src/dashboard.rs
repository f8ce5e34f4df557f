//! Read side and quick actions over the kill switch registry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::kill_switch::{
    ActionContext, ActivateInput, DeactivateInput, KillSwitchError, KillSwitchRegistry,
    KillSwitchScope, KillSwitchState, Severity,
};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ScopeCounts {
    pub global: usize,
    pub client: usize,
    pub platform: usize,
    pub action: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct KillSwitchOverview {
    pub active_counts: ScopeCounts,
    pub total_active: usize,
    pub global_active: bool,
    /// Every active switch, newest activation first.
    pub active: Vec<KillSwitchState>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub global_active: bool,
    pub total_active: usize,
    pub critical_active: usize,
    /// One line per active switch contributing to the status.
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct KillSwitchCheck {
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<KillSwitchScope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<KillSwitchState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ClientStatus {
    pub client_id: String,
    /// True when a global or client switch blocks this client's side effects.
    pub blocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<KillSwitchScope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_switch: Option<KillSwitchState>,
    pub global_active: bool,
    pub recent_history: Vec<KillSwitchState>,
}

const CLIENT_STATUS_HISTORY: usize = 10;

pub struct KillSwitchDashboard {
    registry: Arc<KillSwitchRegistry>,
}

impl KillSwitchDashboard {
    pub fn new(registry: Arc<KillSwitchRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<KillSwitchRegistry> {
        &self.registry
    }

    pub fn get_overview(&self) -> KillSwitchOverview {
        let per_scope: Vec<Vec<KillSwitchState>> = KillSwitchScope::ALL
            .into_iter()
            .map(|scope| self.registry.list_active(scope))
            .collect();
        let active_counts = ScopeCounts {
            global: per_scope[0].len(),
            client: per_scope[1].len(),
            platform: per_scope[2].len(),
            action: per_scope[3].len(),
        };
        let mut active: Vec<KillSwitchState> = per_scope.into_iter().flatten().collect();
        active.sort_by(|a, b| b.activated_at.cmp(&a.activated_at));
        KillSwitchOverview {
            total_active: active.len(),
            global_active: active_counts.global > 0,
            active_counts,
            active,
            generated_at: self.registry.now(),
        }
    }

    /// `critical` while the global switch is active, `degraded` while any
    /// other switch is active, `healthy` otherwise. Severity never raises the
    /// status; `critical_active` only counts.
    pub fn get_system_health(&self) -> SystemHealth {
        let overview = self.get_overview();
        let critical_active = overview
            .active
            .iter()
            .filter(|s| s.severity == Severity::Critical)
            .count();
        let status = if overview.global_active {
            HealthStatus::Critical
        } else if overview.total_active > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        let reasons = overview
            .active
            .iter()
            .map(|s| match &s.target {
                Some(target) => format!("{}:{} ({}): {}", s.scope, target, s.severity.as_str(), s.reason),
                None => format!("{} ({}): {}", s.scope, s.severity.as_str(), s.reason),
            })
            .collect();
        SystemHealth {
            status,
            global_active: overview.global_active,
            total_active: overview.total_active,
            critical_active,
            reasons,
        }
    }

    pub fn quick_activate(
        &self,
        scope: KillSwitchScope,
        target: Option<&str>,
        input: ActivateInput,
    ) -> Result<KillSwitchState, KillSwitchError> {
        self.registry.activate(scope, target, input)
    }

    pub fn quick_deactivate(
        &self,
        scope: KillSwitchScope,
        target: Option<&str>,
        input: DeactivateInput,
    ) -> Result<KillSwitchState, KillSwitchError> {
        self.registry.deactivate(scope, target, input)
    }

    pub fn check_all_before_action(&self, context: &ActionContext) -> KillSwitchCheck {
        match self.registry.first_active(context) {
            Some(state) => KillSwitchCheck {
                blocked: true,
                scope: Some(state.scope),
                reason_code: Some(state.scope.deny_reason_code().to_string()),
                state: Some(state),
            },
            None => KillSwitchCheck {
                blocked: false,
                scope: None,
                reason_code: None,
                state: None,
            },
        }
    }

    /// Activate the global switch at critical severity.
    pub fn emergency_halt(
        &self,
        activated_by: &str,
        reason: &str,
        incident_id: Option<String>,
    ) -> Result<KillSwitchState, KillSwitchError> {
        let mut input = ActivateInput::new(reason, activated_by, Severity::Critical);
        input.incident_id = incident_id;
        self.registry.activate(KillSwitchScope::Global, None, input)
    }

    pub fn get_client_status(&self, client_id: &str) -> ClientStatus {
        let global_active = self.registry.is_active(KillSwitchScope::Global, None);
        let client_switch = self
            .registry
            .get_state(KillSwitchScope::Client, Some(client_id))
            .filter(|s| s.active);
        let blocked_by = if global_active {
            Some(KillSwitchScope::Global)
        } else if client_switch.is_some() {
            Some(KillSwitchScope::Client)
        } else {
            None
        };
        ClientStatus {
            client_id: client_id.trim().to_string(),
            blocked: blocked_by.is_some(),
            blocked_by,
            client_switch,
            global_active,
            recent_history: self.registry.get_history(
                KillSwitchScope::Client,
                Some(client_id),
                CLIENT_STATUS_HISTORY,
            ),
        }
    }

    pub fn get_history(
        &self,
        scope: KillSwitchScope,
        target: Option<&str>,
        limit: usize,
    ) -> Vec<KillSwitchState> {
        self.registry.get_history(scope, target, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::MemoryNotifier;

    fn dashboard() -> KillSwitchDashboard {
        KillSwitchDashboard::new(Arc::new(KillSwitchRegistry::new(
            Arc::new(MemoryNotifier::new()),
            Arc::new(ManualClock::default()),
        )))
    }

    #[test]
    fn health_moves_from_healthy_to_degraded_to_critical() {
        let dashboard = dashboard();
        assert_eq!(dashboard.get_system_health().status, HealthStatus::Healthy);

        dashboard
            .quick_activate(
                KillSwitchScope::Platform,
                Some("tiktok"),
                ActivateInput::new("rate limited upstream", "ops", Severity::Warning),
            )
            .unwrap();
        let health = dashboard.get_system_health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.reasons.len(), 1);

        dashboard.emergency_halt("ops", "credential leak", None).unwrap();
        let health = dashboard.get_system_health();
        assert_eq!(health.status, HealthStatus::Critical);
        assert!(health.global_active);
    }

    #[test]
    fn critical_client_switch_only_degrades_health() {
        let dashboard = dashboard();
        dashboard
            .quick_activate(
                KillSwitchScope::Client,
                Some("client_42"),
                ActivateInput::new("fraud review", "ops", Severity::Critical),
            )
            .unwrap();
        let health = dashboard.get_system_health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(!health.global_active);
        assert_eq!(health.critical_active, 1);
    }

    #[test]
    fn overview_counts_per_scope() {
        let dashboard = dashboard();
        for client in ["a", "b"] {
            dashboard
                .quick_activate(
                    KillSwitchScope::Client,
                    Some(client),
                    ActivateInput::new("chargeback", "ops", Severity::High),
                )
                .unwrap();
        }
        dashboard
            .quick_activate(
                KillSwitchScope::Action,
                Some("publish"),
                ActivateInput::new("template bug", "ops", Severity::High),
            )
            .unwrap();
        let overview = dashboard.get_overview();
        assert_eq!(overview.active_counts.client, 2);
        assert_eq!(overview.active_counts.action, 1);
        assert_eq!(overview.total_active, 3);
        assert!(!overview.global_active);
    }

    #[test]
    fn check_reports_scope_and_clears_after_deactivation() {
        let dashboard = dashboard();
        let ctx = ActionContext {
            client_id: Some("client_42".into()),
            platform: Some("x".into()),
            action_type: Some("publish".into()),
        };
        dashboard
            .quick_activate(
                KillSwitchScope::Client,
                Some("client_42"),
                ActivateInput::new("fraud review", "ops", Severity::High),
            )
            .unwrap();
        let check = dashboard.check_all_before_action(&ctx);
        assert!(check.blocked);
        assert_eq!(check.reason_code.as_deref(), Some("CLIENT_KILL_SWITCH_ACTIVE"));

        dashboard
            .quick_deactivate(
                KillSwitchScope::Client,
                Some("client_42"),
                DeactivateInput::new("review passed", "ops"),
            )
            .unwrap();
        assert!(!dashboard.check_all_before_action(&ctx).blocked);
    }

    #[test]
    fn client_status_reports_global_block() {
        let dashboard = dashboard();
        let status = dashboard.get_client_status("client_9");
        assert!(!status.blocked);

        dashboard.emergency_halt("ops", "halt everything", Some("INC-1".into())).unwrap();
        let status = dashboard.get_client_status("client_9");
        assert!(status.blocked);
        assert_eq!(status.blocked_by, Some(KillSwitchScope::Global));
        assert!(status.client_switch.is_none());
    }
}
