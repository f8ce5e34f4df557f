//! Multi-scope kill switch registry.
//!
//! Four independent keyed stores (global, client, platform, action). Each
//! store is guarded by its own `RwLock` and read without any caching layer, so
//! a flip is visible to the very next check.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::clock::Clock;
use crate::error::reason;
use crate::notify::{OperatorNotification, OperatorNotifier};

/// Entries retained per (scope, target).
pub const HISTORY_LIMIT: usize = 50;
/// Minimum trimmed length of an activation or deactivation reason.
pub const MIN_REASON_LEN: usize = 3;
/// Actor recorded for scheduled deactivations.
pub const SYSTEM_ACTOR: &str = "system";

const GLOBAL_KEY: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchScope {
    Global,
    Client,
    Platform,
    Action,
}

impl KillSwitchScope {
    /// Precedence order used by every check.
    pub const ALL: [KillSwitchScope; 4] = [
        KillSwitchScope::Global,
        KillSwitchScope::Client,
        KillSwitchScope::Platform,
        KillSwitchScope::Action,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Client => "client",
            Self::Platform => "platform",
            Self::Action => "action",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "global" => Some(Self::Global),
            "client" => Some(Self::Client),
            "platform" => Some(Self::Platform),
            "action" => Some(Self::Action),
            _ => None,
        }
    }

    /// Reason code reported when a switch of this scope blocks an action.
    pub fn deny_reason_code(self) -> &'static str {
        match self {
            Self::Global => reason::GLOBAL_KILL_SWITCH_ACTIVE,
            Self::Client => reason::CLIENT_KILL_SWITCH_ACTIVE,
            Self::Platform => reason::PLATFORM_KILL_SWITCH_ACTIVE,
            Self::Action => reason::ACTION_KILL_SWITCH_ACTIVE,
        }
    }

    fn normalize_target(self, target: Option<&str>) -> Result<String, KillSwitchError> {
        let trimmed = target.map(str::trim).filter(|t| !t.is_empty());
        match (self, trimmed) {
            (Self::Global, None) => Ok(GLOBAL_KEY.to_string()),
            (Self::Global, Some(_)) => Err(KillSwitchError::UnexpectedTarget),
            (_, None) => Err(KillSwitchError::MissingTarget { scope: self }),
            (Self::Client, Some(t)) => Ok(t.to_string()),
            (_, Some(t)) => Ok(t.to_ascii_lowercase()),
        }
    }
}

impl fmt::Display for KillSwitchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "warning" => Some(Self::Warning),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// One history entry: an activation, paired with its deactivation once it happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct KillSwitchState {
    pub scope: KillSwitchScope,
    /// `None` for the global switch.
    pub target: Option<String>,
    pub active: bool,
    pub activated_at: DateTime<Utc>,
    pub activated_by: String,
    pub reason: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivated_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivation_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ActivateInput {
    pub reason: String,
    pub activated_by: String,
    pub severity: Severity,
    pub incident_id: Option<String>,
    pub scheduled_end: Option<DateTime<Utc>>,
}

impl ActivateInput {
    pub fn new(reason: impl Into<String>, activated_by: impl Into<String>, severity: Severity) -> Self {
        Self {
            reason: reason.into(),
            activated_by: activated_by.into(),
            severity,
            incident_id: None,
            scheduled_end: None,
        }
    }

    pub fn with_incident(mut self, incident_id: impl Into<String>) -> Self {
        self.incident_id = Some(incident_id.into());
        self
    }

    pub fn with_scheduled_end(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_end = Some(at);
        self
    }
}

#[derive(Debug, Clone)]
pub struct DeactivateInput {
    pub reason: String,
    pub deactivated_by: String,
}

impl DeactivateInput {
    pub fn new(reason: impl Into<String>, deactivated_by: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            deactivated_by: deactivated_by.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KillSwitchError {
    #[error("reason must be at least 3 characters after trimming")]
    ReasonTooShort,
    #[error("actor must not be empty")]
    MissingActor,
    #[error("{scope} kill switch requires a target")]
    MissingTarget { scope: KillSwitchScope },
    #[error("global kill switch does not take a target")]
    UnexpectedTarget,
    #[error("scheduled end must be in the future")]
    ScheduledEndInPast,
    #[error("no active {scope} kill switch for '{target}'")]
    NotActive {
        scope: KillSwitchScope,
        target: String,
    },
}

fn validated_reason(raw: &str) -> Result<String, KillSwitchError> {
    let trimmed = raw.trim();
    if trimmed.chars().count() < MIN_REASON_LEN {
        return Err(KillSwitchError::ReasonTooShort);
    }
    Ok(trimmed.to_string())
}

fn validated_actor(raw: &str) -> Result<String, KillSwitchError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(KillSwitchError::MissingActor);
    }
    Ok(trimmed.to_string())
}

fn display_target(key: &str) -> Option<String> {
    if key == GLOBAL_KEY {
        None
    } else {
        Some(key.to_string())
    }
}

/// Keyed store for one scope. Most recent history entry is the current state.
#[derive(Debug)]
pub struct KillSwitchStore {
    scope: KillSwitchScope,
    entries: RwLock<HashMap<String, VecDeque<KillSwitchState>>>,
}

impl KillSwitchStore {
    pub fn new(scope: KillSwitchScope) -> Self {
        Self {
            scope,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> KillSwitchScope {
        self.scope
    }

    /// Activate a switch. Re-activating an active target updates it in place.
    pub fn activate(
        &self,
        target: Option<&str>,
        input: ActivateInput,
        now: DateTime<Utc>,
    ) -> Result<KillSwitchState, KillSwitchError> {
        let key = self.scope.normalize_target(target)?;
        let reason = validated_reason(&input.reason)?;
        let activated_by = validated_actor(&input.activated_by)?;
        if input.scheduled_end.is_some_and(|end| end <= now) {
            return Err(KillSwitchError::ScheduledEndInPast);
        }
        let incident_id = input
            .incident_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let history = entries.entry(key.clone()).or_default();
        if let Some(current) = history.back_mut().filter(|s| s.active) {
            current.reason = reason;
            current.severity = input.severity;
            current.incident_id = incident_id;
            current.scheduled_end = input.scheduled_end;
            return Ok(current.clone());
        }

        let state = KillSwitchState {
            scope: self.scope,
            target: display_target(&key),
            active: true,
            activated_at: now,
            activated_by,
            reason,
            severity: input.severity,
            incident_id,
            scheduled_end: input.scheduled_end,
            deactivated_at: None,
            deactivated_by: None,
            deactivation_reason: None,
        };
        history.push_back(state.clone());
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
        Ok(state)
    }

    pub fn deactivate(
        &self,
        target: Option<&str>,
        input: DeactivateInput,
        now: DateTime<Utc>,
    ) -> Result<KillSwitchState, KillSwitchError> {
        let key = self.scope.normalize_target(target)?;
        let reason = validated_reason(&input.reason)?;
        let deactivated_by = validated_actor(&input.deactivated_by)?;

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let current = entries
            .get_mut(&key)
            .and_then(|history| history.back_mut())
            .filter(|s| s.active)
            .ok_or_else(|| KillSwitchError::NotActive {
                scope: self.scope,
                target: key.clone(),
            })?;
        current.active = false;
        current.deactivated_at = Some(now);
        current.deactivated_by = Some(deactivated_by);
        current.deactivation_reason = Some(reason);
        Ok(current.clone())
    }

    pub fn is_active(&self, target: Option<&str>) -> bool {
        self.get_state(target).is_some_and(|s| s.active)
    }

    /// Current (most recent) state for a target, active or not.
    pub fn get_state(&self, target: Option<&str>) -> Option<KillSwitchState> {
        let key = self.scope.normalize_target(target).ok()?;
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&key).and_then(|h| h.back()).cloned()
    }

    pub fn list_active(&self) -> Vec<KillSwitchState> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut active: Vec<KillSwitchState> = entries
            .values()
            .filter_map(|h| h.back())
            .filter(|s| s.active)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.activated_at.cmp(&a.activated_at));
        active
    }

    /// History for a target, newest first.
    pub fn get_history(&self, target: Option<&str>, limit: usize) -> Vec<KillSwitchState> {
        let Ok(key) = self.scope.normalize_target(target) else {
            return Vec::new();
        };
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&key)
            .map(|h| h.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    fn expired_targets(&self, now: DateTime<Utc>) -> Vec<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter_map(|(key, h)| h.back().map(|s| (key, s)))
            .filter(|(_, s)| s.active && s.scheduled_end.is_some_and(|end| end <= now))
            .map(|(key, _)| display_target(key))
            .collect()
    }
}

/// Scoped switches matched against one action, in precedence order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ActionContext {
    pub client_id: Option<String>,
    pub platform: Option<String>,
    pub action_type: Option<String>,
}

impl ActionContext {
    fn target_for(&self, scope: KillSwitchScope) -> Option<Option<&str>> {
        match scope {
            KillSwitchScope::Global => Some(None),
            KillSwitchScope::Client => self.client_id.as_deref().map(Some),
            KillSwitchScope::Platform => self.platform.as_deref().map(Some),
            KillSwitchScope::Action => self.action_type.as_deref().map(Some),
        }
    }
}

/// The four scoped stores plus the notification path shared by manual and
/// scheduled changes.
pub struct KillSwitchRegistry {
    global: KillSwitchStore,
    client: KillSwitchStore,
    platform: KillSwitchStore,
    action: KillSwitchStore,
    notifier: Arc<dyn OperatorNotifier>,
    clock: Arc<dyn Clock>,
}

impl KillSwitchRegistry {
    pub fn new(notifier: Arc<dyn OperatorNotifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            global: KillSwitchStore::new(KillSwitchScope::Global),
            client: KillSwitchStore::new(KillSwitchScope::Client),
            platform: KillSwitchStore::new(KillSwitchScope::Platform),
            action: KillSwitchStore::new(KillSwitchScope::Action),
            notifier,
            clock,
        }
    }

    pub fn store(&self, scope: KillSwitchScope) -> &KillSwitchStore {
        match scope {
            KillSwitchScope::Global => &self.global,
            KillSwitchScope::Client => &self.client,
            KillSwitchScope::Platform => &self.platform,
            KillSwitchScope::Action => &self.action,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn activate(
        &self,
        scope: KillSwitchScope,
        target: Option<&str>,
        input: ActivateInput,
    ) -> Result<KillSwitchState, KillSwitchError> {
        let state = self.store(scope).activate(target, input, self.clock.now())?;
        self.notifier.notify(OperatorNotification::KillSwitchActivated {
            state: state.clone(),
        });
        Ok(state)
    }

    pub fn deactivate(
        &self,
        scope: KillSwitchScope,
        target: Option<&str>,
        input: DeactivateInput,
    ) -> Result<KillSwitchState, KillSwitchError> {
        let state = self.store(scope).deactivate(target, input, self.clock.now())?;
        self.notifier.notify(OperatorNotification::KillSwitchDeactivated {
            state: state.clone(),
        });
        Ok(state)
    }

    pub fn is_active(&self, scope: KillSwitchScope, target: Option<&str>) -> bool {
        self.store(scope).is_active(target)
    }

    pub fn get_state(&self, scope: KillSwitchScope, target: Option<&str>) -> Option<KillSwitchState> {
        self.store(scope).get_state(target)
    }

    pub fn list_active(&self, scope: KillSwitchScope) -> Vec<KillSwitchState> {
        self.store(scope).list_active()
    }

    pub fn get_history(
        &self,
        scope: KillSwitchScope,
        target: Option<&str>,
        limit: usize,
    ) -> Vec<KillSwitchState> {
        self.store(scope).get_history(target, limit)
    }

    /// First active switch covering `context`, checked global → client → platform → action.
    pub fn first_active(&self, context: &ActionContext) -> Option<KillSwitchState> {
        KillSwitchScope::ALL.into_iter().find_map(|scope| {
            let target = context.target_for(scope)?;
            self.store(scope).get_state(target).filter(|s| s.active)
        })
    }

    /// Deactivate every switch whose `scheduled_end` has passed, as `system`.
    pub fn process_scheduled_deactivations(&self, now: DateTime<Utc>) -> Vec<KillSwitchState> {
        let mut deactivated = Vec::new();
        for scope in KillSwitchScope::ALL {
            for target in self.store(scope).expired_targets(now) {
                let input = DeactivateInput::new("scheduled end reached", SYSTEM_ACTOR);
                match self.store(scope).deactivate(target.as_deref(), input, now) {
                    Ok(state) => {
                        self.notifier.notify(OperatorNotification::KillSwitchDeactivated {
                            state: state.clone(),
                        });
                        deactivated.push(state);
                    }
                    // Manually deactivated between the scan and the write.
                    Err(KillSwitchError::NotActive { .. }) => {}
                    Err(error) => tracing::warn!(
                        scope = scope.as_str(),
                        target = target.as_deref().unwrap_or("-"),
                        error = %error,
                        "scheduled kill switch deactivation failed"
                    ),
                }
            }
        }
        deactivated
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::MemoryNotifier;

    fn registry() -> (KillSwitchRegistry, Arc<MemoryNotifier>, Arc<ManualClock>) {
        let notifier = Arc::new(MemoryNotifier::new());
        let clock = Arc::new(ManualClock::default());
        (
            KillSwitchRegistry::new(notifier.clone(), clock.clone()),
            notifier,
            clock,
        )
    }

    fn activation(reason: &str) -> ActivateInput {
        ActivateInput::new(reason, "ops@marshal", Severity::High)
    }

    #[test]
    fn activate_then_deactivate_pairs_into_one_entry() {
        let (registry, notifier, _) = registry();
        registry
            .activate(KillSwitchScope::Client, Some("client_42"), activation("fraud review"))
            .unwrap();
        assert!(registry.is_active(KillSwitchScope::Client, Some("client_42")));

        registry
            .deactivate(
                KillSwitchScope::Client,
                Some("client_42"),
                DeactivateInput::new("cleared", "ops@marshal"),
            )
            .unwrap();
        assert!(!registry.is_active(KillSwitchScope::Client, Some("client_42")));

        let history = registry.get_history(KillSwitchScope::Client, Some("client_42"), 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].deactivated_by.as_deref(), Some("ops@marshal"));
        assert_eq!(history[0].reason, "fraud review");
        assert_eq!(notifier.count("kill_switch_activated"), 1);
        assert_eq!(notifier.count("kill_switch_deactivated"), 1);
    }

    #[test]
    fn reactivation_updates_in_place() {
        let (registry, _, _) = registry();
        let scope = KillSwitchScope::Platform;
        registry.activate(scope, Some("x"), activation("api outage")).unwrap();
        let updated = registry
            .activate(
                scope,
                Some("X"),
                ActivateInput::new("api outage, widened", "oncall", Severity::Critical)
                    .with_incident("INC-7"),
            )
            .unwrap();
        assert_eq!(updated.severity, Severity::Critical);
        assert_eq!(updated.incident_id.as_deref(), Some("INC-7"));
        assert_eq!(updated.activated_by, "ops@marshal");
        assert_eq!(registry.get_history(scope, Some("x"), 50).len(), 1);
    }

    #[test]
    fn reason_must_have_three_characters_after_trim() {
        let (registry, _, _) = registry();
        let err = registry
            .activate(KillSwitchScope::Global, None, activation("  ab  "))
            .unwrap_err();
        assert_eq!(err, KillSwitchError::ReasonTooShort);
        assert!(!registry.is_active(KillSwitchScope::Global, None));
    }

    #[test]
    fn scoped_switches_require_target_and_global_rejects_one() {
        let (registry, _, _) = registry();
        assert_eq!(
            registry
                .activate(KillSwitchScope::Action, None, activation("stop posting"))
                .unwrap_err(),
            KillSwitchError::MissingTarget {
                scope: KillSwitchScope::Action
            }
        );
        assert_eq!(
            registry
                .activate(KillSwitchScope::Global, Some("all"), activation("stop all"))
                .unwrap_err(),
            KillSwitchError::UnexpectedTarget
        );
    }

    #[test]
    fn deactivating_inactive_switch_is_rejected() {
        let (registry, notifier, _) = registry();
        let err = registry
            .deactivate(
                KillSwitchScope::Client,
                Some("nobody"),
                DeactivateInput::new("cleanup", "ops"),
            )
            .unwrap_err();
        assert!(matches!(err, KillSwitchError::NotActive { .. }));
        assert!(notifier.sent().is_empty());
    }

    #[test]
    fn history_is_bounded() {
        let (registry, _, _) = registry();
        for i in 0..(HISTORY_LIMIT + 5) {
            registry
                .activate(KillSwitchScope::Action, Some("publish"), activation(&format!("round {i}")))
                .unwrap();
            registry
                .deactivate(
                    KillSwitchScope::Action,
                    Some("publish"),
                    DeactivateInput::new("round done", "ops"),
                )
                .unwrap();
        }
        let history = registry.get_history(KillSwitchScope::Action, Some("publish"), 500);
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].reason, format!("round {}", HISTORY_LIMIT + 4));
    }

    #[test]
    fn first_active_follows_precedence() {
        let (registry, _, _) = registry();
        let ctx = ActionContext {
            client_id: Some("client_42".into()),
            platform: Some("x".into()),
            action_type: Some("publish".into()),
        };
        assert!(registry.first_active(&ctx).is_none());

        registry
            .activate(KillSwitchScope::Action, Some("publish"), activation("bad template"))
            .unwrap();
        registry
            .activate(KillSwitchScope::Client, Some("client_42"), activation("fraud review"))
            .unwrap();
        assert_eq!(
            registry.first_active(&ctx).map(|s| s.scope),
            Some(KillSwitchScope::Client)
        );

        registry
            .activate(KillSwitchScope::Global, None, activation("incident"))
            .unwrap();
        assert_eq!(
            registry.first_active(&ctx).map(|s| s.scope),
            Some(KillSwitchScope::Global)
        );
    }

    #[test]
    fn scheduled_deactivation_uses_system_actor() {
        let (registry, notifier, clock) = registry();
        let end = clock.now() + Duration::minutes(5);
        registry
            .activate(
                KillSwitchScope::Platform,
                Some("instagram"),
                activation("maintenance").with_scheduled_end(end),
            )
            .unwrap();
        registry
            .activate(KillSwitchScope::Client, Some("client_7"), activation("no end"))
            .unwrap();

        assert!(registry.process_scheduled_deactivations(clock.now()).is_empty());
        clock.advance(Duration::minutes(6));
        let swept = registry.process_scheduled_deactivations(clock.now());
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].deactivated_by.as_deref(), Some(SYSTEM_ACTOR));
        assert!(!registry.is_active(KillSwitchScope::Platform, Some("instagram")));
        assert!(registry.is_active(KillSwitchScope::Client, Some("client_7")));
        assert_eq!(notifier.count("kill_switch_deactivated"), 1);
    }

    #[test]
    fn scheduled_end_in_past_is_rejected() {
        let (registry, _, clock) = registry();
        let err = registry
            .activate(
                KillSwitchScope::Global,
                None,
                activation("too late").with_scheduled_end(clock.now() - Duration::seconds(1)),
            )
            .unwrap_err();
        assert_eq!(err, KillSwitchError::ScheduledEndInPast);
    }
}
