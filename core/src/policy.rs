//! Policy gate consulted synchronously before every high-risk tool call.
//!
//! Evaluation is fail-fast: kill switches (global → client → platform →
//! action), then role and attribute checks, then idempotency key presence.
//! Decisions are computed fresh on every call and never cached.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::reason;
use crate::kill_switch::{ActionContext, KillSwitchRegistry, KillSwitchScope};
use crate::tool::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepUp {
    #[default]
    None,
    Mfa,
    Approval,
}

impl StepUp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Mfa => "mfa",
            Self::Approval => "approval",
        }
    }
}

/// Tool-id prefix → risk classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskRule {
    pub prefix: String,
    pub tier: RiskTier,
    pub action_class: String,
    /// High-tier rules that still demand an MFA confirmation.
    #[serde(default)]
    pub requires_mfa: bool,
}

impl RiskRule {
    pub fn new(prefix: &str, tier: RiskTier, action_class: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            tier,
            action_class: action_class.to_string(),
            requires_mfa: false,
        }
    }

    fn matches(&self, tool_id: &str) -> bool {
        tool_id == self.prefix.trim_end_matches('.') || tool_id.starts_with(&self.prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ToolClassification {
    pub tier: RiskTier,
    pub action_class: String,
    pub step_up: StepUp,
}

impl ToolClassification {
    pub fn is_high_risk(&self) -> bool {
        self.tier >= RiskTier::High
    }
}

#[derive(Debug, Clone)]
pub struct RiskClassifier {
    rules: Vec<RiskRule>,
}

impl Default for RiskClassifier {
    fn default() -> Self {
        let mut direct_message = RiskRule::new("dm.", RiskTier::High, "message");
        direct_message.requires_mfa = true;
        Self::new(vec![
            RiskRule::new("publish.", RiskTier::High, "publish"),
            RiskRule::new("post.", RiskTier::High, "publish"),
            RiskRule::new("message.", RiskTier::High, "message"),
            direct_message,
            RiskRule::new("payment.", RiskTier::Critical, "payment"),
            RiskRule::new("billing.", RiskTier::Critical, "payment"),
            RiskRule::new("delete.", RiskTier::Critical, "delete"),
            RiskRule::new("account.delete", RiskTier::Critical, "delete"),
        ])
    }
}

impl RiskClassifier {
    pub fn new(rules: Vec<RiskRule>) -> Self {
        Self { rules }
    }

    /// Longest matching prefix wins. Unmatched tools are low risk and take
    /// their first id segment as action class.
    pub fn classify(&self, tool_id: &str) -> ToolClassification {
        let tool_id = tool_id.trim().to_ascii_lowercase();
        let rule = self
            .rules
            .iter()
            .filter(|r| r.matches(&tool_id))
            .max_by_key(|r| r.prefix.len());
        match rule {
            Some(rule) => ToolClassification {
                tier: rule.tier,
                action_class: rule.action_class.clone(),
                step_up: match rule.tier {
                    RiskTier::Critical => StepUp::Approval,
                    RiskTier::High if rule.requires_mfa => StepUp::Mfa,
                    _ => StepUp::None,
                },
            },
            None => ToolClassification {
                tier: RiskTier::Low,
                action_class: tool_id.split('.').next().unwrap_or_default().to_string(),
                step_up: StepUp::None,
            },
        }
    }
}

/// Attribute constraints on a role grant. Empty lists are unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct AttributeConstraints {
    pub tenants: Vec<String>,
    pub platforms: Vec<String>,
    pub lanes: Vec<String>,
    pub capabilities: Vec<String>,
    pub max_risk_tier: Option<RiskTier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RoleGrant {
    pub role: String,
    /// Patterns over `resource:action:scope`, with `*` and `prefix:*` wildcards.
    pub permissions: Vec<String>,
    #[serde(default)]
    pub constraints: AttributeConstraints,
}

/// The acting principal of an episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Subject {
    pub id: String,
    /// Home tenant. When set, the subject may only act for that client.
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub grants: Vec<RoleGrant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyResource {
    pub tool_id: String,
    pub action_class: String,
    pub platform: Option<String>,
    pub lane: Option<String>,
    pub capability: Option<String>,
    pub risk_tier: RiskTier,
}

impl PolicyResource {
    pub fn for_call(call: &ToolCall, classification: &ToolClassification) -> Self {
        Self {
            tool_id: call.tool_id.clone(),
            action_class: classification.action_class.clone(),
            platform: call.platform.as_ref().map(|p| p.trim().to_ascii_lowercase()),
            lane: call.lane.clone(),
            capability: call.capability.clone(),
            risk_tier: classification.tier,
        }
    }

    /// Permission string the subject must hold: `tool:<action>:<platform|any>`.
    pub fn permission(&self) -> String {
        format!(
            "tool:{}:{}",
            self.action_class,
            self.platform.as_deref().unwrap_or("any")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyEnvironment {
    pub episode_id: Uuid,
    pub client_id: String,
    pub side_effecting: bool,
    pub retryable: bool,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PolicyDecision {
    pub allow: bool,
    pub reason_code: String,
    pub required_step_up: StepUp,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<KillSwitchScope>,
}

impl PolicyDecision {
    fn deny(reason_code: &str, message: String, scope: Option<KillSwitchScope>) -> Self {
        Self {
            allow: false,
            reason_code: reason_code.to_string(),
            required_step_up: StepUp::None,
            message,
            scope,
        }
    }
}

pub(crate) fn permission_matches(granted: &str, required: &str) -> bool {
    let granted = granted.trim().to_lowercase();
    let required = required.trim().to_lowercase();
    if granted.is_empty() || required.is_empty() {
        return false;
    }
    if granted == "*" || granted == required {
        return true;
    }
    if let Some(prefix) = granted.strip_suffix(":*") {
        return required == prefix || required.starts_with(&format!("{prefix}:"));
    }
    false
}

fn attribute_allows(list: &[String], value: Option<&str>) -> bool {
    if list.is_empty() {
        return true;
    }
    value.is_some_and(|v| list.iter().any(|allowed| allowed == "*" || allowed.eq_ignore_ascii_case(v)))
}

fn constraints_allow(
    subject: &Subject,
    constraints: &AttributeConstraints,
    resource: &PolicyResource,
    env: &PolicyEnvironment,
) -> bool {
    let tenant_ok = if constraints.tenants.is_empty() {
        subject
            .tenant_id
            .as_deref()
            .is_none_or(|tenant| tenant == env.client_id)
    } else {
        attribute_allows(&constraints.tenants, Some(&env.client_id))
    };
    tenant_ok
        && attribute_allows(&constraints.platforms, resource.platform.as_deref())
        && attribute_allows(&constraints.lanes, resource.lane.as_deref())
        && attribute_allows(&constraints.capabilities, resource.capability.as_deref())
        && constraints
            .max_risk_tier
            .is_none_or(|max| resource.risk_tier <= max)
}

pub struct PolicyGate {
    kill_switches: Arc<KillSwitchRegistry>,
    classifier: RiskClassifier,
}

impl PolicyGate {
    pub fn new(kill_switches: Arc<KillSwitchRegistry>, classifier: RiskClassifier) -> Self {
        Self {
            kill_switches,
            classifier,
        }
    }

    pub fn kill_switches(&self) -> &Arc<KillSwitchRegistry> {
        &self.kill_switches
    }

    pub fn classify(&self, tool_id: &str) -> ToolClassification {
        self.classifier.classify(tool_id)
    }

    pub fn check(
        &self,
        subject: &Subject,
        resource: &PolicyResource,
        env: &PolicyEnvironment,
    ) -> PolicyDecision {
        let decision = self.evaluate(subject, resource, env);
        if decision.allow {
            tracing::info!(
                episode_id = %env.episode_id,
                client_id = %env.client_id,
                subject = %subject.id,
                tool_id = %resource.tool_id,
                risk_tier = resource.risk_tier.as_str(),
                step_up = decision.required_step_up.as_str(),
                decision = "allow",
                "policy decision"
            );
        } else {
            tracing::warn!(
                episode_id = %env.episode_id,
                client_id = %env.client_id,
                subject = %subject.id,
                tool_id = %resource.tool_id,
                reason_code = %decision.reason_code,
                decision = "deny",
                "policy decision"
            );
        }
        decision
    }

    fn evaluate(
        &self,
        subject: &Subject,
        resource: &PolicyResource,
        env: &PolicyEnvironment,
    ) -> PolicyDecision {
        let context = ActionContext {
            client_id: Some(env.client_id.clone()),
            platform: resource.platform.clone(),
            action_type: Some(resource.action_class.clone()),
        };
        if let Some(switch) = self.kill_switches.first_active(&context) {
            let scope_label = match &switch.target {
                Some(target) => format!("{} '{}'", switch.scope, target),
                None => switch.scope.to_string(),
            };
            return PolicyDecision::deny(
                switch.scope.deny_reason_code(),
                format!(
                    "{scope_label} kill switch is active ({}, by {}): {}",
                    switch.severity.as_str(),
                    switch.activated_by,
                    switch.reason
                ),
                Some(switch.scope),
            );
        }

        let required = resource.permission();
        let matching: Vec<&RoleGrant> = subject
            .grants
            .iter()
            .filter(|g| g.permissions.iter().any(|p| permission_matches(p, &required)))
            .collect();
        if matching.is_empty() {
            return PolicyDecision::deny(
                reason::RBAC_DENIED,
                format!("subject '{}' holds no role granting '{required}'", subject.id),
                None,
            );
        }
        if !matching
            .iter()
            .any(|g| constraints_allow(subject, &g.constraints, resource, env))
        {
            let roles: Vec<&str> = matching.iter().map(|g| g.role.as_str()).collect();
            return PolicyDecision::deny(
                reason::ABAC_DENIED,
                format!(
                    "roles [{}] grant '{required}' but their attribute constraints exclude client '{}' / tier {}",
                    roles.join(", "),
                    env.client_id,
                    resource.risk_tier.as_str()
                ),
                None,
            );
        }

        let has_key = env
            .idempotency_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty());
        if env.side_effecting && env.retryable && !has_key {
            return PolicyDecision::deny(
                reason::IDEMPOTENCY_KEY_MISSING,
                format!(
                    "retryable side-effecting call '{}' has no idempotency key",
                    resource.tool_id
                ),
                None,
            );
        }

        let classification = self.classifier.classify(&resource.tool_id);
        PolicyDecision {
            allow: true,
            reason_code: reason::ALLOWED.to_string(),
            required_step_up: classification.step_up,
            message: format!("'{}' allowed for '{}'", resource.tool_id, subject.id),
            scope: None,
        }
    }
}
