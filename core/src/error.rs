use serde::Serialize;
use utoipa::ToSchema;

/// Structured error response for operators and automation.
/// Every error carries enough context to act on it without reading logs.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error class (e.g. "validation_failed", "not_found", "conflict")
    pub error: String,
    /// Domain-specific machine code (e.g. "CLIENT_KILL_SWITCH_ACTIVE")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human readable description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// The value that was received (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<serde_json::Value>,
    /// Request ID for tracing and debugging
    pub request_id: String,
    /// Hint about what the correct usage looks like
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docs_hint: Option<String>,
}

/// Error classes used across the API
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const FORBIDDEN: &str = "forbidden";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const ILLEGAL_TRANSITION: &str = "illegal_transition";
    pub const BUDGET_STILL_EXCEEDED: &str = "budget_still_exceeded";
}

/// Reason codes attached to policy decisions, failures and forced suspensions.
pub mod reason {
    pub const ALLOWED: &str = "ALLOWED";
    pub const GLOBAL_KILL_SWITCH_ACTIVE: &str = "GLOBAL_KILL_SWITCH_ACTIVE";
    pub const CLIENT_KILL_SWITCH_ACTIVE: &str = "CLIENT_KILL_SWITCH_ACTIVE";
    pub const PLATFORM_KILL_SWITCH_ACTIVE: &str = "PLATFORM_KILL_SWITCH_ACTIVE";
    pub const ACTION_KILL_SWITCH_ACTIVE: &str = "ACTION_KILL_SWITCH_ACTIVE";
    pub const RBAC_DENIED: &str = "RBAC_DENIED";
    pub const ABAC_DENIED: &str = "ABAC_DENIED";
    pub const IDEMPOTENCY_KEY_MISSING: &str = "IDEMPOTENCY_KEY_MISSING";

    pub const POLICY_DENIED: &str = "POLICY_DENIED";
    pub const STEP_UP_REQUIRED: &str = "STEP_UP_REQUIRED";
    pub const BUDGET_WARNING: &str = "BUDGET_WARNING";
    pub const BUDGET_EXCEEDED: &str = "BUDGET_EXCEEDED";
    pub const TOOL_PERMANENT_FAILURE: &str = "TOOL_PERMANENT_FAILURE";
    pub const TOOL_TRANSIENT_FAILURE: &str = "TOOL_TRANSIENT_FAILURE";
    pub const VERIFICATION_NOT_APPLIED: &str = "VERIFICATION_NOT_APPLIED";
    pub const VERIFICATION_ESCALATED: &str = "VERIFICATION_ESCALATED";
    pub const ACTION_INTERRUPTED: &str = "ACTION_INTERRUPTED";
    pub const AGENT_ERROR: &str = "AGENT_ERROR";
    pub const OPERATOR_REQUESTED: &str = "OPERATOR_REQUESTED";
    pub const CANCELLED: &str = "CANCELLED";
    pub const RECOVERY_NO_CHECKPOINT: &str = "RECOVERY_NO_CHECKPOINT";
    pub const RUNTIME_SHUTDOWN: &str = "RUNTIME_SHUTDOWN";
    pub const RETRIES_EXHAUSTED: &str = "RETRIES_EXHAUSTED";
}
