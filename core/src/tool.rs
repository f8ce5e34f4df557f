use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// A side-effecting (or read-only) call an agent wants executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ToolCall {
    /// Dotted identifier, e.g. `publish.post` or `payment.refund`.
    pub tool_id: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Whether a transient failure may be retried with the same key.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

impl ToolCall {
    pub fn new(tool_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            tool_id: tool_id.into(),
            input,
            platform: None,
            lane: None,
            capability: None,
            idempotency_key: None,
            retryable: true,
        }
    }

    pub fn on_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }

    pub fn not_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// The idempotency key, if present and non-blank.
    pub fn key(&self) -> Option<&str> {
        self.idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

/// What the gateway observed when it executed a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success {
        #[serde(default)]
        output: serde_json::Value,
        /// Pointer to evidence of the effect (post URL, receipt id, ...).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        proof: Option<String>,
    },
    /// Safe to retry with the same idempotency key.
    Transient { message: String },
    /// Retrying cannot help.
    Permanent { message: String },
    /// The effect may or may not have happened (timeout after send, lost ack).
    Unknown { message: String },
}

impl ToolOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Transient { .. } => "transient",
            Self::Permanent { .. } => "permanent",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// Result of a read-only check of whether an action's effect exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationProbe {
    Applied { proof: Option<String> },
    NotApplied,
    Inconclusive,
}

/// Executes tool calls on external systems.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    async fn invoke(&self, action_id: Uuid, call: &ToolCall) -> ToolOutcome;

    /// Read-only probe. Must never repeat the effect.
    async fn verify(&self, action_id: Uuid, call: &ToolCall) -> VerificationProbe;
}
