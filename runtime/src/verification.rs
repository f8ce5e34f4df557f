use marshal_core::events::VerificationVerdict;
use marshal_core::tool::{ToolCall, ToolGateway, VerificationProbe};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::VerificationConfig;

/// Probe an action with an unknown outcome until it resolves or the attempt
/// budget runs out. Probes are read-only; nothing here can repeat the effect.
///
/// Returns `None` when cancelled between probes; the action stays pending.
pub async fn verify_outcome(
    gateway: &dyn ToolGateway,
    action_id: Uuid,
    call: &ToolCall,
    config: &VerificationConfig,
    cancel: &CancellationToken,
) -> Option<VerificationVerdict> {
    for attempt in 1..=config.max_attempts {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(action_id = %action_id, attempt, "verification interrupted by cancellation");
                return None;
            }
            _ = tokio::time::sleep(config.backoff(attempt)) => {}
        }

        match gateway.verify(action_id, call).await {
            VerificationProbe::Applied { proof } => {
                tracing::info!(action_id = %action_id, tool_id = %call.tool_id, attempt, "verification confirmed effect");
                return Some(VerificationVerdict::Confirmed { proof });
            }
            VerificationProbe::NotApplied => {
                tracing::info!(action_id = %action_id, tool_id = %call.tool_id, attempt, "verification found no effect");
                return Some(VerificationVerdict::NotApplied);
            }
            VerificationProbe::Inconclusive => {
                tracing::debug!(action_id = %action_id, tool_id = %call.tool_id, attempt, "verification inconclusive");
            }
        }
    }

    tracing::warn!(
        action_id = %action_id,
        tool_id = %call.tool_id,
        attempts = config.max_attempts,
        "verification exhausted without a verdict"
    );
    Some(VerificationVerdict::Unresolved {
        attempts: config.max_attempts,
    })
}
