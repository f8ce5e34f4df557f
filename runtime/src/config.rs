use std::path::PathBuf;
use std::time::Duration;

use marshal_core::budget::{BudgetDimension, BudgetPolicy};

/// Bounds for the unknown-outcome verification loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationConfig {
    /// Probes before the action is escalated to an operator.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl VerificationConfig {
    /// Delay before probe number `attempt` (1-based). Doubles each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub budget_policy: BudgetPolicy,
    pub verification: VerificationConfig,
    /// How often expired kill switches are swept.
    pub sweep_interval: Duration,
    /// JSON checkpoint directory used when no database is configured.
    pub checkpoint_dir: Option<PathBuf>,
    /// Operator commands buffered per episode.
    pub command_buffer: usize,
    /// Failed attempts of one action (same key, else same tool) before the episode fails.
    pub max_action_attempts: u32,
    /// Final snapshots kept in memory after a driver exits, oldest dropped first.
    pub finished_retention: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            budget_policy: BudgetPolicy::default(),
            verification: VerificationConfig::default(),
            sweep_interval: Duration::from_secs(30),
            checkpoint_dir: None,
            command_buffer: 32,
            max_action_attempts: 3,
            finished_retention: 256,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|raw| raw.trim().parse::<u64>().ok());

        let mut budget_policy = defaults.budget_policy;
        if let Some(pct) = parsed("MARSHAL_SOFT_THRESHOLD_PCT").filter(|p| (1..=100).contains(p)) {
            budget_policy.soft_threshold_pct = pct as u8;
        }
        if let Some(raw) = lookup("MARSHAL_WARNING_SUSPENDS") {
            budget_policy.warning_suspends = matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(raw) = lookup("MARSHAL_FAIL_ON_EXCEEDED") {
            budget_policy.fail_on_exceeded = raw.split(',').filter_map(BudgetDimension::parse).collect();
        }

        let mut verification = defaults.verification;
        if let Some(attempts) = parsed("MARSHAL_VERIFY_MAX_ATTEMPTS").filter(|a| *a > 0) {
            verification.max_attempts = u32::try_from(attempts).unwrap_or(u32::MAX);
        }
        if let Some(ms) = parsed("MARSHAL_VERIFY_BACKOFF_MS") {
            verification.initial_backoff = Duration::from_millis(ms);
        }

        Self {
            budget_policy,
            verification,
            sweep_interval: parsed("MARSHAL_SWEEP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            checkpoint_dir: lookup("MARSHAL_CHECKPOINT_DIR")
                .map(|dir| dir.trim().to_string())
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            command_buffer: defaults.command_buffer,
            max_action_attempts: parsed("MARSHAL_MAX_ACTION_ATTEMPTS")
                .filter(|a| *a > 0)
                .and_then(|a| u32::try_from(a).ok())
                .unwrap_or(defaults.max_action_attempts),
            finished_retention: parsed("MARSHAL_FINISHED_RETENTION")
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(defaults.finished_retention),
        }
    }
}
