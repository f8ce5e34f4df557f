//! Per-episode resource budgets.
//!
//! Five independent counters, each `{used, limit}`. A limit of `0` means the
//! dimension is unlimited. Counters only ever grow; a fresh budget requires a
//! fresh episode.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    Tokens,
    TimeMs,
    Retries,
    Subcalls,
    ToolCalls,
}

impl BudgetDimension {
    pub const ALL: [BudgetDimension; 5] = [
        BudgetDimension::Tokens,
        BudgetDimension::TimeMs,
        BudgetDimension::Retries,
        BudgetDimension::Subcalls,
        BudgetDimension::ToolCalls,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tokens => "tokens",
            Self::TimeMs => "time_ms",
            Self::Retries => "retries",
            Self::Subcalls => "subcalls",
            Self::ToolCalls => "tool_calls",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tokens" => Some(Self::Tokens),
            "time_ms" | "time" => Some(Self::TimeMs),
            "retries" => Some(Self::Retries),
            "subcalls" => Some(Self::Subcalls),
            "tool_calls" => Some(Self::ToolCalls),
            _ => None,
        }
    }
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BudgetCounter {
    pub used: u64,
    /// `0` = unlimited.
    pub limit: u64,
    /// Set once the soft threshold warning fired for the current limit.
    #[serde(default)]
    pub warned: bool,
}

impl BudgetCounter {
    pub fn with_limit(limit: u64) -> Self {
        Self {
            used: 0,
            limit,
            warned: false,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit == 0
    }

    /// Usage went past the limit.
    pub fn is_over(&self) -> bool {
        !self.is_unlimited() && self.used > self.limit
    }

    /// No headroom left: the next increment would go past the limit.
    pub fn is_exhausted(&self) -> bool {
        !self.is_unlimited() && self.used >= self.limit
    }

    pub fn would_exceed(&self, amount: u64) -> bool {
        !self.is_unlimited() && self.used.saturating_add(amount) > self.limit
    }

    pub fn remaining(&self) -> Option<u64> {
        (!self.is_unlimited()).then(|| self.limit.saturating_sub(self.used))
    }

    fn reached_soft_threshold(&self, pct: u8) -> bool {
        !self.is_unlimited() && u128::from(self.used) * 100 >= u128::from(self.limit) * u128::from(pct)
    }
}

/// Requested limits for a new episode. Missing dimensions are unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct BudgetLimits {
    pub tokens: u64,
    pub time_ms: u64,
    pub retries: u64,
    pub subcalls: u64,
    pub tool_calls: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EpisodeBudget {
    pub tokens: BudgetCounter,
    pub time_ms: BudgetCounter,
    pub retries: BudgetCounter,
    pub subcalls: BudgetCounter,
    pub tool_calls: BudgetCounter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExceededAction {
    Suspend,
    Fail,
}

impl ExceededAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Suspend => "suspend",
            Self::Fail => "fail",
        }
    }
}

/// Outcome of charging or evaluating a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetSignal {
    WithinLimits,
    Warning(BudgetDimension),
    Exceeded(BudgetDimension),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BudgetError {
    #[error("{dimension} budget exhausted: used {used} of {limit}, requested {requested}")]
    Exhausted {
        dimension: BudgetDimension,
        used: u64,
        limit: u64,
        requested: u64,
    },
    #[error("new {dimension} limit {requested} is below current usage {used}")]
    LimitBelowUsage {
        dimension: BudgetDimension,
        used: u64,
        requested: u64,
    },
}

impl BudgetError {
    pub fn dimension(&self) -> BudgetDimension {
        match self {
            Self::Exhausted { dimension, .. } | Self::LimitBelowUsage { dimension, .. } => *dimension,
        }
    }
}

/// How the runner reacts to thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPolicy {
    /// Percentage of a limit at which `BUDGET_WARNING` fires.
    pub soft_threshold_pct: u8,
    /// Turn the soft warning into a forced suspend.
    pub warning_suspends: bool,
    /// Dimensions whose exhaustion fails the episode instead of suspending it.
    pub fail_on_exceeded: Vec<BudgetDimension>,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            soft_threshold_pct: 80,
            warning_suspends: false,
            fail_on_exceeded: vec![BudgetDimension::ToolCalls, BudgetDimension::Subcalls],
        }
    }
}

impl BudgetPolicy {
    pub fn exceeded_action(&self, dimension: BudgetDimension) -> ExceededAction {
        if self.fail_on_exceeded.contains(&dimension) {
            ExceededAction::Fail
        } else {
            ExceededAction::Suspend
        }
    }
}

impl EpisodeBudget {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            tokens: BudgetCounter::with_limit(limits.tokens),
            time_ms: BudgetCounter::with_limit(limits.time_ms),
            retries: BudgetCounter::with_limit(limits.retries),
            subcalls: BudgetCounter::with_limit(limits.subcalls),
            tool_calls: BudgetCounter::with_limit(limits.tool_calls),
        }
    }

    pub fn limits(&self) -> BudgetLimits {
        BudgetLimits {
            tokens: self.tokens.limit,
            time_ms: self.time_ms.limit,
            retries: self.retries.limit,
            subcalls: self.subcalls.limit,
            tool_calls: self.tool_calls.limit,
        }
    }

    pub fn counter(&self, dimension: BudgetDimension) -> &BudgetCounter {
        match dimension {
            BudgetDimension::Tokens => &self.tokens,
            BudgetDimension::TimeMs => &self.time_ms,
            BudgetDimension::Retries => &self.retries,
            BudgetDimension::Subcalls => &self.subcalls,
            BudgetDimension::ToolCalls => &self.tool_calls,
        }
    }

    fn counter_mut(&mut self, dimension: BudgetDimension) -> &mut BudgetCounter {
        match dimension {
            BudgetDimension::Tokens => &mut self.tokens,
            BudgetDimension::TimeMs => &mut self.time_ms,
            BudgetDimension::Retries => &mut self.retries,
            BudgetDimension::Subcalls => &mut self.subcalls,
            BudgetDimension::ToolCalls => &mut self.tool_calls,
        }
    }

    /// Add usage without evaluating thresholds.
    pub fn add_usage(&mut self, dimension: BudgetDimension, amount: u64) {
        let counter = self.counter_mut(dimension);
        counter.used = counter.used.saturating_add(amount);
    }

    /// Raise usage to an externally measured total. Never lowers it.
    pub fn raise_usage(&mut self, dimension: BudgetDimension, total: u64) {
        let counter = self.counter_mut(dimension);
        counter.used = counter.used.max(total);
    }

    /// Add `amount` to a counter and report the resulting threshold signal.
    pub fn charge(&mut self, dimension: BudgetDimension, amount: u64, policy: &BudgetPolicy) -> BudgetSignal {
        self.add_usage(dimension, amount);
        self.evaluate_dimension(dimension, policy)
    }

    pub fn observe(&mut self, dimension: BudgetDimension, total: u64, policy: &BudgetPolicy) -> BudgetSignal {
        self.raise_usage(dimension, total);
        self.evaluate_dimension(dimension, policy)
    }

    /// Refuse an increment that would go past the limit. Nothing is charged.
    pub fn ensure_available(&self, dimension: BudgetDimension, amount: u64) -> Result<(), BudgetError> {
        let counter = self.counter(dimension);
        if counter.would_exceed(amount) {
            return Err(BudgetError::Exhausted {
                dimension,
                used: counter.used,
                limit: counter.limit,
                requested: amount,
            });
        }
        Ok(())
    }

    pub fn evaluate_dimension(&mut self, dimension: BudgetDimension, policy: &BudgetPolicy) -> BudgetSignal {
        let counter = self.counter_mut(dimension);
        if counter.is_over() {
            return BudgetSignal::Exceeded(dimension);
        }
        if !counter.warned && counter.reached_soft_threshold(policy.soft_threshold_pct) {
            counter.warned = true;
            return BudgetSignal::Warning(dimension);
        }
        BudgetSignal::WithinLimits
    }

    /// Evaluate every dimension. An exceeded dimension outranks any warning.
    pub fn evaluate(&mut self, policy: &BudgetPolicy) -> BudgetSignal {
        if let Some(dimension) = BudgetDimension::ALL
            .into_iter()
            .find(|d| self.counter(*d).is_over())
        {
            return BudgetSignal::Exceeded(dimension);
        }
        BudgetDimension::ALL
            .into_iter()
            .map(|d| self.evaluate_dimension(d, policy))
            .find(|signal| *signal != BudgetSignal::WithinLimits)
            .unwrap_or(BudgetSignal::WithinLimits)
    }

    /// Change a limit. `0` lifts it entirely. Re-arms the soft warning.
    pub fn set_limit(&mut self, dimension: BudgetDimension, limit: u64) -> Result<(), BudgetError> {
        let counter = self.counter_mut(dimension);
        if limit != 0 && limit < counter.used {
            return Err(BudgetError::LimitBelowUsage {
                dimension,
                used: counter.used,
                requested: limit,
            });
        }
        counter.limit = limit;
        counter.warned = false;
        Ok(())
    }
}

/// Subcall counter shared between a parent runner and the supervisor that
/// spawns its children. Reservations use a CAS loop so concurrent spawns can
/// never overshoot the limit.
#[derive(Debug, Clone)]
pub struct SubcallQuota {
    inner: Arc<QuotaInner>,
}

#[derive(Debug)]
struct QuotaInner {
    used: AtomicU64,
    limit: AtomicU64,
}

impl SubcallQuota {
    pub fn new(counter: BudgetCounter) -> Self {
        Self {
            inner: Arc::new(QuotaInner {
                used: AtomicU64::new(counter.used),
                limit: AtomicU64::new(counter.limit),
            }),
        }
    }

    pub fn used(&self) -> u64 {
        self.inner.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.inner.limit.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit: u64) {
        self.inner.limit.store(limit, Ordering::Release);
    }

    /// Reserve one subcall. Returns the new usage.
    pub fn try_acquire(&self) -> Result<u64, BudgetError> {
        loop {
            let current = self.inner.used.load(Ordering::Acquire);
            let limit = self.limit();
            if limit != 0 && current >= limit {
                return Err(BudgetError::Exhausted {
                    dimension: BudgetDimension::Subcalls,
                    used: current,
                    limit,
                    requested: 1,
                });
            }
            if self
                .inner
                .used
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(current + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(limits: BudgetLimits) -> (EpisodeBudget, BudgetPolicy) {
        (EpisodeBudget::new(limits), BudgetPolicy::default())
    }

    #[test]
    fn warning_fires_once_at_soft_threshold() {
        let (mut budget, policy) = budget(BudgetLimits {
            tokens: 1000,
            ..BudgetLimits::default()
        });
        assert_eq!(budget.charge(BudgetDimension::Tokens, 700, &policy), BudgetSignal::WithinLimits);
        assert_eq!(
            budget.charge(BudgetDimension::Tokens, 100, &policy),
            BudgetSignal::Warning(BudgetDimension::Tokens)
        );
        assert_eq!(budget.charge(BudgetDimension::Tokens, 50, &policy), BudgetSignal::WithinLimits);
        assert_eq!(budget.evaluate(&policy), BudgetSignal::WithinLimits);
    }

    #[test]
    fn exceeded_fires_on_first_increment_past_limit() {
        let (mut budget, policy) = budget(BudgetLimits {
            tokens: 100,
            ..BudgetLimits::default()
        });
        budget.charge(BudgetDimension::Tokens, 100, &policy);
        assert_eq!(
            budget.charge(BudgetDimension::Tokens, 1, &policy),
            BudgetSignal::Exceeded(BudgetDimension::Tokens)
        );
        assert_eq!(budget.evaluate(&policy), BudgetSignal::Exceeded(BudgetDimension::Tokens));
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let (mut budget, policy) = budget(BudgetLimits::default());
        assert_eq!(
            budget.charge(BudgetDimension::ToolCalls, 10_000, &policy),
            BudgetSignal::WithinLimits
        );
        assert!(budget.ensure_available(BudgetDimension::ToolCalls, 1).is_ok());
        assert_eq!(budget.tool_calls.remaining(), None);
    }

    #[test]
    fn ensure_available_does_not_charge() {
        let (mut budget, policy) = budget(BudgetLimits {
            tool_calls: 1,
            ..BudgetLimits::default()
        });
        assert!(budget.ensure_available(BudgetDimension::ToolCalls, 1).is_ok());
        budget.charge(BudgetDimension::ToolCalls, 1, &policy);
        let err = budget.ensure_available(BudgetDimension::ToolCalls, 1).unwrap_err();
        assert_eq!(err.dimension(), BudgetDimension::ToolCalls);
        assert_eq!(budget.tool_calls.used, 1);
    }

    #[test]
    fn observe_never_lowers_usage() {
        let (mut budget, policy) = budget(BudgetLimits::default());
        budget.observe(BudgetDimension::TimeMs, 500, &policy);
        budget.observe(BudgetDimension::TimeMs, 200, &policy);
        assert_eq!(budget.time_ms.used, 500);
    }

    #[test]
    fn raising_limit_rearms_warning_and_rejects_below_usage() {
        let (mut budget, policy) = budget(BudgetLimits {
            tokens: 1000,
            ..BudgetLimits::default()
        });
        budget.charge(BudgetDimension::Tokens, 800, &policy);
        assert!(budget.tokens.warned);
        assert!(matches!(
            budget.set_limit(BudgetDimension::Tokens, 500),
            Err(BudgetError::LimitBelowUsage { .. })
        ));
        budget.set_limit(BudgetDimension::Tokens, 2000).unwrap();
        assert!(!budget.tokens.warned);
        assert_eq!(
            budget.charge(BudgetDimension::Tokens, 800, &policy),
            BudgetSignal::Warning(BudgetDimension::Tokens)
        );
    }

    #[test]
    fn structural_dimensions_fail_by_default() {
        let policy = BudgetPolicy::default();
        assert_eq!(policy.exceeded_action(BudgetDimension::ToolCalls), ExceededAction::Fail);
        assert_eq!(policy.exceeded_action(BudgetDimension::Subcalls), ExceededAction::Fail);
        assert_eq!(policy.exceeded_action(BudgetDimension::Tokens), ExceededAction::Suspend);
        assert_eq!(policy.exceeded_action(BudgetDimension::TimeMs), ExceededAction::Suspend);
    }

    #[test]
    fn concurrent_subcall_reservations_never_overshoot() {
        let quota = SubcallQuota::new(BudgetCounter::with_limit(25));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let quota = quota.clone();
                scope.spawn(move || {
                    for _ in 0..10 {
                        let _ = quota.try_acquire();
                    }
                });
            }
        });
        assert_eq!(quota.used(), 25);
        assert!(quota.try_acquire().is_err());
    }
}
