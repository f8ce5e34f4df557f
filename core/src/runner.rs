//! Runner state machine.
//!
//! One `Runner` owns one episode. `dispatch` is the only mutator: it checks the
//! event against the transition table, consults the policy gate before any
//! high-risk tool call, updates context and budget, and hands back the new
//! state plus an optional derived event and an optional effect for the driver.
//! A rejected event leaves the runner untouched.

mod table;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

pub use table::{is_legal, legal_events};

use crate::audit::{AuditDecision, AuditOutcome, AuditRecord, AuditSink};
use crate::budget::{BudgetDimension, BudgetError, BudgetPolicy, BudgetSignal, ExceededAction, SubcallQuota};
use crate::clock::Clock;
use crate::episode::{
    CycleProgress, Episode, EpisodeCheckpoint, EpisodeSpec, FailureDetail, PendingVerification, Phase,
    RunnerState, SuspendReason,
};
use crate::error::reason;
use crate::events::{ActRequest, ActResult, EventKind, RunnerEvent, VerificationVerdict};
use crate::idempotency::{IdempotencyLedger, Reservation};
use crate::notify::{OperatorNotification, OperatorNotifier};
use crate::policy::{PolicyEnvironment, PolicyGate, PolicyResource, StepUp};
use crate::tool::{ToolCall, ToolOutcome};

/// Shared collaborators handed to every runner.
#[derive(Clone)]
pub struct RunnerDeps {
    pub gate: Arc<PolicyGate>,
    pub ledger: Arc<IdempotencyLedger>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn OperatorNotifier>,
    pub clock: Arc<dyn Clock>,
    pub budget_policy: BudgetPolicy,
}

#[derive(Debug, Error, PartialEq)]
pub enum RunnerError {
    #[error("event {event} is not legal in state {state}")]
    IllegalTransition { state: RunnerState, event: EventKind },
    #[error("action {action_id} has an unresolved outcome; it must be verified first")]
    VerificationPending { action_id: Uuid },
    #[error("no verification is pending for action {action_id}")]
    NoPendingVerification { action_id: Uuid },
    #[error("completion for action {received} does not match the in-flight action")]
    ActionMismatch { expected: Option<Uuid>, received: Uuid },
    #[error("idempotency key '{key}' is held by action {holder}")]
    IdempotencyBusy { key: String, holder: Uuid },
    #[error("episode has no checkpoint to resume from")]
    NoCheckpoint,
    #[error("checkpoint {0} not found on this episode")]
    CheckpointNotFound(Uuid),
    #[error("{dimension} budget still exhausted (used {used} of {limit}); raise the limit before resuming")]
    BudgetStillExceeded {
        dimension: BudgetDimension,
        used: u64,
        limit: u64,
    },
    #[error("episode already {0}")]
    Finished(RunnerState),
    #[error(transparent)]
    Budget(#[from] BudgetError),
}

/// Work the driver must perform after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Execute the call and dispatch `ACT_COMPLETE` with its outcome.
    InvokeTool { action_id: Uuid, call: ToolCall },
    /// Probe the unknown outcome read-only and dispatch `VERIFY_COMPLETE`.
    ScheduleVerification { action_id: Uuid, call: ToolCall },
    /// A checkpoint was synthesized by the runner and still needs persisting.
    PersistCheckpoint(Box<EpisodeCheckpoint>),
    /// The episode reached a terminal state.
    Archive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub event: EventKind,
    pub from: RunnerState,
    pub to: RunnerState,
    pub follow_up: Option<RunnerEvent>,
    pub effect: Option<Effect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Replayed,
    FailedTransient,
    FailedPermanent,
    Unknown,
    NotApplied,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ActionRecord {
    pub action_id: Uuid,
    pub tool_id: String,
    pub idempotency_key: Option<String>,
    pub status: ActionStatus,
    pub reason_code: String,
    pub proof: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct InFlight {
    action_id: Uuid,
    call: ToolCall,
    gated: bool,
    replayed: bool,
}

/// Working memory of one runner.
#[derive(Debug, Clone)]
pub struct RunnerContext {
    pub episode: Episode,
    pub current_phase: Option<Phase>,
    pub phase_data: Map<String, Value>,
    pub loop_count: u64,
    pub last_error: Option<FailureDetail>,
    pub cycle: CycleProgress,
    pub pending_verification: Option<PendingVerification>,
    /// Action the driver should (re)issue next: a retry or a call awaiting step-up.
    pub pending_action: Option<ToolCall>,
    pub failed_attempts: HashMap<String, u32>,
    pub actions: Vec<ActionRecord>,
    pub suspended_for: Option<SuspendReason>,
    granted_step_up: StepUp,
    in_flight: Option<InFlight>,
    active_ms: u64,
    active_since: Option<DateTime<Utc>>,
}

impl RunnerContext {
    fn new(episode: Episode) -> Self {
        Self {
            episode,
            current_phase: None,
            phase_data: Map::new(),
            loop_count: 0,
            last_error: None,
            cycle: CycleProgress::default(),
            pending_verification: None,
            pending_action: None,
            failed_attempts: HashMap::new(),
            actions: Vec::new(),
            suspended_for: None,
            granted_step_up: StepUp::None,
            in_flight: None,
            active_ms: 0,
            active_since: None,
        }
    }

    fn apply_checkpoint(&mut self, checkpoint: &EpisodeCheckpoint) {
        self.current_phase = None;
        self.phase_data = checkpoint.phase_data.clone();
        self.loop_count = checkpoint.loop_count;
        self.cycle = checkpoint.cycle;
        self.pending_verification = checkpoint.pending_verification.clone();
        self.pending_action = checkpoint.pending_action.clone();
    }
}

/// Identity used to count retries: the idempotency key, else the tool id.
fn retry_identity(call: &ToolCall) -> String {
    call.key().map_or_else(|| call.tool_id.clone(), str::to_string)
}

struct Step {
    to: RunnerState,
    follow_up: Option<RunnerEvent>,
    effect: Option<Effect>,
}

impl Step {
    fn to(state: RunnerState) -> Self {
        Self {
            to: state,
            follow_up: None,
            effect: None,
        }
    }

    fn with_follow_up(mut self, event: Option<RunnerEvent>) -> Self {
        self.follow_up = event;
        self
    }

    fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect);
        self
    }
}

pub struct Runner {
    state: RunnerState,
    ctx: RunnerContext,
    deps: RunnerDeps,
    subcalls: SubcallQuota,
}

impl Runner {
    pub fn new(spec: EpisodeSpec, deps: RunnerDeps) -> Self {
        let episode = Episode::new(spec, deps.clock.now());
        let subcalls = SubcallQuota::new(episode.budget.subcalls);
        Self {
            state: RunnerState::Idle,
            ctx: RunnerContext::new(episode),
            deps,
            subcalls,
        }
    }

    /// Rebuild a suspended runner from a durable episode snapshot and checkpoint.
    pub fn restore(mut episode: Episode, checkpoint: EpisodeCheckpoint, deps: RunnerDeps) -> Self {
        episode.budget = checkpoint.budget.clone();
        if !episode.checkpoints.iter().any(|c| c.id == checkpoint.id) {
            episode.checkpoints.push(checkpoint.clone());
        }
        episode.status = RunnerState::Suspended;
        let subcalls = SubcallQuota::new(episode.budget.subcalls);
        let mut ctx = RunnerContext::new(episode);
        ctx.apply_checkpoint(&checkpoint);
        ctx.active_ms = checkpoint.budget.time_ms.used;
        ctx.suspended_for = Some(checkpoint.reason.clone());
        Self {
            state: RunnerState::Suspended,
            ctx,
            deps,
            subcalls,
        }
    }

    pub fn id(&self) -> Uuid {
        self.ctx.episode.id
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn context(&self) -> &RunnerContext {
        &self.ctx
    }

    pub fn episode(&self) -> &Episode {
        &self.ctx.episode
    }

    pub fn loop_count(&self) -> u64 {
        self.ctx.loop_count
    }

    /// Phase the loop continues with from `running`.
    pub fn next_phase(&self) -> Phase {
        self.ctx.cycle.next_pending()
    }

    pub fn subcall_quota(&self) -> SubcallQuota {
        self.subcalls.clone()
    }

    pub fn pending_verification(&self) -> Option<&PendingVerification> {
        self.ctx.pending_verification.as_ref()
    }

    pub fn pending_action(&self) -> Option<&ToolCall> {
        self.ctx.pending_action.as_ref()
    }

    /// Failed attempts recorded for the idempotency key (or tool) of `call`.
    pub fn failed_attempts_for(&self, call: &ToolCall) -> u32 {
        self.ctx
            .failed_attempts
            .get(&retry_identity(call))
            .copied()
            .unwrap_or(0)
    }

    /// Operator change of one budget limit. Touches limits only, never state.
    pub fn raise_budget_limit(&mut self, dimension: BudgetDimension, limit: u64) -> Result<(), RunnerError> {
        if self.state.is_terminal() {
            return Err(RunnerError::Finished(self.state));
        }
        self.sync_subcalls();
        self.ctx.episode.budget.set_limit(dimension, limit)?;
        if dimension == BudgetDimension::Subcalls {
            self.subcalls.set_limit(limit);
        }
        tracing::info!(
            episode_id = %self.id(),
            dimension = dimension.as_str(),
            limit,
            "episode budget limit changed"
        );
        Ok(())
    }

    /// Snapshot for a suspension about to be dispatched. Persist it first,
    /// then dispatch `SUSPEND` carrying it.
    pub fn prepare_checkpoint(&mut self, reason: SuspendReason) -> EpisodeCheckpoint {
        self.refresh_time();
        self.snapshot(reason)
    }

    pub fn dispatch(&mut self, event: RunnerEvent) -> Result<Transition, RunnerError> {
        let from = self.state;
        let kind = event.kind();
        if !is_legal(from, kind) {
            tracing::warn!(
                episode_id = %self.id(),
                state = from.as_str(),
                event = kind.as_str(),
                "illegal runner transition rejected"
            );
            return Err(RunnerError::IllegalTransition {
                state: from,
                event: kind,
            });
        }

        let step = match event {
            RunnerEvent::Start => self.on_start(),
            RunnerEvent::Perceive => self.on_enter_phase(Phase::Perceive),
            RunnerEvent::Plan => self.on_enter_phase(Phase::Plan),
            RunnerEvent::Observe => self.on_enter_phase(Phase::Observe),
            RunnerEvent::Act(request) => self.on_act(request),
            RunnerEvent::PerceiveComplete { data } => Ok(self.on_phase_complete(Phase::Perceive, data, 0, false)),
            RunnerEvent::PlanComplete { data, tokens_used } => {
                Ok(self.on_phase_complete(Phase::Plan, data, tokens_used, false))
            }
            RunnerEvent::ObserveComplete { data, done } => Ok(self.on_phase_complete(Phase::Observe, data, 0, done)),
            RunnerEvent::ActComplete(result) => self.on_act_complete(result),
            RunnerEvent::Suspend { reason, checkpoint } => Ok(self.on_suspend(reason, checkpoint)),
            RunnerEvent::Resume {
                from_checkpoint,
                grant_step_up,
            } => self.on_resume(from_checkpoint, grant_step_up),
            RunnerEvent::Complete { summary } => self.on_complete(summary),
            RunnerEvent::Fail(detail) => Ok(self.on_fail(detail)),
            RunnerEvent::BudgetWarning { dimension } => Ok(self.on_budget_warning(dimension)),
            RunnerEvent::BudgetExceeded { dimension } => Ok(self.on_budget_exceeded(dimension)),
            RunnerEvent::VerifyComplete { action_id, verdict } => self.on_verify_complete(action_id, verdict),
        }?;

        self.state = step.to;
        self.ctx.episode.status = step.to;
        tracing::debug!(
            episode_id = %self.id(),
            event = kind.as_str(),
            from = from.as_str(),
            to = step.to.as_str(),
            follow_up = step.follow_up.as_ref().map(|e| e.kind().as_str()).unwrap_or("-"),
            "runner transition"
        );
        Ok(Transition {
            event: kind,
            from,
            to: step.to,
            follow_up: step.follow_up,
            effect: step.effect,
        })
    }

    /// Dispatch `event` and every derived event after it.
    pub fn run_to_rest(&mut self, event: RunnerEvent) -> Result<Vec<Transition>, RunnerError> {
        let mut transitions = Vec::new();
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let transition = self.dispatch(event)?;
            next = transition.follow_up.clone();
            transitions.push(transition);
        }
        Ok(transitions)
    }

    // ── handlers ────────────────────────────────────────────────────

    fn on_start(&mut self) -> Result<Step, RunnerError> {
        let now = self.deps.clock.now();
        self.ctx.episode.started_at = Some(now);
        self.ctx.active_since = Some(now);
        tracing::info!(
            episode_id = %self.id(),
            client_id = %self.ctx.episode.client_id,
            agent_type = %self.ctx.episode.agent_type,
            "episode started"
        );
        Ok(Step::to(RunnerState::Initializing))
    }

    fn on_enter_phase(&mut self, phase: Phase) -> Result<Step, RunnerError> {
        if phase == Phase::Observe
            && let Some(pending) = &self.ctx.pending_verification
        {
            return Err(RunnerError::VerificationPending {
                action_id: pending.action_id,
            });
        }
        let signal = self.boundary_signal();
        if let BudgetSignal::Exceeded(dimension) = signal {
            return Ok(self.preempt(dimension));
        }
        self.ctx.current_phase = Some(phase);
        Ok(Step::to(phase.state()).with_follow_up(self.signal_follow_up(signal)))
    }

    fn on_act(&mut self, request: ActRequest) -> Result<Step, RunnerError> {
        if let Some(pending) = &self.ctx.pending_verification {
            return Err(RunnerError::VerificationPending {
                action_id: pending.action_id,
            });
        }
        let ActRequest {
            action_id,
            call,
            step_up,
        } = request;
        let identity = retry_identity(&call);
        let is_retry = self.ctx.failed_attempts.get(&identity).copied().unwrap_or(0) > 0;

        if let BudgetSignal::Exceeded(dimension) = self.boundary_signal() {
            return Ok(self.preempt(dimension));
        }
        let budget = &self.ctx.episode.budget;
        if budget.ensure_available(BudgetDimension::ToolCalls, 1).is_err() {
            return Ok(self.preempt(BudgetDimension::ToolCalls));
        }
        if is_retry && budget.ensure_available(BudgetDimension::Retries, 1).is_err() {
            return Ok(self.preempt(BudgetDimension::Retries));
        }

        let classification = self.deps.gate.classify(&call.tool_id);
        let gated = classification.is_high_risk();
        if gated {
            let resource = PolicyResource::for_call(&call, &classification);
            let env = PolicyEnvironment {
                episode_id: self.id(),
                client_id: self.ctx.episode.client_id.clone(),
                side_effecting: true,
                retryable: call.retryable,
                idempotency_key: call.idempotency_key.clone(),
            };
            let decision = self.deps.gate.check(&self.ctx.episode.subject, &resource, &env);
            if !decision.allow {
                self.audit(action_id, &call, AuditDecision::Deny, &decision.reason_code, AuditOutcome::NotAttempted, None);
                self.record_action(action_id, &call, ActionStatus::Denied, &decision.reason_code, None);
                let detail = FailureDetail::new(reason::POLICY_DENIED, decision.message.clone()).with_details(json!({
                    "reason_code": decision.reason_code,
                    "scope": decision.scope,
                    "tool_id": call.tool_id,
                    "action_id": action_id,
                }));
                return Ok(self.on_fail(detail));
            }

            let granted = step_up.max(self.ctx.granted_step_up);
            if decision.required_step_up > granted {
                self.audit(action_id, &call, AuditDecision::Allow, reason::STEP_UP_REQUIRED, AuditOutcome::NotAttempted, None);
                let message = format!(
                    "'{}' requires {} confirmation before it can run",
                    call.tool_id,
                    decision.required_step_up.as_str()
                );
                self.ctx.pending_action = Some(call);
                // Suspend is not accepted from `initializing`, so park in `running` first.
                return Ok(Step::to(RunnerState::Running).with_follow_up(Some(RunnerEvent::suspend(SuspendReason::new(
                    reason::STEP_UP_REQUIRED,
                    message,
                )))));
            }
        }

        let mut replay = None;
        if let Some(key) = call.key() {
            match self.deps.ledger.reserve(key, action_id) {
                Reservation::Fresh => {}
                Reservation::AlreadyConfirmed {
                    action_id: original,
                    proof,
                } => replay = Some((original, proof)),
                Reservation::Busy { action_id: holder } => {
                    return Err(RunnerError::IdempotencyBusy {
                        key: key.to_string(),
                        holder,
                    });
                }
            }
        }

        self.ctx.current_phase = Some(Phase::Act);
        self.ctx.pending_action = None;
        self.ctx.granted_step_up = StepUp::None;

        if let Some((original, proof)) = replay {
            tracing::info!(
                episode_id = %self.id(),
                action_id = %action_id,
                original_action_id = %original,
                "idempotent replay; tool not invoked again"
            );
            self.ctx.in_flight = Some(InFlight {
                action_id,
                call,
                gated,
                replayed: true,
            });
            let result = ActResult {
                action_id,
                outcome: ToolOutcome::Success {
                    output: json!({ "replayed_from": original }),
                    proof,
                },
                tokens_used: 0,
            };
            return Ok(Step::to(RunnerState::Acting).with_follow_up(Some(RunnerEvent::ActComplete(result))));
        }

        let budget = &mut self.ctx.episode.budget;
        budget.add_usage(BudgetDimension::ToolCalls, 1);
        if is_retry {
            budget.add_usage(BudgetDimension::Retries, 1);
        }
        self.ctx.in_flight = Some(InFlight {
            action_id,
            call: call.clone(),
            gated,
            replayed: false,
        });
        Ok(Step::to(RunnerState::Acting).with_effect(Effect::InvokeTool { action_id, call }))
    }

    fn on_act_complete(&mut self, result: ActResult) -> Result<Step, RunnerError> {
        let in_flight = match self.ctx.in_flight.take() {
            Some(in_flight) if in_flight.action_id == result.action_id => in_flight,
            other => {
                let expected = other.as_ref().map(|f| f.action_id);
                self.ctx.in_flight = other;
                return Err(RunnerError::ActionMismatch {
                    expected,
                    received: result.action_id,
                });
            }
        };
        let InFlight {
            action_id,
            call,
            gated,
            replayed,
        } = in_flight;
        let decision = if gated {
            AuditDecision::Allow
        } else {
            AuditDecision::NotGated
        };
        let identity = retry_identity(&call);
        self.ctx
            .episode
            .budget
            .add_usage(BudgetDimension::Tokens, result.tokens_used);
        self.ctx.current_phase = None;

        let mut follow_up = None;
        let mut effect = None;
        match result.outcome {
            ToolOutcome::Success { output, proof } => {
                let (outcome, status) = if replayed {
                    (AuditOutcome::Deduplicated, ActionStatus::Replayed)
                } else {
                    if let Some(key) = call.key() {
                        self.deps.ledger.confirm(key, action_id, proof.clone());
                    }
                    (AuditOutcome::ConfirmedSuccess, ActionStatus::Succeeded)
                };
                self.audit(action_id, &call, decision, reason::ALLOWED, outcome, proof.clone());
                self.record_action(action_id, &call, status, reason::ALLOWED, proof.clone());
                self.ctx.phase_data.insert(
                    Phase::Act.as_str().to_string(),
                    json!({
                        "action_id": action_id,
                        "tool_id": call.tool_id,
                        "output": output,
                        "proof": proof,
                    }),
                );
                self.ctx.failed_attempts.remove(&identity);
                self.ctx.cycle.mark(Phase::Act);
            }
            ToolOutcome::Transient { message } => {
                if let Some(key) = call.key() {
                    self.deps.ledger.release(key, action_id);
                }
                self.audit(action_id, &call, decision, reason::TOOL_TRANSIENT_FAILURE, AuditOutcome::FailedTransient, None);
                self.record_action(action_id, &call, ActionStatus::FailedTransient, reason::TOOL_TRANSIENT_FAILURE, None);
                *self.ctx.failed_attempts.entry(identity).or_insert(0) += 1;
                let detail = FailureDetail::new(reason::TOOL_TRANSIENT_FAILURE, message)
                    .with_details(json!({ "tool_id": call.tool_id, "action_id": action_id }));
                self.ctx.last_error = Some(detail.clone());
                if call.retryable {
                    self.ctx.pending_action = Some(call);
                } else {
                    follow_up = Some(RunnerEvent::Fail(detail));
                }
            }
            ToolOutcome::Permanent { message } => {
                if let Some(key) = call.key() {
                    self.deps.ledger.release(key, action_id);
                }
                self.audit(action_id, &call, decision, reason::TOOL_PERMANENT_FAILURE, AuditOutcome::FailedPermanent, None);
                self.record_action(action_id, &call, ActionStatus::FailedPermanent, reason::TOOL_PERMANENT_FAILURE, None);
                let detail = FailureDetail::new(reason::TOOL_PERMANENT_FAILURE, message)
                    .with_details(json!({ "tool_id": call.tool_id, "action_id": action_id }));
                self.ctx.last_error = Some(detail.clone());
                follow_up = Some(RunnerEvent::Fail(detail));
            }
            ToolOutcome::Unknown { message } => {
                tracing::warn!(
                    episode_id = %self.id(),
                    action_id = %action_id,
                    tool_id = %call.tool_id,
                    message = %message,
                    "tool outcome unknown; halting dependent steps until verified"
                );
                self.mark_unknown(action_id, call.clone(), gated, reason::ALLOWED);
                effect = Some(Effect::ScheduleVerification { action_id, call });
            }
        }

        if follow_up.is_none() {
            let signal = self.boundary_signal();
            follow_up = self.signal_follow_up(signal);
        }
        Ok(Step {
            to: RunnerState::Running,
            follow_up,
            effect,
        })
    }

    fn on_phase_complete(&mut self, phase: Phase, data: Value, tokens_used: u64, done: bool) -> Step {
        self.ctx.phase_data.insert(phase.as_str().to_string(), data);
        self.ctx
            .episode
            .budget
            .add_usage(BudgetDimension::Tokens, tokens_used);
        self.ctx.cycle.mark(phase);
        self.ctx.current_phase = None;

        let mut follow_up = None;
        if phase == Phase::Observe {
            // Observing closes the cycle, whether or not the plan produced an action.
            self.ctx.loop_count += 1;
            self.ctx.cycle.reset();
            if done {
                follow_up = Some(RunnerEvent::Complete { summary: None });
            }
        }
        if follow_up.is_none() {
            let signal = self.boundary_signal();
            follow_up = self.signal_follow_up(signal);
        }
        Step::to(RunnerState::Running).with_follow_up(follow_up)
    }

    fn on_suspend(&mut self, reason: SuspendReason, checkpoint: Option<Box<EpisodeCheckpoint>>) -> Step {
        self.interrupt_in_flight();
        self.fold_active_time();
        let (checkpoint, effect) = match checkpoint {
            Some(checkpoint) => (*checkpoint, None),
            None => {
                let checkpoint = self.snapshot(reason.clone());
                let effect = Effect::PersistCheckpoint(Box::new(checkpoint.clone()));
                (checkpoint, Some(effect))
            }
        };
        tracing::info!(
            episode_id = %self.id(),
            checkpoint_id = %checkpoint.id,
            reason_code = %reason.code,
            dimension = reason.dimension.map(|d| d.as_str()).unwrap_or("-"),
            loop_count = checkpoint.loop_count,
            "episode suspended"
        );
        self.ctx.episode.checkpoints.push(checkpoint);
        self.ctx.suspended_for = Some(reason);
        Step {
            to: RunnerState::Suspended,
            follow_up: None,
            effect,
        }
    }

    fn on_resume(&mut self, from_checkpoint: Option<Uuid>, grant_step_up: StepUp) -> Result<Step, RunnerError> {
        let checkpoint = match from_checkpoint {
            Some(id) => self
                .ctx
                .episode
                .checkpoints
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or(RunnerError::CheckpointNotFound(id))?,
            None => self
                .ctx
                .episode
                .latest_checkpoint()
                .cloned()
                .ok_or(RunnerError::NoCheckpoint)?,
        };

        self.sync_subcalls();
        let budget = &self.ctx.episode.budget;
        let triggering = self
            .ctx
            .suspended_for
            .as_ref()
            .and_then(|r| r.dimension)
            .filter(|d| budget.counter(*d).is_exhausted());
        let blocked = triggering.or_else(|| {
            BudgetDimension::ALL
                .into_iter()
                .find(|d| budget.counter(*d).is_over())
        });
        if let Some(dimension) = blocked {
            let counter = budget.counter(dimension);
            return Err(RunnerError::BudgetStillExceeded {
                dimension,
                used: counter.used,
                limit: counter.limit,
            });
        }

        self.ctx.apply_checkpoint(&checkpoint);
        self.ctx.granted_step_up = grant_step_up;
        self.ctx.suspended_for = None;
        self.ctx.active_since = Some(self.deps.clock.now());
        tracing::info!(
            episode_id = %self.id(),
            checkpoint_id = %checkpoint.id,
            loop_count = checkpoint.loop_count,
            next_phase = self.ctx.cycle.next_pending().as_str(),
            "episode resumed"
        );
        Ok(Step::to(RunnerState::Running))
    }

    fn on_complete(&mut self, summary: Option<Value>) -> Result<Step, RunnerError> {
        if let Some(pending) = &self.ctx.pending_verification {
            return Err(RunnerError::VerificationPending {
                action_id: pending.action_id,
            });
        }
        if let Some(summary) = summary {
            self.ctx.phase_data.insert("summary".to_string(), summary);
        }
        self.finish();
        tracing::info!(
            episode_id = %self.id(),
            loop_count = self.ctx.loop_count,
            "episode completed"
        );
        Ok(Step::to(RunnerState::Completed).with_effect(Effect::Archive))
    }

    fn on_fail(&mut self, detail: FailureDetail) -> Step {
        self.interrupt_in_flight();
        self.finish();
        tracing::warn!(
            episode_id = %self.id(),
            code = %detail.code,
            message = %detail.message,
            "episode failed"
        );
        self.ctx.last_error = Some(detail.clone());
        self.ctx.episode.failure = Some(detail);
        Step::to(RunnerState::Failed).with_effect(Effect::Archive)
    }

    fn on_budget_warning(&mut self, dimension: BudgetDimension) -> Step {
        let counter = *self.ctx.episode.budget.counter(dimension);
        tracing::warn!(
            episode_id = %self.id(),
            dimension = dimension.as_str(),
            used = counter.used,
            limit = counter.limit,
            "episode budget soft threshold reached"
        );
        let follow_up = self.deps.budget_policy.warning_suspends.then(|| {
            RunnerEvent::suspend(SuspendReason::budget(
                reason::BUDGET_WARNING,
                dimension,
                format!(
                    "{dimension} budget at {} of {} (soft threshold {}%)",
                    counter.used, counter.limit, self.deps.budget_policy.soft_threshold_pct
                ),
            ))
        });
        Step::to(self.state).with_follow_up(follow_up)
    }

    fn on_budget_exceeded(&mut self, dimension: BudgetDimension) -> Step {
        let counter = *self.ctx.episode.budget.counter(dimension);
        let action = self.deps.budget_policy.exceeded_action(dimension);
        self.deps.notifier.notify(OperatorNotification::BudgetExceeded {
            episode_id: self.id(),
            client_id: self.ctx.episode.client_id.clone(),
            dimension,
            used: counter.used,
            limit: counter.limit,
            action,
        });
        let message = format!(
            "{dimension} budget exhausted: used {} of {}",
            counter.used, counter.limit
        );
        let follow_up = match action {
            ExceededAction::Suspend => {
                RunnerEvent::suspend(SuspendReason::budget(reason::BUDGET_EXCEEDED, dimension, message))
            }
            ExceededAction::Fail => RunnerEvent::Fail(
                FailureDetail::new(reason::BUDGET_EXCEEDED, message).with_details(json!({
                    "dimension": dimension,
                    "used": counter.used,
                    "limit": counter.limit,
                })),
            ),
        };
        Step::to(self.state).with_follow_up(Some(follow_up))
    }

    fn on_verify_complete(&mut self, action_id: Uuid, verdict: VerificationVerdict) -> Result<Step, RunnerError> {
        let pending = match &self.ctx.pending_verification {
            Some(pending) if pending.action_id == action_id => pending.clone(),
            _ => return Err(RunnerError::NoPendingVerification { action_id }),
        };
        let decision = if pending.gated {
            AuditDecision::Allow
        } else {
            AuditDecision::NotGated
        };
        let call = pending.call;
        let identity = retry_identity(&call);

        let mut follow_up = None;
        match verdict {
            VerificationVerdict::Confirmed { proof } => {
                if let Some(key) = call.key() {
                    self.deps.ledger.confirm(key, action_id, proof.clone());
                }
                self.audit(action_id, &call, decision, reason::ALLOWED, AuditOutcome::ConfirmedSuccess, proof.clone());
                self.record_action(action_id, &call, ActionStatus::Succeeded, reason::ALLOWED, proof.clone());
                self.ctx.phase_data.insert(
                    Phase::Act.as_str().to_string(),
                    json!({
                        "action_id": action_id,
                        "tool_id": call.tool_id,
                        "proof": proof,
                        "verified": true,
                    }),
                );
                self.ctx.failed_attempts.remove(&identity);
                self.ctx.cycle.mark(Phase::Act);
                self.ctx.pending_verification = None;
            }
            VerificationVerdict::NotApplied => {
                if let Some(key) = call.key() {
                    self.deps.ledger.release(key, action_id);
                }
                self.audit(action_id, &call, decision, reason::VERIFICATION_NOT_APPLIED, AuditOutcome::VerifiedNotApplied, None);
                self.record_action(action_id, &call, ActionStatus::NotApplied, reason::VERIFICATION_NOT_APPLIED, None);
                *self.ctx.failed_attempts.entry(identity).or_insert(0) += 1;
                self.ctx.pending_verification = None;
                if call.retryable {
                    self.ctx.pending_action = Some(call);
                } else {
                    follow_up = Some(RunnerEvent::fail(
                        reason::VERIFICATION_NOT_APPLIED,
                        format!("'{}' was not applied and is not retryable", call.tool_id),
                    ));
                }
            }
            VerificationVerdict::Unresolved { attempts } => {
                self.deps.notifier.notify(OperatorNotification::VerificationEscalated {
                    episode_id: self.id(),
                    client_id: self.ctx.episode.client_id.clone(),
                    action_id,
                    tool_id: call.tool_id.clone(),
                    attempts,
                });
                follow_up = Some(RunnerEvent::suspend(SuspendReason::new(
                    reason::VERIFICATION_ESCALATED,
                    format!(
                        "outcome of '{}' (action {action_id}) still unknown after {attempts} checks",
                        call.tool_id
                    ),
                )));
            }
        }
        Ok(Step::to(RunnerState::Running).with_follow_up(follow_up))
    }

    // ── helpers ─────────────────────────────────────────────────────

    /// An episode leaving `acting` before its call reported back cannot assume
    /// anything about that call: its outcome becomes unknown.
    fn interrupt_in_flight(&mut self) {
        let Some(in_flight) = self.ctx.in_flight.take() else {
            return;
        };
        self.ctx.current_phase = None;
        if in_flight.replayed {
            return;
        }
        self.mark_unknown(
            in_flight.action_id,
            in_flight.call,
            in_flight.gated,
            reason::ACTION_INTERRUPTED,
        );
    }

    fn mark_unknown(&mut self, action_id: Uuid, call: ToolCall, gated: bool, reason_code: &str) {
        if let Some(key) = call.key() {
            self.deps.ledger.mark_unknown(key, action_id);
        }
        let decision = if gated {
            AuditDecision::Allow
        } else {
            AuditDecision::NotGated
        };
        self.audit(action_id, &call, decision, reason_code, AuditOutcome::Unknown, None);
        self.record_action(action_id, &call, ActionStatus::Unknown, reason_code, None);
        self.ctx.pending_verification = Some(PendingVerification {
            action_id,
            call,
            gated,
            since: self.deps.clock.now(),
        });
    }

    fn preempt(&mut self, dimension: BudgetDimension) -> Step {
        if self.state == RunnerState::Initializing {
            let counter = *self.ctx.episode.budget.counter(dimension);
            let detail = FailureDetail::new(
                reason::BUDGET_EXCEEDED,
                format!(
                    "{dimension} budget exhausted before the first phase: used {} of {}",
                    counter.used, counter.limit
                ),
            )
            .with_details(json!({ "dimension": dimension, "used": counter.used, "limit": counter.limit }));
            return Step::to(self.state).with_follow_up(Some(RunnerEvent::Fail(detail)));
        }
        Step::to(self.state).with_follow_up(Some(RunnerEvent::BudgetExceeded { dimension }))
    }

    fn signal_follow_up(&self, signal: BudgetSignal) -> Option<RunnerEvent> {
        match signal {
            BudgetSignal::WithinLimits => None,
            BudgetSignal::Warning(dimension) => Some(RunnerEvent::BudgetWarning { dimension }),
            BudgetSignal::Exceeded(dimension) => Some(RunnerEvent::BudgetExceeded { dimension }),
        }
    }

    /// Phase-boundary evaluation: refresh measured dimensions, then check all.
    fn boundary_signal(&mut self) -> BudgetSignal {
        self.sync_subcalls();
        self.refresh_time();
        self.ctx.episode.budget.evaluate(&self.deps.budget_policy)
    }

    fn sync_subcalls(&mut self) {
        self.ctx
            .episode
            .budget
            .raise_usage(BudgetDimension::Subcalls, self.subcalls.used());
    }

    fn active_elapsed(&self, now: DateTime<Utc>) -> u64 {
        let running = self
            .ctx
            .active_since
            .map(|since| u64::try_from((now - since).num_milliseconds()).unwrap_or(0))
            .unwrap_or(0);
        self.ctx.active_ms.saturating_add(running)
    }

    fn refresh_time(&mut self) {
        let total = self.active_elapsed(self.deps.clock.now());
        self.ctx
            .episode
            .budget
            .raise_usage(BudgetDimension::TimeMs, total);
    }

    fn fold_active_time(&mut self) {
        let now = self.deps.clock.now();
        self.ctx.active_ms = self.active_elapsed(now);
        self.ctx.active_since = None;
        let total = self.ctx.active_ms;
        self.ctx
            .episode
            .budget
            .raise_usage(BudgetDimension::TimeMs, total);
    }

    fn finish(&mut self) {
        self.fold_active_time();
        self.ctx.episode.ended_at = Some(self.deps.clock.now());
    }

    fn snapshot(&self, reason: SuspendReason) -> EpisodeCheckpoint {
        EpisodeCheckpoint {
            id: Uuid::now_v7(),
            episode_id: self.id(),
            phase: self.ctx.current_phase.or(self.state.phase()),
            phase_data: self.ctx.phase_data.clone(),
            loop_count: self.ctx.loop_count,
            timestamp: self.deps.clock.now(),
            reason,
            state_before: self.state,
            cycle: self.ctx.cycle,
            budget: self.ctx.episode.budget.clone(),
            pending_verification: self.ctx.pending_verification.clone(),
            pending_action: self.ctx.pending_action.clone(),
        }
    }

    fn audit(
        &self,
        action_id: Uuid,
        call: &ToolCall,
        decision: AuditDecision,
        reason_code: &str,
        outcome: AuditOutcome,
        proof: Option<String>,
    ) {
        self.deps.audit.append(AuditRecord {
            id: Uuid::now_v7(),
            episode_id: self.id(),
            action_id,
            client_id: self.ctx.episode.client_id.clone(),
            tool_id: call.tool_id.clone(),
            idempotency_key: call.key().map(str::to_string),
            decision,
            reason_code: reason_code.to_string(),
            outcome,
            proof,
            recorded_at: self.deps.clock.now(),
        });
    }

    fn record_action(
        &mut self,
        action_id: Uuid,
        call: &ToolCall,
        status: ActionStatus,
        reason_code: &str,
        proof: Option<String>,
    ) {
        let at = self.deps.clock.now();
        self.ctx.actions.push(ActionRecord {
            action_id,
            tool_id: call.tool_id.clone(),
            idempotency_key: call.key().map(str::to_string),
            status,
            reason_code: reason_code.to_string(),
            proof,
            at,
        });
    }
}
