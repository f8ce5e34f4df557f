//! One driver task per episode.
//!
//! The driver is the only caller of its runner. It walks the perceive → plan →
//! act → observe loop by asking the agent for each phase, performs the effects
//! the runner hands back (tool calls, verification, checkpoint writes, archive)
//! and services operator commands between steps. Checkpoints are written to
//! the durable store before the matching `SUSPEND` is dispatched.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use marshal_core::budget::{BudgetDimension, EpisodeBudget};
use marshal_core::checkpoint::CheckpointStore;
use marshal_core::episode::{FailureDetail, Phase, RunnerState, SuspendReason};
use marshal_core::error::reason;
use marshal_core::events::{ActRequest, ActResult, EventKind, RunnerEvent};
use marshal_core::policy::StepUp;
use marshal_core::runner::{ActionRecord, Effect, Runner, RunnerError, is_legal};
use marshal_core::tool::{ToolCall, ToolGateway};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::agent::{AgentView, EpisodeAgent, PlanOutput};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::verification::verify_outcome;

pub type Reply = oneshot::Sender<Result<EpisodeSnapshot, RuntimeError>>;

/// Operator requests serviced between steps.
#[derive(Debug)]
pub enum Command {
    Suspend {
        reason: SuspendReason,
        reply: Reply,
    },
    Resume {
        checkpoint_id: Option<Uuid>,
        grant_step_up: StepUp,
        reply: Reply,
    },
    RaiseBudget {
        dimension: BudgetDimension,
        limit: u64,
        reply: Reply,
    },
    Fail {
        detail: FailureDetail,
        reply: Reply,
    },
    /// A limit enforced outside the runner (the shared subcall quota) refused work.
    BudgetExceeded { dimension: BudgetDimension },
}

/// Published after every step.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct EpisodeSnapshot {
    pub episode_id: Uuid,
    pub parent_episode_id: Option<Uuid>,
    pub client_id: String,
    pub agent_type: String,
    pub task_type: String,
    pub state: RunnerState,
    pub loop_count: u64,
    pub next_phase: Phase,
    pub budget: EpisodeBudget,
    pub pending_verification: Option<Uuid>,
    pub pending_action: Option<String>,
    pub suspended_for: Option<SuspendReason>,
    pub failure: Option<FailureDetail>,
    pub checkpoint_count: usize,
    pub latest_checkpoint_id: Option<Uuid>,
    pub actions: Vec<ActionRecord>,
    pub updated_at: DateTime<Utc>,
}

impl EpisodeSnapshot {
    pub fn capture(runner: &Runner, now: DateTime<Utc>) -> Self {
        let ctx = runner.context();
        let episode = &ctx.episode;
        Self {
            episode_id: episode.id,
            parent_episode_id: episode.parent_episode_id,
            client_id: episode.client_id.clone(),
            agent_type: episode.agent_type.clone(),
            task_type: episode.task_type.clone(),
            state: runner.state(),
            loop_count: ctx.loop_count,
            next_phase: runner.next_phase(),
            budget: episode.budget.clone(),
            pending_verification: ctx.pending_verification.as_ref().map(|p| p.action_id),
            pending_action: ctx.pending_action.as_ref().map(|c| c.tool_id.clone()),
            suspended_for: ctx.suspended_for.clone(),
            failure: episode.failure.clone(),
            checkpoint_count: episode.checkpoints.len(),
            latest_checkpoint_id: episode.latest_checkpoint().map(|c| c.id),
            actions: ctx.actions.clone(),
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

pub struct EpisodeDriver {
    runner: Runner,
    agent: Arc<dyn EpisodeAgent>,
    gateway: Arc<dyn ToolGateway>,
    store: Arc<dyn CheckpointStore>,
    config: RuntimeConfig,
    commands: mpsc::Receiver<Command>,
    snapshot: watch::Sender<EpisodeSnapshot>,
    /// Cancelled for this episode alone.
    cancel: CancellationToken,
    /// Cancelled when the whole runtime stops.
    shutdown: CancellationToken,
}

impl EpisodeDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: Runner,
        agent: Arc<dyn EpisodeAgent>,
        gateway: Arc<dyn ToolGateway>,
        store: Arc<dyn CheckpointStore>,
        config: RuntimeConfig,
        commands: mpsc::Receiver<Command>,
        snapshot: watch::Sender<EpisodeSnapshot>,
        cancel: CancellationToken,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runner,
            agent,
            gateway,
            store,
            config,
            commands,
            snapshot,
            cancel,
            shutdown,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn publish(&self) {
        self.snapshot
            .send_replace(EpisodeSnapshot::capture(&self.runner, self.now()));
    }

    pub async fn run(mut self) -> EpisodeSnapshot {
        let episode_id = self.runner.id();
        if self.runner.state() == RunnerState::Idle {
            if let Err(err) = self.store.register(self.runner.episode()).await {
                tracing::error!(episode_id = %episode_id, error = %err, "failed to register episode in checkpoint store");
            }
            self.apply_logged(RunnerEvent::Start).await;
        }

        loop {
            self.publish();
            if self.runner.state().is_terminal() {
                break;
            }

            if self.runner.state() == RunnerState::Suspended {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        self.on_cancelled().await;
                        break;
                    }
                    command = self.commands.recv() => match command {
                        Some(command) => self.handle(command).await,
                        None => break,
                    },
                }
                continue;
            }

            while let Ok(command) = self.commands.try_recv() {
                self.handle(command).await;
            }
            if self.cancel.is_cancelled() {
                self.on_cancelled().await;
                break;
            }
            if matches!(self.runner.state(), RunnerState::Running | RunnerState::Initializing) {
                self.step().await;
            }
        }

        self.publish();
        tracing::info!(
            episode_id = %episode_id,
            state = self.runner.state().as_str(),
            loop_count = self.runner.loop_count(),
            "episode driver stopped"
        );
        EpisodeSnapshot::capture(&self.runner, self.now())
    }

    /// Runtime shutdown parks the episode for recovery; a targeted cancel ends it.
    async fn on_cancelled(&mut self) {
        let state = self.runner.state();
        if self.shutdown.is_cancelled() {
            if is_legal(state, EventKind::Suspend) {
                self.apply_logged(RunnerEvent::suspend(SuspendReason::new(
                    reason::RUNTIME_SHUTDOWN,
                    "runtime shutting down; resumes on recovery",
                )))
                .await;
            }
            return;
        }
        if !state.is_terminal() {
            self.apply_logged(RunnerEvent::fail(reason::CANCELLED, "episode cancelled by operator"))
                .await;
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Suspend { reason, reply } => {
                let result = if is_legal(self.runner.state(), EventKind::Suspend) {
                    self.apply(RunnerEvent::suspend(reason)).await.map_err(RuntimeError::from)
                } else {
                    Err(self.not_allowed("suspend"))
                };
                self.reply(reply, result);
            }
            Command::Resume {
                checkpoint_id,
                grant_step_up,
                reply,
            } => {
                let result = self
                    .apply(RunnerEvent::Resume {
                        from_checkpoint: checkpoint_id,
                        grant_step_up,
                    })
                    .await
                    .map_err(RuntimeError::from);
                self.reply(reply, result);
            }
            Command::RaiseBudget {
                dimension,
                limit,
                reply,
            } => {
                let result = self
                    .runner
                    .raise_budget_limit(dimension, limit)
                    .map_err(RuntimeError::from);
                self.reply(reply, result);
            }
            Command::Fail { detail, reply } => {
                let result = if self.runner.state().is_terminal() || self.runner.state() == RunnerState::Idle {
                    Err(self.not_allowed("fail"))
                } else {
                    self.apply(RunnerEvent::Fail(detail)).await.map_err(RuntimeError::from)
                };
                self.reply(reply, result);
            }
            Command::BudgetExceeded { dimension } => {
                let event = if self.runner.state() == RunnerState::Initializing {
                    RunnerEvent::fail(reason::BUDGET_EXCEEDED, format!("{dimension} budget exhausted"))
                } else {
                    RunnerEvent::BudgetExceeded { dimension }
                };
                self.apply_logged(event).await;
            }
        }
    }

    fn not_allowed(&self, operation: &'static str) -> RuntimeError {
        RuntimeError::NotAllowed {
            episode_id: self.runner.id(),
            state: self.runner.state(),
            operation,
        }
    }

    fn reply(&self, reply: Reply, result: Result<(), RuntimeError>) {
        self.publish();
        let _ = reply.send(result.map(|()| EpisodeSnapshot::capture(&self.runner, self.now())));
    }

    /// Advance the loop by one phase.
    async fn step(&mut self) {
        if let Some(pending) = self.runner.pending_verification().cloned() {
            let verdict = verify_outcome(
                self.gateway.as_ref(),
                pending.action_id,
                &pending.call,
                &self.config.verification,
                &self.cancel,
            )
            .await;
            if let Some(verdict) = verdict {
                self.apply_logged(RunnerEvent::VerifyComplete {
                    action_id: pending.action_id,
                    verdict,
                })
                .await;
            }
            return;
        }

        if let Some(call) = self.runner.pending_action().cloned() {
            self.retry(call).await;
            return;
        }

        let planned = self.planned_action();
        let phase = match self.runner.next_phase() {
            Phase::Act if planned.is_none() => Phase::Observe,
            phase => phase,
        };
        match phase {
            Phase::Perceive => {
                if self.enter(RunnerEvent::Perceive, RunnerState::Perceiving).await {
                    let view = AgentView::of(&self.runner);
                    let event = match self.agent.perceive(&view).await {
                        Ok(data) => RunnerEvent::perceive_complete(data),
                        Err(err) => agent_failure("perceive", &err.message),
                    };
                    self.apply_logged(event).await;
                }
            }
            Phase::Plan => {
                if self.enter(RunnerEvent::Plan, RunnerState::Planning).await {
                    let view = AgentView::of(&self.runner);
                    let event = match self.agent.plan(&view).await {
                        Ok(PlanOutput {
                            data,
                            tokens_used,
                            action,
                        }) => RunnerEvent::plan_complete(json!({ "output": data, "action": action }), tokens_used),
                        Err(err) => agent_failure("plan", &err.message),
                    };
                    self.apply_logged(event).await;
                }
            }
            Phase::Act => {
                if let Some(call) = planned {
                    self.apply_logged(RunnerEvent::Act(ActRequest::new(call))).await;
                }
            }
            Phase::Observe => {
                if self.enter(RunnerEvent::Observe, RunnerState::Observing).await {
                    let view = AgentView::of(&self.runner);
                    let event = match self.agent.observe(&view).await {
                        Ok(observation) => RunnerEvent::observe_complete(observation.data, observation.done),
                        Err(err) => agent_failure("observe", &err.message),
                    };
                    self.apply_logged(event).await;
                }
            }
        }
    }

    /// The call recorded by this cycle's plan, if the act phase is still open.
    fn planned_action(&self) -> Option<ToolCall> {
        let ctx = self.runner.context();
        if ctx.cycle.contains(Phase::Act) {
            return None;
        }
        ctx.phase_data
            .get(Phase::Plan.as_str())
            .and_then(|plan| plan.get("action"))
            .filter(|action| !action.is_null())
            .and_then(|action| serde_json::from_value(action.clone()).ok())
    }

    async fn retry(&mut self, call: ToolCall) {
        let attempts = self.runner.failed_attempts_for(&call);
        if attempts >= self.config.max_action_attempts {
            self.apply_logged(RunnerEvent::Fail(
                FailureDetail::new(
                    reason::RETRIES_EXHAUSTED,
                    format!("'{}' failed {attempts} times; giving up", call.tool_id),
                )
                .with_details(json!({ "tool_id": call.tool_id, "attempts": attempts })),
            ))
            .await;
            return;
        }
        self.apply_logged(RunnerEvent::Act(ActRequest::new(call))).await;
    }

    /// Dispatch a phase entry; `true` when the runner actually entered `state`.
    async fn enter(&mut self, event: RunnerEvent, state: RunnerState) -> bool {
        self.apply_logged(event).await;
        self.runner.state() == state
    }

    async fn apply_logged(&mut self, event: RunnerEvent) {
        let kind = event.kind();
        if let Err(err) = self.apply(event).await {
            tracing::error!(
                episode_id = %self.runner.id(),
                event = kind.as_str(),
                state = self.runner.state().as_str(),
                error = %err,
                "runner rejected event"
            );
            // A rejection inside the loop would otherwise repeat forever.
            if self.runner.state() == RunnerState::Running
                && let Err(fail_err) = self
                    .apply(RunnerEvent::fail(reason::AGENT_ERROR, err.to_string()))
                    .await
            {
                tracing::error!(
                    episode_id = %self.runner.id(),
                    state = self.runner.state().as_str(),
                    error = %fail_err,
                    "runner rejected fallback failure; stopping driver"
                );
                self.cancel.cancel();
            }
        }
    }

    /// Dispatch `event`, perform each effect and dispatch what it produced,
    /// then the runner's derived events, until the runner is at rest.
    async fn apply(&mut self, event: RunnerEvent) -> Result<(), RunnerError> {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let event = self.persist_before_suspend(event).await;
            let transition = self.runner.dispatch(event)?;
            if let Some(effect) = transition.effect
                && let Some(next) = self.perform(effect).await
            {
                queue.push_back(next);
            }
            if let Some(follow_up) = transition.follow_up {
                queue.push_back(follow_up);
            }
        }
        Ok(())
    }

    /// Write-then-transition: a suspend without a checkpoint gets one here,
    /// persisted before the runner sees the event.
    async fn persist_before_suspend(&mut self, event: RunnerEvent) -> RunnerEvent {
        let reason = match event {
            RunnerEvent::Suspend {
                reason,
                checkpoint: None,
            } => reason,
            other => return other,
        };
        if !is_legal(self.runner.state(), EventKind::Suspend) {
            return RunnerEvent::suspend(reason);
        }
        let checkpoint = self.runner.prepare_checkpoint(reason.clone());
        if let Err(err) = self.store.save(self.runner.episode(), &checkpoint).await {
            tracing::error!(
                episode_id = %self.runner.id(),
                checkpoint_id = %checkpoint.id,
                error = %err,
                "checkpoint not durable; suspending from memory only"
            );
        }
        RunnerEvent::Suspend {
            reason,
            checkpoint: Some(Box::new(checkpoint)),
        }
    }

    async fn perform(&mut self, effect: Effect) -> Option<RunnerEvent> {
        match effect {
            Effect::InvokeTool { action_id, call } => {
                tracing::info!(
                    episode_id = %self.runner.id(),
                    action_id = %action_id,
                    tool_id = %call.tool_id,
                    "invoking tool"
                );
                // Never raced against cancellation: a dispatched call is always awaited.
                let outcome = self.gateway.invoke(action_id, &call).await;
                Some(RunnerEvent::ActComplete(ActResult {
                    action_id,
                    outcome,
                    tokens_used: 0,
                }))
            }
            Effect::ScheduleVerification { action_id, .. } => {
                tracing::info!(
                    episode_id = %self.runner.id(),
                    action_id = %action_id,
                    "verification scheduled"
                );
                None
            }
            Effect::PersistCheckpoint(checkpoint) => {
                if let Err(err) = self.store.save(self.runner.episode(), &checkpoint).await {
                    tracing::error!(episode_id = %self.runner.id(), error = %err, "checkpoint write failed");
                }
                None
            }
            Effect::Archive => {
                if let Err(err) = self.store.archive(self.runner.episode()).await {
                    tracing::error!(episode_id = %self.runner.id(), error = %err, "episode archive failed");
                }
                None
            }
        }
    }
}

fn agent_failure(phase: &str, message: &str) -> RunnerEvent {
    RunnerEvent::Fail(
        FailureDetail::new(reason::AGENT_ERROR, format!("agent failed during {phase}: {message}"))
            .with_details(json!({ "phase": phase })),
    )
}
