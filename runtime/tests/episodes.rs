use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use marshal_core::audit::{AuditOutcome, MemoryAuditSink};
use marshal_core::budget::{BudgetDimension, BudgetLimits, BudgetPolicy};
use marshal_core::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use marshal_core::clock::SystemClock;
use marshal_core::episode::{Episode, EpisodeSpec, Phase, RunnerState, SuspendReason};
use marshal_core::idempotency::IdempotencyLedger;
use marshal_core::kill_switch::{ActivateInput, KillSwitchRegistry, KillSwitchScope, Severity};
use marshal_core::notify::MemoryNotifier;
use marshal_core::policy::{AttributeConstraints, PolicyGate, RiskClassifier, RoleGrant, StepUp, Subject};
use marshal_core::runner::RunnerDeps;
use marshal_core::tool::{ToolOutcome, VerificationProbe};
use marshal_runtime::agent::{AgentError, AgentRegistry, AgentView, EpisodeAgent, Observation, PlanOutput};
use marshal_runtime::config::{RuntimeConfig, VerificationConfig};
use marshal_runtime::gateway::RecordingGateway;
use marshal_runtime::scripted::ScriptedAgent;
use marshal_runtime::{EpisodeSnapshot, RuntimeError, Supervisor};
use serde_json::{Value, json};
use uuid::Uuid;

/// Never finishes; each perceive takes a few milliseconds.
struct LoopingAgent;

#[async_trait]
impl EpisodeAgent for LoopingAgent {
    async fn perceive(&self, view: &AgentView) -> Result<Value, AgentError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(json!({ "tick": view.loop_count }))
    }

    async fn plan(&self, _view: &AgentView) -> Result<PlanOutput, AgentError> {
        Ok(PlanOutput {
            data: json!({}),
            tokens_used: 0,
            action: None,
        })
    }

    async fn observe(&self, _view: &AgentView) -> Result<Observation, AgentError> {
        Ok(Observation {
            data: json!({}),
            done: false,
        })
    }
}

struct Rig {
    supervisor: Supervisor,
    gateway: Arc<RecordingGateway>,
    store: Arc<MemoryCheckpointStore>,
    audit: Arc<MemoryAuditSink>,
    notifier: Arc<MemoryNotifier>,
    registry: Arc<KillSwitchRegistry>,
}

fn rig(policy: BudgetPolicy) -> Rig {
    rig_with_store(policy, Arc::new(MemoryCheckpointStore::new()))
}

fn rig_with_store(budget_policy: BudgetPolicy, store: Arc<MemoryCheckpointStore>) -> Rig {
    rig_with(budget_policy, store, RuntimeConfig::default().finished_retention)
}

fn rig_with(budget_policy: BudgetPolicy, store: Arc<MemoryCheckpointStore>, finished_retention: usize) -> Rig {
    let clock = Arc::new(SystemClock);
    let audit = Arc::new(MemoryAuditSink::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let registry = Arc::new(KillSwitchRegistry::new(notifier.clone(), clock.clone()));
    let gateway = Arc::new(RecordingGateway::new());
    let deps = RunnerDeps {
        gate: Arc::new(PolicyGate::new(registry.clone(), RiskClassifier::default())),
        ledger: Arc::new(IdempotencyLedger::new()),
        audit: audit.clone(),
        notifier: notifier.clone(),
        clock,
        budget_policy: budget_policy.clone(),
    };
    let config = RuntimeConfig {
        budget_policy,
        verification: VerificationConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        },
        finished_retention,
        ..RuntimeConfig::default()
    };
    let agents = AgentRegistry::new()
        .with("scripted", Arc::new(ScriptedAgent))
        .with("looping", Arc::new(LoopingAgent));
    let supervisor = Supervisor::new(deps, agents, gateway.clone(), store.clone(), config);
    Rig {
        supervisor,
        gateway,
        store,
        audit,
        notifier,
        registry,
    }
}

fn spec(agent_type: &str, client_id: &str, budget: BudgetLimits, input: Value) -> EpisodeSpec {
    EpisodeSpec {
        agent_type: agent_type.into(),
        task_type: "weekly_post".into(),
        client_id: client_id.into(),
        parent_episode_id: None,
        subject: Subject {
            id: "agent-publisher".into(),
            tenant_id: Some(client_id.into()),
            grants: vec![RoleGrant {
                role: "operator".into(),
                permissions: vec!["tool:*".into()],
                constraints: AttributeConstraints::default(),
            }],
        },
        budget,
        input,
    }
}

fn publish_step(key: &str) -> Value {
    json!({
        "perceive": {"feed": []},
        "plan": {"next": "publish"},
        "tokens": 10,
        "action": {"tool_id": "publish.post", "platform": "x", "idempotency_key": key, "input": {"text": "hello"}}
    })
}

async fn settle(supervisor: &Supervisor, id: Uuid) -> EpisodeSnapshot {
    wait(supervisor, id, |s| s.is_terminal() || s.state == RunnerState::Suspended).await
}

async fn wait(supervisor: &Supervisor, id: Uuid, predicate: impl Fn(&EpisodeSnapshot) -> bool) -> EpisodeSnapshot {
    tokio::time::timeout(Duration::from_secs(5), supervisor.wait_until(id, predicate))
        .await
        .expect("episode did not reach the expected state in time")
        .unwrap()
}

#[tokio::test]
async fn scripted_episode_completes_and_is_archived() {
    let rig = rig(BudgetPolicy::default());
    let input = json!({"steps": [publish_step("post-1"), {"plan": {"rest": true}, "done": true}]});
    let started = rig
        .supervisor
        .start_episode(spec("scripted", "client_1", BudgetLimits::default(), input))
        .unwrap();

    let done = settle(&rig.supervisor, started.episode_id).await;
    assert_eq!(done.state, RunnerState::Completed);
    assert_eq!(done.loop_count, 2);
    assert_eq!(done.budget.tool_calls.used, 1);
    assert_eq!(done.budget.tokens.used, 10);
    assert_eq!(rig.gateway.invocation_count(), 1);
    assert_eq!(rig.audit.count_outcome(AuditOutcome::ConfirmedSuccess), 1);
    assert!(rig.store.list_unfinished().await.unwrap().is_empty());
}

#[tokio::test]
async fn second_tool_call_past_the_limit_fails_before_invocation() {
    let rig = rig(BudgetPolicy::default());
    let input = json!({"steps": [publish_step("post-1"), publish_step("post-2")]});
    let limits = BudgetLimits {
        tool_calls: 1,
        ..BudgetLimits::default()
    };
    let started = rig
        .supervisor
        .start_episode(spec("scripted", "client_1", limits, input))
        .unwrap();

    let done = settle(&rig.supervisor, started.episode_id).await;
    assert_eq!(done.state, RunnerState::Failed);
    assert_eq!(done.failure.unwrap().code, "BUDGET_EXCEEDED");
    assert_eq!(rig.gateway.invocation_count(), 1);
    assert_eq!(done.budget.tool_calls.used, 1);
    assert_eq!(rig.notifier.count("budget_exceeded"), 1);
}

#[tokio::test]
async fn client_kill_switch_stops_only_that_client() {
    let rig = rig(BudgetPolicy::default());
    rig.registry
        .activate(
            KillSwitchScope::Client,
            Some("client_42"),
            ActivateInput::new("fraud review", "ops@example.com", Severity::High),
        )
        .unwrap();
    let input = json!({"steps": [publish_step("post-1")]});

    let blocked = rig
        .supervisor
        .start_episode(spec("scripted", "client_42", BudgetLimits::default(), input.clone()))
        .unwrap();
    let blocked = settle(&rig.supervisor, blocked.episode_id).await;
    assert_eq!(blocked.state, RunnerState::Failed);
    let failure = blocked.failure.unwrap();
    assert_eq!(failure.code, "POLICY_DENIED");
    assert_eq!(failure.details.unwrap()["reason_code"], "CLIENT_KILL_SWITCH_ACTIVE");
    assert_eq!(rig.gateway.invocation_count(), 0);

    let allowed = rig
        .supervisor
        .start_episode(spec("scripted", "client_43", BudgetLimits::default(), input))
        .unwrap();
    let allowed = settle(&rig.supervisor, allowed.episode_id).await;
    assert_eq!(allowed.state, RunnerState::Completed);
    assert_eq!(rig.gateway.invocation_count(), 1);
}

#[tokio::test]
async fn unknown_outcome_is_verified_instead_of_reinvoked() {
    let rig = rig(BudgetPolicy::default());
    rig.gateway.push_outcome(
        "publish.post",
        [ToolOutcome::Unknown {
            message: "gateway timeout".into(),
        }],
    );
    rig.gateway.push_probe(
        "publish.post",
        [
            VerificationProbe::Inconclusive,
            VerificationProbe::Applied {
                proof: Some("https://x.example/p/9".into()),
            },
        ],
    );
    let input = json!({"steps": [publish_step("post-1")]});
    let started = rig
        .supervisor
        .start_episode(spec("scripted", "client_1", BudgetLimits::default(), input))
        .unwrap();

    let done = settle(&rig.supervisor, started.episode_id).await;
    assert_eq!(done.state, RunnerState::Completed);
    assert_eq!(rig.gateway.invocation_count(), 1);
    assert_eq!(rig.gateway.probe_count(), 2);
    assert_eq!(rig.audit.count_outcome(AuditOutcome::Unknown), 1);
    assert_eq!(rig.audit.count_outcome(AuditOutcome::ConfirmedSuccess), 1);
    let last = done.actions.last().unwrap();
    assert_eq!(last.proof.as_deref(), Some("https://x.example/p/9"));
}

#[tokio::test]
async fn unresolved_outcome_escalates_without_observing() {
    let rig = rig(BudgetPolicy::default());
    rig.gateway.push_outcome(
        "publish.post",
        [ToolOutcome::Unknown {
            message: "connection reset".into(),
        }],
    );
    let input = json!({"steps": [publish_step("post-1")]});
    let started = rig
        .supervisor
        .start_episode(spec("scripted", "client_1", BudgetLimits::default(), input))
        .unwrap();

    let parked = settle(&rig.supervisor, started.episode_id).await;
    assert_eq!(parked.state, RunnerState::Suspended);
    assert_eq!(parked.suspended_for.unwrap().code, "VERIFICATION_ESCALATED");
    assert!(parked.pending_verification.is_some());
    assert_eq!(parked.loop_count, 0);
    assert_eq!(rig.gateway.probe_count(), 3);
    assert_eq!(rig.gateway.invocation_count(), 1);
    assert_eq!(rig.notifier.count("verification_escalated"), 1);
}

#[tokio::test]
async fn warning_suspend_resumes_at_the_saved_phase_after_raise() {
    let rig = rig(BudgetPolicy {
        warning_suspends: true,
        ..BudgetPolicy::default()
    });
    let mut step = publish_step("post-1");
    step["tokens"] = json!(85);
    let limits = BudgetLimits {
        tokens: 100,
        ..BudgetLimits::default()
    };
    let started = rig
        .supervisor
        .start_episode(spec("scripted", "client_1", limits, json!({"steps": [step]})))
        .unwrap();
    let id = started.episode_id;

    let parked = settle(&rig.supervisor, id).await;
    assert_eq!(parked.state, RunnerState::Suspended);
    let reason = parked.suspended_for.clone().unwrap();
    assert_eq!(reason.code, "BUDGET_WARNING");
    assert_eq!(reason.dimension, Some(BudgetDimension::Tokens));
    assert_eq!(parked.next_phase, Phase::Act);
    assert_eq!(parked.loop_count, 0);
    assert_eq!(parked.checkpoint_count, 1);
    assert_eq!(rig.gateway.invocation_count(), 0);
    assert!(rig.store.load(id, None).await.is_ok());

    rig.supervisor
        .raise_budget(id, BudgetDimension::Tokens, 1000)
        .await
        .unwrap();
    let resumed = rig.supervisor.resume(id, None, StepUp::None).await.unwrap();
    assert_eq!(resumed.loop_count, 0);

    let done = settle(&rig.supervisor, id).await;
    assert_eq!(done.state, RunnerState::Completed);
    assert_eq!(done.loop_count, 1);
    assert_eq!(done.budget.tokens.limit, 1000);
    assert_eq!(rig.gateway.invocation_count(), 1);
}

#[tokio::test]
async fn critical_tool_waits_for_approval() {
    let rig = rig(BudgetPolicy::default());
    let input = json!({"steps": [{
        "action": {"tool_id": "payment.refund", "idempotency_key": "refund-7", "input": {"amount": 40}}
    }]});
    let started = rig
        .supervisor
        .start_episode(spec("scripted", "client_1", BudgetLimits::default(), input))
        .unwrap();
    let id = started.episode_id;

    let parked = settle(&rig.supervisor, id).await;
    assert_eq!(parked.suspended_for.unwrap().code, "STEP_UP_REQUIRED");
    assert_eq!(parked.pending_action.as_deref(), Some("payment.refund"));
    assert_eq!(rig.gateway.invocation_count(), 0);

    rig.supervisor.resume(id, None, StepUp::Approval).await.unwrap();
    let done = settle(&rig.supervisor, id).await;
    assert_eq!(done.state, RunnerState::Completed);
    assert_eq!(rig.gateway.invocation_count(), 1);
}

#[tokio::test]
async fn operator_suspend_and_resume_keep_the_loop_going() {
    let rig = rig(BudgetPolicy::default());
    let started = rig
        .supervisor
        .start_episode(spec("looping", "client_1", BudgetLimits::default(), Value::Null))
        .unwrap();
    let id = started.episode_id;
    wait(&rig.supervisor, id, |s| s.loop_count >= 1).await;

    let parked = rig
        .supervisor
        .suspend(id, SuspendReason::new("OPERATOR_REQUESTED", "maintenance window"))
        .await
        .unwrap();
    assert_eq!(parked.state, RunnerState::Suspended);
    assert_eq!(parked.checkpoint_count, 1);
    let loops_at_suspend = parked.loop_count;

    let err = rig
        .supervisor
        .suspend(id, SuspendReason::new("OPERATOR_REQUESTED", "again"))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::NotAllowed { operation: "suspend", .. }));

    rig.supervisor.resume(id, None, StepUp::None).await.unwrap();
    wait(&rig.supervisor, id, |s| s.loop_count > loops_at_suspend).await;

    rig.supervisor.cancel(id).unwrap();
    let done = settle(&rig.supervisor, id).await;
    assert_eq!(done.state, RunnerState::Failed);
    assert_eq!(done.failure.unwrap().code, "CANCELLED");
}

#[tokio::test]
async fn shutdown_parks_episodes_and_recovery_resumes_them() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let first = rig_with_store(BudgetPolicy::default(), store.clone());
    let started = first
        .supervisor
        .start_episode(spec("looping", "client_1", BudgetLimits::default(), Value::Null))
        .unwrap();
    let id = started.episode_id;
    wait(&first.supervisor, id, |s| s.loop_count >= 2).await;

    let stopped = first.supervisor.shutdown().await;
    let parked = stopped.iter().find(|s| s.episode_id == id).unwrap();
    assert_eq!(parked.state, RunnerState::Suspended);
    assert_eq!(parked.suspended_for.as_ref().unwrap().code, "RUNTIME_SHUTDOWN");
    assert!(matches!(
        first
            .supervisor
            .start_episode(spec("looping", "client_1", BudgetLimits::default(), Value::Null)),
        Err(RuntimeError::ShuttingDown)
    ));
    assert_eq!(store.list_unfinished().await.unwrap(), vec![id]);

    let second = rig_with_store(BudgetPolicy::default(), store.clone());
    let report = second.supervisor.recover().await.unwrap();
    assert_eq!(report.resumed, vec![id]);
    let loops = parked.loop_count;
    wait(&second.supervisor, id, |s| s.loop_count > loops).await;

    second.supervisor.cancel(id).unwrap();
    settle(&second.supervisor, id).await;
    assert!(store.list_unfinished().await.unwrap().is_empty());
}

#[tokio::test]
async fn recovery_fails_episodes_that_never_checkpointed() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let crashed = Episode::new(
        spec("scripted", "client_1", BudgetLimits::default(), Value::Null),
        Utc::now(),
    );
    store.register(&crashed).await.unwrap();

    let rig = rig_with_store(BudgetPolicy::default(), store.clone());
    let report = rig.supervisor.recover().await.unwrap();
    assert_eq!(report.failed, vec![crashed.id]);
    assert!(store.list_unfinished().await.unwrap().is_empty());
    let archived = store.load_episode(crashed.id).await.unwrap();
    assert_eq!(archived.status, RunnerState::Failed);
    assert_eq!(archived.failure.unwrap().code, "RECOVERY_NO_CHECKPOINT");
}

#[tokio::test]
async fn child_spawns_are_capped_by_the_parent_subcall_budget() {
    let rig = rig(BudgetPolicy::default());
    let limits = BudgetLimits {
        subcalls: 1,
        ..BudgetLimits::default()
    };
    let parent = rig
        .supervisor
        .start_episode(spec("looping", "client_1", limits, Value::Null))
        .unwrap();
    let parent_id = parent.episode_id;

    let child = rig
        .supervisor
        .spawn_child(parent_id, spec("scripted", "client_1", BudgetLimits::default(), Value::Null))
        .unwrap();
    assert_eq!(child.parent_episode_id, Some(parent_id));
    let child = settle(&rig.supervisor, child.episode_id).await;
    assert_eq!(child.state, RunnerState::Completed);

    let refused = rig
        .supervisor
        .spawn_child(parent_id, spec("scripted", "client_1", BudgetLimits::default(), Value::Null))
        .unwrap_err();
    assert!(matches!(refused, RuntimeError::Budget(_)));

    let parent = settle(&rig.supervisor, parent_id).await;
    assert_eq!(parent.state, RunnerState::Failed);
    assert_eq!(parent.failure.unwrap().code, "BUDGET_EXCEEDED");
}

#[tokio::test]
async fn unknown_agent_types_are_rejected_up_front() {
    let rig = rig(BudgetPolicy::default());
    let err = rig
        .supervisor
        .start_episode(spec("planner", "client_1", BudgetLimits::default(), Value::Null))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownAgent(name) if name == "planner"));
    assert!(rig.supervisor.list().is_empty());
}

#[tokio::test]
async fn finished_episodes_release_their_driver_handles() {
    let rig = rig_with(BudgetPolicy::default(), Arc::new(MemoryCheckpointStore::new()), 8);
    let mut ids = Vec::new();
    for _ in 0..20 {
        let started = rig
            .supervisor
            .start_episode(spec("scripted", "client_1", BudgetLimits::default(), Value::Null))
            .unwrap();
        let done = settle(&rig.supervisor, started.episode_id).await;
        assert_eq!(done.state, RunnerState::Completed);
        ids.push(started.episode_id);
    }

    for _ in 0..200 {
        if rig.supervisor.live_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(rig.supervisor.live_count(), 0);
    assert_eq!(rig.supervisor.list().len(), 8);

    let newest = *ids.last().unwrap();
    assert_eq!(rig.supervisor.snapshot(newest).unwrap().state, RunnerState::Completed);
    assert!(matches!(
        rig.supervisor.snapshot(ids[0]),
        Err(RuntimeError::UnknownEpisode(_))
    ));
    assert!(matches!(
        rig.supervisor.cancel(newest),
        Err(RuntimeError::NotAllowed { operation: "cancel", .. })
    ));
    assert!(matches!(
        rig.supervisor
            .suspend(newest, SuspendReason::new("OPERATOR_REQUESTED", "too late"))
            .await,
        Err(RuntimeError::NotAllowed { operation: "suspend", .. })
    ));
}
