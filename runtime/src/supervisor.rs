//! Owns every live episode in this process: one driver task each, reachable
//! by episode id through a command channel and a snapshot watch.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use marshal_core::budget::{BudgetDimension, SubcallQuota};
use marshal_core::checkpoint::CheckpointStore;
use marshal_core::episode::{EpisodeSpec, FailureDetail, SuspendReason};
use marshal_core::policy::StepUp;
use marshal_core::runner::{Runner, RunnerDeps};
use marshal_core::tool::ToolGateway;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{AgentRegistry, EpisodeAgent};
use crate::config::RuntimeConfig;
use crate::driver::{Command, EpisodeDriver, EpisodeSnapshot, Reply};
use crate::error::RuntimeError;

struct EpisodeHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<EpisodeSnapshot>,
    cancel: CancellationToken,
    subcalls: SubcallQuota,
}

/// Final snapshots of episodes whose driver has exited.
#[derive(Default)]
struct Finished {
    order: VecDeque<Uuid>,
    snapshots: HashMap<Uuid, EpisodeSnapshot>,
}

impl Finished {
    fn insert(&mut self, snapshot: EpisodeSnapshot, capacity: usize) {
        let id = snapshot.episode_id;
        if self.snapshots.insert(id, snapshot).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.snapshots.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: Uuid) {
        if self.snapshots.remove(&id).is_some() {
            self.order.retain(|kept| *kept != id);
        }
    }
}

struct Inner {
    deps: RunnerDeps,
    agents: AgentRegistry,
    gateway: Arc<dyn ToolGateway>,
    store: Arc<dyn CheckpointStore>,
    config: RuntimeConfig,
    episodes: RwLock<HashMap<Uuid, EpisodeHandle>>,
    finished: Mutex<Finished>,
    shutdown: CancellationToken,
    tasks: Mutex<JoinSet<EpisodeSnapshot>>,
}

impl Inner {
    /// Drop the handle of an exited driver, keeping only its final snapshot.
    /// The snapshot lands before the handle leaves so lookups never miss both.
    fn release(&self, snapshot: EpisodeSnapshot) {
        let id = snapshot.episode_id;
        let state = snapshot.state;
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(snapshot, self.config.finished_retention);
        self.episodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        tracing::debug!(episode_id = %id, state = state.as_str(), "episode handle released");
    }

    fn finished_snapshot(&self, id: Uuid) -> Option<EpisodeSnapshot> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshots
            .get(&id)
            .cloned()
    }
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        deps: RunnerDeps,
        agents: AgentRegistry,
        gateway: Arc<dyn ToolGateway>,
        store: Arc<dyn CheckpointStore>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                agents,
                gateway,
                store,
                config,
                episodes: RwLock::new(HashMap::new()),
                finished: Mutex::new(Finished::default()),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn deps(&self) -> &RunnerDeps {
        &self.inner.deps
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.inner.agents
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Cancelled once `shutdown` starts. Background loops hang off it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn start_episode(&self, spec: EpisodeSpec) -> Result<EpisodeSnapshot, RuntimeError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RuntimeError::ShuttingDown);
        }
        let agent = self.inner.agents.resolve(&spec.agent_type)?;
        let runner = Runner::new(spec, self.inner.deps.clone());
        Ok(self.launch(runner, agent))
    }

    /// Start a sub-episode charged against the parent's `subcalls` budget.
    /// A refusal also tells the parent its budget is exhausted.
    pub fn spawn_child(&self, parent_id: Uuid, mut spec: EpisodeSpec) -> Result<EpisodeSnapshot, RuntimeError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RuntimeError::ShuttingDown);
        }
        let (quota, commands, parent) = self.with_handle(parent_id, "spawn_child", |h| {
            (h.subcalls.clone(), h.commands.clone(), h.snapshot.borrow().clone())
        })?;
        if parent.is_terminal() {
            return Err(RuntimeError::NotAllowed {
                episode_id: parent_id,
                state: parent.state,
                operation: "spawn_child",
            });
        }
        let agent = self.inner.agents.resolve(&spec.agent_type)?;

        match quota.try_acquire() {
            Ok(used) => tracing::debug!(
                parent_episode_id = %parent_id,
                subcalls_used = used,
                subcalls_limit = quota.limit(),
                "subcall reserved"
            ),
            Err(err) => {
                tracing::warn!(parent_episode_id = %parent_id, error = %err, "child episode refused");
                let _ = commands.try_send(Command::BudgetExceeded {
                    dimension: BudgetDimension::Subcalls,
                });
                return Err(err.into());
            }
        }

        spec.parent_episode_id = Some(parent_id);
        let runner = Runner::new(spec, self.inner.deps.clone());
        Ok(self.launch(runner, agent))
    }

    /// Hand a runner to a fresh driver task.
    pub(crate) fn launch(&self, runner: Runner, agent: Arc<dyn EpisodeAgent>) -> EpisodeSnapshot {
        let id = runner.id();
        let initial = EpisodeSnapshot::capture(&runner, Utc::now());
        let (commands, command_rx) = mpsc::channel(self.inner.config.command_buffer.max(1));
        let (snapshot_tx, snapshot) = watch::channel(initial.clone());
        let cancel = self.inner.shutdown.child_token();
        let subcalls = runner.subcall_quota();

        let driver = EpisodeDriver::new(
            runner,
            agent,
            self.inner.gateway.clone(),
            self.inner.store.clone(),
            self.inner.config.clone(),
            command_rx,
            snapshot_tx,
            cancel.clone(),
            self.inner.shutdown.clone(),
        );

        self.inner
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.inner
            .episodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                EpisodeHandle {
                    commands,
                    snapshot,
                    cancel,
                    subcalls,
                },
            );

        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(finished) = tasks.try_join_next() {
            if let Err(err) = finished {
                tracing::error!(error = %err, "episode driver task panicked");
            }
        }
        let inner = Arc::downgrade(&self.inner);
        tasks.spawn(async move {
            let last = driver.run().await;
            if let Some(inner) = inner.upgrade() {
                inner.release(last.clone());
            }
            last
        });
        tracing::info!(episode_id = %id, state = initial.state.as_str(), "episode driver launched");
        initial
    }

    /// Run `f` against a live episode. A finished one answers `NotAllowed`
    /// for `operation`.
    fn with_handle<T>(
        &self,
        id: Uuid,
        operation: &'static str,
        f: impl FnOnce(&EpisodeHandle) -> T,
    ) -> Result<T, RuntimeError> {
        let live = {
            let episodes = self.inner.episodes.read().unwrap_or_else(PoisonError::into_inner);
            episodes.get(&id).map(f)
        };
        match (live, self.inner.finished_snapshot(id)) {
            (Some(value), _) => Ok(value),
            (None, Some(last)) => Err(RuntimeError::NotAllowed {
                episode_id: id,
                state: last.state,
                operation,
            }),
            (None, None) => Err(RuntimeError::UnknownEpisode(id)),
        }
    }

    pub fn snapshot(&self, id: Uuid) -> Result<EpisodeSnapshot, RuntimeError> {
        let live = {
            let episodes = self.inner.episodes.read().unwrap_or_else(PoisonError::into_inner);
            episodes.get(&id).map(|h| h.snapshot.borrow().clone())
        };
        live.or_else(|| self.inner.finished_snapshot(id))
            .ok_or(RuntimeError::UnknownEpisode(id))
    }

    /// Live episodes plus the retained final snapshots of finished ones.
    pub fn list(&self) -> Vec<EpisodeSnapshot> {
        let mut snapshots: Vec<EpisodeSnapshot> = {
            let episodes = self.inner.episodes.read().unwrap_or_else(PoisonError::into_inner);
            episodes.values().map(|h| h.snapshot.borrow().clone()).collect()
        };
        let retained: Vec<EpisodeSnapshot> = {
            let finished = self.inner.finished.lock().unwrap_or_else(PoisonError::into_inner);
            finished
                .snapshots
                .values()
                .filter(|s| !snapshots.iter().any(|live| live.episode_id == s.episode_id))
                .cloned()
                .collect()
        };
        snapshots.extend(retained);
        snapshots.sort_by_key(|s| s.episode_id);
        snapshots
    }

    /// Episodes whose driver task is still running.
    pub fn live_count(&self) -> usize {
        self.inner.episodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn request(
        &self,
        id: Uuid,
        operation: &'static str,
        make: impl FnOnce(Reply) -> Command,
    ) -> Result<EpisodeSnapshot, RuntimeError> {
        let (sender, current) =
            self.with_handle(id, operation, |h| (h.commands.clone(), h.snapshot.borrow().clone()))?;
        if current.is_terminal() {
            return Err(RuntimeError::NotAllowed {
                episode_id: id,
                state: current.state,
                operation,
            });
        }
        let (reply, answer) = oneshot::channel();
        sender
            .send(make(reply))
            .await
            .map_err(|_| RuntimeError::EpisodeGone(id))?;
        answer.await.map_err(|_| RuntimeError::EpisodeGone(id))?
    }

    pub async fn suspend(&self, id: Uuid, reason: SuspendReason) -> Result<EpisodeSnapshot, RuntimeError> {
        self.request(id, "suspend", |reply| Command::Suspend { reason, reply })
            .await
    }

    pub async fn resume(
        &self,
        id: Uuid,
        checkpoint_id: Option<Uuid>,
        grant_step_up: StepUp,
    ) -> Result<EpisodeSnapshot, RuntimeError> {
        self.request(id, "resume", |reply| Command::Resume {
            checkpoint_id,
            grant_step_up,
            reply,
        })
        .await
    }

    pub async fn raise_budget(
        &self,
        id: Uuid,
        dimension: BudgetDimension,
        limit: u64,
    ) -> Result<EpisodeSnapshot, RuntimeError> {
        self.request(id, "raise_budget", |reply| Command::RaiseBudget {
            dimension,
            limit,
            reply,
        })
        .await
    }

    pub async fn fail(&self, id: Uuid, detail: FailureDetail) -> Result<EpisodeSnapshot, RuntimeError> {
        self.request(id, "fail", |reply| Command::Fail { detail, reply })
            .await
    }

    /// Stop one episode. An in-flight tool call still completes first.
    pub fn cancel(&self, id: Uuid) -> Result<(), RuntimeError> {
        self.with_handle(id, "cancel", |h| h.cancel.cancel())
    }

    /// Wait until the published snapshot satisfies `predicate`.
    pub async fn wait_until(
        &self,
        id: Uuid,
        predicate: impl Fn(&EpisodeSnapshot) -> bool,
    ) -> Result<EpisodeSnapshot, RuntimeError> {
        let mut snapshot = match self.with_handle(id, "wait", |h| h.snapshot.clone()) {
            Ok(receiver) => receiver,
            Err(RuntimeError::NotAllowed { .. }) => {
                return match self.inner.finished_snapshot(id) {
                    Some(last) if predicate(&last) => Ok(last),
                    _ => Err(RuntimeError::EpisodeGone(id)),
                };
            }
            Err(err) => return Err(err),
        };
        let found = snapshot
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| RuntimeError::EpisodeGone(id))?;
        Ok(found.clone())
    }

    /// Stop accepting work, park every live episode with a checkpoint and
    /// wait for all drivers to exit.
    pub async fn shutdown(&self) -> Vec<EpisodeSnapshot> {
        self.inner.shutdown.cancel();
        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        let mut finished = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(snapshot) => finished.push(snapshot),
                Err(err) => tracing::error!(error = %err, "episode driver task panicked"),
            }
        }
        tracing::info!(episodes = finished.len(), "supervisor stopped");
        finished
    }
}
