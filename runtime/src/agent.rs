//! The agent side of an episode: what to perceive, what to do next, and
//! whether the work is finished. Agents never touch the runner directly; the
//! driver feeds their answers back as completion events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use marshal_core::runner::{ActionRecord, Runner};
use marshal_core::tool::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::error::RuntimeError;

/// Read-only view of an episode handed to agent callbacks.
#[derive(Debug, Clone)]
pub struct AgentView {
    pub episode_id: Uuid,
    pub client_id: String,
    pub task_type: String,
    pub input: Value,
    pub loop_count: u64,
    pub phase_data: Map<String, Value>,
    pub last_action: Option<ActionRecord>,
}

impl AgentView {
    pub fn of(runner: &Runner) -> Self {
        let ctx = runner.context();
        Self {
            episode_id: ctx.episode.id,
            client_id: ctx.episode.client_id.clone(),
            task_type: ctx.episode.task_type.clone(),
            input: ctx.episode.input.clone(),
            loop_count: ctx.loop_count,
            phase_data: ctx.phase_data.clone(),
            last_action: ctx.actions.last().cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanOutput {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub tokens_used: u64,
    /// Tool call to execute in the act phase. `None` skips straight to observing.
    #[serde(default)]
    pub action: Option<ToolCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct AgentError {
    pub message: String,
}

impl AgentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait EpisodeAgent: Send + Sync {
    async fn perceive(&self, view: &AgentView) -> Result<Value, AgentError>;

    async fn plan(&self, view: &AgentView) -> Result<PlanOutput, AgentError>;

    async fn observe(&self, view: &AgentView) -> Result<Observation, AgentError>;
}

/// Agents keyed by `agent_type`.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn EpisodeAgent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, agent_type: &str, agent: Arc<dyn EpisodeAgent>) -> Self {
        self.register(agent_type, agent);
        self
    }

    pub fn register(&mut self, agent_type: &str, agent: Arc<dyn EpisodeAgent>) {
        self.agents.insert(agent_type.trim().to_lowercase(), agent);
    }

    pub fn resolve(&self, agent_type: &str) -> Result<Arc<dyn EpisodeAgent>, RuntimeError> {
        self.agents
            .get(&agent_type.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownAgent(agent_type.to_string()))
    }

    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.agents.keys().cloned().collect();
        types.sort();
        types
    }
}
