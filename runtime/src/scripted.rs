//! Agent that follows a script carried in the episode input:
//!
//! ```json
//! {"steps": [{"perceive": {...}, "plan": {...}, "tokens": 120,
//!             "action": {"tool_id": "publish.post", ...}, "done": false}]}
//! ```
//!
//! Step `n` drives loop `n`; the last step repeats. Used for dry runs, operator
//! rehearsals and tests.

use async_trait::async_trait;
use marshal_core::tool::ToolCall;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::agent::{AgentError, AgentView, EpisodeAgent, Observation, PlanOutput};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScriptStep {
    pub perceive: Value,
    pub plan: Value,
    pub tokens: u64,
    pub action: Option<ToolCall>,
    pub observe: Value,
    pub done: bool,
    /// Make the named phase return an agent error.
    pub fail_in: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Script {
    #[serde(default)]
    steps: Vec<ScriptStep>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptedAgent;

impl ScriptedAgent {
    fn step(view: &AgentView) -> Result<(ScriptStep, bool), AgentError> {
        let script: Script = if view.input.is_null() {
            Script::default()
        } else {
            serde_json::from_value(view.input.clone())
                .map_err(|e| AgentError::new(format!("episode input is not a valid script: {e}")))?
        };
        let Some(last_index) = script.steps.len().checked_sub(1) else {
            return Ok((
                ScriptStep {
                    done: true,
                    ..ScriptStep::default()
                },
                true,
            ));
        };
        let index = usize::try_from(view.loop_count).unwrap_or(usize::MAX).min(last_index);
        let is_last = index == last_index;
        Ok((script.steps[index].clone(), is_last))
    }

    fn check(step: &ScriptStep, phase: &str) -> Result<(), AgentError> {
        match &step.fail_in {
            Some(failing) if failing == phase => Err(AgentError::new(format!("scripted failure in {phase}"))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl EpisodeAgent for ScriptedAgent {
    async fn perceive(&self, view: &AgentView) -> Result<Value, AgentError> {
        let (step, _) = Self::step(view)?;
        Self::check(&step, "perceive")?;
        Ok(step.perceive)
    }

    async fn plan(&self, view: &AgentView) -> Result<PlanOutput, AgentError> {
        let (step, _) = Self::step(view)?;
        Self::check(&step, "plan")?;
        Ok(PlanOutput {
            data: step.plan,
            tokens_used: step.tokens,
            action: step.action,
        })
    }

    async fn observe(&self, view: &AgentView) -> Result<Observation, AgentError> {
        let (step, is_last) = Self::step(view)?;
        Self::check(&step, "observe")?;
        let data = match step.observe {
            Value::Null => json!({ "last_action": view.last_action }),
            data => data,
        };
        Ok(Observation {
            data,
            done: step.done || is_last,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;
    use uuid::Uuid;

    use super::*;

    fn view(input: Value, loop_count: u64) -> AgentView {
        AgentView {
            episode_id: Uuid::now_v7(),
            client_id: "client_1".into(),
            task_type: "publish".into(),
            input,
            loop_count,
            phase_data: Map::new(),
            last_action: None,
        }
    }

    #[tokio::test]
    async fn follows_steps_and_finishes_on_the_last() {
        let input = json!({"steps": [
            {"tokens": 5, "action": {"tool_id": "publish.post", "idempotency_key": "p-1"}},
            {"plan": {"rest": true}}
        ]});
        let agent = ScriptedAgent;

        let plan = agent.plan(&view(input.clone(), 0)).await.unwrap();
        assert_eq!(plan.tokens_used, 5);
        assert_eq!(plan.action.unwrap().key(), Some("p-1"));
        assert!(!agent.observe(&view(input.clone(), 0)).await.unwrap().done);

        let plan = agent.plan(&view(input.clone(), 1)).await.unwrap();
        assert!(plan.action.is_none());
        assert!(agent.observe(&view(input.clone(), 7)).await.unwrap().done);
    }

    #[tokio::test]
    async fn scripted_failures_and_bad_input_are_agent_errors() {
        let agent = ScriptedAgent;
        let failing = json!({"steps": [{"fail_in": "plan"}]});
        assert!(agent.perceive(&view(failing.clone(), 0)).await.is_ok());
        assert!(agent.plan(&view(failing, 0)).await.is_err());
        assert!(agent.perceive(&view(json!({"steps": 3}), 0)).await.is_err());
        assert!(agent.observe(&view(Value::Null, 0)).await.unwrap().done);
    }
}
