use clap::{Subcommand, ValueEnum};
use serde_json::json;
use uuid::Uuid;

use crate::util::{Target, api_request, exit_error, read_json_from_file};

#[derive(Subcommand)]
pub enum EpisodeCommands {
    /// Start an episode from an EpisodeSpec JSON file (use '-' for stdin)
    Start {
        #[arg(long, short = 'f')]
        file: String,
    },
    /// Spawn a child episode; counts against the parent's subcall budget
    Spawn {
        /// Parent episode id
        parent: Uuid,
        #[arg(long, short = 'f')]
        file: String,
    },
    /// Snapshots of every episode the runtime knows about
    List,
    /// One episode snapshot
    Get { episode_id: Uuid },
    /// Checkpoint history for an episode
    Checkpoints { episode_id: Uuid },
    /// Suspend a running episode and capture a checkpoint
    Suspend {
        episode_id: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Resume a suspended episode
    Resume {
        episode_id: Uuid,
        /// Restore this checkpoint instead of the latest
        #[arg(long)]
        checkpoint_id: Option<Uuid>,
        /// Step-up granted for a held high-risk action
        #[arg(long, value_enum, default_value = "none")]
        grant_step_up: StepUp,
    },
    /// Change one budget limit (0 removes the limit)
    Budget {
        episode_id: Uuid,
        #[arg(long, value_enum)]
        dimension: Dimension,
        #[arg(long)]
        limit: u64,
    },
    /// Fail an episode; terminal
    Fail {
        episode_id: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Cancel an episode's in-flight work and fail it
    Cancel { episode_id: Uuid },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum StepUp {
    None,
    Mfa,
    Approval,
}

impl StepUp {
    fn as_str(self) -> &'static str {
        match self {
            StepUp::None => "none",
            StepUp::Mfa => "mfa",
            StepUp::Approval => "approval",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Dimension {
    Tokens,
    TimeMs,
    Retries,
    Subcalls,
    ToolCalls,
}

impl Dimension {
    fn as_str(self) -> &'static str {
        match self {
            Dimension::Tokens => "tokens",
            Dimension::TimeMs => "time_ms",
            Dimension::Retries => "retries",
            Dimension::Subcalls => "subcalls",
            Dimension::ToolCalls => "tool_calls",
        }
    }
}

pub async fn run(target: &Target, command: EpisodeCommands) -> i32 {
    match command {
        EpisodeCommands::Start { file } => target.post("/v1/episodes", load_spec(&file)).await,
        EpisodeCommands::Spawn { parent, file } => {
            target
                .post(&format!("/v1/episodes/{parent}/children"), load_spec(&file))
                .await
        }
        EpisodeCommands::List => target.get("/v1/episodes", &[]).await,
        EpisodeCommands::Get { episode_id } => target.get(&format!("/v1/episodes/{episode_id}"), &[]).await,
        EpisodeCommands::Checkpoints { episode_id } => {
            target
                .get(&format!("/v1/episodes/{episode_id}/checkpoints"), &[])
                .await
        }
        EpisodeCommands::Suspend { episode_id, reason } => {
            target
                .post(&format!("/v1/episodes/{episode_id}/suspend"), json!({ "reason": reason }))
                .await
        }
        EpisodeCommands::Resume {
            episode_id,
            checkpoint_id,
            grant_step_up,
        } => {
            let body = json!({
                "checkpoint_id": checkpoint_id,
                "grant_step_up": grant_step_up.as_str(),
            });
            target
                .post(&format!("/v1/episodes/{episode_id}/resume"), body)
                .await
        }
        EpisodeCommands::Budget {
            episode_id,
            dimension,
            limit,
        } => {
            let body = json!({
                "dimension": dimension.as_str(),
                "limit": limit,
            });
            target
                .post(&format!("/v1/episodes/{episode_id}/budget"), body)
                .await
        }
        EpisodeCommands::Fail { episode_id, reason } => {
            target
                .post(&format!("/v1/episodes/{episode_id}/fail"), json!({ "reason": reason }))
                .await
        }
        EpisodeCommands::Cancel { episode_id } => {
            let path = format!("/v1/episodes/{episode_id}/cancel");
            api_request(target, reqwest::Method::POST, &path, None, &[]).await
        }
    }
}

fn load_spec(file: &str) -> serde_json::Value {
    let spec = match read_json_from_file(file) {
        Ok(v) => v,
        Err(e) => exit_error(&e, Some("The file must hold one EpisodeSpec object")),
    };
    if !spec.is_object() {
        exit_error(
            "episode spec must be a JSON object",
            Some("Required fields: agent_type, task_type, client_id, subject"),
        );
    }
    spec
}
