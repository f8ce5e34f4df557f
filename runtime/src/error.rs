use marshal_core::budget::BudgetError;
use marshal_core::checkpoint::CheckpointError;
use marshal_core::episode::RunnerState;
use marshal_core::runner::RunnerError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("episode {0} is not running in this process")]
    UnknownEpisode(Uuid),
    #[error("no agent registered for agent type '{0}'")]
    UnknownAgent(String),
    #[error("episode {episode_id} is {state}; {operation} is not possible")]
    NotAllowed {
        episode_id: Uuid,
        state: RunnerState,
        operation: &'static str,
    },
    #[error("episode {0} stopped before answering")]
    EpisodeGone(Uuid),
    #[error("supervisor is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Budget(#[from] BudgetError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}
