use marshal_core::checkpoint::CheckpointError;
use marshal_core::clock::Clock;
use marshal_core::episode::{FailureDetail, RunnerState};
use marshal_core::error::reason;
use marshal_core::policy::StepUp;
use marshal_core::runner::Runner;
use serde::Serialize;
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::supervisor::Supervisor;

/// What happened to each unfinished episode found in the store.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// Parked by a clean shutdown and running again.
    pub resumed: Vec<Uuid>,
    /// Restored in `suspended`, waiting for an operator.
    pub suspended: Vec<Uuid>,
    /// Stopped before their first checkpoint; archived as failed.
    pub failed: Vec<Uuid>,
    /// Left untouched (unreadable, or no agent for their type).
    pub skipped: Vec<Uuid>,
}

impl Supervisor {
    /// Re-derive every unfinished episode from its last durable checkpoint.
    ///
    /// Episodes parked by `shutdown` resume on their own. Anything else was
    /// interrupted at an unknown point and waits suspended for an operator.
    pub async fn recover(&self) -> Result<RecoveryReport, RuntimeError> {
        let store = self.store().clone();
        let mut report = RecoveryReport::default();

        for id in store.list_unfinished().await? {
            let mut episode = match store.load_episode(id).await {
                Ok(episode) => episode,
                Err(err) => {
                    tracing::warn!(episode_id = %id, error = %err, "cannot read episode; skipping recovery");
                    report.skipped.push(id);
                    continue;
                }
            };

            let checkpoint = match store.load(id, None).await {
                Ok(checkpoint) => checkpoint,
                Err(CheckpointError::NoCheckpoint(_)) => {
                    episode.status = RunnerState::Failed;
                    episode.ended_at = Some(self.deps().clock.now());
                    episode.failure = Some(FailureDetail::new(
                        reason::RECOVERY_NO_CHECKPOINT,
                        "episode stopped before its first checkpoint; nothing to resume from",
                    ));
                    store.archive(&episode).await?;
                    tracing::warn!(episode_id = %id, "unfinished episode without checkpoint marked failed");
                    report.failed.push(id);
                    continue;
                }
                Err(err) => {
                    tracing::warn!(episode_id = %id, error = %err, "cannot read checkpoint; skipping recovery");
                    report.skipped.push(id);
                    continue;
                }
            };

            let agent = match self.agents().resolve(&episode.agent_type) {
                Ok(agent) => agent,
                Err(err) => {
                    tracing::warn!(episode_id = %id, error = %err, "no agent for recovered episode; skipping");
                    report.skipped.push(id);
                    continue;
                }
            };

            let auto_resume = checkpoint.reason.code == reason::RUNTIME_SHUTDOWN;
            let runner = Runner::restore(episode, checkpoint, self.deps().clone());
            self.launch(runner, agent);

            if !auto_resume {
                tracing::info!(episode_id = %id, "episode restored suspended; awaiting operator");
                report.suspended.push(id);
                continue;
            }
            match self.resume(id, None, StepUp::None).await {
                Ok(_) => {
                    tracing::info!(episode_id = %id, "episode resumed after restart");
                    report.resumed.push(id);
                }
                Err(err) => {
                    tracing::warn!(episode_id = %id, error = %err, "restored episode could not resume");
                    report.suspended.push(id);
                }
            }
        }

        tracing::info!(
            resumed = report.resumed.len(),
            suspended = report.suspended.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "recovery finished"
        );
        Ok(report)
    }
}
