//! Durable checkpoint storage contract.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::episode::{Episode, EpisodeCheckpoint};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("episode {0} not found in checkpoint store")]
    EpisodeNotFound(Uuid),
    #[error("checkpoint {checkpoint_id} not found for episode {episode_id}")]
    CheckpointNotFound { episode_id: Uuid, checkpoint_id: Uuid },
    #[error("episode {0} has no checkpoint")]
    NoCheckpoint(Uuid),
    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("checkpoint storage failed: {0}")]
    Storage(String),
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist `checkpoint` together with the episode snapshot it belongs to.
    /// Must be durable before it returns.
    async fn save(&self, episode: &Episode, checkpoint: &EpisodeCheckpoint) -> Result<(), CheckpointError>;

    /// Record a started episode before it has any checkpoint, so recovery can
    /// find episodes that crashed mid-run.
    async fn register(&self, episode: &Episode) -> Result<(), CheckpointError>;

    /// A named checkpoint, or the latest one when `checkpoint_id` is `None`.
    async fn load(
        &self,
        episode_id: Uuid,
        checkpoint_id: Option<Uuid>,
    ) -> Result<EpisodeCheckpoint, CheckpointError>;

    async fn load_episode(&self, episode_id: Uuid) -> Result<Episode, CheckpointError>;

    /// Record the final snapshot of a completed or failed episode.
    async fn archive(&self, episode: &Episode) -> Result<(), CheckpointError>;

    /// Episodes that were never archived.
    async fn list_unfinished(&self) -> Result<Vec<Uuid>, CheckpointError>;
}

#[derive(Debug)]
struct Stored {
    episode: Episode,
    checkpoints: Vec<EpisodeCheckpoint>,
    archived: bool,
}

/// In-process store. Not durable across restarts.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    episodes: Mutex<HashMap<Uuid, Stored>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Stored>> {
        self.episodes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, episode: &Episode, checkpoint: &EpisodeCheckpoint) -> Result<(), CheckpointError> {
        let mut episodes = self.lock();
        let stored = episodes.entry(episode.id).or_insert_with(|| Stored {
            episode: episode.clone(),
            checkpoints: Vec::new(),
            archived: false,
        });
        stored.episode = episode.clone();
        stored.checkpoints.push(checkpoint.clone());
        Ok(())
    }

    async fn register(&self, episode: &Episode) -> Result<(), CheckpointError> {
        self.lock().entry(episode.id).or_insert_with(|| Stored {
            episode: episode.clone(),
            checkpoints: Vec::new(),
            archived: false,
        });
        Ok(())
    }

    async fn load(
        &self,
        episode_id: Uuid,
        checkpoint_id: Option<Uuid>,
    ) -> Result<EpisodeCheckpoint, CheckpointError> {
        let episodes = self.lock();
        let stored = episodes
            .get(&episode_id)
            .ok_or(CheckpointError::EpisodeNotFound(episode_id))?;
        match checkpoint_id {
            Some(id) => stored
                .checkpoints
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or(CheckpointError::CheckpointNotFound {
                    episode_id,
                    checkpoint_id: id,
                }),
            None => stored
                .checkpoints
                .last()
                .cloned()
                .ok_or(CheckpointError::NoCheckpoint(episode_id)),
        }
    }

    async fn load_episode(&self, episode_id: Uuid) -> Result<Episode, CheckpointError> {
        let episodes = self.lock();
        let stored = episodes
            .get(&episode_id)
            .ok_or(CheckpointError::EpisodeNotFound(episode_id))?;
        let mut episode = stored.episode.clone();
        episode.checkpoints = stored.checkpoints.clone();
        Ok(episode)
    }

    async fn archive(&self, episode: &Episode) -> Result<(), CheckpointError> {
        let mut episodes = self.lock();
        let stored = episodes.entry(episode.id).or_insert_with(|| Stored {
            episode: episode.clone(),
            checkpoints: Vec::new(),
            archived: false,
        });
        stored.episode = episode.clone();
        stored.archived = true;
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<Uuid>, CheckpointError> {
        let episodes = self.lock();
        let mut ids: Vec<Uuid> = episodes
            .iter()
            .filter(|(_, s)| !s.archived)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
