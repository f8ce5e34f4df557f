//! JSON-file checkpoint store for single-node deployments without a database.
//!
//! Layout under the root directory:
//!
//! ```text
//! <episode_id>/episode.json
//! <episode_id>/checkpoints/<checkpoint_id>.json
//! ```
//!
//! Checkpoint ids are UUIDv7, so file name order is creation order. Every
//! write goes to a temporary file that is renamed into place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use marshal_core::checkpoint::{CheckpointError, CheckpointStore};
use marshal_core::episode::{Episode, EpisodeCheckpoint};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct EpisodeFile {
    episode: Episode,
    archived: bool,
}

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

fn storage(err: std::io::Error, path: &Path) -> CheckpointError {
    CheckpointError::Storage(format!("{}: {err}", path.display()))
}

impl FileCheckpointStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| storage(e, &root))?;
        Ok(Self { root })
    }

    fn episode_dir(&self, episode_id: Uuid) -> PathBuf {
        self.root.join(episode_id.to_string())
    }

    fn episode_path(&self, episode_id: Uuid) -> PathBuf {
        self.episode_dir(episode_id).join("episode.json")
    }

    fn checkpoint_dir(&self, episode_id: Uuid) -> PathBuf {
        self.episode_dir(episode_id).join("checkpoints")
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(|e| storage(e, &tmp))?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| storage(e, path))
    }

    async fn read_episode_file(&self, episode_id: Uuid) -> Result<EpisodeFile, CheckpointError> {
        let path = self.episode_path(episode_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CheckpointError::EpisodeNotFound(episode_id)),
            Err(e) => Err(storage(e, &path)),
        }
    }

    async fn write_episode(&self, episode: &Episode, archived: bool) -> Result<(), CheckpointError> {
        let dir = self.checkpoint_dir(episode.id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| storage(e, &dir))?;
        let mut episode = episode.clone();
        // Checkpoints live in their own files.
        episode.checkpoints.clear();
        Self::write_json(&self.episode_path(episode.id), &EpisodeFile { episode, archived }).await
    }

    async fn read_checkpoints(&self, episode_id: Uuid) -> Result<Vec<EpisodeCheckpoint>, CheckpointError> {
        let dir = self.checkpoint_dir(episode_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage(e, &dir)),
        };
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| storage(e, &dir))? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut checkpoints = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path).await.map_err(|e| storage(e, &path))?;
            checkpoints.push(serde_json::from_slice(&bytes)?);
        }
        Ok(checkpoints)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, episode: &Episode, checkpoint: &EpisodeCheckpoint) -> Result<(), CheckpointError> {
        self.write_episode(episode, false).await?;
        let path = self
            .checkpoint_dir(episode.id)
            .join(format!("{}.json", checkpoint.id));
        Self::write_json(&path, checkpoint).await?;
        tracing::debug!(
            episode_id = %episode.id,
            checkpoint_id = %checkpoint.id,
            path = %path.display(),
            "checkpoint written"
        );
        Ok(())
    }

    async fn register(&self, episode: &Episode) -> Result<(), CheckpointError> {
        match self.read_episode_file(episode.id).await {
            Ok(_) => Ok(()),
            Err(CheckpointError::EpisodeNotFound(_)) => self.write_episode(episode, false).await,
            Err(err) => Err(err),
        }
    }

    async fn load(
        &self,
        episode_id: Uuid,
        checkpoint_id: Option<Uuid>,
    ) -> Result<EpisodeCheckpoint, CheckpointError> {
        self.read_episode_file(episode_id).await?;
        let mut checkpoints = self.read_checkpoints(episode_id).await?;
        match checkpoint_id {
            Some(id) => checkpoints
                .into_iter()
                .find(|c| c.id == id)
                .ok_or(CheckpointError::CheckpointNotFound {
                    episode_id,
                    checkpoint_id: id,
                }),
            None => checkpoints.pop().ok_or(CheckpointError::NoCheckpoint(episode_id)),
        }
    }

    async fn load_episode(&self, episode_id: Uuid) -> Result<Episode, CheckpointError> {
        let mut episode = self.read_episode_file(episode_id).await?.episode;
        episode.checkpoints = self.read_checkpoints(episode_id).await?;
        Ok(episode)
    }

    async fn archive(&self, episode: &Episode) -> Result<(), CheckpointError> {
        self.write_episode(episode, true).await
    }

    async fn list_unfinished(&self) -> Result<Vec<Uuid>, CheckpointError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| storage(e, &self.root))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| storage(e, &self.root))? {
            let Some(id) = entry.file_name().to_str().and_then(|name| Uuid::parse_str(name).ok()) else {
                continue;
            };
            match self.read_episode_file(id).await {
                Ok(file) if !file.archived => ids.push(id),
                Ok(_) => {}
                Err(err) => tracing::warn!(episode_id = %id, error = %err, "skipping unreadable episode file"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use marshal_core::budget::BudgetLimits;
    use marshal_core::episode::{CycleProgress, EpisodeSpec, RunnerState, SuspendReason};
    use marshal_core::policy::Subject;

    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("marshal-store-{}", Uuid::now_v7()))
    }

    fn episode() -> Episode {
        Episode::new(
            EpisodeSpec {
                agent_type: "scripted".into(),
                task_type: "publish".into(),
                client_id: "client_1".into(),
                parent_episode_id: None,
                subject: Subject {
                    id: "agent".into(),
                    tenant_id: None,
                    grants: Vec::new(),
                },
                budget: BudgetLimits {
                    tokens: 1000,
                    ..BudgetLimits::default()
                },
                input: serde_json::json!({"steps": []}),
            },
            Utc::now(),
        )
    }

    fn checkpoint(episode: &Episode, loop_count: u64) -> EpisodeCheckpoint {
        EpisodeCheckpoint {
            id: Uuid::now_v7(),
            episode_id: episode.id,
            phase: None,
            phase_data: serde_json::Map::new(),
            loop_count,
            timestamp: Utc::now(),
            reason: SuspendReason::new("OPERATOR_REQUESTED", "pause"),
            state_before: RunnerState::Running,
            cycle: CycleProgress::default(),
            budget: episode.budget.clone(),
            pending_verification: None,
            pending_action: None,
        }
    }

    #[tokio::test]
    async fn checkpoints_survive_reopening_the_store() {
        let dir = scratch_dir();
        let episode = episode();
        let first = checkpoint(&episode, 1);
        let second = checkpoint(&episode, 2);
        {
            let store = FileCheckpointStore::open(&dir).await.unwrap();
            store.save(&episode, &first).await.unwrap();
            store.save(&episode, &second).await.unwrap();
        }

        let store = FileCheckpointStore::open(&dir).await.unwrap();
        assert_eq!(store.load(episode.id, None).await.unwrap(), second);
        assert_eq!(store.load(episode.id, Some(first.id)).await.unwrap(), first);
        let loaded = store.load_episode(episode.id).await.unwrap();
        assert_eq!(loaded.checkpoints.len(), 2);
        assert_eq!(loaded.budget.tokens.limit, 1000);
        assert_eq!(store.list_unfinished().await.unwrap(), vec![episode.id]);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn archive_and_register_track_unfinished_episodes() {
        let dir = scratch_dir();
        let store = FileCheckpointStore::open(&dir).await.unwrap();
        let crashed = episode();
        let finished = episode();
        store.register(&crashed).await.unwrap();
        store.register(&finished).await.unwrap();
        store.archive(&finished).await.unwrap();

        assert_eq!(store.list_unfinished().await.unwrap(), vec![crashed.id]);
        assert!(matches!(
            store.load(crashed.id, None).await,
            Err(CheckpointError::NoCheckpoint(_))
        ));
        assert!(matches!(
            store.load(Uuid::now_v7(), None).await,
            Err(CheckpointError::EpisodeNotFound(_))
        ));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
