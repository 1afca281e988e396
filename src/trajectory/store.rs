//! Episode persistence.
//!
//! The trainer only needs two operations: append one finalized episode and
//! read back everything appended so far. [`JsonlEpisodeStore`] writes one JSON
//! object per line; [`InMemoryEpisodeStore`] keeps records in memory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::types::EpisodeRecord;
use crate::error::{MarlError, MarlResult};

#[async_trait]
pub trait EpisodeStore: Send + Sync {
    async fn append(&self, record: &EpisodeRecord) -> MarlResult<()>;

    /// Every record appended so far, in append order.
    async fn read_all(&self) -> MarlResult<Vec<EpisodeRecord>>;
}

// ---------------------------------------------------------------------------
// JSON lines
// ---------------------------------------------------------------------------

/// Append-only JSON-lines file.
#[derive(Debug)]
pub struct JsonlEpisodeStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEpisodeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EpisodeStore for JsonlEpisodeStore {
    async fn append(&self, record: &EpisodeRecord) -> MarlResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(episode = %record.episode_id, path = %self.path.display(), "appended episode");
        Ok(())
    }

    async fn read_all(&self) -> MarlResult<Vec<EpisodeRecord>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(MarlError::Store(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };

        let mut records = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EpisodeRecord>(line) {
                Ok(record) => records.push(record),
                // A torn final write leaves a partial line; keep the rest usable.
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping unreadable episode record"
                ),
            }
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// In memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct InMemoryEpisodeStore {
    records: Mutex<Vec<EpisodeRecord>>,
}

impl InMemoryEpisodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EpisodeStore for InMemoryEpisodeStore {
    async fn append(&self, record: &EpisodeRecord) -> MarlResult<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn read_all(&self) -> MarlResult<Vec<EpisodeRecord>> {
        Ok(self.records.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentRole;
    use crate::trajectory::{MultiTurnTrajectory, Turn};

    fn sample_record(id: &str, reward: f64) -> EpisodeRecord {
        let mut traj = MultiTurnTrajectory::new(id, 1, 3, "Does X improve Y?", 0.6);
        traj.push_turn(Turn::new(0, AgentRole::LiteratureSynthesizer, "prior work", "", "").with_reward(Some(0.5)))
            .unwrap();
        traj.push_turn(Turn::new(1, AgentRole::HypothesisGenerator, "H1", "", ""))
            .unwrap();
        traj.finalize(reward).unwrap();
        traj.to_record(reward, 0.0, 3).unwrap()
    }

    #[tokio::test]
    async fn test_jsonl_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlEpisodeStore::new(dir.path().join("runs").join("episodes.jsonl"));
        assert!(store.read_all().await.unwrap().is_empty());

        let a = sample_record("ep-a", 2.0);
        let b = sample_record("ep-b", 4.0);
        store.append(&a).await.unwrap();
        store.append(&b).await.unwrap();

        let all = store.read_all().await.unwrap();
        assert_eq!(all, vec![a, b]);
        assert_eq!(all[0].turns[0].reward, Some(0.5));
    }

    #[tokio::test]
    async fn test_jsonl_skips_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("episodes.jsonl");
        let store = JsonlEpisodeStore::new(&path);
        store.append(&sample_record("ep-a", 1.0)).await.unwrap();
        tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap()
            .write_all(b"{\"episode_id\": \"ep-b\", \"tur")
            .await
            .unwrap();
        let all = store.read_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryEpisodeStore::new();
        store.append(&sample_record("ep-a", 1.0)).await.unwrap();
        assert_eq!(store.read_all().await.unwrap().len(), 1);
    }
}
