//! Run persistence.
//!
//! The engine saves the full [`Run`] record at every stage barrier, so a
//! snapshot can be served after the in-memory handle is gone.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use crate::run::{Run, RunId};
use crate::types::AppResult;

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, run: &Run) -> AppResult<()>;

    async fn load(&self, run_id: RunId) -> AppResult<Option<Run>>;
}

#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    inner: Arc<RwLock<HashMap<RunId, Run>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, run: &Run) -> AppResult<()> {
        let mut guard = self.inner.write().await;
        guard.insert(run.id(), run.clone());
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> AppResult<Option<Run>> {
        let guard = self.inner.read().await;
        Ok(guard.get(&run_id).cloned())
    }
}

/// One JSON document per run under `dir`.
pub struct FileRunStore {
    dir: PathBuf,
}

impl FileRunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, run_id: RunId) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn save(&self, run: &Run) -> AppResult<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path(run.id());
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(run)?).await?;
        // Readers never observe a half-written record.
        fs::rename(&tmp, &path).await?;
        debug!(run_id = %run.id(), path = %path.display(), "Run saved");
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> AppResult<Option<Run>> {
        match fs::read(self.path(run_id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentKind;
    use crate::intent::{Intent, Route};
    use crate::run::RunStatus;

    fn run() -> Run {
        let intent = Intent::new(Route::Debate)
            .with_field("drug_name", "Metformin")
            .with_field("indication", "Glioblastoma");
        let target = intent.resolve_target().unwrap();
        Run::new(intent, target, &[vec![AgentKind::Literature]])
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::new(dir.path().join("runs"));
        let mut run = run();
        run.transition(RunStatus::Queued).unwrap();

        store.save(&run).await.unwrap();
        let loaded = store.load(run.id()).await.unwrap().unwrap();
        assert_eq!(loaded.id(), run.id());
        assert_eq!(loaded.status(), RunStatus::Queued);
        assert_eq!(loaded.intent(), run.intent());

        assert!(store.load(RunId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_overwrites() {
        let store = InMemoryRunStore::new();
        let mut run = run();
        store.save(&run).await.unwrap();
        run.transition(RunStatus::Cancelled).unwrap();
        store.save(&run).await.unwrap();

        let loaded = store.load(run.id()).await.unwrap().unwrap();
        assert_eq!(loaded.status(), RunStatus::Cancelled);
    }
}
