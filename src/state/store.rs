// ABOUTME: Durable sinks for flushed sync state
// ABOUTME: Atomic JSON file store for the CLI and an in-memory store for embedding

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;

use crate::error::Result;

/// Where [`StateManager::flush`](super::StateManager::flush) writes each
/// checkpoint. The CLI also hands every STATE it has written to stdout to a
/// [`FileStateStore`] from its output loop.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn persist(&self, state: &serde_json::Value) -> Result<()>;
}

/// Writes each flushed state to a JSON file via write-then-rename so a
/// crash never leaves a torn file behind.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last persisted state, if any.
    pub async fn read(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn persist(&self, state: &serde_json::Value) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        let contents = serde_json::to_vec_pretty(state)?;
        {
            let mut file = fs::File::create(&tmp).await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &contents).await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Keeps every flushed state in memory. Durability then rests with the
/// downstream writer, which confirms each STATE by taking the next message.
#[derive(Default)]
pub struct InMemoryStateStore {
    history: Mutex<Vec<serde_json::Value>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persisted(&self) -> Vec<serde_json::Value> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn latest(&self) -> Option<serde_json::Value> {
        self.history.lock().ok().and_then(|h| h.last().cloned())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn persist(&self, state: &serde_json::Value) -> Result<()> {
        if let Ok(mut history) = self.history.lock() {
            history.push(state.clone());
        }
        Ok(())
    }
}
