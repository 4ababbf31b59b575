use async_trait::async_trait;
use fd_lock::RwLock;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::event::QueuedEvent;
use crate::errors::{SyncError, SyncResult};
use crate::remote::memory::lock;

/// Where the durable event list lives
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self) -> SyncResult<Vec<QueuedEvent>>;

    /// Replace the stored list with `events`
    async fn save(&self, events: &[QueuedEvent]) -> SyncResult<()>;
}

/// JSON file on local disk. Writes go to a temp file and are renamed into
/// place while holding an advisory lock on `<path>.lock`.
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    path: PathBuf,
}

impl FileQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        with_suffix(&self.path, "lock")
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn load(&self) -> SyncResult<Vec<QueuedEvent>> {
        if !tokio::fs::try_exists(&self.path).await? {
            debug!(file = ?self.path, "No queue file yet");
            return Ok(Vec::new());
        }

        let contents = tokio::fs::read(&self.path).await?;
        match serde_json::from_slice(&contents) {
            Ok(events) => Ok(events),
            Err(err) => {
                // keep the unreadable file for inspection instead of overwriting it
                let backup = with_suffix(&self.path, "corrupt");
                tokio::fs::rename(&self.path, &backup).await?;
                warn!(file = ?self.path, backup = ?backup, error = %err, "Queue file unreadable; moved aside");
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, events: &[QueuedEvent]) -> SyncResult<()> {
        let serialized = serde_json::to_vec_pretty(events)?;
        let path = self.path.clone();
        let lock_path = self.lock_path();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let lock_file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            let mut lock = RwLock::new(lock_file);
            let _guard = lock.write()?;

            let temp = with_suffix(&path, "tmp");
            fs::write(&temp, serialized)?;
            fs::rename(&temp, &path)?;
            Ok(())
        })
        .await
        .map_err(|err| SyncError::Storage(std::io::Error::other(err)))??;

        Ok(())
    }
}

/// Process-local store, for tests and sessions without a writable disk
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    events: Mutex<Vec<QueuedEvent>>,
    saves: Mutex<usize>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Vec<QueuedEvent>) -> Self {
        Self {
            events: Mutex::new(events),
            saves: Mutex::new(0),
        }
    }

    pub fn stored(&self) -> Vec<QueuedEvent> {
        lock(&self.events).clone()
    }

    pub fn save_count(&self) -> usize {
        *lock(&self.saves)
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self) -> SyncResult<Vec<QueuedEvent>> {
        Ok(self.stored())
    }

    async fn save(&self, events: &[QueuedEvent]) -> SyncResult<()> {
        *lock(&self.events) = events.to_vec();
        *lock(&self.saves) += 1;
        Ok(())
    }
}
