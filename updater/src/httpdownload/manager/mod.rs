mod inner;
mod item;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Url;
use thiserror::Error;
use tokio::sync::{watch, RwLock, RwLockWriteGuard};
use uuid::Uuid;

use super::download::config::HttpDownloadConfig;
use super::{Outcome, TaskSnapshot, UpdateConsumer};

use self::inner::Inner;
pub use self::inner::LogUpdateConsumer;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No download task for '{0}'")]
    UnknownTask(String),
    #[error("'{0}' is not a plain file name")]
    InvalidFileName(String),
    #[error("Download of '{0}' is still running")]
    TaskStillRunning(String),
    #[error("Download directory unavailable: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub download_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub http: HttpDownloadConfig,
}

/// What a caller got when claiming a finished task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandOff {
    /// The record was evicted by this call, the file is the caller's to use.
    Claimed,
    /// Another handle on the same attempt claimed it first.
    ClaimedElsewhere,
    /// Evicted without a claim, by a cleanup, or replaced by a newer attempt.
    Lost,
}

/// A caller's view of one task. Every caller joining the same task gets a
/// handle on the same state and observes the same outcome.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: Uuid,
    file_name: String,
    state: watch::Receiver<TaskSnapshot>,
}

impl TaskHandle {
    fn new(state: watch::Receiver<TaskSnapshot>) -> Self {
        let (id, file_name) = {
            let snapshot = state.borrow();
            (snapshot.id, snapshot.file_name.clone())
        };
        TaskHandle {
            id,
            file_name,
            state,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.state.borrow().clone()
    }

    /// Resolves once the task reaches a terminal state.
    pub async fn wait(mut self) -> Outcome {
        loop {
            if let Some(outcome) = self.state.borrow_and_update().state.outcome() {
                return outcome;
            }
            if self.state.changed().await.is_err() {
                // worker is gone without reporting, nothing will ever complete
                return self
                    .state
                    .borrow()
                    .state
                    .outcome()
                    .unwrap_or(Outcome::Cancelled);
            }
        }
    }
}

/// This struct takes care of starting, joining and stopping downloads, at most
/// one per file name. At most `max_concurrent_downloads` transfer at once, the
/// rest wait in `Pending`.
/// Internally it uses a RwLock to allow for concurrent access,
/// this exposes a thread-safe interface.
/// This struct is supposed to be cloned as it uses an Arc internally.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<RwLock<Inner>>,
    download_dir: Arc<PathBuf>,
}

impl DownloadManager {
    /// The update_consumer is placed in a separate task and will receive all updates from all downloads.
    pub fn new(
        config: ManagerConfig,
        update_consumer: impl UpdateConsumer + Send + Sync + 'static,
    ) -> Self {
        let download_dir = Arc::new(config.download_dir.clone());
        let inner = Arc::new(RwLock::new(Inner::new(config, update_consumer)));
        DownloadManager {
            inner,
            download_dir,
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub async fn start(&self, file_name: &str, artifact: Url) -> Result<TaskHandle> {
        self.spawn(None, file_name, artifact).await
    }

    /// Same as `start`, the app is carried along in snapshots.
    pub async fn start_for_app(
        &self,
        app: &str,
        file_name: &str,
        artifact: Url,
    ) -> Result<TaskHandle> {
        self.spawn(Some(app.to_owned()), file_name, artifact).await
    }

    async fn spawn(&self, app: Option<String>, file_name: &str, artifact: Url) -> Result<TaskHandle> {
        tokio::fs::create_dir_all(self.download_dir.as_path()).await?;
        let mut inner = self.inner.write().await;
        inner.start(app, file_name, artifact)
    }

    /// Byte counts trail the transfer by up to the download's `progress_interval`.
    pub async fn progress(&self, file_name: &str) -> Result<TaskSnapshot> {
        let inner = self.inner.read().await;
        Ok(inner.get(file_name)?.snapshot())
    }

    /// Stops the task and returns once it is terminal. No-op for a finished task.
    pub async fn cancel(&self, file_name: &str) -> Result<()> {
        let handle = {
            let mut inner = self.inner.write().await;
            let item = inner.get_mut(file_name)?;
            if !item.is_live() {
                return Ok(());
            }
            log::info!("Stop requested for download {} ({})", item.id(), file_name);
            item.stop();
            item.handle()
        };
        let outcome = handle.wait().await;
        log::debug!("Download {} ended with {:?}", file_name, outcome);
        Ok(())
    }

    pub async fn await_completion(&self, file_name: &str) -> Result<Outcome> {
        let handle = {
            let inner = self.inner.read().await;
            inner.get(file_name)?.handle()
        };
        Ok(handle.wait().await)
    }

    /// Forgets a terminal task record, the file on disk is left alone.
    pub async fn evict(&self, file_name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.evict(file_name, None)
    }

    /// Claims the terminal task behind `handle` by evicting exactly that attempt.
    /// Only one handle per attempt ever gets `Claimed`.
    pub async fn hand_off(&self, handle: &TaskHandle) -> HandOff {
        let mut inner = self.inner.write().await;
        inner.hand_off(handle.file_name(), handle.id())
    }

    pub async fn snapshot_all(&self) -> Vec<TaskSnapshot> {
        let inner = self.inner.read().await;
        inner.snapshots()
    }

    pub async fn live_files(&self) -> HashSet<String> {
        let inner = self.inner.read().await;
        inner.live_files()
    }

    /// Blocks every start, cancel and eviction until the returned guard is dropped.
    pub async fn freeze(&self) -> FrozenTasks<'_> {
        FrozenTasks {
            guard: self.inner.write().await,
        }
    }
}

/// Task table held still, no task can be added while this lives.
pub struct FrozenTasks<'a> {
    guard: RwLockWriteGuard<'a, Inner>,
}

impl FrozenTasks<'_> {
    pub fn live_files(&self) -> HashSet<String> {
        self.guard.live_files()
    }

    pub fn download_dir(&self) -> &Path {
        self.guard.download_dir()
    }

    /// Drops every terminal record, returns their file names.
    pub fn evict_finished(&mut self) -> Vec<String> {
        self.guard.evict_finished()
    }
}
