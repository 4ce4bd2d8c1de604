use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::provider::AppIdentity;

pub mod download;
pub mod manager;
pub mod observer;

pub use manager::{DownloadManager, HandOff, TaskHandle};
pub use observer::DownloadObserver;

/// Why a task ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Transient network failure that outlived every retry.
    Network(String),
    /// The server answered with a non-retryable status.
    Rejected(u16),
    /// Disk space or permissions, never retried.
    ResourceUnavailable(String),
    Timeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Network(e) => write!(f, "network failure: {}", e),
            FailureReason::Rejected(status) => write!(f, "server answered {}", status),
            FailureReason::ResourceUnavailable(e) => write!(f, "resource unavailable: {}", e),
            FailureReason::Timeout => write!(f, "timed out"),
        }
    }
}

/// Terminal result of a download task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { path: PathBuf },
    Failed { reason: FailureReason },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Pending,
    InProgress,
    Completed { path: PathBuf },
    Failed { reason: FailureReason },
    Cancelled,
}

impl State {
    /// Pending and InProgress tasks own their file in the download directory.
    pub fn is_live(&self) -> bool {
        matches!(self, State::Pending | State::InProgress)
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            State::Pending | State::InProgress => None,
            State::Completed { path } => Some(Outcome::Completed { path: path.clone() }),
            State::Failed { reason } => Some(Outcome::Failed {
                reason: reason.clone(),
            }),
            State::Cancelled => Some(Outcome::Cancelled),
        }
    }
}

impl From<Outcome> for State {
    fn from(value: Outcome) -> Self {
        match value {
            Outcome::Completed { path } => State::Completed { path },
            Outcome::Failed { reason } => State::Failed { reason },
            Outcome::Cancelled => State::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub bytes_received: u64,
    /// Unknown until the server announced a content length.
    pub bytes_total: Option<u64>,
    pub bytes_per_second: u64,
}

impl Progress {
    /// Fraction in [0.0, 1.0], 0.0 while the total is unknown.
    pub fn fraction(&self) -> f64 {
        match self.bytes_total {
            Some(total) if total > 0 => (self.bytes_received as f64 / total as f64).min(1.0),
            _ => 0.0,
        }
    }
}

/// Point-in-time copy of a task, safe to hand out.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub file_name: String,
    pub app: Option<AppIdentity>,
    pub state: State,
    pub progress: Progress,
    pub started_at: DateTime<Utc>,
}

impl TaskSnapshot {
    pub fn progress_fraction(&self) -> f64 {
        match self.state {
            State::Completed { .. } => 1.0,
            _ => self.progress.fraction(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadUpdate {
    pub id: Uuid,
    pub file_name: String,
    pub update_type: UpdateType,
}

#[derive(Debug, Clone)]
pub enum UpdateType {
    Queued {
        app: Option<AppIdentity>,
        started_at: DateTime<Utc>,
    },
    Started,
    Running(Progress),
    Finished(Outcome),
    Evicted,
}

/// Trait for a struct that can handle DownloadUpdates.
pub trait UpdateConsumer {
    fn consume(&mut self, update: DownloadUpdate);
}

/// Publishes the state of one task: into the task's own watch channel, which
/// `progress` and awaiters read, and to the manager-wide update consumer.
#[derive(Debug, Clone)]
pub struct TaskReporter {
    id: Uuid,
    file_name: String,
    state: Arc<watch::Sender<TaskSnapshot>>,
    update_ch: mpsc::Sender<DownloadUpdate>,
}

impl TaskReporter {
    pub fn new(
        snapshot: TaskSnapshot,
        update_ch: mpsc::Sender<DownloadUpdate>,
    ) -> (Self, watch::Receiver<TaskSnapshot>) {
        let (tx, rx) = watch::channel(snapshot.clone());
        let reporter = TaskReporter {
            id: snapshot.id,
            file_name: snapshot.file_name,
            state: Arc::new(tx),
            update_ch,
        };
        (reporter, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.state.borrow().clone()
    }

    fn update(&self, update_type: UpdateType) -> DownloadUpdate {
        DownloadUpdate {
            id: self.id,
            file_name: self.file_name.clone(),
            update_type,
        }
    }

    pub async fn queued(&self) {
        let (app, started_at) = {
            let snapshot = self.state.borrow();
            (snapshot.app.clone(), snapshot.started_at)
        };
        let _ = self
            .update_ch
            .send(self.update(UpdateType::Queued { app, started_at }))
            .await;
    }

    pub async fn started(&self) {
        self.state.send_modify(|s| s.state = State::InProgress);
        let _ = self.update_ch.send(self.update(UpdateType::Started)).await;
    }

    /// Progress is dropped rather than queued when the consumer lags behind.
    pub fn running(&self, progress: Progress) {
        self.state.send_modify(|s| s.progress = progress);
        let _ = self.update_ch.try_send(self.update(UpdateType::Running(progress)));
    }

    pub fn set_total(&self, bytes_total: Option<u64>) {
        self.state.send_modify(|s| s.progress.bytes_total = bytes_total);
    }

    pub async fn finished(&self, outcome: Outcome) {
        self.state.send_modify(|s| {
            if let Outcome::Completed { .. } = outcome {
                if let Some(total) = s.progress.bytes_total {
                    s.progress.bytes_received = total;
                }
            }
            s.progress.bytes_per_second = 0;
            s.state = State::from(outcome.clone());
        });
        let _ = self
            .update_ch
            .send(self.update(UpdateType::Finished(outcome)))
            .await;
    }
}
