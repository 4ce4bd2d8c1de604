use std::path::Path;
use std::sync::Arc;

use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::TaskHandle;
use crate::httpdownload::download::{self, HttpDownload};
use crate::httpdownload::{FailureReason, Outcome, TaskReporter, TaskSnapshot};

/// Wrapper over a spawned HttpDownload, owned by the manager's map.
/// The task keeps running when the item is dropped, only `stop` ends it early.
#[derive(Debug)]
pub struct DownloaderItem {
    reporter: TaskReporter,
    tx: Option<oneshot::Sender<()>>,
    _worker: JoinHandle<()>,
}

impl DownloaderItem {
    pub fn spawn(download: HttpDownload, reporter: TaskReporter, slots: Arc<Semaphore>) -> Self {
        let (tx, rx) = oneshot::channel();
        let worker = tokio::spawn(run(download, reporter.clone(), slots, rx));
        DownloaderItem {
            reporter,
            tx: Some(tx),
            _worker: worker,
        }
    }

    pub fn id(&self) -> Uuid {
        self.reporter.id()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.reporter.snapshot()
    }

    pub fn is_live(&self) -> bool {
        self.snapshot().state.is_live()
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle::new(self.reporter.subscribe())
    }

    /// Signals the worker to stop, false if it was already signalled or gone.
    pub fn stop(&mut self) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

async fn run(
    mut download: HttpDownload,
    reporter: TaskReporter,
    slots: Arc<Semaphore>,
    mut rx: oneshot::Receiver<()>,
) {
    reporter.queued().await;
    let permit = tokio::select! {
        biased;
        _ = &mut rx => {
            log::info!("Download {} cancelled while queued", download.url);
            reporter.finished(Outcome::Cancelled).await;
            return;
        }
        permit = slots.acquire_owned() => permit,
    };
    let _permit = match permit {
        Ok(permit) => permit,
        Err(e) => {
            reporter
                .finished(Outcome::Failed {
                    reason: FailureReason::ResourceUnavailable(e.to_string()),
                })
                .await;
            return;
        }
    };
    // a stop racing the permit must win before any byte is requested
    if !matches!(rx.try_recv(), Err(TryRecvError::Empty)) {
        reporter.finished(Outcome::Cancelled).await;
        return;
    }

    reporter.started().await;
    log::info!(
        "Starting download {} -> {}",
        download.url,
        download.file_path.display()
    );
    let outcome = match download.run(&mut rx, &reporter).await {
        Ok(_) => Outcome::Completed {
            path: download.file_path.clone(),
        },
        Err(download::Error::Stopped(bytes)) => {
            log::info!("Download {} stopped after {} bytes", download.url, bytes);
            remove_partial(&download.file_path).await;
            Outcome::Cancelled
        }
        Err(e) => {
            log::error!("Error encountered while downloading {}: {}", download.url, e);
            remove_partial(&download.file_path).await;
            Outcome::Failed {
                reason: e.failure_reason(),
            }
        }
    };
    reporter.finished(outcome).await;
}

/// No partial artifact survives a task that did not complete.
async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove partial file {}: {}", path.display(), e),
    }
}
