//! Reclaims the transient download directory at session boundaries.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::httpdownload::DownloadManager;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Could not list the download directory: {0}")]
    Listing(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    /// Files backing a live task, left untouched.
    pub kept: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    /// Terminal task records forgotten along with their files.
    pub evicted: Vec<String>,
}

#[derive(Clone)]
pub struct FileLifecycleCleaner {
    manager: DownloadManager,
}

impl FileLifecycleCleaner {
    pub fn new(manager: DownloadManager) -> Self {
        FileLifecycleCleaner { manager }
    }

    /// Deletes every file in the download directory that does not back a live
    /// task. The manager's task table is frozen for the whole pass so no task
    /// can register a file between the listing and the deletion.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let mut tasks = self.manager.freeze().await;
        let live = tasks.live_files();
        let dir = tasks.download_dir().to_path_buf();
        let mut report = CleanupReport::default();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.evicted = tasks.evict_finished();
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if live.contains(&name) {
                report.kept.push(path);
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => report.removed.push(path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("Could not remove {}: {}", path.display(), e);
                    report.failed.push((path, e.to_string()));
                }
            }
        }
        report.evicted = tasks.evict_finished();
        report.removed.sort();
        report.kept.sort();
        log::info!(
            "Cleanup removed {} files, kept {} in use",
            report.removed.len(),
            report.kept.len()
        );
        Ok(report)
    }
}
