use tokio::runtime::Handle;

use crate::cleaner::{CleanupReport, FileLifecycleCleaner};

/// Held by the shell while the application is in active use. Ending the
/// session reclaims the download directory; dropping the guard without
/// `end()` still schedules that cleanup on the current runtime.
#[must_use = "dropping the guard ends the session"]
pub struct SessionGuard {
    cleaner: Option<FileLifecycleCleaner>,
}

impl SessionGuard {
    /// `None` disables the leave-side cleanup.
    pub(super) fn new(cleaner: Option<FileLifecycleCleaner>) -> Self {
        SessionGuard { cleaner }
    }

    pub async fn end(mut self) -> Option<CleanupReport> {
        let cleaner = self.cleaner.take()?;
        cleanup(&cleaner, "end").await
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(cleaner) = self.cleaner.take() {
            match Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        cleanup(&cleaner, "drop").await;
                    });
                }
                Err(_) => log::warn!("Session dropped outside of a runtime, download files are kept"),
            }
        }
    }
}

pub(super) async fn cleanup(cleaner: &FileLifecycleCleaner, boundary: &str) -> Option<CleanupReport> {
    match cleaner.cleanup().await {
        Ok(report) => {
            log::info!(
                "Session {} cleanup removed {} download files",
                boundary,
                report.removed.len()
            );
            Some(report)
        }
        Err(e) => {
            log::error!("Session {} cleanup failed: {}", boundary, e);
            None
        }
    }
}
