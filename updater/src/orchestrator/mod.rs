//! Single entry point for the UI layer. Composes the store, resolver, download
//! manager, scheduler and cleaner, and republishes their state as snapshots.
//! Nothing below this module crosses the boundary: callers only ever see
//! `Problem`, the outcome enums and the snapshot views.

mod session;
mod snapshot;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use crate::cleaner::FileLifecycleCleaner;
use crate::httpdownload::manager;
use crate::httpdownload::{DownloadManager, DownloadObserver, FailureReason, HandOff, Outcome};
use crate::provider::refresh::{RefreshError, RefreshReport, Refresher};
use crate::provider::{AppIdentity, ProviderFeed, ProviderStore};
use crate::resolver::{InstalledVersions, ProviderPreferences, ResolveError, VersionResolver};
use crate::scheduler::{
    self, BackgroundScheduler, NotificationSink, SchedulingPermit, TickReport, UpdateCheck,
};
use crate::settings::Settings;
use crate::util::{parse_filename, sanitize_file_name};
use crate::version::Version;

pub use session::SessionGuard;
pub use snapshot::{AppView, DownloadStatus, DownloadView, Snapshot};
use snapshot::Published;

const DEFAULT_ARTIFACT_EXTENSION: &str = "apk";

/// The closed set of failures the UI ever sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Problem {
    #[error("no internet")]
    NoInternet,
    #[error("could not download")]
    CouldNotDownload,
    #[error("storage unavailable")]
    StorageUnavailable,
    #[error("timed out")]
    TimedOut,
    #[error("unknown app")]
    UnknownApp,
    #[error("no version information")]
    NoVersionInfo,
    #[error("unknown provider")]
    UnknownProvider,
    #[error("no such download")]
    NoSuchDownload,
}

impl From<&ResolveError> for Problem {
    fn from(value: &ResolveError) -> Self {
        match value {
            ResolveError::NotFound(_) => Problem::UnknownApp,
            ResolveError::NoProviderData(_) => Problem::NoVersionInfo,
        }
    }
}

impl From<ResolveError> for Problem {
    fn from(value: ResolveError) -> Self {
        Problem::from(&value)
    }
}

impl From<&FailureReason> for Problem {
    fn from(value: &FailureReason) -> Self {
        match value {
            FailureReason::Network(_) => Problem::NoInternet,
            FailureReason::Rejected(_) => Problem::CouldNotDownload,
            FailureReason::ResourceUnavailable(_) => Problem::StorageUnavailable,
            FailureReason::Timeout => Problem::TimedOut,
        }
    }
}

impl From<manager::Error> for Problem {
    fn from(value: manager::Error) -> Self {
        match value {
            manager::Error::UnknownTask(_) => Problem::NoSuchDownload,
            manager::Error::InvalidFileName(_) | manager::Error::TaskStillRunning(_) => {
                Problem::CouldNotDownload
            }
            manager::Error::Io(_) => Problem::StorageUnavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    UpdatesAvailable { count: usize },
    UpToDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DownloadOutcome {
    InstallQueued { file_name: String },
    Cancelled,
    UpToDate,
}

/// Platform installer, handed the path of a completed artifact.
pub trait Installer: Send + Sync {
    fn queue_install(&self, app: &str, artifact: &Path);
}

/// Platform adapters the facade needs from the shell.
pub struct Collaborators {
    pub feed: Arc<dyn ProviderFeed>,
    pub installed: Arc<dyn InstalledVersions>,
    pub installer: Arc<dyn Installer>,
    pub notifier: Arc<dyn NotificationSink>,
}

struct Shared {
    store: ProviderStore,
    refresher: Refresher,
    resolver: VersionResolver,
    preferences: ProviderPreferences,
    manager: DownloadManager,
    observer: DownloadObserver,
    cleaner: FileLifecycleCleaner,
    scheduler: Mutex<BackgroundScheduler>,
    installer: Arc<dyn Installer>,
    published: Arc<Published>,
    delete_on_leave: bool,
    check_interval: Duration,
}

/// Safe to Clone and pass around, clones share all state.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Must be called inside a tokio runtime.
    pub fn new(settings: &Settings, collaborators: Collaborators) -> Self {
        let changes = Arc::new(watch::channel(0u64).0);
        let store = ProviderStore::new();
        let preferences = ProviderPreferences::new(settings.default_providers.clone());
        let refresher = Refresher::new(
            store.clone(),
            collaborators.feed,
            settings.provider_timeout(),
        );
        let resolver = VersionResolver::new(
            store.clone(),
            collaborators.installed,
            Arc::new(preferences.clone()),
        );
        let observer = DownloadObserver::new(changes.clone());
        let manager = DownloadManager::new(settings.manager_config(), observer.clone());
        let published = Arc::new(Published::new(changes, settings.self_app.clone()));

        let check = Arc::new(UpdateCheck::new(
            refresher.clone(),
            resolver.clone(),
            collaborators.notifier,
            settings.self_app.clone(),
            settings.notification_filter(),
        ));
        let listener_state = published.clone();
        let scheduler = BackgroundScheduler::new(check).with_listener(Arc::new(
            move |report: &TickReport| listener_state.publish(&report.resolution),
        ));

        Orchestrator {
            shared: Arc::new(Shared {
                store,
                refresher,
                resolver,
                preferences,
                cleaner: FileLifecycleCleaner::new(manager.clone()),
                manager,
                observer,
                scheduler: Mutex::new(scheduler),
                installer: collaborators.installer,
                published,
                delete_on_leave: settings.downloads.delete_on_leave,
                check_interval: settings.check_interval(),
            }),
        }
    }

    /// Refreshes every provider and republishes the resolution.
    pub async fn check_for_updates(&self) -> Result<CheckOutcome, Problem> {
        let refresh = self.shared.refresher.refresh_all().await;
        let resolution = self.shared.resolver.resolve_all();
        self.shared.published.publish(&resolution);
        if let Some(problem) = refresh_problem(&refresh) {
            return Err(problem);
        }
        match resolution.updates().count() {
            0 => Ok(CheckOutcome::UpToDate),
            count => Ok(CheckOutcome::UpdatesAvailable { count }),
        }
    }

    /// Downloads the resolved artifact for `app` and hands it to the installer.
    /// Concurrent calls for the same app share one transfer and only one of
    /// them queues the install.
    pub async fn download_and_queue_install(&self, app: &str) -> Result<DownloadOutcome, Problem> {
        let resolved = self.shared.resolver.resolve(app)?;
        if resolved.installed.is_some() && !resolved.update_available {
            return Ok(DownloadOutcome::UpToDate);
        }
        let file_name = artifact_file_name(app, &resolved.latest, &resolved.artifact);
        let handle = self
            .shared
            .manager
            .start_for_app(app, &file_name, resolved.artifact.clone())
            .await?;
        match handle.clone().wait().await {
            Outcome::Completed { path } => match self.shared.manager.hand_off(&handle).await {
                HandOff::Claimed => {
                    log::info!("Queueing install of {} from {}", app, path.display());
                    self.shared.installer.queue_install(app, &path);
                    Ok(DownloadOutcome::InstallQueued { file_name })
                }
                HandOff::ClaimedElsewhere => Ok(DownloadOutcome::InstallQueued { file_name }),
                HandOff::Lost => {
                    log::warn!("{} was cleaned up before its install could be queued", file_name);
                    Err(Problem::CouldNotDownload)
                }
            },
            Outcome::Failed { reason } => {
                log::warn!("Download of {} failed: {}", file_name, reason);
                Err(Problem::from(&reason))
            }
            Outcome::Cancelled => Ok(DownloadOutcome::Cancelled),
        }
    }

    pub async fn cancel(&self, file_name: &str) -> Result<(), Problem> {
        Ok(self.shared.manager.cancel(file_name).await?)
    }

    /// Lock-free copy of the current state.
    pub fn snapshot(&self) -> Snapshot {
        self.shared
            .published
            .snapshot(&self.shared.observer.read_state())
    }

    /// Changes whenever the snapshot would.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.published.subscribe()
    }

    /// Makes `provider` win ties for `app` and republishes without refreshing.
    pub fn set_default_provider(&self, app: &str, provider: &str) -> Result<(), Problem> {
        let providers = self
            .shared
            .store
            .providers(app)
            .map_err(|_| Problem::UnknownApp)?;
        if !providers.iter().any(|p| p == provider) {
            return Err(Problem::UnknownProvider);
        }
        self.shared.preferences.set(app, provider);
        self.shared
            .published
            .publish(&self.shared.resolver.resolve_all());
        Ok(())
    }

    /// Enter-side cleanup catches files left behind by a session that was killed.
    pub async fn on_session_start(&self) -> SessionGuard {
        if !self.shared.delete_on_leave {
            return SessionGuard::new(None);
        }
        session::cleanup(&self.shared.cleaner, "start").await;
        SessionGuard::new(Some(self.shared.cleaner.clone()))
    }

    pub async fn start_background(&self, permit: SchedulingPermit) -> scheduler::Result<()> {
        let mut scheduler = self.shared.scheduler.lock().await;
        scheduler.start(self.shared.check_interval, permit)
    }

    pub async fn stop_background(&self) {
        self.shared.scheduler.lock().await.stop().await;
    }
}

fn refresh_problem(report: &RefreshReport) -> Option<Problem> {
    if !report.all_failed() {
        return None;
    }
    let timed_out = report
        .catalog_error
        .iter()
        .chain(report.failures.iter().map(|f| &f.error))
        .all(|e| matches!(e, RefreshError::Timeout(_)));
    Some(if timed_out {
        Problem::TimedOut
    } else {
        Problem::NoInternet
    })
}

/// `<app>-<version>.<ext>`, the extension taken from the artifact URL.
pub fn artifact_file_name(app: &str, version: &Version, artifact: &Url) -> String {
    let extension = parse_filename(artifact)
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(DEFAULT_ARTIFACT_EXTENSION);
    sanitize_file_name(&format!("{}-{}.{}", app, version, extension))
}
