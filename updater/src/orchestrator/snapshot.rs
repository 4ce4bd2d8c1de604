use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use super::Problem;
use crate::httpdownload::observer::DownloadStates;
use crate::httpdownload::{State, TaskSnapshot};
use crate::provider::AppIdentity;
use crate::resolver::{ResolveError, ResolvedVersion, Resolution};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppView {
    pub app: AppIdentity,
    pub latest: Option<String>,
    pub source: Option<String>,
    pub installed: Option<String>,
    pub update_available: bool,
    pub problem: Option<Problem>,
}

impl AppView {
    fn resolved(resolved: &ResolvedVersion) -> Self {
        AppView {
            app: resolved.app.clone(),
            latest: Some(resolved.latest.to_string()),
            source: Some(resolved.source.clone()),
            installed: resolved.installed.as_ref().map(ToString::to_string),
            update_available: resolved.update_available,
            problem: None,
        }
    }

    fn failed(app: &str, error: &ResolveError) -> Self {
        AppView {
            app: app.to_owned(),
            latest: None,
            source: None,
            installed: None,
            update_available: false,
            problem: Some(Problem::from(error)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadView {
    pub file_name: String,
    pub app: Option<AppIdentity>,
    pub status: DownloadStatus,
    /// In [0.0, 1.0].
    pub progress: f64,
    pub percent: u8,
    pub bytes_received: u64,
    pub bytes_total: Option<u64>,
    pub bytes_per_second: u64,
    pub started_at: DateTime<Utc>,
    pub problem: Option<Problem>,
}

impl From<&TaskSnapshot> for DownloadView {
    fn from(task: &TaskSnapshot) -> Self {
        let (status, problem) = match &task.state {
            State::Pending => (DownloadStatus::Pending, None),
            State::InProgress => (DownloadStatus::InProgress, None),
            State::Completed { .. } => (DownloadStatus::Completed, None),
            State::Failed { reason } => (DownloadStatus::Failed, Some(Problem::from(reason))),
            State::Cancelled => (DownloadStatus::Cancelled, None),
        };
        let progress = task.progress_fraction();
        DownloadView {
            file_name: task.file_name.clone(),
            app: task.app.clone(),
            status,
            progress,
            percent: (progress * 100.0).round() as u8,
            bytes_received: task.progress.bytes_received,
            bytes_total: task.progress.bytes_total,
            bytes_per_second: task.progress.bytes_per_second,
            started_at: task.started_at,
            problem,
        }
    }
}

/// Everything the UI needs to render, copied out at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub apps: BTreeMap<AppIdentity, AppView>,
    pub downloads: BTreeMap<String, DownloadView>,
    /// Newer release of the host application, if one is known.
    pub new_release: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct AppsState {
    apps: BTreeMap<AppIdentity, AppView>,
    new_release: Option<String>,
    last_checked: Option<DateTime<Utc>>,
}

/// Last published resolution state, shared with the scheduler's tick listener.
pub(super) struct Published {
    apps: ArcSwap<AppsState>,
    changes: Arc<watch::Sender<u64>>,
    self_app: Option<AppIdentity>,
}

impl Published {
    pub fn new(changes: Arc<watch::Sender<u64>>, self_app: Option<AppIdentity>) -> Self {
        Published {
            apps: ArcSwap::from_pointee(AppsState::default()),
            changes,
            self_app,
        }
    }

    pub fn publish(&self, resolution: &Resolution) {
        let mut apps: BTreeMap<AppIdentity, AppView> = resolution
            .resolved
            .iter()
            .map(|(app, resolved)| (app.clone(), AppView::resolved(resolved)))
            .collect();
        for (app, error) in &resolution.failures {
            apps.insert(app.clone(), AppView::failed(app, error));
        }
        let new_release = self
            .self_app
            .as_ref()
            .and_then(|host| resolution.resolved.get(host))
            .filter(|host| host.update_available)
            .map(|host| host.latest.to_string());
        self.apps.store(Arc::new(AppsState {
            apps,
            new_release,
            last_checked: Some(Utc::now()),
        }));
        self.changes.send_modify(|version| *version += 1);
    }

    pub fn snapshot(&self, downloads: &DownloadStates) -> Snapshot {
        let apps = self.apps.load();
        Snapshot {
            apps: apps.apps.clone(),
            downloads: downloads
                .iter()
                .map(|(file_name, task)| (file_name.clone(), DownloadView::from(task)))
                .collect(),
            new_release: apps.new_release.clone(),
            last_checked: apps.last_checked,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
