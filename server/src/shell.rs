//! Platform adapters for running the engine as a local service.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use reqwest::{Client, Url};
use updater::orchestrator::{Collaborators, Installer, Orchestrator};
use updater::provider::{AppIdentity, HttpFeed, ProviderFeed, StaticFeed};
use updater::resolver::InstalledVersions;
use updater::{Notification, NotificationSink, SettingManager, Version};

use crate::ApplicationState;

/// Notifications end up in the log.
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::UpdateAvailable { app, version } => {
                log::info!("Update available for {}: {}", app, version)
            }
            Notification::NewRelease { version } => {
                log::info!("A new release of this application is available: {}", version)
            }
        }
    }
}

/// Installation is platform specific; this hand-off only records the artifact.
pub struct LogInstaller;

impl Installer for LogInstaller {
    fn queue_install(&self, app: &str, artifact: &Path) {
        log::info!("Install of {} queued from {}", app, artifact.display());
    }
}

/// Installed versions read once from a YAML map of `app: version`.
#[derive(Debug, Default)]
pub struct InstalledFile {
    versions: BTreeMap<AppIdentity, Version>,
}

impl InstalledFile {
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            log::info!("No installed versions file configured, every app counts as not installed");
            return Ok(InstalledFile::default());
        };
        let file = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Reading installed versions from {}", path.display()))?;
        Self::parse(&file).with_context(|| format!("Parsing {}", path.display()))
    }

    /// Unquoted numbers are taken as YAML reads them, so `1.10` must be quoted.
    pub fn parse(yaml: &str) -> anyhow::Result<Self> {
        let raw: BTreeMap<AppIdentity, serde_yaml::Value> = serde_yaml::from_str(yaml)?;
        let mut versions = BTreeMap::new();
        for (app, value) in raw {
            let text = match value {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Number(n) => n.to_string(),
                other => anyhow::bail!("Version of {} is not a string: {:?}", app, other),
            };
            let version = Version::parse(&text).with_context(|| format!("Version of {}", app))?;
            versions.insert(app, version);
        }
        Ok(InstalledFile { versions })
    }
}

impl InstalledVersions for InstalledFile {
    fn installed_version(&self, app: &str) -> Option<Version> {
        self.versions.get(app).cloned()
    }
}

/// Wires the facade to the configured feed and the local adapters.
pub async fn build_state(setting_manager: SettingManager) -> anyhow::Result<ApplicationState> {
    let settings = setting_manager.read().await.clone();
    let feed: Arc<dyn ProviderFeed> = match &settings.feed_url {
        Some(url) => {
            let base = Url::parse(url).with_context(|| format!("Invalid feed_url '{}'", url))?;
            Arc::new(HttpFeed::new(base, Client::new()))
        }
        None => {
            log::warn!("No feed_url configured, the catalog stays empty");
            Arc::new(StaticFeed::new(Vec::new()))
        }
    };
    let installed = InstalledFile::load(settings.installed_versions_file.as_deref()).await?;
    let orchestrator = Orchestrator::new(
        &settings,
        Collaborators {
            feed,
            installed: Arc::new(installed),
            installer: Arc::new(LogInstaller),
            notifier: Arc::new(LogNotifier),
        },
    );
    Ok(ApplicationState {
        orchestrator,
        setting_manager,
    })
}
