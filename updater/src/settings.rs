use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dirs::home_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};

use crate::httpdownload::download::config::HttpDownloadConfig;
use crate::httpdownload::manager::ManagerConfig;
use crate::provider::{AppIdentity, ProviderId};
use crate::scheduler::NotificationFilter;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Settings file {0} could not be accessed: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Settings file {0} is not valid YAML: {1}")]
    Yaml(PathBuf, #[source] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn transient_download_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("updater")
        .join("downloads")
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Wipe the transient download directory at every session boundary.
    pub delete_on_leave: bool,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub progress_interval_ms: u64,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        let http = HttpDownloadConfig::default();
        DownloadSettings {
            delete_on_leave: true,
            max_retries: http.max_retries,
            retry_backoff_ms: http.retry_backoff.as_millis() as u64,
            request_timeout_secs: http.timeout.as_secs(),
            progress_interval_ms: http.progress_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub updates: bool,
    pub new_release: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        NotificationSettings {
            updates: true,
            new_release: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub download_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub downloads: DownloadSettings,
    pub notifications: NotificationSettings,
    pub check_interval_secs: u64,
    pub provider_timeout_secs: u64,
    pub default_providers: BTreeMap<AppIdentity, ProviderId>,
    /// Base URL of the catalog/provider feed.
    pub feed_url: Option<String>,
    /// Catalog identity of the host application, its updates are new releases.
    pub self_app: Option<AppIdentity>,
    pub installed_versions_file: Option<PathBuf>,
    pub listen_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: transient_download_dir(),
            max_concurrent_downloads: 3,
            downloads: DownloadSettings::default(),
            notifications: NotificationSettings::default(),
            check_interval_secs: 6 * 60 * 60,
            provider_timeout_secs: 15,
            default_providers: BTreeMap::new(),
            feed_url: None,
            self_app: None,
            installed_versions_file: None,
            listen_addr: "0.0.0.0:42069".to_owned(),
        }
    }
}

impl Settings {
    pub fn download_config(&self) -> HttpDownloadConfig {
        HttpDownloadConfig {
            timeout: Duration::from_secs(self.downloads.request_timeout_secs),
            max_retries: self.downloads.max_retries,
            retry_backoff: Duration::from_millis(self.downloads.retry_backoff_ms),
            progress_interval: Duration::from_millis(self.downloads.progress_interval_ms),
            ..HttpDownloadConfig::default()
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            download_dir: self.download_dir.clone(),
            max_concurrent_downloads: self.max_concurrent_downloads.max(1),
            http: self.download_config(),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn notification_filter(&self) -> NotificationFilter {
        NotificationFilter {
            updates: self.notifications.updates,
            new_release: self.notifications.new_release,
        }
    }
}

/// Loads, hands out and persists the YAML settings file.
#[derive(Debug, Clone)]
pub struct SettingManager {
    inner: Arc<RwLock<Settings>>,
    settings_path: PathBuf,
}

pub fn default_settings_path() -> PathBuf {
    home_dir()
        .unwrap_or_default()
        .join(".updater")
        .join("settings.yaml")
}

impl SettingManager {
    pub async fn load(p: Option<PathBuf>) -> Result<Self> {
        let path = p.unwrap_or_else(default_settings_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Io(parent.to_path_buf(), e))?;
        }
        let settings = load_settings(&path).await?;
        Ok(Self {
            inner: Arc::new(RwLock::new(settings)),
            settings_path: path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub async fn read(&self) -> RwLockReadGuard<Settings> {
        self.inner.read().await
    }

    /// Persists first, the in-memory copy only changes once the file is written.
    pub async fn write(&self, settings: Settings) -> Result<()> {
        let bytes = serde_yaml::to_string(&settings)
            .map_err(|e| Error::Yaml(self.settings_path.clone(), e))?;
        tokio::fs::write(&self.settings_path, bytes)
            .await
            .map_err(|e| Error::Io(self.settings_path.clone(), e))?;
        log::info!(
            "Settings file written to {}",
            self.settings_path.to_string_lossy()
        );
        let mut guard = self.inner.write().await;
        *guard = settings;
        Ok(())
    }

    pub async fn update(&self, change: impl FnOnce(&mut Settings)) -> Result<Settings> {
        let mut settings = self.read().await.clone();
        change(&mut settings);
        self.write(settings.clone()).await?;
        Ok(settings)
    }
}

async fn load_settings(p: &Path) -> Result<Settings> {
    let file_exists = tokio::fs::try_exists(p).await.unwrap_or(false);
    if file_exists {
        log::info!("Found settings file at {}, reading...", p.to_string_lossy());
        let file = tokio::fs::read_to_string(p)
            .await
            .map_err(|e| Error::Io(p.to_path_buf(), e))?;
        let settings: Settings =
            serde_yaml::from_str(&file).map_err(|e| Error::Yaml(p.to_path_buf(), e))?;
        log::debug!("Settings loaded: {:?}", settings);
        return Ok(settings);
    }
    log::info!(
        "No settings file found at {}, creating...",
        p.to_string_lossy()
    );
    let settings = Settings::default();
    let settings_str =
        serde_yaml::to_string(&settings).map_err(|e| Error::Yaml(p.to_path_buf(), e))?;
    tokio::fs::write(p, settings_str)
        .await
        .map_err(|e| Error::Io(p.to_path_buf(), e))?;
    Ok(settings)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::util::test::tmp_dir;
    use pretty_assertions::assert_eq;
    use test_log::test;

    #[test(tokio::test)]
    async fn first_load_creates_the_file() -> anyhow::Result<()> {
        let tmp_dir = tmp_dir()?;
        let path = tmp_dir.path().join("conf").join("settings.yaml");
        let manager = SettingManager::load(Some(path.clone())).await?;
        assert!(path.exists());
        assert_eq!(*manager.read().await, Settings::default());
        Ok(())
    }

    #[test(tokio::test)]
    async fn missing_fields_are_defaulted() -> anyhow::Result<()> {
        let tmp_dir = tmp_dir()?;
        let path = tmp_dir.path().join("settings.yaml");
        tokio::fs::write(
            &path,
            "max_concurrent_downloads: 5\ndownloads:\n  delete_on_leave: false\ndefault_providers:\n  Foo: B\n",
        )
        .await?;
        let manager = SettingManager::load(Some(path)).await?;
        let settings = manager.read().await.clone();
        assert_eq!(settings.max_concurrent_downloads, 5);
        assert!(!settings.downloads.delete_on_leave);
        assert_eq!(settings.downloads.max_retries, 3);
        assert_eq!(settings.default_providers["Foo"], "B");
        assert!(settings.notifications.updates);
        assert_eq!(settings.download_config().retry_backoff, Duration::from_secs(1));
        Ok(())
    }

    #[test(tokio::test)]
    async fn updates_are_persisted() -> anyhow::Result<()> {
        let tmp_dir = tmp_dir()?;
        let path = tmp_dir.path().join("settings.yaml");
        let manager = SettingManager::load(Some(path.clone())).await?;
        manager
            .update(|s| {
                s.default_providers.insert("Foo".to_owned(), "C".to_owned());
                s.notifications.new_release = false;
            })
            .await?;
        let reloaded = SettingManager::load(Some(path)).await?;
        assert_eq!(*reloaded.read().await, *manager.read().await);
        assert!(!reloaded.read().await.notification_filter().new_release);
        Ok(())
    }

    #[test(tokio::test)]
    async fn invalid_yaml_is_an_error() -> anyhow::Result<()> {
        let tmp_dir = tmp_dir()?;
        let path = tmp_dir.path().join("settings.yaml");
        tokio::fs::write(&path, "max_concurrent_downloads: [nope").await?;
        assert!(matches!(
            SettingManager::load(Some(path)).await,
            Err(Error::Yaml(..))
        ));
        Ok(())
    }
}
