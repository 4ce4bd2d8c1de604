//! Decides, per app, which provider's report is authoritative and whether it
//! is newer than what is installed.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use reqwest::Url;
use thiserror::Error;

use crate::provider::{store, AppIdentity, ProviderId, ProviderRecord, ProviderStore};
use crate::version::Version;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("App '{0}' is not in the catalog")]
    NotFound(AppIdentity),
    #[error("No provider has reported a version for '{0}'")]
    NoProviderData(AppIdentity),
}

impl From<store::Error> for ResolveError {
    fn from(value: store::Error) -> Self {
        match value {
            store::Error::NotFound(app) | store::Error::UnknownProvider { app, .. } => {
                ResolveError::NotFound(app)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Platform query for the version currently installed on the device.
pub trait InstalledVersions: Send + Sync {
    fn installed_version(&self, app: &str) -> Option<Version>;
}

impl InstalledVersions for HashMap<AppIdentity, Version> {
    fn installed_version(&self, app: &str) -> Option<Version> {
        self.get(app).cloned()
    }
}

impl InstalledVersions for BTreeMap<AppIdentity, Version> {
    fn installed_version(&self, app: &str) -> Option<Version> {
        self.get(app).cloned()
    }
}

/// The user's persisted "default provider" selection.
pub trait DefaultProviders: Send + Sync {
    fn default_provider(&self, app: &str) -> Option<ProviderId>;
}

/// Shared, updatable default provider selection.
#[derive(Debug, Clone, Default)]
pub struct ProviderPreferences {
    inner: Arc<RwLock<HashMap<AppIdentity, ProviderId>>>,
}

impl ProviderPreferences {
    pub fn new(defaults: impl IntoIterator<Item = (AppIdentity, ProviderId)>) -> Self {
        ProviderPreferences {
            inner: Arc::new(RwLock::new(defaults.into_iter().collect())),
        }
    }

    pub fn set(&self, app: &str, provider: &str) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(app.to_owned(), provider.to_owned());
    }

    pub fn clear(&self, app: &str) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(app);
    }
}

impl DefaultProviders for ProviderPreferences {
    fn default_provider(&self, app: &str) -> Option<ProviderId> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app)
            .cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    pub app: AppIdentity,
    pub latest: Version,
    pub source: ProviderId,
    pub artifact: Url,
    pub fetched_at: DateTime<Utc>,
    pub installed: Option<Version>,
    pub update_available: bool,
}

/// Outcome of resolving the whole catalog: one app failing never hides the others.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub resolved: BTreeMap<AppIdentity, ResolvedVersion>,
    pub failures: BTreeMap<AppIdentity, ResolveError>,
}

impl Resolution {
    pub fn updates(&self) -> impl Iterator<Item = &ResolvedVersion> {
        self.resolved.values().filter(|r| r.update_available)
    }
}

/// `true` when `latest` should replace `installed`. Nothing is offered for apps
/// that are not installed.
pub fn is_update(latest: &Version, installed: Option<&Version>) -> bool {
    installed.map_or(false, |installed| latest > installed)
}

/// Pure computation over the current store contents; never triggers a refresh.
#[derive(Clone)]
pub struct VersionResolver {
    store: ProviderStore,
    installed: Arc<dyn InstalledVersions>,
    defaults: Arc<dyn DefaultProviders>,
}

impl VersionResolver {
    pub fn new(
        store: ProviderStore,
        installed: Arc<dyn InstalledVersions>,
        defaults: Arc<dyn DefaultProviders>,
    ) -> Self {
        VersionResolver {
            store,
            installed,
            defaults,
        }
    }

    pub fn resolve(&self, app: &str) -> Result<ResolvedVersion> {
        let records = self.store.records(app)?;
        let configured = self.store.providers(app)?;
        let default = self.defaults.default_provider(app);
        let rank = |provider: &str| -> usize {
            if default.as_deref() == Some(provider) {
                0
            } else {
                configured
                    .iter()
                    .position(|p| p == provider)
                    .map_or(usize::MAX, |i| i + 1)
            }
        };
        let winner = records
            .into_iter()
            .max_by(|a, b| preference(a, b, &rank))
            .ok_or_else(|| ResolveError::NoProviderData(app.to_owned()))?;
        let installed = self.installed.installed_version(app);
        let update_available = is_update(&winner.version, installed.as_ref());
        Ok(ResolvedVersion {
            app: winner.app,
            latest: winner.version,
            source: winner.provider,
            artifact: winner.artifact,
            fetched_at: winner.fetched_at,
            installed,
            update_available,
        })
    }

    pub fn resolve_all(&self) -> Resolution {
        let mut resolution = Resolution::default();
        for app in self.store.apps() {
            match self.resolve(&app) {
                Ok(resolved) => {
                    resolution.resolved.insert(app, resolved);
                }
                Err(e) => {
                    resolution.failures.insert(app, e);
                }
            }
        }
        resolution
    }
}

/// Total order on the records of one app: greater means preferred.
/// Version first, then the later fetch, then the better provider rank and
/// finally the provider id so that equal inputs always pick the same record.
fn preference(a: &ProviderRecord, b: &ProviderRecord, rank: &impl Fn(&str) -> usize) -> Ordering {
    a.version
        .cmp(&b.version)
        .then_with(|| a.fetched_at.cmp(&b.fetched_at))
        .then_with(|| rank(&b.provider).cmp(&rank(&a.provider)))
        .then_with(|| b.provider.cmp(&a.provider))
}
