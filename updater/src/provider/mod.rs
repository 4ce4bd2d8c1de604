//! Provider side of the engine: the catalog of apps, the version records each
//! provider last reported for them, and the refresh pass that keeps those
//! records current.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::version::Version;

pub mod feed;
pub mod refresh;
pub mod store;

pub use feed::{FeedError, HttpFeed, ProviderFeed, ProviderReport, StaticFeed};
pub use refresh::{RefreshError, RefreshFailure, RefreshReport, Refresher};
pub use store::{ProviderStore, Upsert};

/// Key naming an app inside the catalog.
pub type AppIdentity = String;
pub type ProviderId = String;

/// An app as listed by the catalog feed, with its providers in configured order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub app: AppIdentity,
    pub providers: Vec<ProviderId>,
}

impl CatalogEntry {
    pub fn new(app: impl Into<AppIdentity>, providers: &[&str]) -> Self {
        CatalogEntry {
            app: app.into(),
            providers: providers.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// What a single provider last reported for a single app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    pub app: AppIdentity,
    pub provider: ProviderId,
    pub version: Version,
    pub artifact: Url,
    pub fetched_at: DateTime<Utc>,
}
