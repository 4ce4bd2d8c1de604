use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{AppIdentity, CatalogEntry, ProviderId};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Provider unavailable: '{0}'")]
    Unavailable(String),
    #[error("Request error: '{0}'")]
    Request(#[from] reqwest::Error),
}

/// A provider's answer for one app: `{version, artifactReference, fetchedAt}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReport {
    pub version: String,
    pub artifact: String,
    pub fetched_at: DateTime<Utc>,
}

/// Source of the app catalog and of per-provider version metadata.
#[async_trait]
pub trait ProviderFeed: Send + Sync {
    async fn catalog(&self) -> Result<Vec<CatalogEntry>, FeedError>;
    async fn query(&self, app: &str, provider: &str) -> Result<ProviderReport, FeedError>;
}

/// JSON feed served over HTTP.
///
/// * `GET {base}/catalog` returns `[{"app": .., "providers": [..]}]`
/// * `GET {base}/apps/{app}/providers/{provider}` returns
///   `{"version": .., "artifact": .., "fetched_at": ..}`, `fetched_at` being optional
#[derive(Debug, Clone)]
pub struct HttpFeed {
    base: Url,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct WireReport {
    version: String,
    artifact: String,
    #[serde(default)]
    fetched_at: Option<DateTime<Utc>>,
}

impl HttpFeed {
    pub fn new(base: Url, client: Client) -> Self {
        HttpFeed { base, client }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, FeedError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| FeedError::Unavailable(format!("Feed url '{}' cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl ProviderFeed for HttpFeed {
    async fn catalog(&self) -> Result<Vec<CatalogEntry>, FeedError> {
        let url = self.endpoint(&["catalog"])?;
        let entries = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<CatalogEntry>>()
            .await?;
        Ok(entries)
    }

    async fn query(&self, app: &str, provider: &str) -> Result<ProviderReport, FeedError> {
        let url = self.endpoint(&["apps", app, "providers", provider])?;
        // Taken before sending so a slow answer never outdates a faster, later one.
        let requested_at = Utc::now();
        let wire = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<WireReport>()
            .await?;
        Ok(ProviderReport {
            version: wire.version,
            artifact: wire.artifact,
            fetched_at: wire.fetched_at.unwrap_or(requested_at),
        })
    }
}

#[derive(Debug, Default)]
struct StaticState {
    catalog: Vec<CatalogEntry>,
    reports: HashMap<(AppIdentity, ProviderId), ProviderReport>,
    catalog_down: bool,
    delay: Option<Duration>,
}

/// In-memory feed, for offline use and for driving the engine in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticFeed {
    state: Arc<RwLock<StaticState>>,
    catalog_calls: Arc<AtomicUsize>,
}

impl StaticFeed {
    pub fn new(catalog: Vec<CatalogEntry>) -> Self {
        let feed = StaticFeed::default();
        feed.set_catalog(catalog);
        feed
    }

    pub fn set_catalog(&self, catalog: Vec<CatalogEntry>) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).catalog = catalog;
    }

    pub fn set_report(&self, app: &str, provider: &str, report: ProviderReport) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .reports
            .insert((app.to_owned(), provider.to_owned()), report);
    }

    /// Makes a provider unavailable until a report is set again.
    pub fn remove_report(&self, app: &str, provider: &str) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .reports
            .remove(&(app.to_owned(), provider.to_owned()));
    }

    pub fn set_catalog_down(&self, down: bool) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).catalog_down = down;
    }

    /// Delays every answer, to simulate slow providers.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).delay = delay;
    }

    /// How many catalog requests were served, one per refresh pass.
    pub fn catalog_calls(&self) -> usize {
        self.catalog_calls.load(Ordering::SeqCst)
    }

    fn delay(&self) -> Option<Duration> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).delay
    }
}

#[async_trait]
impl ProviderFeed for StaticFeed {
    async fn catalog(&self) -> Result<Vec<CatalogEntry>, FeedError> {
        self.catalog_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.catalog_down {
            return Err(FeedError::Unavailable("catalog".to_owned()));
        }
        Ok(state.catalog.clone())
    }

    async fn query(&self, app: &str, provider: &str) -> Result<ProviderReport, FeedError> {
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .reports
            .get(&(app.to_owned(), provider.to_owned()))
            .cloned()
            .ok_or_else(|| FeedError::Unavailable(format!("{}/{}", app, provider)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::{extract::Path, routing::get, Json, Router};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_log::test;

    async fn spawn_feed_server() -> anyhow::Result<Url> {
        let app = Router::new()
            .route(
                "/feed/catalog",
                get(|| async { Json(json!([{"app": "Foo Bar", "providers": ["A", "B"]}])) }),
            )
            .route(
                "/feed/apps/:app/providers/:provider",
                get(|Path((app, provider)): Path<(String, String)>| async move {
                    Json(json!({
                        "version": "1.2.0",
                        "artifact": format!("https://{}.example/{}.apk", provider, app),
                    }))
                }),
            );
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let url = Url::parse(&format!("http://{}/feed/", listener.local_addr()?))?;
        let server = axum::Server::from_tcp(listener)?.serve(app.into_make_service());
        tokio::spawn(server);
        Ok(url)
    }

    #[test(tokio::test)]
    async fn http_feed_reads_catalog_and_reports() -> anyhow::Result<()> {
        let base = spawn_feed_server().await?;
        let feed = HttpFeed::new(base, Client::new());
        let catalog = feed.catalog().await?;
        assert_eq!(catalog, vec![CatalogEntry::new("Foo Bar", &["A", "B"])]);
        let before = Utc::now();
        let report = feed.query("Foo Bar", "A").await?;
        assert_eq!(report.version, "1.2.0");
        assert_eq!(report.artifact, "https://A.example/Foo Bar.apk");
        assert!(report.fetched_at >= before, "missing fetched_at defaults to the request time");
        Ok(())
    }

    #[test(tokio::test)]
    async fn static_feed_reports_missing_providers_as_unavailable() {
        let feed = StaticFeed::new(vec![CatalogEntry::new("Foo", &["A"])]);
        assert!(matches!(
            feed.query("Foo", "A").await,
            Err(FeedError::Unavailable(_))
        ));
        feed.set_catalog_down(true);
        assert!(feed.catalog().await.is_err());
        assert_eq!(feed.catalog_calls(), 1);
    }
}
