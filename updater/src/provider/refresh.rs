use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use reqwest::Url;
use thiserror::Error;

use super::feed::ProviderFeed;
use super::store::{self, ProviderStore, Upsert};
use super::{AppIdentity, ProviderId, ProviderRecord};
use crate::version::Version;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Provider unavailable: '{0}'")]
    ProviderUnavailable(String),
    #[error("Provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Provider reported an unusable record: '{0}'")]
    InvalidReport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshFailure {
    pub app: AppIdentity,
    pub provider: ProviderId,
    pub error: RefreshError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub stored: usize,
    pub stale: usize,
    pub failures: Vec<RefreshFailure>,
    /// Set when the catalog itself could not be fetched; the previous catalog was kept.
    pub catalog_error: Option<RefreshError>,
}

impl RefreshReport {
    /// True when nothing answered at all, usually meaning there is no connectivity.
    pub fn all_failed(&self) -> bool {
        self.stored + self.stale == 0 && (!self.failures.is_empty() || self.catalog_error.is_some())
    }
}

/// Queries every configured provider of every catalog app and feeds the answers
/// into the store. A provider failing never aborts the pass.
#[derive(Clone)]
pub struct Refresher {
    store: ProviderStore,
    feed: Arc<dyn ProviderFeed>,
    timeout: Duration,
}

impl Refresher {
    pub fn new(store: ProviderStore, feed: Arc<dyn ProviderFeed>, timeout: Duration) -> Self {
        Refresher {
            store,
            feed,
            timeout,
        }
    }

    pub async fn refresh_all(&self) -> RefreshReport {
        let mut report = RefreshReport::default();
        match tokio::time::timeout(self.timeout, self.feed.catalog()).await {
            Ok(Ok(entries)) => self.store.sync_catalog(entries),
            Ok(Err(e)) => {
                log::warn!("Catalog unavailable, keeping the previous one: {}", e);
                report.catalog_error = Some(RefreshError::ProviderUnavailable(e.to_string()));
            }
            Err(_) => {
                log::warn!("Catalog did not answer within {:?}", self.timeout);
                report.catalog_error = Some(RefreshError::Timeout(self.timeout));
            }
        }
        let mut pairs = Vec::new();
        for app in self.store.apps() {
            if let Ok(providers) = self.store.providers(&app) {
                pairs.extend(providers.into_iter().map(|provider| (app.clone(), provider)));
            }
        }
        self.refresh_pairs(pairs, &mut report).await;
        log::info!(
            "Provider refresh done: {} stored, {} stale, {} failed",
            report.stored,
            report.stale,
            report.failures.len()
        );
        report
    }

    /// Refreshes the providers of a single app.
    pub async fn refresh_app(&self, app: &str) -> store::Result<RefreshReport> {
        let providers = self.store.providers(app)?;
        let mut report = RefreshReport::default();
        let pairs = providers
            .into_iter()
            .map(|provider| (app.to_owned(), provider))
            .collect();
        self.refresh_pairs(pairs, &mut report).await;
        Ok(report)
    }

    async fn refresh_pairs(&self, pairs: Vec<(AppIdentity, ProviderId)>, report: &mut RefreshReport) {
        let fetches = pairs.into_iter().map(|(app, provider)| async move {
            let result = self.fetch(&app, &provider).await;
            (app, provider, result)
        });
        for (app, provider, result) in join_all(fetches).await {
            let outcome = result.and_then(|record| {
                self.store
                    .upsert(record)
                    .map_err(|e| RefreshError::InvalidReport(e.to_string()))
            });
            match outcome {
                Ok(Upsert::Stored) => report.stored += 1,
                Ok(Upsert::Stale) => report.stale += 1,
                Err(error) => {
                    log::warn!("Refreshing {}/{} failed: {}", app, provider, error);
                    report.failures.push(RefreshFailure {
                        app,
                        provider,
                        error,
                    });
                }
            }
        }
    }

    async fn fetch(&self, app: &str, provider: &str) -> Result<ProviderRecord, RefreshError> {
        let report = tokio::time::timeout(self.timeout, self.feed.query(app, provider))
            .await
            .map_err(|_| RefreshError::Timeout(self.timeout))?
            .map_err(|e| RefreshError::ProviderUnavailable(e.to_string()))?;
        let version = Version::parse(&report.version)
            .map_err(|e| RefreshError::InvalidReport(e.to_string()))?;
        let artifact = Url::parse(&report.artifact)
            .map_err(|e| RefreshError::InvalidReport(format!("{}: '{}'", e, report.artifact)))?;
        Ok(ProviderRecord {
            app: app.to_owned(),
            provider: provider.to_owned(),
            version,
            artifact,
            fetched_at: report.fetched_at,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::store::test::at;
    use crate::provider::{CatalogEntry, HttpFeed, ProviderReport, StaticFeed};
    use axum::{extract::State, routing::get, Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use pretty_assertions::assert_eq;
    use test_log::test;

    fn report(version: &str, fetched_at: i64) -> ProviderReport {
        ProviderReport {
            version: version.to_owned(),
            artifact: format!("https://mirror.example/foo-{}.apk", version),
            fetched_at: at(fetched_at),
        }
    }

    fn setup() -> (ProviderStore, StaticFeed, Refresher) {
        let store = ProviderStore::new();
        let feed = StaticFeed::new(vec![
            CatalogEntry::new("Foo", &["A", "B"]),
            CatalogEntry::new("Bar", &["A"]),
        ]);
        let refresher = Refresher::new(store.clone(), Arc::new(feed.clone()), Duration::from_millis(200));
        (store, feed, refresher)
    }

    #[test(tokio::test)]
    async fn failing_provider_does_not_abort_the_pass() {
        let (store, feed, refresher) = setup();
        feed.set_report("Foo", "A", report("1.2", 10));
        feed.set_report("Bar", "A", report("3.0", 10));
        let result = refresher.refresh_all().await;
        assert_eq!(result.stored, 2);
        assert_eq!(
            result.failures,
            vec![RefreshFailure {
                app: "Foo".to_owned(),
                provider: "B".to_owned(),
                error: RefreshError::ProviderUnavailable("Provider unavailable: 'Foo/B'".to_owned()),
            }]
        );
        assert_eq!(store.records("Foo").unwrap().len(), 1);
        assert_eq!(store.records("Bar").unwrap().len(), 1);
        assert!(!result.all_failed());
    }

    #[test(tokio::test)]
    async fn stale_reports_are_counted_not_stored() {
        let (store, feed, refresher) = setup();
        feed.set_report("Foo", "A", report("1.2", 20));
        refresher.refresh_all().await;
        feed.set_report("Foo", "A", report("1.1", 10));
        let result = refresher.refresh_all().await;
        assert_eq!(result.stale, 1);
        assert_eq!(store.records("Foo").unwrap()[0].version, Version::parse("1.2").unwrap());
    }

    #[test(tokio::test)]
    async fn invalid_reports_are_failures() {
        let (store, feed, refresher) = setup();
        feed.set_report("Foo", "A", report("one.two", 10));
        feed.set_report(
            "Foo",
            "B",
            ProviderReport {
                version: "1.0".to_owned(),
                artifact: "not a url".to_owned(),
                fetched_at: at(10),
            },
        );
        let result = refresher.refresh_app("Foo").await.unwrap();
        assert_eq!(result.failures.len(), 2);
        assert!(result
            .failures
            .iter()
            .all(|f| matches!(f.error, RefreshError::InvalidReport(_))));
        assert!(store.records("Foo").unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn slow_providers_time_out() {
        let (_store, feed, refresher) = setup();
        feed.set_report("Foo", "A", report("1.2", 10));
        feed.set_delay(Some(Duration::from_secs(5)));
        let result = refresher.refresh_app("Foo").await.unwrap();
        assert!(result
            .failures
            .iter()
            .all(|f| f.error == RefreshError::Timeout(Duration::from_millis(200))));
        assert!(result.all_failed());
    }

    #[test(tokio::test)]
    async fn unavailable_catalog_keeps_the_previous_one() {
        let (store, feed, refresher) = setup();
        refresher.refresh_all().await;
        feed.set_catalog_down(true);
        let result = refresher.refresh_all().await;
        assert!(result.catalog_error.is_some());
        assert_eq!(store.apps(), vec!["Bar".to_owned(), "Foo".to_owned()]);
        assert!(matches!(
            refresher.refresh_app("Baz").await,
            Err(store::Error::NotFound(_))
        ));
    }

    /// First request answers 1.0 after a delay, every later one answers 1.1 at once.
    async fn spawn_lagging_feed() -> anyhow::Result<Url> {
        async fn answer(State(hits): State<Arc<AtomicUsize>>) -> Json<serde_json::Value> {
            let version = if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(300)).await;
                "1.0"
            } else {
                "1.1"
            };
            Json(json!({
                "version": version,
                "artifact": format!("https://mirror.example/foo-{}.apk", version),
            }))
        }
        let app = Router::new()
            .route("/apps/:app/providers/:provider", get(answer))
            .with_state(Arc::new(AtomicUsize::new(0)));
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let url = Url::parse(&format!("http://{}/", listener.local_addr()?))?;
        let server = axum::Server::from_tcp(listener)?.serve(app.into_make_service());
        tokio::spawn(server);
        Ok(url)
    }

    #[test(tokio::test)]
    async fn slow_answer_does_not_overwrite_a_later_request() -> anyhow::Result<()> {
        let store = ProviderStore::new();
        store.register(CatalogEntry::new("Foo", &["A"]));
        let feed = HttpFeed::new(spawn_lagging_feed().await?, reqwest::Client::new());
        let refresher = Refresher::new(store.clone(), Arc::new(feed), Duration::from_secs(2));

        let first = {
            let refresher = refresher.clone();
            tokio::spawn(async move { refresher.refresh_app("Foo").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = refresher.refresh_app("Foo").await?;
        let first = first.await??;

        assert_eq!(second.stored, 1);
        assert_eq!(first.stale, 1);
        assert_eq!(store.records("Foo")?[0].version, Version::parse("1.1")?);
        Ok(())
    }
}
