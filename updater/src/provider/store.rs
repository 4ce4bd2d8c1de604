use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use super::{AppIdentity, CatalogEntry, ProviderId, ProviderRecord};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("App '{0}' is not in the catalog")]
    NotFound(AppIdentity),
    #[error("Provider '{provider}' is not configured for app '{app}'")]
    UnknownProvider {
        app: AppIdentity,
        provider: ProviderId,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Result of offering a record to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Stored,
    /// A record fetched later for the same (app, provider) already landed.
    Stale,
}

#[derive(Debug, Default)]
struct Inner {
    catalog: BTreeMap<AppIdentity, Vec<ProviderId>>,
    records: HashMap<AppIdentity, HashMap<ProviderId, ProviderRecord>>,
}

/// Holds the catalog and, per app, the last record of each configured provider.
/// All mutation goes through this type; readers get owned copies.
/// Cheap to clone, clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct ProviderStore {
    inner: Arc<RwLock<Inner>>,
}

impl ProviderStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the catalog. Records of apps or providers that are no longer
    /// listed are dropped.
    pub fn sync_catalog(&self, entries: Vec<CatalogEntry>) {
        let mut inner = self.write();
        inner.catalog = entries
            .into_iter()
            .map(|entry| (entry.app, entry.providers))
            .collect();
        let Inner { catalog, records } = &mut *inner;
        records.retain(|app, by_provider| match catalog.get(app) {
            Some(providers) => {
                by_provider.retain(|provider, _| providers.contains(provider));
                true
            }
            None => false,
        });
        log::info!("Catalog synced, {} apps", catalog.len());
    }

    /// Adds or replaces a single catalog entry.
    pub fn register(&self, entry: CatalogEntry) {
        let mut inner = self.write();
        if let Some(by_provider) = inner.records.get_mut(&entry.app) {
            by_provider.retain(|provider, _| entry.providers.contains(provider));
        }
        inner.catalog.insert(entry.app, entry.providers);
    }

    pub fn contains(&self, app: &str) -> bool {
        self.read().catalog.contains_key(app)
    }

    pub fn apps(&self) -> Vec<AppIdentity> {
        self.read().catalog.keys().cloned().collect()
    }

    /// Configured providers of an app, in catalog order.
    pub fn providers(&self, app: &str) -> Result<Vec<ProviderId>> {
        self.read()
            .catalog
            .get(app)
            .cloned()
            .ok_or_else(|| Error::NotFound(app.to_owned()))
    }

    /// Replaces the record of (app, provider) unless the stored one was fetched later.
    pub fn upsert(&self, record: ProviderRecord) -> Result<Upsert> {
        let mut inner = self.write();
        let providers = inner
            .catalog
            .get(&record.app)
            .ok_or_else(|| Error::NotFound(record.app.clone()))?;
        if !providers.contains(&record.provider) {
            return Err(Error::UnknownProvider {
                app: record.app,
                provider: record.provider,
            });
        }
        let by_provider = inner.records.entry(record.app.clone()).or_default();
        if let Some(existing) = by_provider.get(&record.provider) {
            if existing.fetched_at > record.fetched_at {
                log::info!(
                    "Discarding stale record for {}/{} fetched at {}, newer one from {} already stored",
                    record.app,
                    record.provider,
                    record.fetched_at,
                    existing.fetched_at
                );
                return Ok(Upsert::Stale);
            }
        }
        by_provider.insert(record.provider.clone(), record);
        Ok(Upsert::Stored)
    }

    /// Current records of an app, ordered by provider id.
    pub fn records(&self, app: &str) -> Result<Vec<ProviderRecord>> {
        let inner = self.read();
        if !inner.catalog.contains_key(app) {
            return Err(Error::NotFound(app.to_owned()));
        }
        let mut records: Vec<ProviderRecord> = inner
            .records
            .get(app)
            .map(|by_provider| by_provider.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(records)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::version::Version;
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use reqwest::Url;

    pub fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    pub fn record(app: &str, provider: &str, version: &str, fetched_at: i64) -> ProviderRecord {
        ProviderRecord {
            app: app.to_owned(),
            provider: provider.to_owned(),
            version: Version::parse(version).unwrap(),
            artifact: Url::parse(&format!(
                "https://{}.example/{}/{}.apk",
                provider.to_lowercase(),
                app,
                version
            ))
            .unwrap(),
            fetched_at: at(fetched_at),
        }
    }

    fn store_with_foo() -> ProviderStore {
        let store = ProviderStore::new();
        store.sync_catalog(vec![CatalogEntry::new("Foo", &["A", "B"])]);
        store
    }

    #[test]
    fn newer_fetch_supersedes_record() {
        let store = store_with_foo();
        assert_eq!(store.upsert(record("Foo", "A", "1.0", 10)), Ok(Upsert::Stored));
        assert_eq!(store.upsert(record("Foo", "A", "1.1", 20)), Ok(Upsert::Stored));
        let records = store.records("Foo").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].version, Version::parse("1.1").unwrap());
    }

    #[test]
    fn stale_fetch_is_rejected_per_provider() {
        let store = store_with_foo();
        store.upsert(record("Foo", "A", "1.1", 20)).unwrap();
        // slow fetch that started earlier lands last
        assert_eq!(store.upsert(record("Foo", "A", "1.0", 10)), Ok(Upsert::Stale));
        // an older record for another provider is unaffected
        assert_eq!(store.upsert(record("Foo", "B", "0.9", 5)), Ok(Upsert::Stored));
        let records = store.records("Foo").unwrap();
        assert_eq!(records[0].version, Version::parse("1.1").unwrap());
        assert_eq!(records[1].provider, "B");
    }

    #[test]
    fn unknown_app_and_provider_are_rejected() {
        let store = store_with_foo();
        assert_eq!(
            store.upsert(record("Bar", "A", "1.0", 1)),
            Err(Error::NotFound("Bar".to_owned()))
        );
        assert!(matches!(
            store.upsert(record("Foo", "C", "1.0", 1)),
            Err(Error::UnknownProvider { .. })
        ));
        assert_eq!(store.records("Bar"), Err(Error::NotFound("Bar".to_owned())));
    }

    #[test]
    fn catalog_sync_prunes_removed_entries() {
        let store = store_with_foo();
        store.register(CatalogEntry::new("Bar", &["A"]));
        store.upsert(record("Foo", "A", "1.0", 1)).unwrap();
        store.upsert(record("Foo", "B", "1.0", 1)).unwrap();
        store.upsert(record("Bar", "A", "1.0", 1)).unwrap();
        store.sync_catalog(vec![CatalogEntry::new("Foo", &["B"])]);
        assert_eq!(store.apps(), vec!["Foo".to_owned()]);
        let records = store.records("Foo").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider, "B");
        assert!(!store.contains("Bar"));
    }
}
