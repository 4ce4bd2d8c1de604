//! Periodic provider refresh and update detection, independent of any UI.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::provider::refresh::{RefreshReport, Refresher};
use crate::provider::AppIdentity;
use crate::resolver::{Resolution, ResolvedVersion, VersionResolver};
use crate::version::Version;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Scheduler is already running")]
    AlreadyRunning,
    #[error("Check interval must be greater than zero")]
    InvalidInterval,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    UpdateAvailable { app: AppIdentity, version: Version },
    /// The host application itself has a newer release.
    NewRelease { version: Version },
}

/// Platform notification sink, fire-and-forget.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Proof that the platform allows background work. Only the shell, after its
/// capability check, hands one out.
#[derive(Debug, Clone, Copy)]
pub struct SchedulingPermit(());

impl SchedulingPermit {
    pub fn granted() -> Self {
        SchedulingPermit(())
    }
}

/// Which notification kinds reach the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationFilter {
    pub updates: bool,
    pub new_release: bool,
}

impl Default for NotificationFilter {
    fn default() -> Self {
        NotificationFilter {
            updates: true,
            new_release: true,
        }
    }
}

impl NotificationFilter {
    pub fn allows(&self, notification: &Notification) -> bool {
        match notification {
            Notification::UpdateAvailable { .. } => self.updates,
            Notification::NewRelease { .. } => self.new_release,
        }
    }

    pub fn any(&self) -> bool {
        self.updates || self.new_release
    }
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub refresh: RefreshReport,
    pub resolution: Resolution,
    /// Every false -> true flip of this tick, including the filtered ones.
    pub notifications: Vec<Notification>,
}

/// One refresh-resolve-diff pass. Shared by the scheduler loop and anyone who
/// wants an out-of-band check; passes never overlap.
pub struct UpdateCheck {
    refresher: Refresher,
    resolver: VersionResolver,
    sink: Arc<dyn NotificationSink>,
    self_app: Option<AppIdentity>,
    filter: NotificationFilter,
    known: Mutex<HashMap<AppIdentity, bool>>,
    running: tokio::sync::Mutex<()>,
}

impl UpdateCheck {
    pub fn new(
        refresher: Refresher,
        resolver: VersionResolver,
        sink: Arc<dyn NotificationSink>,
        self_app: Option<AppIdentity>,
        filter: NotificationFilter,
    ) -> Self {
        UpdateCheck {
            refresher,
            resolver,
            sink,
            self_app,
            filter,
            known: Mutex::new(HashMap::new()),
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// None when another pass is still running; this one is skipped, not queued.
    pub async fn tick(&self) -> Option<TickReport> {
        let _running = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::debug!("Update check still running, skipping this tick");
                return None;
            }
        };
        let refresh = self.refresher.refresh_all().await;
        let resolution = self.resolver.resolve_all();
        let notifications = self.diff(&resolution);
        for notification in &notifications {
            if self.filter.allows(notification) {
                log::info!("Raising {:?}", notification);
                self.sink.notify(notification.clone());
            }
        }
        Some(TickReport {
            refresh,
            resolution,
            notifications,
        })
    }

    /// Records the new flags and returns the flips. Apps that failed to resolve
    /// keep their previous flag, apps gone from the catalog are forgotten.
    fn diff(&self, resolution: &Resolution) -> Vec<Notification> {
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        known.retain(|app, _| {
            resolution.resolved.contains_key(app) || resolution.failures.contains_key(app)
        });
        let mut flips = Vec::new();
        for (app, resolved) in &resolution.resolved {
            let was_available = known
                .insert(app.clone(), resolved.update_available)
                .unwrap_or(false);
            if resolved.update_available && !was_available {
                flips.push(self.notification(resolved));
            }
        }
        flips
    }

    fn notification(&self, resolved: &ResolvedVersion) -> Notification {
        if self.self_app.as_deref() == Some(resolved.app.as_str()) {
            Notification::NewRelease {
                version: resolved.latest.clone(),
            }
        } else {
            Notification::UpdateAvailable {
                app: resolved.app.clone(),
                version: resolved.latest.clone(),
            }
        }
    }
}

pub type TickListener = Arc<dyn Fn(&TickReport) + Send + Sync>;

struct Worker {
    handle: JoinHandle<()>,
    stop: oneshot::Sender<()>,
}

/// Runs an `UpdateCheck` on a single periodic timer. A stopped scheduler owns
/// no task and no timer.
pub struct BackgroundScheduler {
    check: Arc<UpdateCheck>,
    listener: Option<TickListener>,
    worker: Option<Worker>,
}

impl BackgroundScheduler {
    pub fn new(check: Arc<UpdateCheck>) -> Self {
        BackgroundScheduler {
            check,
            listener: None,
            worker: None,
        }
    }

    /// Called with the report of every completed tick.
    pub fn with_listener(mut self, listener: TickListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn start(&mut self, interval: Duration, _permit: SchedulingPermit) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::InvalidInterval);
        }
        if self.worker.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let check = self.check.clone();
        let listener = self.listener.clone();
        log::info!("Starting background update checks every {:?}", interval);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    report = check.tick() => {
                        if let (Some(report), Some(listener)) = (report, &listener) {
                            listener(&report);
                        }
                    }
                }
            }
            log::info!("Background update checks stopped");
        });
        self.worker = Some(Worker { handle, stop });
        Ok(())
    }

    /// Returns once the worker is gone, an in-flight tick is abandoned.
    pub async fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop.send(());
            if let Err(e) = worker.handle.await {
                log::error!("Scheduler worker ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::provider::store::test::at;
    use crate::provider::{CatalogEntry, ProviderReport, ProviderStore, StaticFeed};
    use crate::resolver::ProviderPreferences;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_log::test;

    #[derive(Default)]
    pub struct RecordingSink {
        received: Mutex<Vec<Notification>>,
    }

    impl RecordingSink {
        pub fn received(&self) -> Vec<Notification> {
            self.received.lock().unwrap().clone()
        }
    }

    impl NotificationSink for RecordingSink {
        fn notify(&self, notification: Notification) {
            self.received.lock().unwrap().push(notification);
        }
    }

    pub fn report(version: &str, fetched_at: i64) -> ProviderReport {
        ProviderReport {
            version: version.to_owned(),
            artifact: format!("https://mirror.example/apks/{}.apk", version),
            fetched_at: at(fetched_at),
        }
    }

    fn v(raw: &str) -> Version {
        Version::parse(raw).unwrap()
    }

    struct Fixture {
        feed: StaticFeed,
        sink: Arc<RecordingSink>,
        check: Arc<UpdateCheck>,
    }

    fn fixture(filter: NotificationFilter) -> Fixture {
        let store = ProviderStore::new();
        let feed = StaticFeed::new(vec![
            CatalogEntry::new("Foo", &["A"]),
            CatalogEntry::new("Host", &["A"]),
        ]);
        let installed: BTreeMap<AppIdentity, Version> =
            BTreeMap::from([("Foo".to_owned(), v("1.0")), ("Host".to_owned(), v("3.0"))]);
        let refresher = Refresher::new(
            store.clone(),
            Arc::new(feed.clone()),
            Duration::from_secs(1),
        );
        let resolver = VersionResolver::new(
            store,
            Arc::new(installed),
            Arc::new(ProviderPreferences::default()),
        );
        let sink = Arc::new(RecordingSink::default());
        let check = Arc::new(UpdateCheck::new(
            refresher,
            resolver,
            sink.clone(),
            Some("Host".to_owned()),
            filter,
        ));
        Fixture { feed, sink, check }
    }

    #[test(tokio::test)]
    async fn notifies_once_per_flip() {
        let f = fixture(NotificationFilter::default());
        f.feed.set_report("Foo", "A", report("1.0", 10));
        f.check.tick().await.unwrap();
        assert!(f.sink.received().is_empty());

        f.feed.set_report("Foo", "A", report("1.2", 20));
        let tick = f.check.tick().await.unwrap();
        assert_eq!(tick.notifications.len(), 1);
        f.check.tick().await.unwrap();
        f.feed.set_report("Foo", "A", report("1.3", 30));
        f.check.tick().await.unwrap();
        assert_eq!(
            f.sink.received(),
            vec![Notification::UpdateAvailable {
                app: "Foo".to_owned(),
                version: v("1.2")
            }]
        );
    }

    #[test(tokio::test)]
    async fn host_app_raises_new_release() {
        let f = fixture(NotificationFilter::default());
        f.feed.set_report("Host", "A", report("3.1", 10));
        f.check.tick().await.unwrap();
        assert_eq!(
            f.sink.received(),
            vec![Notification::NewRelease { version: v("3.1") }]
        );
    }

    #[test(tokio::test)]
    async fn filtered_kinds_never_reach_the_sink() {
        let f = fixture(NotificationFilter {
            updates: false,
            new_release: true,
        });
        f.feed.set_report("Foo", "A", report("1.2", 10));
        let tick = f.check.tick().await.unwrap();
        assert_eq!(tick.notifications.len(), 1);
        assert!(f.sink.received().is_empty());
        // the flip is still known, turning updates on later does not replay it
        f.check.tick().await.unwrap();
        assert!(f.sink.received().is_empty());
    }

    #[test(tokio::test)]
    async fn failed_apps_keep_their_flag() {
        let f = fixture(NotificationFilter::default());
        f.feed.set_report("Foo", "A", report("1.2", 10));
        let tick = f.check.tick().await.unwrap();
        assert_eq!(f.sink.received().len(), 1);

        let mut failing = tick.resolution.clone();
        let foo = failing.resolved.remove("Foo").unwrap();
        failing.failures.insert(
            "Foo".to_owned(),
            crate::resolver::ResolveError::NoProviderData("Foo".to_owned()),
        );
        assert!(f.check.diff(&failing).is_empty());
        // back to resolving, still the same known update
        assert!(f.check.diff(&tick.resolution).is_empty());

        // an app that leaves the catalog is forgotten and notifies again on return
        let mut gone = tick.resolution.clone();
        gone.resolved.remove("Foo");
        assert!(f.check.diff(&gone).is_empty());
        gone.resolved.insert("Foo".to_owned(), foo);
        assert_eq!(f.check.diff(&gone).len(), 1);
    }

    #[test(tokio::test)]
    async fn overlapping_ticks_are_skipped() {
        let f = fixture(NotificationFilter::default());
        f.feed.set_report("Foo", "A", report("1.2", 10));
        f.feed.set_delay(Some(Duration::from_millis(200)));
        let (first, second) = tokio::join!(f.check.tick(), f.check.tick());
        assert!(first.is_some() != second.is_some());
        assert_eq!(f.sink.received().len(), 1);
    }

    #[test(tokio::test)]
    async fn stopped_scheduler_does_no_work() {
        let f = fixture(NotificationFilter::default());
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let mut scheduler = BackgroundScheduler::new(f.check.clone()).with_listener(Arc::new(
            move |_: &TickReport| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ));
        assert_eq!(
            scheduler.start(Duration::ZERO, SchedulingPermit::granted()),
            Err(Error::InvalidInterval)
        );
        scheduler
            .start(Duration::from_millis(50), SchedulingPermit::granted())
            .unwrap();
        assert_eq!(
            scheduler.start(Duration::from_millis(50), SchedulingPermit::granted()),
            Err(Error::AlreadyRunning)
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop().await;
        assert!(!scheduler.is_running());
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "Expected several ticks, got {}", after_stop);
        let catalog_calls = f.feed.catalog_calls();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
        assert_eq!(f.feed.catalog_calls(), catalog_calls);
    }
}
