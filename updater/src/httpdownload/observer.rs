use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use super::{DownloadUpdate, Outcome, Progress, State, TaskSnapshot, UpdateConsumer, UpdateType};

pub type DownloadStates = BTreeMap<String, TaskSnapshot>;

/// This struct is responsible for keeping the state of all downloads.
/// It consumes the manager's updates and republishes them as an immutable map
/// that readers load without taking any lock. Every applied update bumps the
/// shared change counter.
/// Safe to Clone and pass around, all clones see the same state.
#[derive(Clone)]
pub struct DownloadObserver {
    states: Arc<ArcSwap<DownloadStates>>,
    changes: Arc<watch::Sender<u64>>,
}

impl DownloadObserver {
    pub fn new(changes: Arc<watch::Sender<u64>>) -> Self {
        DownloadObserver {
            states: Arc::new(ArcSwap::from_pointee(BTreeMap::new())),
            changes,
        }
    }

    pub fn read_state(&self) -> Arc<DownloadStates> {
        self.states.load_full()
    }
}

impl UpdateConsumer for DownloadObserver {
    fn consume(&mut self, update: DownloadUpdate) {
        let mut states = DownloadStates::clone(&self.states.load());
        if apply(&mut states, update) {
            self.states.store(Arc::new(states));
            self.changes.send_modify(|version| *version += 1);
        }
    }
}

/// Returns false when the update belongs to a task that was already replaced.
fn apply(states: &mut DownloadStates, update: DownloadUpdate) -> bool {
    if let UpdateType::Queued { app, started_at } = update.update_type {
        states.insert(
            update.file_name.clone(),
            TaskSnapshot {
                id: update.id,
                file_name: update.file_name,
                app,
                state: State::Pending,
                progress: Progress::default(),
                started_at,
            },
        );
        return true;
    }
    match states.get_mut(&update.file_name) {
        Some(snapshot) if snapshot.id == update.id => {}
        _ => return false,
    }
    match update.update_type {
        UpdateType::Evicted => {
            states.remove(&update.file_name);
        }
        other => {
            if let Some(snapshot) = states.get_mut(&update.file_name) {
                match other {
                    UpdateType::Started => snapshot.state = State::InProgress,
                    UpdateType::Running(progress) => snapshot.progress = progress,
                    UpdateType::Finished(outcome) => {
                        if let (Outcome::Completed { .. }, Some(total)) =
                            (&outcome, snapshot.progress.bytes_total)
                        {
                            snapshot.progress.bytes_received = total;
                        }
                        snapshot.progress.bytes_per_second = 0;
                        snapshot.state = State::from(outcome);
                    }
                    UpdateType::Queued { .. } | UpdateType::Evicted => {}
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::httpdownload::manager::test::manager_config;
    use crate::httpdownload::DownloadManager;
    use crate::util::test::{spawn_test_server, tmp_dir};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use test_log::test;
    use uuid::Uuid;

    fn update(id: Uuid, update_type: UpdateType) -> DownloadUpdate {
        DownloadUpdate {
            id,
            file_name: "foo.apk".to_owned(),
            update_type,
        }
    }

    #[test]
    fn updates_of_replaced_tasks_are_ignored() {
        let (tx, rx) = watch::channel(0);
        let mut observer = DownloadObserver::new(Arc::new(tx));
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());
        observer.consume(update(
            new,
            UpdateType::Queued {
                app: Some("Foo".to_owned()),
                started_at: Utc::now(),
            },
        ));
        observer.consume(update(new, UpdateType::Started));
        observer.consume(update(
            old,
            UpdateType::Finished(Outcome::Completed {
                path: PathBuf::from("foo.apk"),
            }),
        ));
        let states = observer.read_state();
        assert_eq!(states["foo.apk"].id, new);
        assert_eq!(states["foo.apk"].state, State::InProgress);
        assert_eq!(states["foo.apk"].app.as_deref(), Some("Foo"));
        assert_eq!(*rx.borrow(), 2);

        observer.consume(update(new, UpdateType::Evicted));
        assert!(observer.read_state().is_empty());
        assert_eq!(*rx.borrow(), 3);
    }

    #[test(tokio::test)]
    async fn observer_follows_the_manager() -> anyhow::Result<()> {
        let server = spawn_test_server().await?;
        let tmp_dir = tmp_dir()?;
        let (tx, mut rx) = watch::channel(0);
        let observer = DownloadObserver::new(Arc::new(tx));
        let manager = DownloadManager::new(manager_config(tmp_dir.path(), 2), observer.clone());
        manager.start("foo.apk", server.file_url("foo.apk")).await?;
        manager.await_completion("foo.apk").await?;
        // the consumer task applies updates asynchronously
        loop {
            if let Some(snapshot) = observer.read_state().get("foo.apk") {
                if !snapshot.state.is_live() {
                    assert!(matches!(snapshot.state, State::Completed { .. }));
                    break;
                }
            }
            rx.changed().await?;
        }
        manager.evict("foo.apk").await?;
        while observer.read_state().contains_key("foo.apk") {
            rx.changed().await?;
        }
        Ok(())
    }
}
