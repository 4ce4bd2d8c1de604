use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use reqwest::{Client, Url};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::item::DownloaderItem;
use super::{Error, HandOff, ManagerConfig, Result, TaskHandle};
use crate::httpdownload::download::config::HttpDownloadConfig;
use crate::httpdownload::download::HttpDownload;
use crate::httpdownload::{
    DownloadUpdate, Progress, State, TaskReporter, TaskSnapshot, UpdateConsumer, UpdateType,
};
use crate::provider::AppIdentity;
use crate::util::is_plain_file_name;

/// Logs every update, used when nobody needs to observe the downloads.
#[derive(Default)]
pub struct LogUpdateConsumer;

impl UpdateConsumer for LogUpdateConsumer {
    fn consume(&mut self, update: DownloadUpdate) {
        log::debug!("Update: {:?}", update);
    }
}

pub struct Inner {
    update_ch: mpsc::Sender<DownloadUpdate>,
    _consumer_thread: JoinHandle<()>,
    items: HashMap<String, DownloaderItem>,
    /// Last attempt per file name that a caller claimed through `hand_off`.
    handed_off: HashMap<String, Uuid>,
    client: Client,
    config: HttpDownloadConfig,
    slots: Arc<Semaphore>,
    download_dir: PathBuf,
}

impl Inner {
    pub fn new(
        config: ManagerConfig,
        mut update_consumer: impl UpdateConsumer + Send + Sync + 'static,
    ) -> Self {
        let (update_sender, mut update_recv) = mpsc::channel::<DownloadUpdate>(1000);
        log::info!("Spawning update consumer task");
        let consumer_thread = tokio::task::spawn(async move {
            while let Some(update) = update_recv.recv().await {
                update_consumer.consume(update);
            }
            log::debug!("Update channel closed, last update_sender has been dropped");
        });

        Inner {
            update_ch: update_sender,
            _consumer_thread: consumer_thread,
            items: HashMap::new(),
            handed_off: HashMap::new(),
            client: Client::new(),
            config: config.http,
            slots: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1))),
            download_dir: config.download_dir,
        }
    }

    /// Joins the live task for `file_name` or spawns a new one, replacing a terminal record.
    pub fn start(
        &mut self,
        app: Option<AppIdentity>,
        file_name: &str,
        url: Url,
    ) -> Result<TaskHandle> {
        if !is_plain_file_name(file_name) {
            return Err(Error::InvalidFileName(file_name.to_owned()));
        }
        if let Some(item) = self.items.get(file_name) {
            if item.is_live() {
                log::info!("Joining running download {} for {}", item.id(), file_name);
                return Ok(item.handle());
            }
        }

        let snapshot = TaskSnapshot {
            id: Uuid::new_v4(),
            file_name: file_name.to_owned(),
            app,
            state: State::Pending,
            progress: Progress::default(),
            started_at: Utc::now(),
        };
        log::info!("Adding download {} for {}: {}", snapshot.id, file_name, url);
        let (reporter, _) = TaskReporter::new(snapshot, self.update_ch.clone());
        let download = HttpDownload::new(
            url,
            self.download_dir.join(file_name),
            self.client.clone(),
            self.config.clone(),
        );
        let item = DownloaderItem::spawn(download, reporter, self.slots.clone());
        let handle = item.handle();
        self.items.insert(file_name.to_owned(), item);
        Ok(handle)
    }

    pub fn get(&self, file_name: &str) -> Result<&DownloaderItem> {
        self.items
            .get(file_name)
            .ok_or_else(|| Error::UnknownTask(file_name.to_owned()))
    }

    pub fn get_mut(&mut self, file_name: &str) -> Result<&mut DownloaderItem> {
        self.items
            .get_mut(file_name)
            .ok_or_else(|| Error::UnknownTask(file_name.to_owned()))
    }

    /// Removes a terminal record. With `id` set only that exact task is removed.
    pub fn evict(&mut self, file_name: &str, id: Option<Uuid>) -> Result<()> {
        let item = self.get(file_name)?;
        if id.map_or(false, |id| id != item.id()) {
            return Err(Error::UnknownTask(file_name.to_owned()));
        }
        if item.is_live() {
            return Err(Error::TaskStillRunning(file_name.to_owned()));
        }
        if let Some(item) = self.items.remove(file_name) {
            self.notify_evicted(&item, file_name);
        }
        Ok(())
    }

    pub fn hand_off(&mut self, file_name: &str, id: Uuid) -> HandOff {
        match self.evict(file_name, Some(id)) {
            Ok(()) => {
                self.handed_off.insert(file_name.to_owned(), id);
                HandOff::Claimed
            }
            Err(_) if self.handed_off.get(file_name) == Some(&id) => HandOff::ClaimedElsewhere,
            Err(_) => HandOff::Lost,
        }
    }

    pub fn evict_finished(&mut self) -> Vec<String> {
        let finished: Vec<String> = self
            .items
            .iter()
            .filter(|(_, item)| !item.is_live())
            .map(|(file_name, _)| file_name.clone())
            .collect();
        for file_name in &finished {
            if let Some(item) = self.items.remove(file_name) {
                self.notify_evicted(&item, file_name);
            }
        }
        finished
    }

    fn notify_evicted(&self, item: &DownloaderItem, file_name: &str) {
        log::debug!("Evicting download record {} for {}", item.id(), file_name);
        let _ = self.update_ch.try_send(DownloadUpdate {
            id: item.id(),
            file_name: file_name.to_owned(),
            update_type: UpdateType::Evicted,
        });
    }

    pub fn live_files(&self) -> HashSet<String> {
        self.items
            .iter()
            .filter(|(_, item)| item.is_live())
            .map(|(file_name, _)| file_name.clone())
            .collect()
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        let mut snapshots: Vec<TaskSnapshot> =
            self.items.values().map(DownloaderItem::snapshot).collect();
        snapshots.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        snapshots
    }

    pub fn download_dir(&self) -> &PathBuf {
        &self.download_dir
    }
}
