pub mod config;

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, Response, StatusCode, Url};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

use crate::util::{file_size, mb, supports_byte_ranges};

use self::config::HttpDownloadConfig;
use super::{FailureReason, Progress, TaskReporter};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("File IO operation failed, error: '{0}'")]
    Io(#[from] tokio::io::Error),
    #[error("Request error: '{0}'")]
    Request(#[from] reqwest::Error),
    #[error("Download req did not yield 2xx, instead: '{0}'")]
    DownloadNotOk(StatusCode),
    #[error("No answer from '{0}' within {1:?}")]
    Timeout(Url, Duration),
    #[error("Download ended before completion, downloaded bytes: '{0}'")]
    StreamEndedBeforeCompletion(u64),
    #[error("Download was stopped, downloaded bytes before stop: '{0}'")]
    Stopped(u64),
}

impl Error {
    /// Failures worth another attempt: connection trouble, truncated bodies,
    /// overloaded servers.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Request(_) | Error::StreamEndedBeforeCompletion(_) => true,
            Error::DownloadNotOk(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Error::Io(_) | Error::Timeout(..) | Error::Stopped(_) => false,
        }
    }

    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Error::Io(e) => FailureReason::ResourceUnavailable(e.to_string()),
            Error::Request(e) => FailureReason::Network(e.to_string()),
            Error::StreamEndedBeforeCompletion(_) => FailureReason::Network(self.to_string()),
            Error::DownloadNotOk(status) if self.is_transient() => {
                FailureReason::Network(format!("server answered {}", status))
            }
            Error::DownloadNotOk(status) => FailureReason::Rejected(status.as_u16()),
            Error::Timeout(..) => FailureReason::Timeout,
            Error::Stopped(_) => FailureReason::Network(self.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single artifact transfer into `file_path`, retried on transient failures.
#[derive(Debug, Clone)]
pub struct HttpDownload {
    pub url: Url,
    pub file_path: PathBuf,
    pub config: HttpDownloadConfig,
    pub client: Client,
    /// Size announced by the server, known after the first response.
    pub content_length: Option<u64>,
    /// If the server for the Download supports bytes, updated on every response.
    pub supports_byte_ranges: bool,
}

impl HttpDownload {
    pub fn new(url: Url, file_path: PathBuf, client: Client, config: HttpDownloadConfig) -> Self {
        HttpDownload {
            url,
            file_path,
            config,
            client,
            content_length: None,
            supports_byte_ranges: false,
        }
    }

    /// Runs the transfer to completion, returns the number of bytes on disk.
    /// Transient failures are retried with exponential backoff, resuming with a
    /// range request where the server allows it. A stop signal is honoured
    /// while waiting for the server, between chunks and during backoff.
    pub async fn run(
        &mut self,
        stop_ch: &mut oneshot::Receiver<()>,
        reporter: &TaskReporter,
    ) -> Result<u64> {
        let mut retries = 0u32;
        loop {
            let bytes_on_disk = self.get_bytes_on_disk().await;
            let result = if retries > 0 && self.supports_byte_ranges && bytes_on_disk > 0 {
                self.resume(bytes_on_disk, stop_ch, reporter).await
            } else {
                self.start(stop_ch, reporter).await
            };
            match result {
                Err(e) if e.is_transient() && retries < self.config.max_retries => {
                    retries += 1;
                    let delay = self.config.backoff(retries);
                    log::warn!(
                        "Download of {} failed: {}, retry {}/{} in {:?}",
                        self.url,
                        e,
                        retries,
                        self.config.max_retries,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut *stop_ch => {
                            log::info!("Download stop signal received during backoff for: {}", self.url);
                            return Err(Error::Stopped(self.get_bytes_on_disk().await));
                        }
                    }
                }
                other => return other,
            }
        }
    }

    async fn start(
        &mut self,
        stop_ch: &mut oneshot::Receiver<()>,
        reporter: &TaskReporter,
    ) -> Result<u64> {
        let resp = self.request(None, stop_ch).await?;
        self.content_length = resp.content_length();
        reporter.set_total(self.content_length);
        let file_handler = File::create(&self.file_path).await?;
        self.progress(resp, file_handler, stop_ch, reporter, 0).await
    }

    async fn resume(
        &mut self,
        bytes_on_disk: u64,
        stop_ch: &mut oneshot::Receiver<()>,
        reporter: &TaskReporter,
    ) -> Result<u64> {
        let resp = self.request(Some(bytes_on_disk), stop_ch).await?;
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            log::info!(
                "Server ignored the range request, starting from scratch: {}",
                self.url
            );
            self.content_length = resp.content_length();
            reporter.set_total(self.content_length);
            let file_handler = File::create(&self.file_path).await?;
            return self.progress(resp, file_handler, stop_ch, reporter, 0).await;
        }
        log::info!("Resuming {} at {} bytes", self.url, bytes_on_disk);
        if let Some(remaining) = resp.content_length() {
            self.content_length = Some(bytes_on_disk + remaining);
            reporter.set_total(self.content_length);
        }
        let file_handler = OpenOptions::new()
            .append(true)
            .open(&self.file_path)
            .await?;
        self.progress(resp, file_handler, stop_ch, reporter, bytes_on_disk)
            .await
    }

    async fn request(
        &mut self,
        offset: Option<u64>,
        stop_ch: &mut oneshot::Receiver<()>,
    ) -> Result<Response> {
        let mut req = self
            .client
            .get(self.url.clone())
            .headers(self.config.headers.clone());
        if let Some(offset) = offset {
            req = req.header(RANGE, format!("bytes={}-", offset));
        }
        let timeout = self.config.timeout;
        let resp = tokio::select! {
            resp = tokio::time::timeout(timeout, req.send()) => {
                resp.map_err(|_| Error::Timeout(self.url.clone(), timeout))??
            }
            _ = &mut *stop_ch => {
                log::info!("Download stop signal received before response for: {}", self.url);
                return Err(Error::Stopped(offset.unwrap_or(0)));
            }
        };
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::DownloadNotOk(status));
        }
        self.supports_byte_ranges = supports_byte_ranges(resp.headers());
        Ok(resp)
    }

    async fn progress(
        &self,
        resp: Response,
        mut file_handler: File,
        stop_ch: &mut oneshot::Receiver<()>,
        reporter: &TaskReporter,
        mut downloaded_bytes: u64,
    ) -> Result<u64> {
        let mut stream = resp.bytes_stream();
        let mut last_update = Instant::now();
        let mut last_bytes_downloaded = 0u64;
        let timeout = self.config.timeout;
        loop {
            let item = tokio::select! {
                next = tokio::time::timeout(timeout, stream.next()) => match next {
                    Ok(Some(Ok(chunk))) => chunk,
                    Ok(Some(Err(e))) => {
                        // What arrived so far is the offset of the next range request.
                        file_handler.flush().await?;
                        return Err(e.into());
                    }
                    Ok(None) => break,
                    Err(_) => return Err(Error::Timeout(self.url.clone(), timeout)),
                },
                _ = &mut *stop_ch => {
                    log::info!("Download stop signal received for: {}", self.url);
                    file_handler.flush().await?;
                    return Err(Error::Stopped(downloaded_bytes));
                }
            };
            file_handler.write_all(&item).await?;
            downloaded_bytes += item.len() as u64;
            last_bytes_downloaded += item.len() as u64;
            let elapsed = last_update.elapsed();
            if elapsed >= self.config.progress_interval {
                let bytes_per_second =
                    (last_bytes_downloaded as f64 / elapsed.as_secs_f64()) as u64;
                reporter.running(Progress {
                    bytes_received: downloaded_bytes,
                    bytes_total: self.content_length,
                    bytes_per_second,
                });
                last_update = Instant::now();
                last_bytes_downloaded = 0;
            }
        }
        file_handler.flush().await?;
        if let Some(content_length) = self.content_length {
            if downloaded_bytes < content_length {
                log::error!(
                    "Download stream ended before completion, downloaded bytes: {}, content length: {}",
                    downloaded_bytes,
                    content_length
                );
                return Err(Error::StreamEndedBeforeCompletion(downloaded_bytes));
            }
        }
        log::info!(
            "Download completed successfully: {}, {:.2}MB",
            self.url,
            mb(downloaded_bytes)
        );
        Ok(downloaded_bytes)
    }

    pub async fn get_bytes_on_disk(&self) -> u64 {
        file_size(&self.file_path).await
    }
}
