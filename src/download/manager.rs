//! Retrying, queued downloads.

use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};

use super::error::DownloadError;
use super::queue::DownloadQueue;
use super::retry::RetryBackoff;
use super::transfer::Downloader;
use crate::config::ClientOptions;
use crate::events::{EventHub, ScopedLogger};
use crate::request::{RequestData, RequestExecutor};

/// Public entry point for downloads.
///
/// Every attempt goes through the shared [`DownloadQueue`]; failed attempts
/// are queued again after a backoff until `download_max_retries` attempts
/// have run.
#[derive(Debug, Clone)]
pub struct DownloadManager {
    downloader: Downloader,
    queue: DownloadQueue,
    max_retries: u32,
    backoff: RetryBackoff,
    log: ScopedLogger,
}

impl DownloadManager {
    /// Creates a manager sending through `requests`.
    #[must_use]
    pub fn new(requests: RequestExecutor, options: &ClientOptions, events: &EventHub) -> Self {
        let downloader = Downloader::new(
            requests,
            options.progress_interval,
            events.scoped("Download Manager"),
        );
        let queue = DownloadQueue::new(
            downloader.clone(),
            options.download_parallel_count,
            events.scoped("Download Queue"),
        );
        Self {
            downloader,
            queue,
            max_retries: options.download_max_retries.max(1),
            backoff: RetryBackoff::new(options.download_retry_delay),
            log: events.scoped("Download Manager"),
        }
    }

    /// Downloads `data` to `destination`, retrying failed attempts.
    ///
    /// Each attempt works on a fresh copy of `data`.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt once every attempt failed.
    #[instrument(skip(self, data, destination), fields(link = %data.link, destination = %destination.as_ref().display()))]
    pub async fn download(
        &self,
        data: RequestData,
        destination: impl AsRef<Path>,
    ) -> Result<PathBuf, DownloadError> {
        let destination = destination.as_ref().to_path_buf();
        // Most recent first.
        let mut errors: Vec<DownloadError> = Vec::new();

        for cur_retry in 0..self.max_retries {
            let outcome = match self.queue.push(
                data.clone(),
                destination.clone(),
                cur_retry,
                self.max_retries,
            ) {
                Ok(receiver) => receiver
                    .await
                    .unwrap_or_else(|_| Err(DownloadError::QueueClosed)),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(path) => {
                    if cur_retry > 0 {
                        info!(attempts = cur_retry + 1, "download succeeded after retry");
                    }
                    return Ok(path);
                }
                Err(e) => {
                    warn!(attempt = cur_retry + 1, max = self.max_retries, error = %e, "download attempt failed");
                    self.log.file(
                        &destination,
                        format!("Attempt {}/{} failed: {e}", cur_retry + 1, self.max_retries),
                    );
                    errors.insert(0, e);
                }
            }

            if cur_retry + 1 < self.max_retries {
                let delay = self.backoff.delay_for(cur_retry + 1);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.log.file(
            &destination,
            format!("Giving up after {} attempts.", errors.len()),
        );
        for (age, error) in errors.iter().enumerate().skip(1) {
            self.log.file(&destination, format!("Earlier error #{age}: {error}"));
        }
        Err(errors
            .into_iter()
            .next()
            .unwrap_or(DownloadError::QueueClosed))
    }

    /// Runs one attempt immediately, outside the queue.
    ///
    /// # Errors
    ///
    /// See [`Downloader::exec_download_with`].
    pub async fn exec_download(
        &self,
        data: RequestData,
        destination: impl AsRef<Path>,
    ) -> Result<PathBuf, DownloadError> {
        self.downloader.exec_download(data, destination.as_ref()).await
    }

    /// Runs one attempt immediately, optionally skipping the header request.
    ///
    /// # Errors
    ///
    /// See [`Downloader::exec_download_with`].
    pub async fn exec_download_with(
        &self,
        data: RequestData,
        destination: impl AsRef<Path>,
        check_headers: bool,
    ) -> Result<PathBuf, DownloadError> {
        self.downloader
            .exec_download_with(data, destination.as_ref(), check_headers)
            .await
    }

    /// Attempts currently transferring.
    #[must_use]
    pub fn active(&self) -> usize {
        self.queue.active()
    }

    /// Attempts waiting for a slot.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Attempts per download.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The shared download queue.
    #[must_use]
    pub fn queue(&self) -> &DownloadQueue {
        &self.queue
    }
}
