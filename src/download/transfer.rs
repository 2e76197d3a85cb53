//! One download attempt: header check, resume decision, transfer and finalize.

use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, HeaderMap, LAST_MODIFIED};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};

use super::error::DownloadError;
use super::progress::{ProgressState, ProgressTracker};
use super::temp::{find_resumable, request_token, temp_path};
use crate::events::ScopedLogger;
use crate::request::{Listeners, RequestData, RequestError, RequestExecutor, generate_url};

/// Runs single download attempts.
#[derive(Debug, Clone)]
pub struct Downloader {
    requests: RequestExecutor,
    progress_interval: Duration,
    log: ScopedLogger,
}

impl Downloader {
    /// Creates a downloader sending through `requests`.
    #[must_use]
    pub fn new(requests: RequestExecutor, progress_interval: Duration, log: ScopedLogger) -> Self {
        Self {
            requests,
            progress_interval,
            log,
        }
    }

    /// Downloads `data` to `destination` once, fetching headers first.
    ///
    /// # Errors
    ///
    /// See [`exec_download_with`](Self::exec_download_with).
    pub async fn exec_download(
        &self,
        data: RequestData,
        destination: &Path,
    ) -> Result<PathBuf, DownloadError> {
        self.exec_download_with(data, destination, true).await
    }

    /// Downloads `data` to `destination` once.
    ///
    /// Returns immediately when the destination already exists. Otherwise
    /// the bytes go to a temp artifact that is renamed onto the destination
    /// when the body ends. Without `check_headers` the server's range
    /// support is unknown and the transfer always starts from zero.
    ///
    /// The header request runs without listeners, so `on_request` and
    /// `on_response` see only the transfer. `on_done` fires once per attempt.
    /// A success passes the destination path as body. A request failure
    /// passes its [`RequestError`]; IO failures pass neither.
    ///
    /// # Errors
    ///
    /// Returns request errors (including `404`) and IO errors. The temp
    /// artifact is kept on failure so a later attempt can resume it.
    #[instrument(skip(self, data, destination), fields(link = %data.link, destination = %destination.display()))]
    pub async fn exec_download_with(
        &self,
        data: RequestData,
        destination: &Path,
        check_headers: bool,
    ) -> Result<PathBuf, DownloadError> {
        let on_done = data.listeners.on_done.clone();
        let result = self.attempt(data, destination, check_headers).await;
        if let Some(hook) = on_done {
            match &result {
                Ok(saved) => hook(Some(saved.to_string_lossy().as_ref()), None),
                Err(DownloadError::Request(e)) => hook(None, Some(e)),
                Err(_) => hook(None, None),
            }
        }
        result
    }

    async fn attempt(
        &self,
        mut data: RequestData,
        destination: &Path,
        check_headers: bool,
    ) -> Result<PathBuf, DownloadError> {
        if tokio::fs::try_exists(destination).await.unwrap_or(false) {
            self.log.file(destination, "Already downloaded");
            return Ok(destination.to_path_buf());
        }

        let headers = if check_headers {
            self.log.file(destination, "Fetching headers...");
            let quiet = RequestData {
                listeners: Listeners::default(),
                ..data.clone()
            };
            Some(self.requests.fetch_headers(&quiet).await?)
        } else {
            None
        };

        let url = generate_url(&data.link, &data.query)?;
        let token = request_token(data.method, url.as_str());
        self.log
            .file(destination, "Scanning for potential resumable download...");
        let temp = if let Some(found) = find_resumable(destination, &token).await {
            self.log.file(destination, "Resumable download found.");
            found
        } else {
            self.log.file(destination, "Resumable download not found.");
            temp_path(destination, &token)
        };

        let offset = self.resume_offset(destination, headers.as_ref(), &temp).await;
        if offset > 0 {
            self.log.file(
                destination,
                format!("Sending range headers (offset: {offset})..."),
            );
            data.set_header("Range", format!("bytes={offset}-"));
        }
        data.is_404_error = true;

        info!(offset, temp = %temp.display(), "starting transfer");
        let response = self
            .requests
            .send(&data)
            .await?
            .ok_or_else(|| RequestError::status(url.as_str(), 404))?;

        self.write_response(response, &data.listeners, destination, &temp, offset)
            .await
    }

    /// Bytes to skip on the server, or `0` for a fresh start.
    async fn resume_offset(&self, destination: &Path, headers: Option<&HeaderMap>, temp: &Path) -> u64 {
        let Some(headers) = headers else {
            return 0;
        };
        let accepts_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
        if !accepts_ranges {
            self.log.file(
                destination,
                "The server does not support ranges. Resuming is not possible.",
            );
            return 0;
        }

        let Ok(metadata) = tokio::fs::metadata(temp).await else {
            return 0;
        };
        let existing = metadata.len();
        let total = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        match total {
            Some(total) if total > existing => {
                self.log.file(destination, "Resuming is possible.");
                existing
            }
            Some(_) => 0,
            None => {
                self.log.file(
                    destination,
                    "Content length is not available. Resuming is not possible.",
                );
                0
            }
        }
    }

    async fn write_response(
        &self,
        response: reqwest::Response,
        listeners: &Listeners,
        destination: &Path,
        temp: &Path,
        offset: u64,
    ) -> Result<PathBuf, DownloadError> {
        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok());

        let resumed = offset > 0 && response.status().as_u16() == 206;
        if offset > 0 && !resumed {
            self.log.file(
                destination,
                "Server ignored the range request. Restarting from zero.",
            );
        }

        if let Some(dir) = temp.parent()
            && !tokio::fs::try_exists(dir).await.unwrap_or(false)
        {
            self.log
                .file(destination, "Directory not found. Creating a new one...");
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| DownloadError::io(dir, e))?;
        }

        let file = if resumed {
            OpenOptions::new().create(true).append(true).open(temp).await
        } else {
            File::create(temp).await
        }
        .map_err(|e| DownloadError::io(temp, e))?;

        let start = if resumed { offset } else { 0 };
        let total = response.content_length().map(|length| start + length);
        let mut tracker = ProgressTracker::new(start, total, self.progress_interval);

        self.stream_to_file(file, response, temp, &mut tracker, listeners, destination)
            .await?;

        tokio::fs::rename(temp, destination)
            .await
            .map_err(|e| DownloadError::io(destination, e))?;
        if let Err(e) = set_modified(destination, last_modified.unwrap_or_else(SystemTime::now)) {
            warn!(path = %destination.display(), error = %e, "failed to set modification time");
        }

        info!(
            path = %destination.display(),
            bytes = tracker.transferred(),
            resumed,
            "download complete"
        );
        self.log.file(destination, "Download finished.");
        Ok(destination.to_path_buf())
    }

    /// Pipes the response body into `file` and reports progress.
    async fn stream_to_file(
        &self,
        file: File,
        response: reqwest::Response,
        temp: &Path,
        tracker: &mut ProgressTracker,
        listeners: &Listeners,
        destination: &Path,
    ) -> Result<(), DownloadError> {
        let url = response.url().to_string();
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RequestError::network(url.as_str(), e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(temp, e))?;

            if let Some(state) = tracker.advance(chunk.len() as u64) {
                self.report(destination, listeners, &state);
            }
        }

        writer.flush().await.map_err(|e| DownloadError::io(temp, e))?;
        debug!(bytes = tracker.transferred(), "body written");
        Ok(())
    }

    fn report(&self, destination: &Path, listeners: &Listeners, state: &ProgressState) {
        self.log.file(destination, state);
        if let Some(hook) = &listeners.on_progress {
            hook(state);
        }
    }
}

fn set_modified(path: &Path, modified: SystemTime) -> std::io::Result<()> {
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(FileTimes::new().set_accessed(SystemTime::now()).set_modified(modified))
}
