//! Parallelism-bounded FIFO queue of download attempts.
//!
//! A single dispatcher task reads entries from an unbounded channel in
//! arrival order. Each entry waits for one of `parallel_count` semaphore
//! permits, then runs on its own task holding that permit until the attempt
//! finishes. The dispatcher is started by the first push and stops once
//! every handle to the queue is dropped.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, instrument};

use super::error::DownloadError;
use super::transfer::Downloader;
use crate::events::ScopedLogger;
use crate::request::RequestData;

/// Receives the outcome of one queued attempt.
pub type DownloadReceiver = oneshot::Receiver<Result<PathBuf, DownloadError>>;

/// One pending or running download attempt.
#[derive(Debug)]
pub struct DownloadEntry {
    pub request_data: RequestData,
    pub destination_file: PathBuf,
    /// Zero-based attempt number.
    pub cur_retry: u32,
    pub max_retry: u32,
    responder: oneshot::Sender<Result<PathBuf, DownloadError>>,
}

/// State shared by queue handles, the dispatcher and running attempts.
#[derive(Debug)]
struct QueueState {
    downloader: Downloader,
    permits: Arc<Semaphore>,
    parallel_count: usize,
    pending: AtomicUsize,
    ongoing: Arc<AtomicUsize>,
    log: ScopedLogger,
}

/// Counts one running attempt until dropped, including when the attempt
/// panics.
struct OngoingSlot(Arc<AtomicUsize>);

impl OngoingSlot {
    /// Takes a slot and returns it with the number of attempts that were
    /// already running.
    fn take(counter: &Arc<AtomicUsize>) -> (Self, usize) {
        let position = counter.fetch_add(1, Ordering::SeqCst);
        (Self(Arc::clone(counter)), position)
    }
}

impl Drop for OngoingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to the download queue.
#[derive(Debug, Clone)]
pub struct DownloadQueue {
    state: Arc<QueueState>,
    sender: Arc<OnceLock<mpsc::UnboundedSender<DownloadEntry>>>,
}

impl DownloadQueue {
    /// Creates a queue running at most `parallel_count` attempts at once.
    #[must_use]
    pub fn new(downloader: Downloader, parallel_count: usize, log: ScopedLogger) -> Self {
        let parallel_count = parallel_count.max(1);
        Self {
            state: Arc::new(QueueState {
                downloader,
                permits: Arc::new(Semaphore::new(parallel_count)),
                parallel_count,
                pending: AtomicUsize::new(0),
                ongoing: Arc::new(AtomicUsize::new(0)),
                log,
            }),
            sender: Arc::new(OnceLock::new()),
        }
    }

    /// Queues one attempt and returns the receiver for its outcome.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::QueueClosed`] if the dispatcher has stopped.
    pub fn push(
        &self,
        request_data: RequestData,
        destination_file: PathBuf,
        cur_retry: u32,
        max_retry: u32,
    ) -> Result<DownloadReceiver, DownloadError> {
        let (responder, receiver) = oneshot::channel();
        let entry = DownloadEntry {
            request_data,
            destination_file,
            cur_retry,
            max_retry,
            responder,
        };

        self.state.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender().send(entry).is_err() {
            self.state.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(DownloadError::QueueClosed);
        }
        Ok(receiver)
    }

    /// Attempts waiting for a permit.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Attempts currently running.
    #[must_use]
    pub fn active(&self) -> usize {
        self.state.ongoing.load(Ordering::SeqCst)
    }

    /// Maximum number of attempts running at once.
    #[must_use]
    pub fn parallel_count(&self) -> usize {
        self.state.parallel_count
    }

    fn sender(&self) -> &mpsc::UnboundedSender<DownloadEntry> {
        self.sender.get_or_init(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            tokio::spawn(run_queue(Arc::clone(&self.state), receiver));
            sender
        })
    }
}

#[instrument(skip_all, fields(parallel = state.parallel_count))]
async fn run_queue(state: Arc<QueueState>, mut entries: mpsc::UnboundedReceiver<DownloadEntry>) {
    state.log.log("Queue is running.");

    while let Some(entry) = entries.recv().await {
        let Ok(permit) = Arc::clone(&state.permits).acquire_owned().await else {
            break;
        };
        state.pending.fetch_sub(1, Ordering::SeqCst);
        let (slot, position) = OngoingSlot::take(&state.ongoing);

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let _permit = permit;
            let DownloadEntry {
                request_data,
                destination_file,
                cur_retry,
                max_retry,
                responder,
            } = entry;

            state.log.file(
                &destination_file,
                format!("Starting attempt {}/{max_retry}.", cur_retry + 1),
            );
            if let Some(hook) = &request_data.listeners.on_queue {
                hook(position);
            }

            let result = state
                .downloader
                .exec_download(request_data, &destination_file)
                .await;
            drop(slot);

            if responder.send(result).is_err() {
                debug!(path = %destination_file.display(), "caller stopped waiting for the download");
            }
        });
    }

    state.log.log("Queue is stopped.");
}
