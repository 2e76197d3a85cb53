//! Per-host request queues and the router that owns them.
//!
//! Every distinct host gets exactly one [`PerHostQueue`], created on first
//! use and kept for the lifetime of the [`MainRequestQueue`]. A queue is a
//! FIFO channel drained by a single worker task:
//!
//! 1. take the next entry
//! 2. wait until `last_request + rate_limit` if that is still in the future
//! 3. stamp `last_request = now`
//! 4. run the request to completion and answer the caller
//!
//! Requests to one host therefore never overlap and never start closer than
//! `rate_limit` apart, while different hosts proceed independently. A failed
//! request only fails its own caller; the worker moves on to the next entry.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use courier_core::{MainRequestQueue, RequestData, RequestExecutor};
//!
//! # async fn example(executor: RequestExecutor) -> Result<(), Box<dyn std::error::Error>> {
//! let queue = MainRequestQueue::new(Arc::new(executor), Duration::from_millis(1500));
//!
//! // Both go through the same worker, 1.5s apart.
//! let first = queue.get_by_host("example.com").push(RequestData::get("https://example.com/a"))?;
//! let second = queue.get_by_host("example.com").push(RequestData::get("https://example.com/b"))?;
//! let (a, b) = (first.await?, second.await?);
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::executor::Dispatch;
use super::{RequestData, RequestError};

/// Total wait on one host after which a warning is logged once.
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Receives the outcome of one queued request.
pub type QueueReceiver = oneshot::Receiver<Result<Option<String>, RequestError>>;

/// One pending unit of work bound to a host queue.
struct PerHostQueueEntry {
    request_data: RequestData,
    responder: oneshot::Sender<Result<Option<String>, RequestError>>,
}

/// Timing and occupancy shared between a queue handle and its worker.
#[derive(Debug, Default)]
struct HostState {
    /// Dispatch time of the most recent request; `None` before the first.
    last_request: Mutex<Option<Instant>>,
    /// Entries pushed but not yet taken by the worker.
    pending: AtomicUsize,
    /// Total time the worker spent waiting on the rate limit.
    cumulative_delay_ms: AtomicU64,
}

impl HostState {
    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(total)
    }
}

/// Handle to the FIFO queue of one host.
#[derive(Debug, Clone)]
pub struct PerHostQueue {
    host: Arc<str>,
    entries: mpsc::UnboundedSender<PerHostQueueEntry>,
    state: Arc<HostState>,
}

impl PerHostQueue {
    /// Starts the worker for `host`. Must be called inside a Tokio runtime.
    fn spawn(host: &str, dispatcher: Arc<dyn Dispatch>, rate_limit: Duration) -> Self {
        let (entries, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(HostState::default());
        let host: Arc<str> = Arc::from(host);

        tokio::spawn(run_queue(
            Arc::clone(&host),
            receiver,
            dispatcher,
            rate_limit,
            Arc::clone(&state),
        ));
        debug!(host = %host, rate_limit_ms = rate_limit.as_millis(), "per-host queue created");

        Self {
            host,
            entries,
            state,
        }
    }

    /// Host this queue serves.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Appends a request and returns the receiver for its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::QueueClosed`] if the worker has stopped.
    pub fn push(&self, request_data: RequestData) -> Result<QueueReceiver, RequestError> {
        let (responder, receiver) = oneshot::channel();
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        if self
            .entries
            .send(PerHostQueueEntry {
                request_data,
                responder,
            })
            .is_err()
        {
            self.state.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(RequestError::queue_closed(self.host.as_ref()));
        }
        Ok(receiver)
    }

    /// Entries waiting for the worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// When the most recent request was dispatched.
    #[must_use]
    pub fn last_request(&self) -> Option<Instant> {
        *self
            .state
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drains one host's queue until every handle is dropped.
#[instrument(skip(host, entries, dispatcher, state), fields(host = %host))]
async fn run_queue(
    host: Arc<str>,
    mut entries: mpsc::UnboundedReceiver<PerHostQueueEntry>,
    dispatcher: Arc<dyn Dispatch>,
    rate_limit: Duration,
    state: Arc<HostState>,
) {
    let mut warned = false;

    while let Some(entry) = entries.recv().await {
        state.pending.fetch_sub(1, Ordering::SeqCst);

        let last = *state
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = last {
            let Some(deadline) = last.checked_add(rate_limit) else {
                warn!(
                    rate_limit_ms = rate_limit.as_millis(),
                    "rate limit out of range, host queue parked"
                );
                std::future::pending::<()>().await;
                return;
            };
            let now = Instant::now();
            if deadline > now {
                let wait = deadline - now;
                debug!(wait_ms = wait.as_millis(), "rate limit wait");
                tokio::time::sleep_until(deadline).await;

                let total = state.add_cumulative_delay(wait);
                if !warned && total > CUMULATIVE_DELAY_WARNING_THRESHOLD {
                    warned = true;
                    warn!(
                        total_delay_secs = total.as_secs(),
                        "requests to this host have waited a long time on the rate limit"
                    );
                }
            }
        }
        *state
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        let result = dispatcher.dispatch(entry.request_data).await;
        if entry.responder.send(result).is_err() {
            debug!("caller stopped waiting for the result");
        }
    }

    debug!("per-host queue stopped");
}

/// Router from host name to its [`PerHostQueue`].
pub struct MainRequestQueue {
    per_host: DashMap<String, PerHostQueue>,
    dispatcher: Arc<dyn Dispatch>,
    rate_limit: Duration,
}

impl std::fmt::Debug for MainRequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainRequestQueue")
            .field("hosts", &self.per_host.len())
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

impl MainRequestQueue {
    /// Creates an empty router. Queues dispatch through `dispatcher`.
    #[must_use]
    pub fn new(dispatcher: Arc<dyn Dispatch>, rate_limit: Duration) -> Self {
        Self {
            per_host: DashMap::new(),
            dispatcher,
            rate_limit,
        }
    }

    /// Minimum spacing between two dispatches to one host.
    #[must_use]
    pub fn rate_limit(&self) -> Duration {
        self.rate_limit
    }

    /// Returns the queue for `host`, creating it on first use.
    ///
    /// Concurrent first calls for one host create a single queue. Must be
    /// called inside a Tokio runtime.
    #[must_use]
    pub fn get_by_host(&self, host: &str) -> PerHostQueue {
        let host = host.to_ascii_lowercase();
        self.per_host
            .entry(host.clone())
            .or_insert_with(|| {
                PerHostQueue::spawn(&host, Arc::clone(&self.dispatcher), self.rate_limit)
            })
            .value()
            .clone()
    }

    /// Hosts that have a queue.
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        self.per_host.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of host queues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.per_host.len()
    }

    /// Whether no host has been requested yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.per_host.is_empty()
    }
}
