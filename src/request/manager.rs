//! Entry point tying the executor to the per-host router.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use tracing::instrument;
use url::Url;

use super::executor::{RequestExecutor, generate_url};
use super::queue::MainRequestQueue;
use super::{RequestData, RequestError};
use crate::cookies::CookieJar;

/// Queued, rate-limited access to the network.
///
/// [`request`](Self::request) goes through the per-host queue; the other
/// methods run directly on the executor.
#[derive(Debug, Clone)]
pub struct RequestManager {
    executor: RequestExecutor,
    queue: Arc<MainRequestQueue>,
}

impl RequestManager {
    /// Creates a manager whose queues dispatch through `executor`.
    #[must_use]
    pub fn new(executor: RequestExecutor, rate_limit: Duration) -> Self {
        let queue = MainRequestQueue::new(Arc::new(executor.clone()), rate_limit);
        Self {
            executor,
            queue: Arc::new(queue),
        }
    }

    /// Queues `data` behind earlier requests to the same host and returns
    /// its body.
    ///
    /// # Errors
    ///
    /// Returns the request's own error; failures of other queued requests
    /// never surface here.
    #[instrument(skip(self, data), fields(method = %data.method, link = %data.link))]
    pub async fn request(&self, data: RequestData) -> Result<Option<String>, RequestError> {
        let url = generate_url(&data.link, &data.query)?;
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();

        let receiver = self.queue.get_by_host(&host).push(data)?;
        receiver
            .await
            .map_err(|_| RequestError::queue_closed(host))?
    }

    /// See [`generate_url`].
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidUrl`] if `link` is not absolute.
    pub fn generate_url(
        &self,
        link: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<Url, RequestError> {
        generate_url(link, query)
    }

    /// See [`RequestExecutor::generate_request`].
    ///
    /// # Errors
    ///
    /// Returns configuration errors.
    pub fn generate_request(&self, data: &RequestData) -> Result<reqwest::Request, RequestError> {
        self.executor.generate_request(data)
    }

    /// Runs `data` immediately, bypassing the per-host queue.
    ///
    /// # Errors
    ///
    /// See [`RequestExecutor::execute_request`].
    pub async fn execute_request(&self, data: &RequestData) -> Result<Option<String>, RequestError> {
        self.executor.execute_request(data).await
    }

    /// Runs `data` immediately and returns the response headers.
    ///
    /// # Errors
    ///
    /// See [`RequestExecutor::fetch_headers`].
    pub async fn fetch_headers(&self, data: &RequestData) -> Result<HeaderMap, RequestError> {
        self.executor.fetch_headers(data).await
    }

    /// The executor behind this manager.
    #[must_use]
    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    /// The per-host router.
    #[must_use]
    pub fn queue(&self) -> &MainRequestQueue {
        &self.queue
    }

    /// The default cookie jar.
    #[must_use]
    pub fn cookie_jar(&self) -> &Arc<CookieJar> {
        self.executor.cookie_jar()
    }
}
