//! Root client and sub-clients for site integrations.
//!
//! A [`Client`] owns every service: the options, the config store, the debug
//! event hub, the [`RequestManager`] and the [`DownloadManager`]. A
//! [`SubClient`] borrows a client and gives an integration the same request
//! and download surface without owning or copying any of that state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;
use url::Url;

use crate::config::{ClientOptions, ConfigStore, JsonFileStore, OptionsError, StoreError};
use crate::cookies::CookieJar;
use crate::download::{DownloadError, DownloadManager};
use crate::events::{DebugEvent, EventHub, ScopedLogger};
use crate::request::{
    RequestData, RequestError, RequestExecutor, RequestManager, build_http_client, generate_url,
};

/// Store namespace holding the cookie table.
pub const COOKIE_JAR_NAMESPACE: &str = "CookieJar";

/// Errors raised while constructing a [`Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The options failed validation.
    #[error(transparent)]
    Options(#[from] OptionsError),

    /// The persisted state could not be opened.
    #[error("failed to open persisted state: {0}")]
    Store(#[from] StoreError),

    /// The HTTP client could not be initialized.
    #[error("failed to initialize HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Owner of the request and download services.
#[derive(Debug)]
pub struct Client {
    options: Arc<ClientOptions>,
    store: Arc<dyn ConfigStore>,
    events: EventHub,
    requests: RequestManager,
    downloads: DownloadManager,
}

impl Client {
    /// Creates a client persisting its state under `options.data_dir`.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] for invalid options, unreadable persisted
    /// state or an HTTP client that fails to initialize.
    pub fn new(options: ClientOptions) -> Result<Self, ClientError> {
        options.validate()?;
        let store = JsonFileStore::open(&options.data_dir, COOKIE_JAR_NAMESPACE)?;
        Self::with_store(options, Arc::new(store))
    }

    /// Creates a client persisting its state through `store`.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] for invalid options or an HTTP client that
    /// fails to initialize.
    pub fn with_store(
        options: ClientOptions,
        store: Arc<dyn ConfigStore>,
    ) -> Result<Self, ClientError> {
        options.validate()?;
        let events = EventHub::new();

        let jar = Arc::new(CookieJar::new(
            Arc::clone(&store),
            events.scoped("Cookie Jar"),
        ));
        let executor = RequestExecutor::new(
            build_http_client()?,
            &options,
            jar,
            events.scoped("Request Manager"),
        );
        let requests = RequestManager::new(executor.clone(), options.rate_limit_time);
        let downloads = DownloadManager::new(executor, &options, &events);

        info!(
            data_dir = %options.data_dir.display(),
            parallel = options.download_parallel_count,
            rate_limit_ms = options.rate_limit_time.as_millis(),
            "client ready"
        );

        Ok(Self {
            options: Arc::new(options),
            store,
            events,
            requests,
            downloads,
        })
    }

    /// The options this client runs with.
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// The persisted state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// Request layer.
    #[must_use]
    pub fn requests(&self) -> &RequestManager {
        &self.requests
    }

    /// Download layer.
    #[must_use]
    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    /// The default cookie jar.
    #[must_use]
    pub fn cookie_jar(&self) -> &Arc<CookieJar> {
        self.requests.cookie_jar()
    }

    /// Subscribes to the debug event stream of every component.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DebugEvent> {
        self.events.subscribe()
    }

    /// Returns a logger publishing under `scope` on this client's stream.
    #[must_use]
    pub fn logger(&self, scope: &str) -> ScopedLogger {
        self.events.scoped(scope)
    }

    /// Returns a sub-client borrowing this client's services.
    #[must_use]
    pub fn sub_client(&self) -> SubClient<'_> {
        SubClient::new(self)
    }
}

/// Non-owning view of a [`Client`] for one integration.
#[derive(Debug, Clone)]
pub struct SubClient<'a> {
    main: &'a Client,
    log: ScopedLogger,
}

impl<'a> SubClient<'a> {
    /// Creates a sub-client logging under `"Resource Manager"`.
    #[must_use]
    pub fn new(main: &'a Client) -> Self {
        Self::with_scope(main, "Resource Manager")
    }

    /// Creates a sub-client logging under `scope`.
    #[must_use]
    pub fn with_scope(main: &'a Client, scope: &str) -> Self {
        Self {
            main,
            log: main.logger(scope),
        }
    }

    /// The client this view borrows.
    #[must_use]
    pub fn main(&self) -> &'a Client {
        self.main
    }

    /// Queued request through the client's per-host queues.
    ///
    /// # Errors
    ///
    /// See [`RequestManager::request`].
    pub async fn request(&self, data: RequestData) -> Result<Option<String>, RequestError> {
        self.main.requests.request(data).await
    }

    /// Queued, retrying download through the client's download queue.
    ///
    /// # Errors
    ///
    /// See [`DownloadManager::download`].
    pub async fn download(
        &self,
        data: RequestData,
        destination: impl AsRef<Path>,
    ) -> Result<PathBuf, DownloadError> {
        self.main.downloads.download(data, destination).await
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

    /// Publishes a message on the client's debug stream.
    pub fn log(&self, message: impl Into<String>) {
        self.log.log(message);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;
    use tempfile::TempDir;

    fn memory_client() -> Client {
        Client::with_store(ClientOptions::default(), Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_with_store_rejects_invalid_options() {
        let options = ClientOptions {
            download_parallel_count: 0,
            ..ClientOptions::default()
        };
        let result = Client::with_store(options, Arc::new(MemoryStore::new()));
        assert!(matches!(result, Err(ClientError::Options(_))));
    }

    #[tokio::test]
    async fn test_new_uses_data_dir_for_cookies() {
        let dir = TempDir::new().unwrap();
        let options = ClientOptions {
            data_dir: dir.path().to_path_buf(),
            ..ClientOptions::default()
        };
        let client = Client::new(options).unwrap();
        client
            .cookie_jar()
            .set("example.com", "/", "a", "1", false, 4_102_444_800, false)
            .unwrap();

        assert!(dir.path().join("CookieJar.json").exists());
    }

    #[tokio::test]
    async fn test_sub_client_logs_on_main_stream() {
        let client = memory_client();
        let mut events = client.subscribe();

        client.sub_client().log("resource loaded");

        let event = events.recv().await.unwrap();
        assert_eq!(event.to_string(), "[Resource Manager]: resource loaded");
    }

    #[tokio::test]
    async fn test_sub_client_shares_services() {
        let client = memory_client();
        let sub = SubClient::with_scope(&client, "Gallery");

        assert!(std::ptr::eq(sub.main(), &client));
        let url = sub
            .generate_url(
                "https://example.com/list?page=1",
                &BTreeMap::from([("page".to_string(), "3".to_string())]),
            )
            .unwrap();
        assert_eq!(url.as_str(), "https://example.com/list?page=3");
    }

    #[tokio::test]
    async fn test_sub_client_request_rejects_bad_scheme() {
        let client = memory_client();
        let err = client
            .sub_client()
            .request(RequestData::get("ftp://example.com/file"))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }
}
