//! Request description, execution and per-host scheduling.
//!
//! # Overview
//!
//! - [`RequestData`] describes one request: target, method, query overlay,
//!   payload, headers, optional cookie jar, 404 handling and listeners.
//! - [`RequestExecutor`] turns it into a `reqwest` request and drives the
//!   status machine (`200`/`206` success, `301` follow, `404` mapping).
//! - [`MainRequestQueue`] routes requests to one FIFO queue per host. Each
//!   queue dispatches sequentially and keeps a minimum spacing between two
//!   dispatches.
//! - [`RequestManager`] ties the executor and the router together.
//!
//! # Example
//!
//! ```no_run
//! use courier_core::{Client, ClientOptions, RequestData};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(ClientOptions::default())?;
//! let body = client
//!     .requests()
//!     .request(RequestData::get("https://example.com/search").with_query("q", "rust"))
//!     .await?;
//! println!("{body:?}");
//! # Ok(())
//! # }
//! ```

mod error;
mod executor;
mod manager;
mod queue;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

pub use error::RequestError;
pub use executor::{Dispatch, RequestExecutor, build_http_client, generate_url};
pub use manager::RequestManager;
pub use queue::{MainRequestQueue, PerHostQueue, QueueReceiver};

use crate::cookies::CookieJar;
use crate::download::ProgressState;

/// HTTP methods the executor issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    /// `GET`
    #[default]
    Get,
    /// `POST`, the only method that may carry a payload.
    Post,
    /// `HEAD`
    Head,
}

impl Method {
    /// Uppercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => Self::GET,
            Method::Post => Self::POST,
            Method::Head => Self::HEAD,
        }
    }
}

/// Body of a `POST` request.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Form-encoded with the query-string encoder.
    UrlEncoded(BTreeMap<String, String>),
    /// Stringified JSON, sent as `text/plain`.
    Json(Value),
    /// Opaque string, sent as `text/plain`.
    Raw(String),
}

impl Payload {
    /// Returns the content type and the encoded body.
    #[must_use]
    pub fn encode(&self) -> (&'static str, String) {
        match self {
            Self::UrlEncoded(fields) => (
                "application/x-www-form-urlencoded",
                url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(fields)
                    .finish(),
            ),
            Self::Json(value) => ("text/plain", value.to_string()),
            Self::Raw(body) => ("text/plain", body.clone()),
        }
    }
}

/// Called with the built request right before it is sent.
pub type RequestHook = Arc<dyn Fn(&reqwest::Request) + Send + Sync>;
/// Called with every response, including redirects and errors.
pub type ResponseHook = Arc<dyn Fn(&reqwest::Response) + Send + Sync>;
/// Called once a request completes, with its body or its error.
pub type DoneHook = Arc<dyn Fn(Option<&str>, Option<&RequestError>) + Send + Sync>;
/// Called when a download is admitted, with its position among running ones.
pub type QueueHook = Arc<dyn Fn(usize) + Send + Sync>;
/// Called with periodic download progress.
pub type ProgressHook = Arc<dyn Fn(&ProgressState) + Send + Sync>;

/// Observers attached to a request.
#[derive(Clone, Default)]
pub struct Listeners {
    /// See [`RequestHook`].
    pub on_request: Option<RequestHook>,
    /// See [`ResponseHook`].
    pub on_response: Option<ResponseHook>,
    /// See [`DoneHook`].
    pub on_done: Option<DoneHook>,
    /// See [`QueueHook`]. Only used by downloads.
    pub on_queue: Option<QueueHook>,
    /// See [`ProgressHook`]. Only used by downloads.
    pub on_progress: Option<ProgressHook>,
}

impl Listeners {
    /// No listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_request(mut self, hook: impl Fn(&reqwest::Request) + Send + Sync + 'static) -> Self {
        self.on_request = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_response(
        mut self,
        hook: impl Fn(&reqwest::Response) + Send + Sync + 'static,
    ) -> Self {
        self.on_response = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_done(
        mut self,
        hook: impl Fn(Option<&str>, Option<&RequestError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_done = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_queue(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_queue = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_progress(mut self, hook: impl Fn(&ProgressState) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("on_request", &self.on_request.is_some())
            .field("on_response", &self.on_response.is_some())
            .field("on_done", &self.on_done.is_some())
            .field("on_queue", &self.on_queue.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Description of one HTTP request.
///
/// The download layer injects a `Range` header into its own copy before
/// dispatch; the caller's value is never modified.
#[derive(Debug, Clone)]
pub struct RequestData {
    /// Absolute URL.
    pub link: String,
    pub method: Method,
    /// Overlaid onto the query string of `link`, replacing existing keys.
    pub query: BTreeMap<String, String>,
    /// Only valid for [`Method::Post`].
    pub payload: Option<Payload>,
    /// Merged over the client's custom headers.
    pub headers: BTreeMap<String, String>,
    /// Jar used instead of the manager's default jar.
    pub cookie_jar: Option<Arc<CookieJar>>,
    /// Treat `404` as an error instead of an empty success.
    pub is_404_error: bool,
    pub listeners: Listeners,
    /// Read the body into the result; otherwise it is drained and dropped.
    pub return_output: bool,
}

impl RequestData {
    /// Request with the given method and defaults for everything else.
    #[must_use]
    pub fn new(method: Method, link: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            method,
            query: BTreeMap::new(),
            payload: None,
            headers: BTreeMap::new(),
            cookie_jar: None,
            is_404_error: false,
            listeners: Listeners::default(),
            return_output: true,
        }
    }

    #[must_use]
    pub fn get(link: impl Into<String>) -> Self {
        Self::new(Method::Get, link)
    }

    #[must_use]
    pub fn post(link: impl Into<String>) -> Self {
        Self::new(Method::Post, link)
    }

    #[must_use]
    pub fn head(link: impl Into<String>) -> Self {
        Self::new(Method::Head, link)
    }

    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn with_cookie_jar(mut self, jar: Arc<CookieJar>) -> Self {
        self.cookie_jar = Some(jar);
        self
    }

    #[must_use]
    pub fn with_listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    #[must_use]
    pub fn is_404_error(mut self, is_error: bool) -> Self {
        self.is_404_error = is_error;
        self
    }

    #[must_use]
    pub fn return_output(mut self, return_output: bool) -> Self {
        self.return_output = return_output;
        self
    }

    /// Sets a header, replacing any existing header of the same name in any
    /// letter case.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
        self.headers.insert(name.to_string(), value.into());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builders_set_fields() {
        let data = RequestData::post("https://example.com/login")
            .with_query("next", "/home")
            .with_header("X-Token", "abc")
            .with_payload(Payload::Raw("body".to_string()))
            .is_404_error(true)
            .return_output(false);

        assert_eq!(data.method, Method::Post);
        assert_eq!(data.query.get("next").unwrap(), "/home");
        assert_eq!(data.headers.get("X-Token").unwrap(), "abc");
        assert!(data.is_404_error);
        assert!(!data.return_output);
    }

    #[test]
    fn test_defaults() {
        let data = RequestData::get("https://example.com/");
        assert!(!data.is_404_error);
        assert!(data.return_output);
        assert!(data.payload.is_none());
        assert!(data.cookie_jar.is_none());
    }

    #[test]
    fn test_set_header_replaces_any_case() {
        let mut data = RequestData::get("https://example.com/").with_header("range", "bytes=1-");
        data.set_header("Range", "bytes=10-");

        assert_eq!(data.headers.len(), 1);
        assert_eq!(data.headers.get("Range").unwrap(), "bytes=10-");
    }

    #[test]
    fn test_payload_encoding() {
        let form = Payload::UrlEncoded(BTreeMap::from([
            ("user".to_string(), "a b".to_string()),
            ("pass".to_string(), "x&y".to_string()),
        ]));
        assert_eq!(
            form.encode(),
            ("application/x-www-form-urlencoded", "pass=x%26y&user=a+b".to_string())
        );

        let json = Payload::Json(json!({"id": 7}));
        assert_eq!(json.encode(), ("text/plain", r#"{"id":7}"#.to_string()));

        let raw = Payload::Raw("opaque".to_string());
        assert_eq!(raw.encode(), ("text/plain", "opaque".to_string()));
    }

    #[test]
    fn test_method_names() {
        assert_eq!(Method::Get.to_string(), "GET");
        assert_eq!(reqwest::Method::from(Method::Head), reqwest::Method::HEAD);
    }

    #[test]
    fn test_listeners_debug_shows_presence() {
        let listeners = Listeners::new().on_queue(|_| {});
        let rendered = format!("{listeners:?}");
        assert!(rendered.contains("on_queue: true"));
        assert!(rendered.contains("on_request: false"));
    }
}
