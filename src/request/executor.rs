//! Request building and the response status machine.
//!
//! [`RequestExecutor`] is cheap to clone and holds everything needed to run
//! one request end to end: the shared `reqwest` client, the client-wide
//! custom headers, the default cookie jar and the redirect limit.
//!
//! Status handling:
//! - `200` and `206` succeed with the response
//! - `301` is re-issued against `Location`, up to `max_redirects` times
//! - `404` succeeds with no response unless the request set `is_404_error`
//! - anything else fails with [`RequestError::Status`]

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::redirect::Policy;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{RequestData, RequestError};
use crate::config::ClientOptions;
use crate::cookies::CookieJar;
use crate::events::ScopedLogger;

/// Executes a request end to end and returns its body.
///
/// This is the seam between the per-host queues and the network, so queue
/// behavior can be tested against a fake.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Runs the request and returns its body text, or `None` when the body
    /// was not requested or the response was an accepted `404`.
    async fn dispatch(&self, data: RequestData) -> Result<Option<String>, RequestError>;
}

/// Builds the HTTP client shared by a root client.
///
/// Redirects are disabled so the executor sees every `301`, and no timeouts
/// are imposed.
///
/// # Errors
///
/// Returns the `reqwest` error if the TLS backend cannot be initialized.
pub fn build_http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().redirect(Policy::none()).build()
}

/// Parses `link` and overlays `query` onto its query string.
///
/// Each key of `query` replaces the first existing pair with that key in
/// place and drops any later duplicates; keys not present are appended.
///
/// # Errors
///
/// Returns [`RequestError::InvalidUrl`] if `link` is not an absolute URL.
pub fn generate_url(link: &str, query: &BTreeMap<String, String>) -> Result<Url, RequestError> {
    let mut url = Url::parse(link).map_err(|e| RequestError::invalid_url(link, e))?;
    if query.is_empty() {
        return Ok(url);
    }

    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    for (key, value) in query {
        let mut seen = false;
        pairs.retain_mut(|(existing, current)| {
            if existing != key {
                return true;
            }
            if seen {
                return false;
            }
            seen = true;
            current.clone_from(value);
            true
        });
        if !seen {
            pairs.push((key.clone(), value.clone()));
        }
    }

    url.query_pairs_mut().clear().extend_pairs(pairs);
    Ok(url)
}

/// Runs requests against the network.
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    http: reqwest::Client,
    custom_headers: Arc<BTreeMap<String, String>>,
    cookie_jar: Arc<CookieJar>,
    max_redirects: u32,
    log: ScopedLogger,
}

impl RequestExecutor {
    /// Creates an executor over a shared HTTP client.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        options: &ClientOptions,
        cookie_jar: Arc<CookieJar>,
        log: ScopedLogger,
    ) -> Self {
        Self {
            http,
            custom_headers: Arc::new(options.custom_headers.clone()),
            cookie_jar,
            max_redirects: options.max_redirects,
            log,
        }
    }

    /// The jar used when a request does not bring its own.
    #[must_use]
    pub fn cookie_jar(&self) -> &Arc<CookieJar> {
        &self.cookie_jar
    }

    fn jar_for<'a>(&'a self, data: &'a RequestData) -> &'a CookieJar {
        data.cookie_jar.as_deref().unwrap_or(&self.cookie_jar)
    }

    /// Builds the wire request for `data`.
    ///
    /// # Errors
    ///
    /// Fails with a configuration error for a bad URL or scheme, a payload on
    /// a non-`POST` method, or an unsendable header.
    pub fn generate_request(&self, data: &RequestData) -> Result<reqwest::Request, RequestError> {
        let url = generate_url(&data.link, &data.query)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RequestError::UnsupportedScheme {
                scheme: url.scheme().to_string(),
                url: url.to_string(),
            });
        }
        if data.payload.is_some() && data.method != super::Method::Post {
            return Err(RequestError::UnexpectedPayload {
                method: data.method,
                url: url.to_string(),
            });
        }

        let mut builder = self
            .http
            .request(data.method.into(), url.clone())
            .headers(merge_headers(&self.custom_headers, &data.headers)?);
        if let Some(payload) = &data.payload {
            let (content_type, body) = payload.encode();
            if !body.is_empty() {
                builder = builder.header(CONTENT_TYPE, content_type).body(body);
            }
        }

        let mut request = builder.build().map_err(|source| RequestError::Build {
            url: url.to_string(),
            source,
        })?;
        self.jar_for(data).bind(&mut request);
        Ok(request)
    }

    /// Sends `data` and applies the status machine.
    ///
    /// Returns the accepted response (`200`/`206`) with its body unread, or
    /// `None` for a `404` that is not marked as an error. Cookies from every
    /// response along the way are stored.
    ///
    /// # Errors
    ///
    /// Returns configuration, transport and status errors; each is logged
    /// before it is returned.
    #[instrument(skip(self, data), fields(method = %data.method, link = %data.link))]
    pub async fn send(&self, data: &RequestData) -> Result<Option<reqwest::Response>, RequestError> {
        let result = self.follow(data).await;
        if let Err(e) = &result {
            self.log_failure(data, e);
        }
        result
    }

    async fn follow(&self, data: &RequestData) -> Result<Option<reqwest::Response>, RequestError> {
        let mut current = Cow::Borrowed(data);
        let mut redirects = 0;

        loop {
            let response = self.dispatch_once(&current).await?;
            let url = response.url().clone();

            match response.status().as_u16() {
                200 | 206 => return Ok(Some(response)),
                301 => {
                    if redirects >= self.max_redirects {
                        return Err(RequestError::TooManyRedirects {
                            url: url.to_string(),
                            limit: self.max_redirects,
                        });
                    }
                    let location = redirect_target(&url, response.headers()).ok_or_else(|| {
                        RequestError::MissingLocation {
                            url: url.to_string(),
                        }
                    })?;
                    redirects += 1;
                    self.log.log(format!("HTTP 301 on {url}, following {location}"));
                    let mut next = current.into_owned();
                    next.link = location.into();
                    current = Cow::Owned(next);
                }
                404 if !current.is_404_error => {
                    debug!(url = %url, "404 treated as empty result");
                    return Ok(None);
                }
                status => return Err(RequestError::status(url.as_str(), status)),
            }
        }
    }

    /// Builds and sends one request, firing listeners and storing cookies.
    async fn dispatch_once(&self, data: &RequestData) -> Result<reqwest::Response, RequestError> {
        let request = self.generate_request(data)?;
        let url = request.url().clone();
        if let Some(hook) = &data.listeners.on_request {
            hook(&request);
        }
        self.log.log(format!("HTTP {} {url}", data.method));

        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| RequestError::network(url.as_str(), e))?;
        debug!(url = %url, status = response.status().as_u16(), "response received");

        if let Some(hook) = &data.listeners.on_response {
            hook(&response);
        }
        self.jar_for(data).store_response(&url, response.headers());
        Ok(response)
    }

    /// Runs one full request cycle and returns the body text.
    ///
    /// The body is `None` when `return_output` is false (it is still drained)
    /// or for an accepted `404`. `on_done` observes the outcome before it is
    /// returned.
    ///
    /// # Errors
    ///
    /// Everything [`send`](Self::send) returns, plus body read failures.
    pub async fn execute_request(&self, data: &RequestData) -> Result<Option<String>, RequestError> {
        let result = self.read_body(data).await;
        if let Some(hook) = &data.listeners.on_done {
            match &result {
                Ok(body) => hook(body.as_deref(), None),
                Err(e) => hook(None, Some(e)),
            }
        }
        result
    }

    async fn read_body(&self, data: &RequestData) -> Result<Option<String>, RequestError> {
        let Some(response) = self.send(data).await? else {
            return Ok(None);
        };
        let url = response.url().to_string();

        let body = if data.return_output {
            response.text().await.map(Some)
        } else {
            response.bytes().await.map(|_| None)
        };
        body.map_err(|e| {
            let err = RequestError::network(url, e);
            self.log_failure(data, &err);
            err
        })
    }

    /// Sends `data` once and returns the response headers without reading
    /// the body. No status handling is applied.
    ///
    /// # Errors
    ///
    /// Returns configuration and transport errors.
    #[instrument(skip(self, data), fields(method = %data.method, link = %data.link))]
    pub async fn fetch_headers(&self, data: &RequestData) -> Result<HeaderMap, RequestError> {
        match self.dispatch_once(data).await {
            Ok(response) => Ok(response.headers().clone()),
            Err(e) => {
                self.log_failure(data, &e);
                Err(e)
            }
        }
    }

    fn log_failure(&self, data: &RequestData, error: &RequestError) {
        let url = generate_url(&data.link, &data.query)
            .map_or_else(|_| data.link.clone(), String::from);
        warn!(method = %data.method, url = %url, error = %error, source = ?std::error::Error::source(error), "request failed");
        self.log.log(format!("HTTP {} {url} failed: {error}", data.method));
    }
}

#[async_trait]
impl Dispatch for RequestExecutor {
    async fn dispatch(&self, data: RequestData) -> Result<Option<String>, RequestError> {
        self.execute_request(&data).await
    }
}

fn merge_headers(
    custom: &BTreeMap<String, String>,
    request: &BTreeMap<String, String>,
) -> Result<HeaderMap, RequestError> {
    let mut headers = HeaderMap::new();
    for (name, value) in custom.iter().chain(request) {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RequestError::invalid_header(name.as_str(), e))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|e| RequestError::invalid_header(name.as_str(), e))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

fn redirect_target(base: &Url, headers: &HeaderMap) -> Option<Url> {
    let location = headers.get(LOCATION)?.to_str().ok()?;
    base.join(location).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;
    use crate::request::{Method, Payload};
    use reqwest::header::{COOKIE, USER_AGENT};

    fn executor() -> RequestExecutor {
        let jar = CookieJar::new(
            Arc::new(MemoryStore::new()),
            ScopedLogger::detached("Cookie Jar"),
        );
        RequestExecutor::new(
            build_http_client().unwrap(),
            &ClientOptions::default(),
            Arc::new(jar),
            ScopedLogger::detached("Request Manager"),
        )
    }

    fn query(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    // ==================== generate_url Tests ====================

    #[test]
    fn test_generate_url_without_query_is_unchanged() {
        let url = generate_url("https://example.com/a?x=1", &BTreeMap::new()).unwrap();
        assert_eq!(url.as_str(), "https://example.com/a?x=1");
    }

    #[test]
    fn test_generate_url_appends_new_keys() {
        let url = generate_url("https://example.com/search", &query(&[("q", "rust lang")])).unwrap();
        assert_eq!(url.as_str(), "https://example.com/search?q=rust+lang");
    }

    #[test]
    fn test_generate_url_overrides_existing_key_in_place() {
        let url = generate_url(
            "https://example.com/list?page=1&sort=asc&page=9",
            &query(&[("page", "2")]),
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://example.com/list?page=2&sort=asc");
    }

    #[test]
    fn test_generate_url_rejects_relative_link() {
        let err = generate_url("/relative/path", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, RequestError::InvalidUrl { .. }));
    }

    // ==================== generate_request Tests ====================

    #[test]
    fn test_generate_request_rejects_unknown_scheme() {
        let err = executor()
            .generate_request(&RequestData::get("ftp://example.com/file"))
            .unwrap_err();
        assert!(matches!(err, RequestError::UnsupportedScheme { ref scheme, .. } if scheme == "ftp"));
    }

    #[test]
    fn test_generate_request_rejects_payload_on_get() {
        let data = RequestData::get("https://example.com/").with_payload(Payload::Raw("x".into()));
        let err = executor().generate_request(&data).unwrap_err();
        assert!(matches!(
            err,
            RequestError::UnexpectedPayload {
                method: Method::Get,
                ..
            }
        ));
    }

    #[test]
    fn test_generate_request_per_request_header_wins() {
        let data = RequestData::get("https://example.com/").with_header("user-agent", "custom/1.0");
        let request = executor().generate_request(&data).unwrap();

        let agents: Vec<_> = request.headers().get_all(USER_AGENT).iter().collect();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0], "custom/1.0");
    }

    #[test]
    fn test_generate_request_sends_default_user_agent() {
        let request = executor()
            .generate_request(&RequestData::get("https://example.com/"))
            .unwrap();
        assert!(
            request
                .headers()
                .get(USER_AGENT)
                .unwrap()
                .to_str()
                .unwrap()
                .contains("iPhone")
        );
    }

    #[test]
    fn test_generate_request_rejects_invalid_header() {
        let data = RequestData::get("https://example.com/").with_header("bad header", "x");
        let err = executor().generate_request(&data).unwrap_err();
        assert!(matches!(err, RequestError::InvalidHeader { .. }));
    }

    #[test]
    fn test_generate_request_encodes_form_payload() {
        let data = RequestData::post("https://example.com/login").with_payload(Payload::UrlEncoded(
            query(&[("user", "me"), ("pass", "p w")]),
        ));
        let request = executor().generate_request(&data).unwrap();

        assert_eq!(
            request.headers().get(CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
        let body = request.body().and_then(reqwest::Body::as_bytes).unwrap();
        assert_eq!(body, b"pass=p+w&user=me");
    }

    #[test]
    fn test_generate_request_json_payload_is_text_plain() {
        let data = RequestData::post("https://example.com/api")
            .with_payload(Payload::Json(serde_json::json!({"a": 1})));
        let request = executor().generate_request(&data).unwrap();

        assert_eq!(request.headers().get(CONTENT_TYPE).unwrap(), "text/plain");
        let body = request.body().and_then(reqwest::Body::as_bytes).unwrap();
        assert_eq!(body, br#"{"a":1}"#);
    }

    #[test]
    fn test_generate_request_uses_request_jar() {
        let exec = executor();
        let own_jar = Arc::new(CookieJar::new(
            Arc::new(MemoryStore::new()),
            ScopedLogger::detached("Cookie Jar"),
        ));
        own_jar
            .set("example.com", "/", "sid", "own", false, 0, false)
            .unwrap();

        let data = RequestData::get("http://example.com/").with_cookie_jar(Arc::clone(&own_jar));
        let request = exec.generate_request(&data).unwrap();
        assert_eq!(request.headers().get(COOKIE).unwrap(), "sid=own");

        let without = exec
            .generate_request(&RequestData::get("http://example.com/"))
            .unwrap();
        assert!(without.headers().get(COOKIE).is_none());
    }

    // ==================== redirect_target Tests ====================

    #[test]
    fn test_redirect_target_resolves_relative_location() {
        let base = Url::parse("https://example.com/old/page").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("../new?x=1"));

        let target = redirect_target(&base, &headers).unwrap();
        assert_eq!(target.as_str(), "https://example.com/new?x=1");
    }

    #[test]
    fn test_redirect_target_missing_location() {
        let base = Url::parse("https://example.com/").unwrap();
        assert!(redirect_target(&base, &HeaderMap::new()).is_none());
    }
}
