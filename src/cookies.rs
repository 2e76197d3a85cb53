//! Cookie jar backed by a [`ConfigStore`].
//!
//! Cookies are kept in a nested table `domain -> path -> key -> Cookie` and
//! the whole table is written back to the store on every mutation.
//!
//! # Session cookies
//!
//! Every jar draws a random ephemeral id when it is constructed and tags each
//! cookie it stores with that id. A cookie is visible when it carries a
//! future expiry, or when it was stored through the jar reading it. A new jar
//! over the same store therefore behaves like a browser after a restart:
//! unexpired persistent cookies survive, session cookies do not. Within the
//! storing jar a cookie stays visible even after its expiry passes.
//!
//! # Matching
//!
//! - a stored domain matches the request host exactly, or by suffix when it
//!   starts with `.` (`.example.com` covers `example.com` and `a.example.com`).
//!   The suffix must start on a label boundary, so `.example.com` does not
//!   match `badexample.com` the way a plain string suffix test would
//! - the request path must start with the cookie path (plain prefix test)
//! - `secure` cookies need a secure request, `httpOnly` cookies need an HTTP
//!   access context

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::header::{COOKIE, HeaderMap, HeaderValue, SET_COOKIE};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::{ConfigStore, StoreError};
use crate::events::ScopedLogger;

/// Store entry holding the cookie table.
pub const COOKIES_KEY: &str = "Cookies";

/// Nested cookie table: `domain -> path -> key -> Cookie`.
pub type CookieData = BTreeMap<String, BTreeMap<String, BTreeMap<String, Cookie>>>;

/// A stored cookie.
///
/// Serialized with the field names of the persisted table (`httpOnly`,
/// `ephemeralID`).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    /// Cookie name.
    pub key: String,
    /// Cookie value.
    pub value: String,
    /// Lower-cased domain; a leading `.` enables suffix matching.
    pub domain: String,
    /// Path prefix the cookie applies to.
    pub path: String,
    /// Only sent over secure connections.
    pub secure: bool,
    /// Only visible to HTTP access, not scripts.
    pub http_only: bool,
    /// Expiry in Unix seconds; `0` marks a session cookie.
    #[serde(default)]
    pub expiry: u64,
    /// Id of the jar that stored the cookie.
    #[serde(
        rename = "ephemeralID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ephemeral_id: Option<String>,
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("key", &self.key)
            .field("value", &"[REDACTED]")
            .field("domain", &self.domain)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("http_only", &self.http_only)
            .field("expiry", &self.expiry)
            .field("ephemeral_id", &self.ephemeral_id)
            .finish()
    }
}

impl Cookie {
    /// Whether this cookie has no expiry and lives for one jar session.
    #[must_use]
    pub fn is_session(&self) -> bool {
        self.expiry == 0
    }
}

/// Errors raised while parsing a `Set-Cookie` header.
#[derive(Debug, thiserror::Error)]
pub enum CookieError {
    /// The first pair of the header has no `=`.
    #[error("malformed Set-Cookie header: missing '=' in `{name}`")]
    MissingSeparator {
        /// The offending first pair.
        name: String,
    },
}

/// Cookie store shared by every request that binds it.
#[derive(Debug)]
pub struct CookieJar {
    store: Arc<dyn ConfigStore>,
    ephemeral_id: String,
    write_lock: Mutex<()>,
    log: ScopedLogger,
}

impl CookieJar {
    /// Creates a jar over `store` with a fresh ephemeral id.
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>, log: ScopedLogger) -> Self {
        let bytes: [u8; 16] = rand::random();
        let ephemeral_id = bytes.iter().fold(String::with_capacity(32), |mut id, byte| {
            let _ = write!(id, "{byte:02x}");
            id
        });
        Self {
            store,
            ephemeral_id,
            write_lock: Mutex::new(()),
            log,
        }
    }

    /// Session id of this jar instance.
    #[must_use]
    pub fn ephemeral_id(&self) -> &str {
        &self.ephemeral_id
    }

    /// Reads the whole cookie table; an absent or unreadable entry reads as
    /// empty.
    #[must_use]
    pub fn get_all(&self) -> CookieData {
        match self.store.load(COOKIES_KEY) {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(error = %e, "stored cookie table is malformed, ignoring it");
                CookieData::new()
            }),
            Ok(None) => CookieData::new(),
            Err(e) => {
                warn!(error = %e, "failed to read cookie table");
                CookieData::new()
            }
        }
    }

    /// Replaces the whole cookie table.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the table cannot be persisted.
    pub fn set_all(&self, data: &CookieData) -> Result<(), StoreError> {
        self.store.save(COOKIES_KEY, serde_json::to_value(data)?)
    }

    /// Returns every cookie visible to a request for `domain` and `path`.
    ///
    /// `secure` tells whether the request is secure, `http` whether the
    /// access context is HTTP.
    #[must_use]
    pub fn filter_get(&self, domain: &str, path: &str, secure: bool, http: bool) -> Vec<Cookie> {
        let host = domain.to_ascii_lowercase();
        let now = unix_now();
        let data = self.get_all();

        data.iter()
            .filter(|(stored, _)| domain_matches(stored, &host))
            .flat_map(|(_, paths)| paths.iter())
            .filter(|(cookie_path, _)| path.starts_with(cookie_path.as_str()))
            .flat_map(|(_, cookies)| cookies.values())
            .filter(|cookie| (secure || !cookie.secure) && (http || !cookie.http_only))
            .filter(|cookie| self.is_live(cookie, now))
            .cloned()
            .collect()
    }

    /// Returns the first visible cookie named `key`.
    #[must_use]
    pub fn get(
        &self,
        domain: &str,
        path: &str,
        secure: bool,
        http: bool,
        key: &str,
    ) -> Option<Cookie> {
        self.filter_get(domain, path, secure, http)
            .into_iter()
            .find(|cookie| cookie.key == key)
    }

    /// Stores a cookie and persists the table.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the table cannot be persisted.
    #[allow(clippy::too_many_arguments)]
    pub fn set(
        &self,
        domain: &str,
        path: &str,
        key: &str,
        value: &str,
        secure: bool,
        expiry: u64,
        http_only: bool,
    ) -> Result<(), StoreError> {
        self.insert(Cookie {
            key: key.to_string(),
            value: value.to_string(),
            domain: domain.to_string(),
            path: path.to_string(),
            secure,
            http_only,
            expiry,
            ephemeral_id: None,
        })
    }

    /// Stores a parsed cookie and persists the table.
    ///
    /// The cookie is tagged with this jar's ephemeral id.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the table cannot be persisted.
    pub fn insert(&self, mut cookie: Cookie) -> Result<(), StoreError> {
        cookie.domain = cookie.domain.to_ascii_lowercase();
        cookie.ephemeral_id = Some(self.ephemeral_id.clone());

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut data = self.get_all();
        data.entry(cookie.domain.clone())
            .or_default()
            .entry(cookie.path.clone())
            .or_default()
            .insert(cookie.key.clone(), cookie);
        self.set_all(&data)
    }

    /// Parses one `Set-Cookie` header received from `domain`.
    ///
    /// `is_secure` and `is_http` describe the response the header came with
    /// and become the cookie's `secure` and `httpOnly` defaults.
    ///
    /// # Errors
    ///
    /// Returns [`CookieError::MissingSeparator`] if the first pair has no
    /// `=`.
    pub fn parse(
        domain: &str,
        path: &str,
        is_secure: bool,
        is_http: bool,
        header: &str,
    ) -> Result<Cookie, CookieError> {
        let mut parts = header.split(';');
        let first = parts.next().unwrap_or_default().trim();
        let (key, value) = first
            .split_once('=')
            .ok_or_else(|| CookieError::MissingSeparator {
                name: first.to_string(),
            })?;

        let mut cookie = Cookie {
            key: decode(key.trim()),
            value: decode(value.trim()),
            domain: domain.to_ascii_lowercase(),
            path: path.to_string(),
            secure: is_secure,
            http_only: is_http,
            expiry: 0,
            ephemeral_id: None,
        };

        for attribute in parts {
            let (name, value) = attribute.split_once('=').unwrap_or((attribute, ""));
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "expires" => cookie.expiry = parse_cookie_date(value).unwrap_or(0),
                "max-age" => {
                    cookie.expiry = match value.parse::<i64>() {
                        Ok(seconds) if seconds > 0 => {
                            unix_now().saturating_add(seconds.unsigned_abs())
                        }
                        _ => 1,
                    };
                }
                "domain" if !value.is_empty() => cookie.domain = value.to_ascii_lowercase(),
                "path" if !value.is_empty() => cookie.path = value.to_string(),
                "secure" => cookie.secure = true,
                "httponly" => cookie.http_only = true,
                _ => {}
            }
        }

        Ok(cookie)
    }

    /// Renders the `Cookie` header value for a request to `url`.
    #[must_use]
    pub fn header_value(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        let secure = url.scheme() == "https";
        let cookies = self.filter_get(host, url.path(), secure, true);
        if cookies.is_empty() {
            return None;
        }

        let pairs: Vec<String> = cookies
            .iter()
            .map(|cookie| {
                format!(
                    "{}={}",
                    urlencoding::encode(&cookie.key),
                    urlencoding::encode(&cookie.value)
                )
            })
            .collect();
        Some(pairs.join("; "))
    }

    /// Attaches the matching cookies to an outgoing request.
    pub fn bind(&self, request: &mut reqwest::Request) {
        let Some(value) = self.header_value(request.url()) else {
            return;
        };
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                request.headers_mut().insert(COOKIE, value);
            }
            Err(e) => warn!(url = %request.url(), error = %e, "cookie header is not a valid header value"),
        }
    }

    /// Parses and stores every `Set-Cookie` header of a response from `url`.
    ///
    /// A malformed header is logged and skipped; the others are still
    /// stored. Returns the number of cookies stored.
    pub fn store_response(&self, url: &Url, headers: &HeaderMap) -> usize {
        let Some(host) = url.host_str() else {
            return 0;
        };
        let secure = url.scheme() == "https";

        let mut stored = 0;
        for header in headers.get_all(SET_COOKIE) {
            let Ok(header) = header.to_str() else {
                warn!(url = %url, "skipping non-UTF-8 Set-Cookie header");
                continue;
            };
            let cookie = match Self::parse(host, url.path(), secure, true, header) {
                Ok(cookie) => cookie,
                Err(e) => {
                    self.log.log(format!("Skipping cookie from {url}: {e}"));
                    continue;
                }
            };
            debug!(url = %url, key = %cookie.key, domain = %cookie.domain, "storing cookie");
            match self.insert(cookie) {
                Ok(()) => stored += 1,
                Err(e) => warn!(url = %url, error = %e, "failed to persist cookie"),
            }
        }
        stored
    }

    fn is_live(&self, cookie: &Cookie, now: u64) -> bool {
        (!cookie.is_session() && cookie.expiry >= now)
            || cookie.ephemeral_id.as_deref() == Some(self.ephemeral_id.as_str())
    }
}

fn domain_matches(stored: &str, host: &str) -> bool {
    if stored == host {
        return true;
    }
    match stored.strip_prefix('.') {
        Some(bare) => host == bare || host.ends_with(stored),
        None => false,
    }
}

fn decode(raw: &str) -> String {
    urlencoding::decode(raw).map_or_else(|_| raw.to_string(), std::borrow::Cow::into_owned)
}

fn parse_cookie_date(value: &str) -> Option<u64> {
    let time = httpdate::parse_http_date(value)
        .or_else(|_| httpdate::parse_http_date(&value.replace('-', " ")))
        .ok()?;
    // Dates before the epoch mean "already expired", never "session".
    Some(
        time.duration_since(UNIX_EPOCH)
            .map_or(1, |elapsed| elapsed.as_secs().max(1)),
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
