//! Error types for request building and execution.
//!
//! Configuration errors (bad URL, scheme, payload or header) are raised while
//! the request is built, before anything touches the network. Transport and
//! protocol errors carry the URL that failed.

use thiserror::Error;

use super::Method;

/// Errors that can occur while building or executing a request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The link is not an absolute URL.
    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        /// The link as given.
        url: String,
        /// Why it failed to parse.
        #[source]
        source: url::ParseError,
    },

    /// The URL scheme is neither `http` nor `https`.
    #[error("unsupported scheme `{scheme}` in {url}")]
    UnsupportedScheme {
        /// The rejected scheme.
        scheme: String,
        /// The resolved URL.
        url: String,
    },

    /// A payload was attached to a method other than `POST`.
    #[error("unexpected payload for {method} request to {url}")]
    UnexpectedPayload {
        /// The request method.
        method: Method,
        /// The resolved URL.
        url: String,
    },

    /// A header name or value cannot be sent.
    #[error("invalid header `{name}`: {reason}")]
    InvalidHeader {
        /// Header name as given.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The HTTP client refused to build the request.
    #[error("failed to build request for {url}: {source}")]
    Build {
        /// The resolved URL.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Connection, TLS or body transfer failure.
    #[error("network error requesting {url}: {source}")]
    Network {
        /// The resolved URL.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a status the executor does not accept.
    #[error("HTTP {status} hit on {url}")]
    Status {
        /// The URL that produced the status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// More consecutive 301 responses than the configured limit.
    #[error("too many redirects (limit {limit}) following {url}")]
    TooManyRedirects {
        /// The URL of the last redirect.
        url: String,
        /// The configured limit.
        limit: u32,
    },

    /// A 301 response without a usable `Location` header.
    #[error("HTTP 301 without a usable Location header on {url}")]
    MissingLocation {
        /// The URL that redirected.
        url: String,
    },

    /// The per-host queue stopped before answering.
    #[error("request queue for host `{host}` is closed")]
    QueueClosed {
        /// Host of the queue.
        host: String,
    },
}

impl RequestError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an unexpected status error.
    pub fn status(url: impl Into<String>, status: u16) -> Self {
        Self::Status {
            url: url.into(),
            status,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, source: url::ParseError) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            source,
        }
    }

    /// Creates an invalid header error.
    pub fn invalid_header(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidHeader {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a closed queue error.
    pub fn queue_closed(host: impl Into<String>) -> Self {
        Self::QueueClosed { host: host.into() }
    }

    /// The HTTP status carried by this error, if any.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the request was rejected before it reached the network.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl { .. }
                | Self::UnsupportedScheme { .. }
                | Self::UnexpectedPayload { .. }
                | Self::InvalidHeader { .. }
        )
    }
}
