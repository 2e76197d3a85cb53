//! Courier Core Library
//!
//! Network-access core for site integrations: rate-limited HTTP requests
//! and resumable, retrying, parallelism-bounded file downloads, sharing one
//! persisted cookie jar.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Client options and the persisted key-value store
//! - [`events`] - Scoped debug event stream
//! - [`cookies`] - Cookie jar with session-scoped cookies
//! - [`request`] - Request executor and per-host request queues
//! - [`download`] - Download queue, resumption, progress and retries
//! - [`client`] - Root client and sub-clients composing the services

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod cookies;
pub mod download;
pub mod events;
pub mod request;

// Re-export commonly used types
pub use client::{Client, ClientError, SubClient};
pub use config::{ClientOptions, ConfigStore, JsonFileStore, MemoryStore, OptionsError, StoreError};
pub use cookies::{Cookie, CookieData, CookieError, CookieJar};
pub use download::{
    DownloadError, DownloadManager, DownloadQueue, Downloader, ProgressState, RetryBackoff,
    format_remaining, human_file_size,
};
pub use events::{DebugEvent, EventHub, ScopedLogger};
pub use request::{
    Dispatch, Listeners, MainRequestQueue, Method, Payload, PerHostQueue, RequestData,
    RequestError, RequestExecutor, RequestManager, build_http_client, generate_url,
};
