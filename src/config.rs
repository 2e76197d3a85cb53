//! Client options and the persisted key-value store.
//!
//! [`ClientOptions`] is the whole configuration surface of a client. It
//! deserializes from a camelCase JSON document in which every field is
//! optional, so a config file only needs the values it overrides.
//!
//! [`ConfigStore`] is the seam for persisted state. The cookie jar writes its
//! whole table through it on every change.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// User agent sent with every request unless overridden.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 14_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0.3 Mobile/15E148 Safari/604.1";

/// Default directory for persisted state, relative to the working directory.
pub const DEFAULT_DATA_DIR: &str = ".rnr";

/// Default number of downloads transferring at once.
pub const DEFAULT_PARALLEL_COUNT: usize = 2;

/// Default number of attempts per download.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default minimum spacing between two requests to one host.
pub const DEFAULT_RATE_LIMIT: Duration = Duration::from_millis(1500);

/// Default number of 301 responses followed before giving up.
pub const DEFAULT_MAX_REDIRECTS: u32 = 10;

/// Default base delay between download attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default interval between progress reports.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Largest accepted per-host rate limit.
pub const MAX_RATE_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors raised while loading or validating [`ClientOptions`].
#[derive(Debug, Error)]
pub enum OptionsError {
    /// The options file could not be read.
    #[error("failed to read options file {path}: {source}")]
    Io {
        /// Path of the options file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The options file is not a valid options document.
    #[error("invalid options file {path}: {source}")]
    Json {
        /// Path of the options file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A field holds a value the client cannot run with.
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        /// camelCase field name.
        field: &'static str,
        /// What is wrong with the value.
        reason: String,
    },
}

/// Configuration of a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientOptions {
    /// Root directory for persisted state.
    pub data_dir: PathBuf,
    /// Maximum number of downloads transferring at once.
    pub download_parallel_count: usize,
    /// Number of attempts per download before the last error is returned.
    pub download_max_retries: u32,
    /// Headers sent with every request. Per-request headers win on collision.
    pub custom_headers: BTreeMap<String, String>,
    /// Minimum spacing between two dispatches to one host.
    #[serde(with = "millis")]
    pub rate_limit_time: Duration,
    /// Number of 301 responses followed before failing.
    pub max_redirects: u32,
    /// Base delay of the backoff between download attempts.
    #[serde(with = "millis")]
    pub download_retry_delay: Duration,
    /// Minimum interval between two progress reports of one download.
    #[serde(with = "millis")]
    pub progress_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            download_parallel_count: DEFAULT_PARALLEL_COUNT,
            download_max_retries: DEFAULT_MAX_RETRIES,
            custom_headers: BTreeMap::from([(
                "User-Agent".to_string(),
                DEFAULT_USER_AGENT.to_string(),
            )]),
            rate_limit_time: DEFAULT_RATE_LIMIT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            download_retry_delay: DEFAULT_RETRY_DELAY,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl ClientOptions {
    /// Loads a (possibly partial) options document and merges it over the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`OptionsError::Io`] if the file cannot be read and
    /// [`OptionsError::Json`] if it is not a valid options document.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| OptionsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let options = serde_json::from_str(&raw).map_err(|source| OptionsError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded client options");
        Ok(options)
    }

    /// Rejects values the client cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`OptionsError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.download_parallel_count == 0 {
            return Err(OptionsError::Invalid {
                field: "downloadParallelCount",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.download_max_retries == 0 {
            return Err(OptionsError::Invalid {
                field: "downloadMaxRetries",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.rate_limit_time > MAX_RATE_LIMIT {
            return Err(OptionsError::Invalid {
                field: "rateLimitTime",
                reason: format!("must be at most {} ms", MAX_RATE_LIMIT.as_millis()),
            });
        }
        Ok(())
    }
}

/// Durations are written as integer milliseconds in options documents.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Errors raised by a [`ConfigStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("config store IO error at {path}: {source}")]
    Io {
        /// Path of the backing file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// A value could not be converted to or from JSON.
    #[error("config store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Named key-value store for persisted client state.
///
/// Implementations write the value for a key wholesale; there are no partial
/// updates.
pub trait ConfigStore: Send + Sync + std::fmt::Debug {
    /// Returns the value stored under `key`, or `None` if nothing was saved.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the backing storage cannot be read.
    fn load(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Replaces the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the value cannot be persisted.
    fn save(&self, key: &str, value: Value) -> Result<(), StoreError>;
}

/// Store backed by one JSON document on disk.
///
/// The document lives at `<dir>/<name>.json`. Every save rewrites it through
/// a sibling temp file followed by a rename, so readers never observe a half
/// written document.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    /// Opens the namespace `name` under `dir`, reading any existing document.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if an existing document cannot be read or is
    /// not a JSON object.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self, StoreError> {
        let path = dir.as_ref().join(format!("{name}.json"));
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        debug!(path = %path.display(), "opened config store");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Path of the backing document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_document(&self, entries: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        let document = serde_json::to_vec_pretty(entries)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, document).map_err(|e| StoreError::io(&staging, e))?;
        fs::rename(&staging, &self.path).map_err(|e| StoreError::io(&self.path, e))
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value);
        self.write_document(&entries)
    }
}

/// In-memory store for tests and clients that should not touch disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Map<String, Value>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }
}
