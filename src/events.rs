//! Scoped debug event stream.
//!
//! Components never log through a global emitter. Each one receives a
//! [`ScopedLogger`] at construction, bound to a scope name such as
//! `"Request Manager"`. A message is emitted as a `tracing` event and
//! published on the client's broadcast channel, which consumers reach through
//! [`EventHub::subscribe`].
//!
//! # Example
//!
//! ```
//! use courier_core::EventHub;
//!
//! # async fn example() {
//! let hub = EventHub::new();
//! let mut events = hub.subscribe();
//!
//! hub.scoped("Download Queue").log("Queue is running.");
//!
//! let event = events.recv().await.unwrap();
//! assert_eq!(event.to_string(), "[Download Queue]: Queue is running.");
//! # }
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

/// Number of events a slow subscriber may lag behind before it starts
/// missing messages.
const EVENT_BUFFER: usize = 1000;

/// A single debug message tagged with the scope that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEvent {
    /// Logical component name.
    pub scope: Arc<str>,
    /// Human-readable message.
    pub message: String,
}

impl fmt::Display for DebugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]: {}", self.scope, self.message)
    }
}

/// Owner of the debug event channel for one client.
#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<DebugEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Creates a hub with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    /// Subscribes to every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DebugEvent> {
        self.sender.subscribe()
    }

    /// Returns a logger that publishes under `scope`.
    #[must_use]
    pub fn scoped(&self, scope: &str) -> ScopedLogger {
        ScopedLogger {
            scope: Arc::from(scope),
            sender: self.sender.clone(),
        }
    }
}

/// Logger bound to one scope of an [`EventHub`].
#[derive(Debug, Clone)]
pub struct ScopedLogger {
    scope: Arc<str>,
    sender: broadcast::Sender<DebugEvent>,
}

impl ScopedLogger {
    /// Creates a logger on a private hub, for components used on their own.
    #[must_use]
    pub fn detached(scope: &str) -> Self {
        EventHub::new().scoped(scope)
    }

    /// The scope name this logger publishes under.
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Publishes a message.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(scope = %self.scope, "{message}");

        // Sending only fails when nobody is subscribed.
        let _ = self.sender.send(DebugEvent {
            scope: Arc::clone(&self.scope),
            message,
        });
    }

    /// Publishes a message about one file, prefixed with its base name.
    pub fn file(&self, path: &Path, message: impl fmt::Display) {
        let name = path
            .file_name()
            .map_or_else(|| path.to_string_lossy(), |name| name.to_string_lossy());
        self.log(format!("[File: {name}]: {message}"));
    }
}
