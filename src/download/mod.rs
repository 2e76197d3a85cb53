//! Queued, resumable, retrying file downloads.
//!
//! # Features
//!
//! - Parallelism-bounded FIFO queue shared by every download of a client
//! - Resumption from a previous partial transfer through byte ranges
//! - Atomic finalize: bytes land in a temp artifact that is renamed onto the
//!   destination, whose modification time follows `Last-Modified`
//! - Periodic progress reports to an `on_progress` listener
//! - Exponential backoff between attempts; the last error is returned once
//!   every attempt failed
//!
//! # Example
//!
//! ```no_run
//! use courier_core::{Client, ClientOptions, Listeners, RequestData};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(ClientOptions::default())?;
//! let data = RequestData::get("https://example.com/video.mp4").with_listeners(
//!     Listeners::new().on_progress(|state| println!("{state}")),
//! );
//! let path = client.downloads().download(data, "./videos/video.mp4").await?;
//! println!("Downloaded: {}", path.display());
//! # Ok(())
//! # }
//! ```

mod error;
mod manager;
mod progress;
mod queue;
mod retry;
pub mod temp;
mod transfer;

pub use error::DownloadError;
pub use manager::DownloadManager;
pub use progress::{ProgressState, format_remaining, human_file_size};
pub use queue::{DownloadEntry, DownloadQueue, DownloadReceiver};
pub use retry::RetryBackoff;
pub use transfer::Downloader;

// Note: no module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
