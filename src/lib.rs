//! # resumable-dl
//!
//! Embeddable manager for resumable, concurrent HTTP downloads.
//!
//! ## Design Philosophy
//!
//! resumable-dl is designed to be:
//! - **Crash-tolerant** - Every task survives process restarts and resumes from its last flushed byte
//! - **Bounded** - A hard cap on concurrent transfers, with priority and FIFO admission
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use resumable_dl::{Config, DownloadManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = DownloadManager::new(Config::default()).await?;
//!
//!     // Subscribe to events
//!     let mut events = manager.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     manager.start();
//!     let id = manager
//!         .enqueue("https://example.com/large.iso", "downloads/large.iso", None)
//!         .await?;
//!     println!("queued task {id}");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// SQLite persistence
pub mod db;
/// Download manager (queue, scheduler, workers)
pub mod downloader;
/// Error types
pub mod error;
/// Event fan-out to sinks and subscribers
pub mod events;
/// Persistence adapter interface
pub mod persistence;
/// Retry logic with exponential backoff
pub mod retry;
/// Task store and lifecycle transitions
pub mod store;
/// HTTP transport abstraction
pub mod transport;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use downloader::DownloadManager;
pub use error::{DatabaseError, Error, ErrorCode, Result, TransferError};
pub use events::EventSink;
pub use persistence::{MemoryPersistence, PersistenceAdapter};
pub use transport::{FetchRequest, FetchResponse, HttpTransport, ResponseMeta, Transport};
pub use types::{
    ErrorKind, Event, Progress, Status, TaskChange, TaskFilter, TaskId, TaskOptions, TaskRecord,
};

/// Helper function to run the manager with graceful signal handling.
///
/// Waits for a termination signal and then calls the manager's `shutdown()` method,
/// which requeues in-flight transfers so they resume on the next start.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use resumable_dl::{Config, DownloadManager, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = DownloadManager::new(Config::default()).await?;
///     manager.start();
///
///     // Run with automatic signal handling
///     run_with_shutdown(manager).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(manager: DownloadManager) -> Result<()> {
    wait_for_signal().await;
    manager.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration can fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
