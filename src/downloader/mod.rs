//! Core download manager implementation split into focused submodules.
//!
//! The `DownloadManager` struct and its methods are organized by domain:
//! - [`queue`] - Enqueueing and task queries
//! - [`control`] - Task lifecycle control (pause/resume/cancel/remove/retry)
//! - [`scheduler`] - Admission of queued tasks into worker slots
//! - [`lifecycle`] - Startup and shutdown coordination
//! - [`disk_space`] - Free-space preflight and admission halting
//! - [`worker`] - Core transfer execution

mod control;
mod disk_space;
mod lifecycle;
mod queue;
mod scheduler;
mod worker;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventSink};
use crate::persistence::PersistenceAdapter;
use crate::retry::RetryPolicy;
use crate::store::TaskStore;
use crate::transport::{HttpTransport, Transport};
use crate::types::{Event, TaskId};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

/// Why a worker was asked to stop, ordered by strength
///
/// When several signals race, the strongest one wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum StopReason {
    /// Give the slot back and stay queued (shutdown)
    Requeue = 1,
    /// Keep offsets and temp file, become Paused
    Pause = 2,
    /// Discard offsets and temp file, become Cancelled
    Cancel = 3,
    /// Cancel, then delete the record
    Remove = 4,
}

impl StopReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(StopReason::Requeue),
            2 => Some(StopReason::Pause),
            3 => Some(StopReason::Cancel),
            4 => Some(StopReason::Remove),
            _ => None,
        }
    }
}

/// Stop signal shared between the control surface and one worker
#[derive(Clone, Debug, Default)]
pub(crate) struct StopHandle {
    token: CancellationToken,
    reason: Arc<AtomicU8>,
}

impl StopHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to stop; a weaker reason never overrides a stronger one
    pub(crate) fn signal(&self, reason: StopReason) {
        self.reason.fetch_max(reason as u8, Ordering::SeqCst);
        self.token.cancel();
    }

    /// Turn a pending pause back into a plain requeue (resume raced the pause)
    pub(crate) fn withdraw_pause(&self) -> bool {
        self.reason
            .compare_exchange(
                StopReason::Pause as u8,
                StopReason::Requeue as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn reason(&self) -> Option<StopReason> {
        StopReason::from_u8(self.reason.load(Ordering::SeqCst))
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// Queue and worker slot state
#[derive(Clone)]
pub(crate) struct QueueState {
    /// Worker slots (respects max_concurrent_downloads config)
    pub(crate) concurrent_limit: Arc<Semaphore>,
    /// Tasks currently owned by a worker, with their stop handles
    ///
    /// Admission, control operations on active tasks and worker exit all
    /// take this lock before touching the store.
    pub(crate) active_downloads: Arc<Mutex<HashMap<TaskId, StopHandle>>>,
    /// Whether new tasks are accepted (set to false during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Set after a storage failure; no admissions until cleared
    pub(crate) admission_halted: Arc<AtomicBool>,
    /// Wakes the scheduler when a task may have become admissible
    pub(crate) wake: Arc<Notify>,
    /// Stops the scheduler loop
    pub(crate) scheduler_token: CancellationToken,
}

impl QueueState {
    fn new(max_concurrent: usize) -> Self {
        Self {
            concurrent_limit: Arc::new(Semaphore::new(max_concurrent)),
            active_downloads: Arc::new(Mutex::new(HashMap::new())),
            accepting_new: Arc::new(AtomicBool::new(true)),
            admission_halted: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            scheduler_token: CancellationToken::new(),
        }
    }
}

/// Main download manager (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct DownloadManager {
    /// Task store, the single source of truth for task state
    pub(crate) store: Arc<TaskStore>,
    /// Event fan-out (sinks + broadcast channel)
    pub(crate) events: EventBus,
    /// Network transport used by workers
    pub(crate) transport: Arc<dyn Transport>,
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Retry policy for transient failures
    pub(crate) retry: Arc<RetryPolicy>,
    /// Jitter source for the retry policy
    pub(crate) rng: Arc<Mutex<StdRng>>,
    /// Queue and worker slot state
    pub(crate) queue_state: QueueState,
}

impl DownloadManager {
    /// Create a new DownloadManager with the SQLite store and HTTP transport
    ///
    /// This initializes all core components:
    /// - Opens/creates the SQLite database and runs migrations
    /// - Builds the reqwest client
    /// - Restores persisted tasks (interrupted transfers are requeued)
    ///
    /// The scheduler is not running yet; call [`start`](Self::start).
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let db = Database::new(&config.persistence.database_path).await?;
        let transport = HttpTransport::new(&config.transport)?;

        Self::with_components(config, Arc::new(db), Arc::new(transport), Vec::new()).await
    }

    /// Create a DownloadManager from explicit collaborators
    pub async fn with_components(
        config: Config,
        persistence: Arc<dyn PersistenceAdapter>,
        transport: Arc<dyn Transport>,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.download.temp_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create temp directory '{}': {}",
                        config.download.temp_dir.display(),
                        e
                    ),
                ))
            })?;

        let events = EventBus::new(config.event_buffer, sinks);
        let store = Arc::new(TaskStore::new(persistence, events.clone()));

        // Restore tasks from a previous session before anything can be admitted
        store.load().await?;

        let rng = match config.retry.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let queue_state = QueueState::new(config.download.max_concurrent_downloads);

        Ok(Self {
            store,
            events,
            transport,
            retry: Arc::new(RetryPolicy::new(config.retry.clone())),
            rng: Arc::new(Mutex::new(rng)),
            config: Arc::new(config),
            queue_state,
        })
    }

    /// Subscribe to events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events independently.
    /// A subscriber that falls behind by more than `event_buffer` events receives
    /// `RecvError::Lagged`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use resumable_dl::{Config, DownloadManager};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let manager = DownloadManager::new(Config::default()).await?;
    ///
    ///     let mut events = manager.subscribe();
    ///     tokio::spawn(async move {
    ///         while let Ok(event) = events.recv().await {
    ///             tracing::info!(?event, "download event");
    ///         }
    ///     });
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Events as a `Stream`, skipping over any lagged gaps
    pub fn event_stream(&self) -> impl futures::Stream<Item = Event> + Send + 'static {
        use futures::StreamExt;
        tokio_stream::wrappers::BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move { event.ok() })
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Path of the in-progress file for a task
    pub fn temp_path(&self, id: TaskId) -> PathBuf {
        self.config.download.temp_dir.join(format!("task_{}.part", id.0))
    }

    /// Emit an event to all sinks and subscribers
    pub(crate) fn emit_event(&self, event: Event) {
        self.events.emit(event);
    }

    /// Wake the scheduler to look for admissible tasks
    pub(crate) fn wake_scheduler(&self) {
        self.queue_state.wake.notify_one();
    }

    /// Remove a task's temp file, ignoring a file that is already gone
    pub(crate) async fn remove_temp_file(&self, id: TaskId) {
        let path = self.temp_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(task_id = id.0, "removed temp file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                task_id = id.0,
                path = %path.display(),
                error = %e,
                "failed to remove temp file"
            ),
        }
    }
}
