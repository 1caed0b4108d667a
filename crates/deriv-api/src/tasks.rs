//! Tracking for background work spawned by the engine or its callers.
//!
//! Failures are surfaced on the error channel tagged with the task label;
//! shutdown cancels whatever is still running and waits for it to unwind.

use std::fmt::Display;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use deriv_core::ApiError;

use crate::channels::Broadcast;

/// Registry of fire-and-forget tasks.
#[derive(Debug)]
pub struct TaskRegistry {
    tracker: TaskTracker,
    cancel: CancellationToken,
    errors: Broadcast<ApiError>,
}

impl TaskRegistry {
    /// Create a registry reporting failures on `errors`.
    pub fn new(errors: Broadcast<ApiError>) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            errors,
        }
    }

    /// Spawn a tracked task.
    ///
    /// An `Err` outcome is published as [`ApiError::Task`] with `label`.
    pub fn spawn<F, E>(&self, label: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        let label = label.into();
        let cancel = self.cancel.clone();
        let errors = self.errors.clone();
        let _ = self.tracker.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => debug!(label, "task cancelled"),
                outcome = task => {
                    if let Err(e) = outcome {
                        let message = e.to_string();
                        warn!(label, error = %message, "background task failed");
                        errors.publish(ApiError::Task { label, message });
                    }
                }
            }
        });
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    /// Whether no tasks are running.
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait for every running task to finish on its own.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel every running task and wait for them to stop.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
