//! First-failure-wins task group.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};

/// Tasks sharing one cancellation token.
///
/// The first task to fail while the token is still live records its error
/// and cancels the token. Failures after cancellation are logged and dropped,
/// so a caller-initiated cancellation never turns into an error.
pub struct TaskGroup {
    token: CancellationToken,
    tracker: TaskTracker,
    first_error: Arc<Mutex<Option<Error>>>,
}

impl TaskGroup {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            tracker: TaskTracker::new(),
            first_error: Arc::default(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Spawn a task. A panic counts as a failure.
    pub fn spawn<F>(&self, task: impl Into<String>, future: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let task = task.into();
        let token = self.token.clone();
        let first_error = Arc::clone(&self.first_error);

        self.tracker.spawn(async move {
            let result = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(Error::TaskPanicked { task: task.clone() }),
            };
            let Err(err) = result else { return };

            {
                let mut slot = first_error.lock().unwrap_or_else(|p| p.into_inner());
                if token.is_cancelled() || slot.is_some() {
                    tracing::debug!(task = %task, error = %err, "Task failed after cancellation");
                } else {
                    tracing::error!(task = %task, error = %err, "Task failed, cancelling group");
                    *slot = Some(err);
                }
            }
            token.cancel();
        });
    }

    /// Wait for every task and return the error that cancelled the group, if any.
    pub async fn wait(self) -> Result<()> {
        self.tracker.close();
        self.tracker.wait().await;
        let first = self
            .first_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
