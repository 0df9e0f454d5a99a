//! Supervised background work
//!
//! Every unit of work runs in its own task, watched by a supervisor task
//! that turns a panic or cancellation into an error and always delivers the
//! outcome to a completion callback. Nothing spawned here can fail silently.

use std::future::Future;

use tokio_util::task::TaskTracker;

use bs_core::error::InstallError;

/// Spawns and tracks background work
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
        }
    }

    /// Run `work` in the background and hand its outcome to `on_complete`
    pub fn spawn<F, C>(&self, name: String, work: F, on_complete: C)
    where
        F: Future<Output = Result<(), InstallError>> + Send + 'static,
        C: FnOnce(Result<(), InstallError>) + Send + 'static,
    {
        let worker = self.tracker.spawn(work);
        self.tracker.spawn(async move {
            tracing::info!("[BackgroundTask] Starting: {}", name);
            let outcome = match worker.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(InstallError::TaskFailed(format!("{} panicked", name))),
                Err(e) => Err(InstallError::TaskFailed(format!("{} was cancelled: {}", name, e))),
            };
            match &outcome {
                Ok(()) => tracing::info!("[BackgroundTask] Completed: {}", name),
                Err(e) => tracing::error!("[BackgroundTask] Failed: {} - {}", name, e),
            }
            on_complete(outcome);
        });
    }

    /// Number of live tasks, supervisors included
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait for all running work to finish
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
