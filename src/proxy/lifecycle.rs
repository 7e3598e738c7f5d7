//! Start/stop state machine for the wire
//!
//! Two states, `Stopped` (initial) and `Running`. Every background observer
//! task is spawned through the lifecycle's `TaskTracker`, so stopping can
//! drain in-flight saves within a bounded time. Each run gets a fresh
//! tracker: a `start` racing a draining `stop` never reopens the tracker
//! that `stop` is waiting on.

use std::future::Future;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use super::error::LifecycleError;

/// Default bound on a graceful stop
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct Lifecycle {
    running: RwLock<bool>,
    /// Tracker of the current run; closed ones are replaced on `start`
    tracker: Mutex<TaskTracker>,
    stop_timeout: Duration,
}

impl Lifecycle {
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            running: RwLock::new(false),
            tracker: Mutex::new(TaskTracker::new()),
            stop_timeout,
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stopped -> Running
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut running = self.running.write().unwrap_or_else(PoisonError::into_inner);
        if *running {
            return Err(LifecycleError::AlreadyRunning);
        }
        *running = true;

        let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        if tracker.is_closed() {
            *tracker = TaskTracker::new();
        }
        tracing::info!("Wire started");
        Ok(())
    }

    /// Running -> Stopped, waiting up to the stop timeout for tracked tasks.
    ///
    /// The state is `Stopped` on return even when the drain timed out.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let tracker = {
            let mut running = self.running.write().unwrap_or_else(PoisonError::into_inner);
            if !*running {
                return Err(LifecycleError::NotRunning);
            }
            *running = false;

            let tracker = self.current();
            tracker.close();
            tracker
        };

        tracing::info!(pending = tracker.len(), "Wire stopping, draining observers");

        match tokio::time::timeout(self.stop_timeout, tracker.wait()).await {
            Ok(()) => {
                tracing::info!("Wire stopped");
                Ok(())
            }
            Err(_) => {
                let pending = tracker.len();
                tracing::error!(
                    pending,
                    timeout = ?self.stop_timeout,
                    "Wire stop timed out with observers still running"
                );
                Err(LifecycleError::StopTimeout {
                    timeout: self.stop_timeout,
                    pending,
                })
            }
        }
    }

    /// Start, wait for `stop_signal`, then stop. Returns immediately if start fails.
    pub async fn run<F>(&self, stop_signal: F) -> Result<(), LifecycleError>
    where
        F: Future<Output = ()>,
    {
        self.start()?;
        stop_signal.await;
        self.stop().await
    }

    /// Spawn a task the next stop will wait for
    pub(crate) fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.current().spawn(task)
    }

    /// Tasks of the current run spawned and not yet finished
    pub fn in_flight(&self) -> usize {
        self.current().len()
    }

    fn current(&self) -> TaskTracker {
        self.tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_TIMEOUT)
    }
}
