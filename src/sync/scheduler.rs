//! Debounced push scheduler
//!
//! Holds at most one pending push. Scheduling a new push aborts the pending
//! one and restarts the quiet window, so a burst of edits produces a single
//! push. Once the window elapses the push runs detached: a later schedule or
//! cancel no longer affects it.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Debounces push jobs behind a fixed quiet window
#[derive(Clone)]
pub struct PushScheduler {
    debounce: Duration,
    pending: Arc<StdMutex<Option<JoinHandle<()>>>>,
    in_flight: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

impl PushScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: Arc::new(StdMutex::new(None)),
            in_flight: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Replace any pending push with `job`, run after the quiet window
    pub fn schedule<F, Fut>(&self, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = pending.take() {
            handle.abort();
            log::debug!("Pending push superseded");
        }

        let debounce = self.debounce;
        let in_flight = self.in_flight.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;

            // Past this point the push is no longer cancelable
            let push = tokio::spawn(job());
            let mut in_flight = in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.retain(|h| !h.is_finished());
            in_flight.push(push);
        });

        *pending = Some(handle);
    }

    /// Drop the pending push, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.take() {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                if was_pending {
                    log::debug!("Pending push cancelled");
                }
                was_pending
            }
            None => false,
        }
    }

    /// Whether a push is still waiting for its quiet window
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }

    /// Wait until no push is pending or running
    ///
    /// The pending push stays in place while waiting, so a schedule or
    /// cancel issued meanwhile still replaces it.
    pub async fn wait_idle(&self) {
        loop {
            if self.is_pending() {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                continue;
            }

            let running: Vec<JoinHandle<()>> = {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                in_flight.drain(..).collect()
            };

            if running.is_empty() {
                return;
            }

            for handle in running {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        log::error!("Push task panicked: {}", e);
                    }
                }
            }
        }
    }
}
