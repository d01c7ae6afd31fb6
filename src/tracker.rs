//! In-flight run tracking for graceful shutdown.
//!
//! Hosts call [`ExecutionTracker::acquire`] before each run and hold the
//! permit for its duration. [`ExecutionTracker::drain`] flips the
//! draining flag (new acquisitions are refused) and waits for active
//! runs to release.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::{EngineError, Result};

/// Tracks active workflow runs.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    state: Mutex<TrackerState>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct TrackerState {
    active: usize,
    draining: bool,
}

impl ExecutionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new run. Refused while draining.
    pub fn acquire(self: &Arc<Self>) -> Result<RunPermit> {
        let mut state = self.state.lock().expect("tracker lock");
        if state.draining {
            return Err(EngineError::Other(
                "engine is draining, not accepting new runs".into(),
            ));
        }
        state.active += 1;
        Ok(RunPermit {
            tracker: self.clone(),
        })
    }

    /// Number of active runs.
    pub fn active(&self) -> usize {
        self.state.lock().expect("tracker lock").active
    }

    /// Whether a drain is in progress.
    pub fn is_draining(&self) -> bool {
        self.state.lock().expect("tracker lock").draining
    }

    /// Stop accepting runs and wait up to `timeout` for active runs to
    /// release. Returns `true` on a clean drain.
    pub async fn drain(&self, timeout: Duration) -> bool {
        {
            let mut state = self.state.lock().expect("tracker lock");
            state.draining = true;
            if state.active == 0 {
                return true;
            }
            info!(active = state.active, "draining, waiting for active runs");
        }

        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => true,
            Err(_) => {
                warn!(active = self.active(), "drain timeout with runs still active");
                false
            }
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("tracker lock");
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.notify.notify_waiters();
    }
}

/// Permit for one active run; releasing happens on drop.
#[derive(Debug)]
pub struct RunPermit {
    tracker: Arc<ExecutionTracker>,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.tracker.release();
    }
}
