//! Streaming status updates pushed to the caller during a run.
//!
//! The engine emits one [`StatusUpdate`] per block lifecycle edge on a
//! bounded channel. Sends are non-blocking: when the caller cannot keep
//! up, updates are dropped with a warning. The stream is best-effort
//! telemetry, not a durability channel — [`crate::model::BlockState`]
//! remains the source of truth.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

/// Default status channel capacity.
pub const DEFAULT_STATUS_BUFFER: usize = 256;

/// Status values carried by update events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Running,
    Completed,
    Failed,
    Retrying,
    CircuitBreakerTripped,
}

/// One streamed status update.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// Always `"execution_update"`.
    #[serde(rename = "type")]
    pub update_type: &'static str,
    pub block_id: String,
    pub status: StatusKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retry / breaker detail (attempt, delay, source token).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl StatusUpdate {
    fn new(block_id: &str, status: StatusKind) -> Self {
        Self {
            update_type: "execution_update",
            block_id: block_id.to_string(),
            status,
            inputs: None,
            output: None,
            error: None,
            detail: None,
        }
    }

    /// Block started executing, with its input snapshot.
    pub fn running(block_id: &str, inputs: Option<Value>) -> Self {
        Self {
            inputs,
            ..Self::new(block_id, StatusKind::Running)
        }
    }

    /// Block finished, with its output.
    pub fn completed(block_id: &str, output: Option<Value>) -> Self {
        Self {
            output,
            ..Self::new(block_id, StatusKind::Completed)
        }
    }

    /// Block failed.
    pub fn failed(block_id: &str, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(block_id, StatusKind::Failed)
        }
    }

    /// Block is waiting out a backoff delay before another attempt.
    pub fn retrying(block_id: &str, attempt: u32, delay_ms: u64, reason: &str) -> Self {
        Self {
            detail: Some(serde_json::json!({
                "attempt": attempt,
                "delayMs": delay_ms,
                "reason": reason,
            })),
            ..Self::new(block_id, StatusKind::Retrying)
        }
    }

    /// The run's circuit breaker is open for this block's error source.
    pub fn breaker_tripped(block_id: &str, source: &str) -> Self {
        Self {
            detail: Some(serde_json::json!({ "source": source })),
            ..Self::new(block_id, StatusKind::CircuitBreakerTripped)
        }
    }
}

/// Non-blocking, optional status sink shared across block tasks.
///
/// Cloneable; a disabled sender (no channel attached) drops everything
/// silently, which keeps executors free of `Option` plumbing.
#[derive(Debug, Clone, Default)]
pub struct StatusSender {
    tx: Option<mpsc::Sender<StatusUpdate>>,
}

impl StatusSender {
    /// Sink attached to a channel.
    pub fn new(tx: mpsc::Sender<StatusUpdate>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sink that discards all updates.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Create a channel with the default buffer and a sender for it.
    pub fn channel() -> (Self, mpsc::Receiver<StatusUpdate>) {
        let (tx, rx) = mpsc::channel(DEFAULT_STATUS_BUFFER);
        (Self::new(tx), rx)
    }

    /// Emit an update without blocking. A full buffer drops the update
    /// with a warning.
    pub fn emit(&self, update: StatusUpdate) {
        let Some(tx) = &self.tx else { return };
        if let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(update) {
            warn!(
                block = %dropped.block_id,
                status = ?dropped.status,
                "status channel full, dropping update"
            );
        }
    }
}
