//! Per-run circuit breaker keyed by error source.
//!
//! Consecutive failures from the same external source (`rate_limit`,
//! `server_5xx`, `timeout`, `network_error`) trip the breaker; while a
//! source is tripped the engine short-circuits retries for any block
//! hitting that source. A single success clears the source.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

use crate::error::ErrorSource;

/// Default consecutive-failure threshold.
pub const DEFAULT_TRIP_THRESHOLD: u32 = 5;

/// Shared-per-run circuit breaker.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    inner: Mutex<BreakerState>,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_fails: HashMap<ErrorSource, u32>,
    tripped: HashMap<ErrorSource, bool>,
}

impl CircuitBreaker {
    /// Breaker with the default threshold.
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_TRIP_THRESHOLD)
    }

    /// Breaker tripping after `threshold` consecutive failures per source.
    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            inner: Mutex::new(BreakerState::default()),
        }
    }

    /// Record a failure for `source`. Returns `true` if this failure
    /// tripped the breaker (transition from closed to open).
    ///
    /// [`ErrorSource::None`] (permanent errors) never counts.
    pub fn record_failure(&self, source: ErrorSource) -> bool {
        if source == ErrorSource::None {
            return false;
        }
        let mut state = self.inner.lock().expect("breaker lock poisoned");
        let count = state.consecutive_fails.entry(source).or_insert(0);
        *count += 1;
        if *count >= self.threshold && !state.tripped.get(&source).copied().unwrap_or(false) {
            state.tripped.insert(source, true);
            warn!(
                source = source.as_str(),
                failures = self.threshold,
                "circuit breaker tripped"
            );
            return true;
        }
        false
    }

    /// Record a success for `source`, clearing its counter and trip flag.
    pub fn record_success(&self, source: ErrorSource) {
        if source == ErrorSource::None {
            return;
        }
        let mut state = self.inner.lock().expect("breaker lock poisoned");
        state.consecutive_fails.remove(&source);
        state.tripped.remove(&source);
    }

    /// Whether `source` is currently tripped.
    pub fn is_tripped(&self, source: ErrorSource) -> bool {
        if source == ErrorSource::None {
            return false;
        }
        let state = self.inner.lock().expect("breaker lock poisoned");
        state.tripped.get(&source).copied().unwrap_or(false)
    }

    /// Current consecutive-failure count for `source`.
    pub fn failure_count(&self, source: ErrorSource) -> u32 {
        let state = self.inner.lock().expect("breaker lock poisoned");
        state.consecutive_fails.get(&source).copied().unwrap_or(0)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_at_exact_threshold() {
        let breaker = CircuitBreaker::with_threshold(3);
        assert!(!breaker.record_failure(ErrorSource::RateLimit));
        assert!(!breaker.record_failure(ErrorSource::RateLimit));
        assert!(!breaker.is_tripped(ErrorSource::RateLimit));
        assert!(breaker.record_failure(ErrorSource::RateLimit));
        assert!(breaker.is_tripped(ErrorSource::RateLimit));
    }

    #[test]
    fn test_trip_reported_once() {
        let breaker = CircuitBreaker::with_threshold(2);
        assert!(!breaker.record_failure(ErrorSource::Server5xx));
        assert!(breaker.record_failure(ErrorSource::Server5xx));
        // Already tripped: further failures do not re-report the edge.
        assert!(!breaker.record_failure(ErrorSource::Server5xx));
        assert!(breaker.is_tripped(ErrorSource::Server5xx));
    }

    #[test]
    fn test_success_resets_source() {
        let breaker = CircuitBreaker::with_threshold(2);
        breaker.record_failure(ErrorSource::Timeout);
        breaker.record_failure(ErrorSource::Timeout);
        assert!(breaker.is_tripped(ErrorSource::Timeout));

        breaker.record_success(ErrorSource::Timeout);
        assert!(!breaker.is_tripped(ErrorSource::Timeout));
        assert_eq!(breaker.failure_count(ErrorSource::Timeout), 0);
    }

    #[test]
    fn test_sources_tracked_independently() {
        let breaker = CircuitBreaker::with_threshold(2);
        breaker.record_failure(ErrorSource::RateLimit);
        breaker.record_failure(ErrorSource::Network);
        assert!(!breaker.is_tripped(ErrorSource::RateLimit));
        assert!(!breaker.is_tripped(ErrorSource::Network));

        breaker.record_failure(ErrorSource::Network);
        assert!(breaker.is_tripped(ErrorSource::Network));
        assert!(!breaker.is_tripped(ErrorSource::RateLimit));
    }

    #[test]
    fn test_empty_source_never_trips() {
        let breaker = CircuitBreaker::with_threshold(1);
        assert!(!breaker.record_failure(ErrorSource::None));
        assert!(!breaker.record_failure(ErrorSource::None));
        assert!(!breaker.is_tripped(ErrorSource::None));
    }
}
