//! Exponential backoff with jitter and the shared retry loop.
//!
//! [`RetryPolicy`] describes how transient failures are retried: delay
//! growth, cap, jitter, and an optional filter restricting retries to
//! specific error types. [`retry_with_backoff`] is the single retry loop
//! used by both the engine's per-block wrapper and the LLM transport:
//! it classifies each failure, honors `Retry-After`, consults the run's
//! circuit breaker, and respects cancellation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::error::{classify, Classified, EngineError, ErrorSource, Result};
use crate::model::RetrySpec;

/// Error-type tokens a block's `retry_on` list may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    RateLimit,
    ServerError,
    Timeout,
    NetworkError,
    AllTransient,
}

impl RetryOn {
    /// Parse a `retry_on` token. Unknown tokens are ignored by the caller.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "rate_limit" => Some(RetryOn::RateLimit),
            "server_error" => Some(RetryOn::ServerError),
            "timeout" => Some(RetryOn::Timeout),
            "network_error" => Some(RetryOn::NetworkError),
            "all_transient" => Some(RetryOn::AllTransient),
            _ => None,
        }
    }

    /// Whether this token covers the given error source.
    fn matches(&self, source: ErrorSource) -> bool {
        match self {
            RetryOn::RateLimit => source == ErrorSource::RateLimit,
            RetryOn::ServerError => source == ErrorSource::Server5xx,
            RetryOn::Timeout => source == ErrorSource::Timeout,
            RetryOn::NetworkError => source == ErrorSource::Network,
            RetryOn::AllTransient => source != ErrorSource::None,
        }
    }
}

/// Retry policy: attempt count, delay schedule, and error-type filter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retries after the initial attempt. 0 disables retry.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Growth factor applied per retry.
    pub multiplier: f64,
    /// Delay cap.
    pub max_delay: Duration,
    /// Additive jitter as a fraction of the computed delay (0.2 = ±20%).
    pub jitter_percent: f64,
    /// Error types to retry. Empty = retry every retryable error.
    pub retry_on: Vec<RetryOn>,
}

impl RetryPolicy {
    /// No retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// 3 retries, 1s initial, 2x growth, 30s cap, ±20% jitter.
    pub fn standard() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter_percent: 0.2,
            retry_on: Vec::new(),
        }
    }

    /// Build a policy from a block's [`RetrySpec`].
    pub fn from_spec(spec: &RetrySpec) -> Self {
        let initial = if spec.backoff_ms > 0 {
            Duration::from_millis(spec.backoff_ms)
        } else {
            Duration::from_secs(1)
        };
        let max = if spec.max_backoff_ms > 0 {
            Duration::from_millis(spec.max_backoff_ms)
        } else {
            Duration::from_secs(30)
        };
        Self {
            max_retries: spec.max_retries,
            initial_delay: initial,
            multiplier: 2.0,
            max_delay: max,
            jitter_percent: 0.2,
            retry_on: spec
                .retry_on
                .iter()
                .filter_map(|t| RetryOn::parse(t))
                .collect(),
        }
    }

    /// Delay for retry attempt N (0-indexed), with jitter applied.
    ///
    /// Base delay is `initial_delay * multiplier^attempt`, capped at
    /// `max_delay`, then adjusted by a uniform ±`jitter_percent` factor.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = if self.jitter_percent > 0.0 {
            (fastrand::f64() * 2.0 - 1.0) * self.jitter_percent
        } else {
            0.0
        };
        Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
    }

    /// Whether the policy retries this classified error.
    ///
    /// Requires the error to be retryable at all, then applies the
    /// `retry_on` filter (empty filter = everything retryable).
    pub fn should_retry(&self, c: &Classified) -> bool {
        if !c.retryable {
            return false;
        }
        if self.retry_on.is_empty() {
            return true;
        }
        self.retry_on.iter().any(|t| t.matches(c.source))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// What the retry loop reports before each sleep.
pub type OnRetry<'a> = &'a mut (dyn FnMut(u32, Duration, &Classified) + Send);

/// Run `op` with retry-with-backoff.
///
/// Each failure is classified (§ error taxonomy). A retry happens only
/// when the policy allows the error type, attempts remain, and the run's
/// circuit breaker is not tripped for the error's source. The sleep
/// honors `Retry-After` (the larger of backoff and the provider hint)
/// and returns immediately on cancellation.
///
/// The breaker, when present, gates retries and is cleared on a
/// success that follows failures. Recording failures is the caller's
/// job — the breaker counts operation-level failures, not individual
/// attempts.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    breaker: Option<&CircuitBreaker>,
    cancel: Option<&AtomicBool>,
    mut on_retry: Option<OnRetry<'_>>,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_source = ErrorSource::None;

    for attempt in 0..=policy.max_retries {
        if is_cancelled(cancel) {
            return Err(EngineError::Cancelled);
        }

        match op(attempt).await {
            Ok(value) => {
                if let Some(b) = breaker {
                    if last_source != ErrorSource::None {
                        b.record_success(last_source);
                    }
                }
                return Ok(value);
            }
            Err(err) => {
                let c = classify(&err);
                last_source = c.source;
                if let Some(b) = breaker {
                    if b.is_tripped(c.source) {
                        debug!(
                            source = c.source.as_str(),
                            "circuit breaker open, not retrying"
                        );
                        return Err(err);
                    }
                }
                if attempt >= policy.max_retries || !policy.should_retry(&c) {
                    return Err(err);
                }

                let mut delay = policy.delay_for_attempt(attempt);
                if let Some(ra) = c.retry_after {
                    delay = delay.max(ra);
                }
                if let Some(cb) = on_retry.as_deref_mut() {
                    cb(attempt + 1, delay, &c);
                }

                sleep_cancellable(delay, cancel).await;
                if is_cancelled(cancel) {
                    return Err(EngineError::Cancelled);
                }
            }
        }
    }

    Err(EngineError::Other("retry loop exited unexpectedly".into()))
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|c| c.load(Ordering::Relaxed))
}

/// Sleep in slices so cancellation cuts a long backoff short.
async fn sleep_cancellable(delay: Duration, cancel: Option<&AtomicBool>) {
    const SLICE: Duration = Duration::from_millis(250);
    let mut remaining = delay;
    while remaining > Duration::ZERO {
        if is_cancelled(cancel) {
            return;
        }
        let slice = remaining.min(SLICE);
        tokio::time::sleep(slice).await;
        remaining = remaining.saturating_sub(slice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn no_jitter(policy: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            jitter_percent: 0.0,
            ..policy
        }
    }

    #[test]
    fn test_delay_exponential() {
        let policy = no_jitter(RetryPolicy::standard());
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped() {
        let policy = no_jitter(RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..RetryPolicy::standard()
        });
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_jitter_within_bounds() {
        let policy = RetryPolicy::standard();
        for _ in 0..100 {
            let d = policy.delay_for_attempt(0).as_secs_f64();
            assert!((0.8..=1.2).contains(&d), "delay {} outside ±20%", d);
        }
    }

    #[test]
    fn test_retry_on_parse() {
        assert_eq!(RetryOn::parse("rate_limit"), Some(RetryOn::RateLimit));
        assert_eq!(RetryOn::parse("all_transient"), Some(RetryOn::AllTransient));
        assert_eq!(RetryOn::parse("bogus"), None);
    }

    #[test]
    fn test_should_retry_empty_filter() {
        let policy = RetryPolicy::standard();
        let c = classify(&EngineError::Http {
            status: 503,
            body: "".into(),
            retry_after: None,
            output: None,
        });
        assert!(policy.should_retry(&c));
    }

    #[test]
    fn test_should_retry_filter_mismatch() {
        let policy = RetryPolicy {
            retry_on: vec![RetryOn::RateLimit],
            ..RetryPolicy::standard()
        };
        let server = classify(&EngineError::Http {
            status: 500,
            body: "".into(),
            retry_after: None,
            output: None,
        });
        assert!(!policy.should_retry(&server));

        let limited = classify(&EngineError::Http {
            status: 429,
            body: "".into(),
            retry_after: None,
            output: None,
        });
        assert!(policy.should_retry(&limited));
    }

    #[test]
    fn test_should_retry_never_for_permanent() {
        let policy = RetryPolicy {
            retry_on: vec![RetryOn::AllTransient],
            ..RetryPolicy::standard()
        };
        let c = classify(&EngineError::Http {
            status: 401,
            body: "".into(),
            retry_after: None,
            output: None,
        });
        assert!(!policy.should_retry(&c));
    }

    #[test]
    fn test_from_spec_defaults() {
        let policy = RetryPolicy::from_spec(&RetrySpec {
            max_retries: 2,
            backoff_ms: 0,
            max_backoff_ms: 0,
            retry_on: vec!["timeout".into(), "nonsense".into()],
        });
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.retry_on, vec![RetryOn::Timeout]);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            ..no_jitter(RetryPolicy::standard())
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result = retry_with_backoff(&policy, None, None, None, move |_attempt| {
            let calls = calls_in.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(EngineError::Http {
                        status: 503,
                        body: "unavailable".into(),
                        retry_after: None,
                        output: None,
                    })
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_at_most_n_plus_one_attempts() {
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            ..no_jitter(RetryPolicy::standard())
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result: Result<()> = retry_with_backoff(&policy, None, None, None, move |_| {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::Http {
                    status: 500,
                    body: "boom".into(),
                    retry_after: None,
                    output: None,
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(1),
            ..no_jitter(RetryPolicy::standard())
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result: Result<()> = retry_with_backoff(&policy, None, None, None, move |_| {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::Http {
                    status: 401,
                    body: "unauthorized".into(),
                    retry_after: None,
                    output: None,
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tripped_breaker_short_circuits() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(1),
            ..no_jitter(RetryPolicy::standard())
        };
        let breaker = CircuitBreaker::with_threshold(1);
        breaker.record_failure(ErrorSource::Server5xx);
        assert!(breaker.is_tripped(ErrorSource::Server5xx));

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result: Result<()> =
            retry_with_backoff(&policy, Some(&breaker), None, None, move |_| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::Http {
                        status: 500,
                        body: "boom".into(),
                        retry_after: None,
                        output: None,
                    })
                }
            })
            .await;

        assert!(result.is_err());
        // Open breaker: one attempt, no retries.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_failure_clears_breaker_source() {
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            ..no_jitter(RetryPolicy::standard())
        };
        let breaker = CircuitBreaker::with_threshold(5);
        breaker.record_failure(ErrorSource::Server5xx);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result = retry_with_backoff(&policy, Some(&breaker), None, None, move |_| {
            let calls = calls_in.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(EngineError::Http {
                        status: 500,
                        body: "".into(),
                        retry_after: None,
                        output: None,
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(breaker.failure_count(ErrorSource::Server5xx), 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_before_first_attempt() {
        let policy = RetryPolicy::standard();
        let cancel = AtomicBool::new(true);
        let result: Result<()> =
            retry_with_backoff(&policy, None, Some(&cancel), None, |_| async {
                panic!("should not be called")
            })
            .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_on_retry_reports_each_wait() {
        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            ..no_jitter(RetryPolicy::standard())
        };
        let mut reported = Vec::new();
        let mut cb = |attempt: u32, delay: Duration, _c: &Classified| {
            reported.push((attempt, delay));
        };

        let _: Result<()> = retry_with_backoff(&policy, None, None, Some(&mut cb), |_| async {
            Err(EngineError::Http {
                status: 502,
                body: "".into(),
                retry_after: None,
                output: None,
            })
        })
        .await;

        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].0, 1);
        assert_eq!(reported[1].0, 2);
    }
}
