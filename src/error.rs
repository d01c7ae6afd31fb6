//! Error types and the transient/permanent classification used by retry,
//! circuit-breaker, and user-messaging logic.
//!
//! [`EngineError`] is the crate-wide error enum. [`classify`] maps any
//! engine error onto a [`Classified`] record: category, retryability,
//! circuit-breaker source token, and a human-readable guidance string.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Errors produced by the engine and its executors.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Low-level HTTP transport failure (connection refused, timeout, DNS).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// `output` carries the parsed response body when the executor could
    /// still produce one (the HTTP block returns the body alongside the
    /// error so downstream diagnostics can inspect it).
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text, truncated for display.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
        /// Parsed response body, when available despite the failure.
        output: Option<Value>,
    },

    /// A block's config is invalid or inconsistent with its inputs.
    #[error("block '{block}': {message}")]
    BlockConfig {
        /// ID of the misconfigured block.
        block: String,
        /// What is wrong with it.
        message: String,
    },

    /// The workflow definition itself is unusable (dangling connection,
    /// no start blocks, duplicate IDs).
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// A tool invocation failed.
    #[error("tool '{name}' failed: {message}")]
    Tool {
        /// Registry name of the tool.
        name: String,
        /// Failure detail from the tool.
        message: String,
    },

    /// The run was cancelled via the cancellation flag or workflow deadline.
    #[error("execution was cancelled")]
    Cancelled,

    /// A per-block or workflow-level timeout elapsed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Structured-output or tool-usage validation failed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A panic was recovered at the dispatcher boundary.
    #[error("internal panic: {0}")]
    Panic(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Coarse error category driving retry and propagation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Worth retrying: rate limits, 5xx, timeouts, network failures.
    Transient,
    /// Retrying cannot help: auth failures, malformed requests, TLS.
    Permanent,
    /// The call succeeded but its output failed validation.
    Validation,
    /// Unclassifiable; treated as not retryable.
    Unknown,
}

/// Circuit-breaker source token derived from an error.
///
/// Identifies the class of external failure so consecutive failures from
/// the same source can trip the breaker. Permanent errors map to
/// [`ErrorSource::None`], which never trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    /// HTTP 429.
    RateLimit,
    /// HTTP 5xx.
    Server5xx,
    /// Deadline or request timeout (including HTTP 408).
    Timeout,
    /// Connection refused/reset, DNS failure, unreachable network.
    Network,
    /// No breaker-relevant source (permanent/validation errors).
    None,
}

impl ErrorSource {
    /// Stable token used in status events and breaker keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSource::RateLimit => "rate_limit",
            ErrorSource::Server5xx => "server_5xx",
            ErrorSource::Timeout => "timeout",
            ErrorSource::Network => "network_error",
            ErrorSource::None => "",
        }
    }
}

/// The result of classifying an [`EngineError`].
#[derive(Debug, Clone)]
pub struct Classified {
    /// Transient / permanent / validation / unknown.
    pub category: ErrorCategory,
    /// Whether a retry could plausibly succeed.
    pub retryable: bool,
    /// HTTP status, when the error came from an HTTP response.
    pub status_code: Option<u16>,
    /// Provider-requested wait before retrying (429 default: 60s).
    pub retry_after: Option<Duration>,
    /// Circuit-breaker source token.
    pub source: ErrorSource,
    /// Human-readable guidance for the caller.
    pub guidance: String,
    /// Raw technical detail, preserved for diagnostics.
    pub detail: String,
}

/// Default `Retry-After` applied to 429 responses without a header.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// HTTP statuses treated as permanent.
const PERMANENT_STATUSES: [u16; 5] = [400, 401, 403, 404, 422];

/// Classify an error per the transient/permanent taxonomy.
pub fn classify(err: &EngineError) -> Classified {
    let detail = err.to_string();
    match err {
        EngineError::Http {
            status,
            retry_after,
            body,
            ..
        } => classify_status(*status, *retry_after, body, detail),

        EngineError::Request(e) => {
            let msg = e.to_string().to_ascii_lowercase();
            if is_tls_message(&msg) {
                return permanent(
                    detail,
                    "TLS/certificate verification failed; check the endpoint configuration.",
                );
            }
            let source = if e.is_timeout() {
                ErrorSource::Timeout
            } else {
                ErrorSource::Network
            };
            transient(source, None, None, detail)
        }

        EngineError::Timeout(_) | EngineError::Cancelled => {
            transient(ErrorSource::Timeout, None, None, detail)
        }

        EngineError::Json(_) | EngineError::Validation(_) => Classified {
            category: ErrorCategory::Validation,
            retryable: false,
            status_code: None,
            retry_after: None,
            source: ErrorSource::None,
            guidance: "The response did not match the expected format.".to_string(),
            detail,
        },

        EngineError::BlockConfig { .. } | EngineError::InvalidWorkflow(_) => permanent(
            detail,
            "The workflow or block configuration is invalid and must be corrected.",
        ),

        EngineError::Panic(_) => Classified {
            category: ErrorCategory::Unknown,
            retryable: false,
            status_code: None,
            retry_after: None,
            source: ErrorSource::None,
            guidance: "An internal error occurred while executing this block.".to_string(),
            detail,
        },

        EngineError::Tool { message, .. } => classify_message(message, detail),
        EngineError::Other(message) => classify_message(message, detail),
    }
}

/// Classify an HTTP status code.
fn classify_status(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
    detail: String,
) -> Classified {
    if status == 429 {
        let guidance = if body.to_ascii_lowercase().contains("quota") {
            "The provider reports the usage quota is exhausted."
        } else {
            "The provider is rate limiting requests. The engine will back off and retry."
        };
        return Classified {
            category: ErrorCategory::Transient,
            retryable: true,
            status_code: Some(status),
            retry_after: Some(retry_after.unwrap_or(DEFAULT_RATE_LIMIT_WAIT)),
            source: ErrorSource::RateLimit,
            guidance: guidance.to_string(),
            detail,
        };
    }

    if status == 408 {
        let mut c = transient(ErrorSource::Timeout, Some(status), retry_after, detail);
        c.guidance = "The request timed out on the server side.".to_string();
        return c;
    }

    if (500..=599).contains(&status) {
        let mut c = transient(ErrorSource::Server5xx, Some(status), retry_after, detail);
        c.guidance = "The upstream server is unavailable or failing.".to_string();
        return c;
    }

    if PERMANENT_STATUSES.contains(&status) {
        let guidance = match status {
            401 | 403 => "Authentication failed. Check the configured API key or credential.",
            400 | 422 => "The request was rejected as malformed. Check the block configuration.",
            404 => "The requested resource was not found.",
            _ => "The request was rejected.",
        };
        let mut c = permanent(detail, guidance);
        c.status_code = Some(status);
        return c;
    }

    // Remaining 4xx and anything exotic: unknown, not retryable.
    Classified {
        category: ErrorCategory::Unknown,
        retryable: false,
        status_code: Some(status),
        retry_after: None,
        source: ErrorSource::None,
        guidance: format!("The request failed with HTTP {}.", status),
        detail,
    }
}

/// Classify a free-form message by keyword sniffing (tool and subprocess
/// failures arrive as plain strings).
fn classify_message(message: &str, detail: String) -> Classified {
    let lower = message.to_ascii_lowercase();

    if is_tls_message(&lower) {
        return permanent(
            detail,
            "TLS/certificate verification failed; check the endpoint configuration.",
        );
    }
    if lower.contains("rate limit") || lower.contains("too many requests") {
        let mut c = transient(ErrorSource::RateLimit, None, None, detail);
        c.retry_after = Some(DEFAULT_RATE_LIMIT_WAIT);
        c.guidance = "The provider is rate limiting requests.".to_string();
        return c;
    }
    if lower.contains("timed out") || lower.contains("timeout") || lower.contains("deadline") {
        return transient(ErrorSource::Timeout, None, None, detail);
    }
    if lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("no such host")
        || lower.contains("dns")
        || lower.contains("network is unreachable")
    {
        return transient(ErrorSource::Network, None, None, detail);
    }

    Classified {
        category: ErrorCategory::Unknown,
        retryable: false,
        status_code: None,
        retry_after: None,
        source: ErrorSource::None,
        guidance: "An unexpected error occurred.".to_string(),
        detail,
    }
}

fn is_tls_message(lower: &str) -> bool {
    lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl")
}

fn transient(
    source: ErrorSource,
    status_code: Option<u16>,
    retry_after: Option<Duration>,
    detail: String,
) -> Classified {
    let guidance = match source {
        ErrorSource::Timeout => "The operation timed out.",
        ErrorSource::Network => "The network is unreachable or the connection dropped.",
        _ => "A transient failure occurred.",
    };
    Classified {
        category: ErrorCategory::Transient,
        retryable: true,
        status_code,
        retry_after,
        source,
        guidance: guidance.to_string(),
        detail,
    }
}

fn permanent(detail: String, guidance: &str) -> Classified {
    Classified {
        category: ErrorCategory::Permanent,
        retryable: false,
        status_code: None,
        retry_after: None,
        source: ErrorSource::None,
        guidance: guidance.to_string(),
        detail,
    }
}
