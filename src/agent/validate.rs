//! Post-attempt tool-usage validation.
//!
//! After every agent attempt, the validator decides whether the block
//! actually used tools the way its configuration demands — and when
//! every attempted tool failed, whether those failures look like the
//! model's fault (bad parameters, worth a retry) or the outside world's
//! (API down, pass the error downstream).

use super::ToolCallRecord;

/// Why a validation pass failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// `requireToolUsage` was set but no tool was attempted.
    NoToolCalled,
    /// Every attempted tool failed with parameter-shaped errors.
    ToolParameterError,
    /// A `requiredTools` entry was never attempted.
    RequiredToolMissing,
    /// The structured output did not match the configured schema.
    SchemaMismatch,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NoToolCalled => "no_tool_called",
            FailureKind::ToolParameterError => "tool_parameter_error",
            FailureKind::RequiredToolMissing => "required_tool_missing",
            FailureKind::SchemaMismatch => "schema_mismatch",
        }
    }
}

/// A failed validation verdict.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub kind: FailureKind,
    pub reason: String,
}

/// Message fragments that mark a failure as parameter-shaped: the model
/// sent something the tool rejected, so a corrected retry can help.
const PARAMETER_ERROR_MARKERS: [&str; 4] = [
    "did you mean",
    "is not valid",
    "unsupported action",
    "is required",
];

/// Message fragments that mark a failure as external: the tool was
/// called correctly but the world said no.
const EXTERNAL_ERROR_MARKERS: [&str; 7] = [
    "rate limit",
    "too many requests",
    "timeout",
    "timed out",
    "connection refused",
    "service unavailable",
    "api is down",
];

/// Validate an attempt's tool usage.
///
/// Returns `None` when the attempt passes. External-shaped failures
/// pass: the block did its job and downstream blocks receive the
/// error.
pub fn validate_tool_usage(
    calls: &[ToolCallRecord],
    require_tool_usage: bool,
    required_tools: &[String],
) -> Option<ValidationFailure> {
    if require_tool_usage && calls.is_empty() {
        return Some(ValidationFailure {
            kind: FailureKind::NoToolCalled,
            reason: "the block requires tool usage but no tool was called".into(),
        });
    }

    if !calls.is_empty() && calls.iter().all(|c| !c.success) {
        let parameter_shaped: Vec<&ToolCallRecord> = calls
            .iter()
            .filter(|c| {
                c.error
                    .as_deref()
                    .map(is_parameter_error)
                    .unwrap_or(false)
            })
            .collect();
        if !parameter_shaped.is_empty() {
            let detail = parameter_shaped
                .iter()
                .map(|c| {
                    format!(
                        "{}: {}",
                        c.name,
                        c.error.as_deref().unwrap_or("unknown error")
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Some(ValidationFailure {
                kind: FailureKind::ToolParameterError,
                reason: format!("all tool calls failed with parameter errors: {}", detail),
            });
        }
        // External failures: the block attempted the correct tool, so
        // the attempt counts as done.
    }

    for required in required_tools {
        if !calls.iter().any(|c| &c.name == required) {
            return Some(ValidationFailure {
                kind: FailureKind::RequiredToolMissing,
                reason: format!("required tool '{}' was not called", required),
            });
        }
    }

    None
}

/// Parameter-shaped failure: retryable with a corrected prompt.
pub fn is_parameter_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    PARAMETER_ERROR_MARKERS.iter().any(|m| lower.contains(m))
}

/// External-shaped failure: not the model's fault.
pub fn is_external_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    EXTERNAL_ERROR_MARKERS.iter().any(|m| lower.contains(m))
}
