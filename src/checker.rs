//! Post-hoc block checker: an independent small-model judgment on
//! whether an LLM block accomplished its intended job.
//!
//! The checker is fail-open: any internal error (no provider, network
//! failure, unparseable verdict) defaults to `passed`, so a checker bug
//! can never turn a healthy run into a failed one.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::agent::resolve_model;
use crate::context::RunContext;
use crate::llm::{json::extract_json, ChatClient, ChatRequest};
use crate::model::{Block, JsonMap};

/// The checker's verdict on a completed block.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub passed: bool,
    pub reason: String,
}

impl Verdict {
    fn pass(reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            reason: reason.into(),
        }
    }
}

/// Judgment rules baked into the checker prompt.
const CHECKER_SYSTEM: &str = "\
You judge whether a workflow block accomplished its intended job. \
Respond with strict JSON only: {\"passed\": true|false, \"reason\": \"...\"}.\n\
Rules:\n\
- External API failures (rate limits, server errors) count as PASSED \
when the block attempted the correct tool and handled the error \
gracefully.\n\
- Parse or format errors are failures only when the content is also \
meaningless for the block's purpose.\n\
- Timeouts, empty responses, and calls to clearly wrong tools are \
failures.";

/// Judge a completed LLM block. Returns `passed: true` on any internal
/// checker error.
pub async fn check_block(
    ctx: &RunContext,
    block: &Block,
    inputs: &JsonMap,
    output: &JsonMap,
) -> Verdict {
    let configured = ctx
        .agent
        .checker_model
        .clone()
        .unwrap_or_else(|| block.config_str("model").to_string());
    let (provider, model) = match resolve_model(ctx, &configured) {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!(block = %block.id, error = %e, "checker has no model, defaulting to passed");
            return Verdict::pass("checker unavailable");
        }
    };

    let request = ChatRequest {
        model,
        messages: vec![
            json!({"role": "system", "content": CHECKER_SYSTEM}),
            json!({"role": "user", "content": build_judgment_prompt(ctx, block, inputs, output)}),
        ],
        temperature: 0.0,
        max_tokens: Some(512),
        tools: None,
        response_format: None,
    };

    let outcome = match ChatClient::complete(&ctx.client, &provider, &request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(block = %block.id, error = %e, "checker call failed, defaulting to passed");
            return Verdict::pass("checker call failed");
        }
    };

    match parse_verdict(&outcome.content) {
        Some(verdict) => {
            debug!(block = %block.id, passed = verdict.passed, "checker verdict");
            verdict
        }
        None => {
            warn!(block = %block.id, "checker verdict unparseable, defaulting to passed");
            Verdict::pass("checker verdict unparseable")
        }
    }
}

/// The judgment prompt: workflow goal, block identity, inputs, and a
/// summarized output.
fn build_judgment_prompt(
    ctx: &RunContext,
    block: &Block,
    inputs: &JsonMap,
    output: &JsonMap,
) -> String {
    let goal = ctx.workflow_goal.as_deref().unwrap_or("(not stated)");
    let description = block.config_str("description");

    format!(
        "Workflow goal: {}\nBlock: {} ({})\nBlock intent: {}\n\nInputs:\n{}\n\nOutput summary:\n{}",
        goal,
        block.display_name(),
        block.block_type,
        if description.is_empty() {
            "(none given)"
        } else {
            description
        },
        truncate(&Value::Object(inputs.clone()).to_string(), 1500),
        summarize_output(output),
    )
}

/// A compact, checker-friendly view of the block output.
pub(crate) fn summarize_output(output: &JsonMap) -> String {
    let mut lines = Vec::new();

    if let Some(response) = output.get("response") {
        let text = match response {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        lines.push(format!("response: {}", truncate(&text, 1200)));
    }
    if output.get("timedOut").and_then(Value::as_bool) == Some(true) {
        lines.push("timed out: yes".into());
    }
    if let Some(Value::Array(calls)) = output.get("toolCalls") {
        let succeeded = calls
            .iter()
            .filter(|c| c.get("success").and_then(Value::as_bool) == Some(true))
            .count();
        lines.push(format!("tool calls: {} ({} succeeded)", calls.len(), succeeded));
        for call in calls.iter().filter(|c| {
            c.get("success").and_then(Value::as_bool) == Some(false)
        }) {
            lines.push(format!(
                "  failed: {} — {}",
                call.get("name").and_then(Value::as_str).unwrap_or("?"),
                call.get("error").and_then(Value::as_str).unwrap_or("?")
            ));
        }
    }
    for flag in ["_formatError", "_validationError", "_toolValidationWarning"] {
        if let Some(value) = output.get(flag) {
            lines.push(format!("{}: {}", flag.trim_start_matches('_'), value));
        }
    }
    if let Some(Value::Array(artifacts)) = output.get("artifacts") {
        lines.push(format!("artifacts: {}", artifacts.len()));
    }
    if let Some(Value::Array(files)) = output.get("files") {
        lines.push(format!("files: {}", files.len()));
    }

    if lines.is_empty() {
        "(empty output)".into()
    } else {
        lines.join("\n")
    }
}

fn parse_verdict(content: &str) -> Option<Verdict> {
    let value = extract_json(content)?;
    Some(Verdict {
        passed: value.get("passed")?.as_bool()?,
        reason: value
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::mock::{StaticCatalog, StaticToolRegistry};
    use crate::model::BlockType;
    use std::sync::Arc;

    #[test]
    fn test_parse_verdict_strict_json() {
        let verdict = parse_verdict(r#"{"passed": false, "reason": "empty response"}"#).unwrap();
        assert!(!verdict.passed);
        assert_eq!(verdict.reason, "empty response");
    }

    #[test]
    fn test_parse_verdict_with_prose() {
        let verdict =
            parse_verdict("Here is my judgment: {\"passed\": true, \"reason\": \"ok\"}").unwrap();
        assert!(verdict.passed);
    }

    #[test]
    fn test_parse_verdict_garbage_is_none() {
        assert!(parse_verdict("definitely passed!").is_none());
    }

    #[test]
    fn test_summarize_output_counts_tool_calls() {
        let output = serde_json::json!({
            "response": "done",
            "toolCalls": [
                {"name": "a", "success": true},
                {"name": "b", "success": false, "error": "rate limit"}
            ],
            "artifacts": [{}],
            "_formatError": "bad json"
        })
        .as_object()
        .unwrap()
        .clone();

        let summary = summarize_output(&output);
        assert!(summary.contains("tool calls: 2 (1 succeeded)"));
        assert!(summary.contains("failed: b — rate limit"));
        assert!(summary.contains("artifacts: 1"));
        assert!(summary.contains("formatError"));
    }

    #[test]
    fn test_summarize_empty_output() {
        assert_eq!(summarize_output(&JsonMap::new()), "(empty output)");
    }

    #[tokio::test]
    async fn test_checker_fails_open_without_provider() {
        let ctx = RunContext::builder(
            Arc::new(StaticToolRegistry::new()),
            Arc::new(StaticCatalog::new()),
        )
        .build();
        let block = Block::new("llm", BlockType::LlmInference);
        let verdict = check_block(&ctx, &block, &JsonMap::new(), &JsonMap::new()).await;
        assert!(verdict.passed);
    }
}
