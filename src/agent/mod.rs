//! The LLM agent block executor.
//!
//! Phase 1 drives the agent loop: stream a chat completion, execute any
//! requested tools, feed results back, repeat until the model stops or
//! the iteration cap trips. Phase 2 optionally reformats the result
//! into a configured output schema with a dedicated low-temperature
//! call. Tool-usage validation wraps the whole attempt and can rerun it
//! with an injected explanation.

pub mod artifact;
pub mod prompt;
pub mod schema;
pub mod validate;

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::backoff::retry_with_backoff;
use crate::collab::Provider;
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::events::StatusUpdate;
use crate::exec::{tool::execute_tool, BlockExecutor, BoxFut};
use crate::llm::{ChatClient, ChatRequest, StreamOutcome, TokenUsage};
use crate::model::{Block, JsonMap};
use crate::template;
use artifact::Artifact;
use validate::validate_tool_usage;

/// Fields promoted from tool results to top-level output keys.
const PROMOTED_FIELDS: [&str; 6] = ["text", "data", "content", "result", "output", "transcription"];

/// One executed tool call, kept in the attempt's log.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub success: bool,
}

/// The agent block executor (`llm_inference`).
pub struct AgentExecutor;

impl AgentExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AgentExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockExecutor for AgentExecutor {
    fn kind(&self) -> &'static str {
        "llm_inference"
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let require_tool_usage = block.config_bool("requireToolUsage");
            let required_tools: Vec<String> = block
                .config
                .get("requiredTools")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();
            let max_validation_retries = block
                .config_u64("maxRetries")
                .map(|n| n as u32)
                .unwrap_or(ctx.agent.validation_retries);

            let mut attempt_inputs = inputs.clone();
            let mut last_failure: Option<validate::ValidationFailure> = None;

            for attempt in 0..=max_validation_retries {
                if let Some(failure) = &last_failure {
                    attempt_inputs.insert("_retryAttempt".into(), json!(attempt));
                    attempt_inputs.insert("_retryReason".into(), json!(failure.reason.clone()));
                }

                let (mut output, calls) = run_attempt(ctx, block, &attempt_inputs).await?;

                match validate_tool_usage(&calls, require_tool_usage, &required_tools) {
                    None => {
                        // Schema-format failures are validation errors
                        // too: retried with an injected explanation,
                        // surfaced as warning flags when exhausted.
                        if let Some(reason) = schema_failure_reason(&output) {
                            if attempt < max_validation_retries {
                                info!(
                                    block = %block.id,
                                    "structured output failed validation, retrying attempt"
                                );
                                last_failure = Some(validate::ValidationFailure {
                                    kind: validate::FailureKind::SchemaMismatch,
                                    reason,
                                });
                                continue;
                            }
                        }
                        return Ok(output);
                    }
                    Some(failure) => {
                        if attempt < max_validation_retries {
                            info!(
                                block = %block.id,
                                kind = failure.kind.as_str(),
                                "tool-usage validation failed, retrying attempt"
                            );
                            last_failure = Some(failure);
                            continue;
                        }
                        // Exhausted: succeed with a warning so the run
                        // can proceed.
                        warn!(
                            block = %block.id,
                            kind = failure.kind.as_str(),
                            "tool-usage validation exhausted retries"
                        );
                        output.insert(
                            "_toolValidationWarning".into(),
                            json!({
                                "kind": failure.kind.as_str(),
                                "reason": failure.reason,
                            }),
                        );
                        return Ok(output);
                    }
                }
            }

            unreachable!("validation loop always returns")
        })
    }
}

/// Formatting/validation flags left on an attempt's output, when any.
fn schema_failure_reason(output: &JsonMap) -> Option<String> {
    for flag in ["_formatError", "_validationError"] {
        if let Some(reason) = output.get(flag).and_then(Value::as_str) {
            return Some(format!(
                "the structured output did not satisfy the schema: {}",
                reason
            ));
        }
    }
    None
}

/// One full agent attempt: the tool loop plus optional schema
/// formatting. Returns the output map and the tool-call log.
async fn run_attempt(
    ctx: &RunContext,
    block: &Block,
    inputs: &JsonMap,
) -> Result<(JsonMap, Vec<ToolCallRecord>)> {
    let configured_model = block.config_str("model");
    let (provider, model) = resolve_model(ctx, configured_model)?;
    debug!(block = %block.id, provider = %provider.name, model = %model, "agent attempt");

    let temperature = block
        .config
        .get("temperature")
        .and_then(Value::as_f64)
        .unwrap_or(0.7);
    let max_tokens = block.config_u64("maxTokens");
    let max_iterations = block
        .config_u64("maxIterations")
        .map(|n| n as u32)
        .unwrap_or(ctx.agent.max_iterations);

    let tools_enabled = block
        .config
        .get("enableTools")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let tool_specs = if tools_enabled {
        let allowed: Option<HashSet<String>> = block
            .config
            .get("allowedTools")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?;
        ctx.tools
            .list()
            .into_iter()
            .filter(|spec| {
                allowed
                    .as_ref()
                    .map(|names| names.contains(&spec.name))
                    .unwrap_or(true)
            })
            .collect()
    } else {
        Vec::new()
    };

    let output_schema = block.config.get("outputSchema").filter(|v| v.is_object());

    // --- Message assembly ---
    let mut system = String::from(prompt::SYSTEM_PREAMBLE);
    system.push_str(&prompt::tool_catalog(&tool_specs));
    if let Some(notice) = prompt::retry_notice(inputs) {
        system.push_str(&notice);
    }
    let user_system = block.config_str("systemPrompt");
    if !user_system.is_empty() {
        system.push_str("\n\n");
        system.push_str(&template::render_string(
            user_system,
            &Value::Object(inputs.clone()),
        ));
    }
    system.push_str(&prompt::data_context(inputs));

    let user_prompt = match block.config_str("prompt") {
        "" => block.config_str("userPrompt"),
        p => p,
    };
    let user_message = prompt::build_user_message(ctx, user_prompt, inputs, &model).await?;

    let mut messages = vec![json!({"role": "system", "content": system}), user_message];

    let tool_definitions = if tool_specs.is_empty() {
        None
    } else {
        Some(Value::Array(
            tool_specs
                .iter()
                .map(|spec| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": spec.name,
                            "description": spec.description,
                            "parameters": spec.parameters,
                        }
                    })
                })
                .collect(),
        ))
    };

    // Native strict schema only without tools and for trusted models.
    let response_format = match output_schema {
        Some(s) if tool_definitions.is_none() && ctx.agent.supports_strict_schema(&model) => {
            Some(schema::response_format(s))
        }
        _ => None,
    };

    // --- Agent loop ---
    let mut calls: Vec<ToolCallRecord> = Vec::new();
    let mut artifacts: Vec<Artifact> = Vec::new();
    let mut files: Vec<Value> = Vec::new();
    let mut usage = TokenUsage::default();
    let mut final_content = String::new();
    let mut thinking: Option<String> = None;
    let mut timed_out = false;

    let mut iteration = 0u32;
    loop {
        if ctx.is_cancelled() {
            timed_out = true;
            break;
        }
        if iteration >= max_iterations {
            warn!(block = %block.id, iterations = iteration, "agent loop hit iteration cap");
            timed_out = true;
            break;
        }
        iteration += 1;

        let request = ChatRequest {
            model: model.clone(),
            messages: messages.clone(),
            temperature,
            max_tokens,
            tools: tool_definitions.clone(),
            response_format: response_format.clone(),
        };

        let outcome = call_llm(ctx, block, &provider, &request).await?;
        accumulate_usage(&mut usage, outcome.usage);
        if let Some(t) = &outcome.thinking {
            thinking = Some(match thinking.take() {
                Some(mut existing) => {
                    existing.push('\n');
                    existing.push_str(t);
                    existing
                }
                None => t.clone(),
            });
        }

        if outcome.is_final() {
            final_content = outcome.content;
            break;
        }

        // Echo the assistant turn (with its tool calls) before the tool
        // results.
        messages.push(assistant_tool_message(&outcome));

        let mut seen_this_iteration: HashSet<String> = HashSet::new();
        let mut repeated = false;
        for call in &outcome.tool_calls {
            if !seen_this_iteration.insert(call.name.clone()) {
                warn!(
                    block = %block.id,
                    tool = %call.name,
                    "tool repeated within one iteration, exiting agent loop"
                );
                repeated = true;
                break;
            }

            let mut args = call.arguments.clone();
            auto_inject_arguments(ctx, &call.name, &mut args, inputs, &artifacts).await;

            let record = match execute_tool(ctx, &call.name, args.clone(), None).await {
                Ok(raw) => {
                    let sanitized = artifact::sanitize_tool_result(&call.name, &raw, &mut artifacts);
                    if let Ok(parsed) = serde_json::from_str::<Value>(&raw) {
                        artifact::extract_files(&parsed, &mut files);
                    }
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": call.id,
                        "content": sanitized.clone(),
                    }));
                    ToolCallRecord {
                        name: call.name.clone(),
                        arguments: args,
                        result: Some(sanitized),
                        error: None,
                        success: true,
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": call.id,
                        "content": format!("Error: {}", message),
                    }));
                    ToolCallRecord {
                        name: call.name.clone(),
                        arguments: args,
                        result: None,
                        error: Some(message),
                        success: false,
                    }
                }
            };
            calls.push(record);
        }

        if repeated {
            final_content = outcome.content;
            break;
        }
    }

    // --- Output assembly ---
    let mut output = if timed_out {
        timeout_output(&calls, usage)
    } else {
        let mut out = JsonMap::new();
        out.insert("response".into(), Value::String(final_content.clone()));
        out
    };

    if let Some(t) = thinking {
        output.insert("thinking".into(), Value::String(t));
    }
    output.insert("model".into(), Value::String(model.clone()));
    output.insert(
        "toolCalls".into(),
        serde_json::to_value(&calls).unwrap_or(Value::Null),
    );
    output.insert("toolResults".into(), tool_results_map(&calls));
    promote_tool_fields(&mut output);
    output.insert("promptTokens".into(), json!(usage.prompt_tokens));
    output.insert("completionTokens".into(), json!(usage.completion_tokens));
    output.insert("totalTokens".into(), json!(usage.total_tokens));
    if !artifacts.is_empty() {
        output.insert(
            "artifacts".into(),
            serde_json::to_value(&artifacts).unwrap_or(Value::Null),
        );
    }
    if !files.is_empty() {
        output.insert("files".into(), Value::Array(files));
    }

    // --- Phase 2: schema formatting ---
    if let Some(schema_value) = output_schema {
        if !timed_out {
            format_structured(ctx, block, &provider, &model, schema_value, &mut output).await?;
        }
    }

    Ok((output, calls))
}

/// Call the chat endpoint with transient-error retry and breaker
/// integration, emitting `retrying` status updates on each wait.
async fn call_llm(
    ctx: &RunContext,
    block: &Block,
    provider: &Provider,
    request: &ChatRequest,
) -> Result<StreamOutcome> {
    let status = ctx.status.clone();
    let block_id = block.id.clone();
    let mut on_retry = move |attempt: u32, delay: std::time::Duration, c: &crate::error::Classified| {
        status.emit(StatusUpdate::retrying(
            &block_id,
            attempt,
            delay.as_millis() as u64,
            &c.detail,
        ));
    };

    retry_with_backoff(
        &ctx.agent.llm_retry,
        Some(ctx.breaker.as_ref()),
        Some(ctx.cancellation.as_ref()),
        Some(&mut on_retry),
        |_attempt| ChatClient::stream(&ctx.client, provider, request, None),
    )
    .await
}

/// Model resolution: direct lookup, alias, workflow override, default.
pub(crate) fn resolve_model(ctx: &RunContext, configured: &str) -> Result<(Provider, String)> {
    for candidate in [Some(configured), ctx.model_override.as_deref()]
        .into_iter()
        .flatten()
        .filter(|c| !c.is_empty())
    {
        if let Some(provider) = ctx.providers.by_model_id(candidate) {
            return Ok((provider, candidate.to_string()));
        }
        if let Some((provider, model)) = ctx.providers.resolve_alias(candidate) {
            return Ok((provider, model));
        }
    }
    ctx.providers
        .default_provider()
        .ok_or_else(|| EngineError::Other("no LLM provider available".into()))
}

/// The assistant message echoing the model's tool calls.
fn assistant_tool_message(outcome: &StreamOutcome) -> Value {
    let tool_calls: Vec<Value> = outcome
        .tool_calls
        .iter()
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.raw_arguments,
                }
            })
        })
        .collect();
    json!({
        "role": "assistant",
        "content": outcome.content,
        "tool_calls": tool_calls,
    })
}

/// Spec'd auto-injections: file text for `analyze_data`, the latest
/// chart for Discord/Slack message tools.
async fn auto_inject_arguments(
    ctx: &RunContext,
    tool_name: &str,
    args: &mut Value,
    inputs: &JsonMap,
    artifacts: &[Artifact],
) {
    if !args.is_object() {
        *args = Value::Object(Map::new());
    }
    let map = args.as_object_mut().expect("object ensured above");

    if tool_name == "analyze_data" {
        let csv_missing = map
            .get("csv_data")
            .and_then(Value::as_str)
            .map(str::is_empty)
            .unwrap_or(true);
        if csv_missing {
            let data_file = prompt::find_file_refs(inputs)
                .into_iter()
                .find(|r| !r.is_image());
            if let Some(file_ref) = data_file {
                if let Some(text) = prompt::read_file_text(ctx, &file_ref.file_id).await {
                    map.insert("csv_data".into(), Value::String(text));
                    map.remove("file_id");
                }
            }
        }
    }

    let is_messenger = (tool_name.contains("discord") || tool_name.contains("slack"))
        && (tool_name.contains("message") || tool_name.contains("send"));
    if is_messenger {
        let image_placeholder = map
            .get("image_data")
            .and_then(Value::as_str)
            .map(|s| s.is_empty() || s == artifact::CHART_MARKER || s.contains("placeholder"))
            .unwrap_or(true);
        if image_placeholder {
            // This run's charts first, then any upstream block's.
            let latest = artifacts
                .last()
                .map(|a| a.base64.clone())
                .or_else(|| upstream_chart(inputs));
            if let Some(payload) = latest {
                map.insert("image_data".into(), Value::String(payload));
            } else {
                map.remove("image_data");
            }
        }
    }
}

/// The most recent chart produced by an upstream block, if inputs carry
/// one.
fn upstream_chart(inputs: &JsonMap) -> Option<String> {
    let artifacts = inputs.get("artifacts")?.as_array()?;
    artifacts
        .iter()
        .rev()
        .find_map(|a| a.get("base64").and_then(Value::as_str))
        .map(|s| s.to_string())
}

/// Timeout result: partial work stays consumable downstream.
fn timeout_output(calls: &[ToolCallRecord], usage: TokenUsage) -> JsonMap {
    let combined = calls
        .iter()
        .filter_map(|c| c.result.as_deref())
        .collect::<Vec<_>>()
        .join("\n\n");
    let mut out = JsonMap::new();
    out.insert("timedOut".into(), Value::Bool(true));
    out.insert("response".into(), Value::String(combined));
    out.insert("totalTokens".into(), json!(usage.total_tokens));
    out
}

/// `toolResults` map keyed by tool name, JSON-parsed where possible.
fn tool_results_map(calls: &[ToolCallRecord]) -> Value {
    let mut map = Map::new();
    for call in calls {
        if let Some(result) = &call.result {
            let parsed = serde_json::from_str::<Value>(result)
                .unwrap_or_else(|_| Value::String(result.clone()));
            map.insert(call.name.clone(), parsed);
        }
    }
    Value::Object(map)
}

/// Promote common text fields from tool results to top-level keys when
/// not already present.
fn promote_tool_fields(output: &mut JsonMap) {
    let Some(Value::Object(results)) = output.get("toolResults").cloned() else {
        return;
    };
    for result in results.values() {
        let Value::Object(result) = result else { continue };
        for field in PROMOTED_FIELDS {
            if output.contains_key(field) {
                continue;
            }
            if let Some(value) = result.get(field) {
                output.insert(field.to_string(), value.clone());
            }
        }
    }
}

/// Phase 2: dedicated formatting call producing schema-shaped output.
async fn format_structured(
    ctx: &RunContext,
    block: &Block,
    provider: &Provider,
    model: &str,
    schema_value: &Value,
    output: &mut JsonMap,
) -> Result<()> {
    let content = output
        .get("response")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_results = output
        .get("toolResults")
        .map(|v| v.to_string())
        .unwrap_or_default();

    let request = ChatRequest {
        model: model.to_string(),
        messages: vec![
            json!({"role": "system", "content": schema::formatter_system_prompt(schema_value)}),
            json!({"role": "user", "content": format!(
                "Content to format:\n{}\n\nTool results:\n{}",
                content, tool_results
            )}),
        ],
        temperature: 0.1,
        max_tokens: None,
        tools: None,
        response_format: if ctx.agent.supports_strict_schema(model) {
            Some(schema::response_format(schema_value))
        } else {
            None
        },
    };

    let outcome = call_llm(ctx, block, provider, &request).await?;
    let parsed = crate::llm::json::extract_json(&outcome.content);

    match parsed {
        Some(structured) => {
            let violations = schema::validate(&structured, schema_value);
            if violations.is_empty() {
                merge_structured(output, &structured);
            } else if block.config_bool("strictValidation") {
                return Err(EngineError::Validation(violations.join("; ")));
            } else {
                // Keep the unvalidated parse, flag the mismatch.
                merge_structured(output, &structured);
                output.insert("_validationError".into(), json!(violations.join("; ")));
                output.insert("rawResponse".into(), Value::String(content));
            }
        }
        None => {
            output.insert(
                "_formatError".into(),
                json!("formatter response was not valid JSON"),
            );
            output.insert("rawResponse".into(), Value::String(outcome.content));
        }
    }
    Ok(())
}

/// Merge structured fields under `response`/`data` and spread them at
/// the top level.
fn merge_structured(output: &mut JsonMap, structured: &Value) {
    output.insert("response".into(), structured.clone());
    output.insert("data".into(), structured.clone());
    if let Value::Object(fields) = structured {
        for (key, value) in fields {
            output.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

fn accumulate_usage(total: &mut TokenUsage, delta: TokenUsage) {
    total.prompt_tokens += delta.prompt_tokens;
    total.completion_tokens += delta.completion_tokens;
    total.total_tokens += delta.total_tokens;
}
