//! Per-chunk accumulator for streamed chat completions.
//!
//! Collects content deltas, tool-call argument fragments (keyed by the
//! provider-assigned index), the finish reason, and usage. Reasoning
//! spans (`<think>…</think>`) are stripped from the final content and
//! surfaced separately.

use std::collections::BTreeMap;

use serde_json::Value;

use super::json::extract_json;

/// Token counts reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    fn from_value(v: &Value) -> Self {
        let get = |key: &str| v.get(key).and_then(Value::as_u64).unwrap_or(0);
        Self {
            prompt_tokens: get("prompt_tokens"),
            completion_tokens: get("completion_tokens"),
            total_tokens: get("total_tokens"),
        }
    }
}

/// One tool call requested by the model, with arguments parsed leniently.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Provider-assigned call id, echoed back in the tool message.
    pub id: String,
    pub name: String,
    /// Parsed arguments; `Null` when the raw fragment never became JSON.
    pub arguments: Value,
    /// The raw accumulated argument text.
    pub raw_arguments: String,
}

#[derive(Debug, Default)]
struct ToolCallDraft {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates streamed chunks into a final outcome.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    tool_calls: BTreeMap<usize, ToolCallDraft>,
    finish_reason: Option<String>,
    usage: TokenUsage,
    model: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one parsed SSE chunk.
    pub fn absorb(&mut self, chunk: &Value) {
        if let Some(usage) = chunk.get("usage") {
            if !usage.is_null() {
                self.usage = TokenUsage::from_value(usage);
            }
        }
        if self.model.is_none() {
            if let Some(model) = chunk.get("model").and_then(Value::as_str) {
                self.model = Some(model.to_string());
            }
        }

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            return;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }

        // Streaming chunks carry a `delta`; non-streaming responses a
        // full `message`. Both shapes land here.
        let body = choice.get("delta").or_else(|| choice.get("message"));
        let Some(body) = body else { return };

        if let Some(content) = body.get("content").and_then(Value::as_str) {
            self.content.push_str(content);
        }

        if let Some(calls) = body.get("tool_calls").and_then(Value::as_array) {
            for (position, call) in calls.iter().enumerate() {
                let index = call
                    .get("index")
                    .and_then(Value::as_u64)
                    .map(|i| i as usize)
                    .unwrap_or(position);
                let draft = self.tool_calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    draft.id = id.to_string();
                }
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        draft.name.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        draft.arguments.push_str(args);
                    }
                }
            }
        }
    }

    /// Whether any tool call has been observed so far.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Finalize into a [`StreamOutcome`].
    pub fn finish(self) -> StreamOutcome {
        let (thinking, content) = extract_thinking(&self.content);
        let tool_calls = self
            .tool_calls
            .into_values()
            .filter(|draft| !draft.name.is_empty())
            .map(|draft| {
                let arguments = if draft.arguments.trim().is_empty() {
                    Value::Object(serde_json::Map::new())
                } else {
                    extract_json(&draft.arguments).unwrap_or(Value::Null)
                };
                ToolCallRequest {
                    id: draft.id,
                    name: draft.name,
                    arguments,
                    raw_arguments: draft.arguments,
                }
            })
            .collect();

        StreamOutcome {
            content,
            thinking,
            tool_calls,
            finish_reason: self.finish_reason,
            usage: self.usage,
            model: self.model,
        }
    }
}

/// The assembled result of one streamed (or whole) chat completion.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub content: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub finish_reason: Option<String>,
    pub usage: TokenUsage,
    pub model: Option<String>,
}

impl StreamOutcome {
    /// The loop exits when the model says it is done or asked for
    /// nothing further.
    pub fn is_final(&self) -> bool {
        matches!(self.finish_reason.as_deref(), Some("stop") | Some("end_turn"))
            || self.tool_calls.is_empty()
    }
}

/// Split `<think>…</think>` (or `<thinking>…</thinking>`) spans out of
/// the content. Multiple spans concatenate.
pub fn extract_thinking(text: &str) -> (Option<String>, String) {
    let mut thinking = String::new();
    let mut cleaned = String::with_capacity(text.len());
    let mut rest = text;

    loop {
        let open = rest.find("<think>").map(|i| (i, "<think>", "</think>"));
        let open = match open {
            Some(o) => Some(o),
            None => rest
                .find("<thinking>")
                .map(|i| (i, "<thinking>", "</thinking>")),
        };
        let Some((start, open_tag, close_tag)) = open else {
            cleaned.push_str(rest);
            break;
        };
        cleaned.push_str(&rest[..start]);
        let after = &rest[start + open_tag.len()..];
        match after.find(close_tag) {
            Some(end) => {
                if !thinking.is_empty() {
                    thinking.push('\n');
                }
                thinking.push_str(after[..end].trim());
                rest = &after[end + close_tag.len()..];
            }
            None => {
                // Unclosed tag: everything after it is reasoning.
                if !thinking.is_empty() {
                    thinking.push('\n');
                }
                thinking.push_str(after.trim());
                break;
            }
        }
    }

    let thinking = if thinking.is_empty() {
        None
    } else {
        Some(thinking)
    };
    (thinking, cleaned.trim().to_string())
}
