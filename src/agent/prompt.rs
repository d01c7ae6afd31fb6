//! Message assembly for the agent loop: system preamble, tool catalog,
//! retry notices, data context, and file/image injection.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::collab::ToolSpec;
use crate::context::RunContext;
use crate::error::Result;
use crate::model::JsonMap;
use crate::template;

/// Per-entry cap on upstream output summaries in the data context.
const SUMMARY_CAP: usize = 1500;
/// Line cap on injected data-file previews.
const DATA_FILE_LINES: usize = 100;

/// The mandatory workflow-execution-mode preamble.
pub const SYSTEM_PREAMBLE: &str = "\
You are executing one step of an automated workflow. Act immediately on \
the task below. Use the available tools when they help. Never ask the \
user questions — there is no user to answer them. Never fabricate data \
you could obtain with a tool. Produce the step's output directly.";

/// Human-readable catalog of available tools, appended to the system
/// prompt when tool calling is enabled.
pub fn tool_catalog(tools: &[ToolSpec]) -> String {
    if tools.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\nAvailable tools:\n");
    for tool in tools {
        out.push_str(&format!("- {}: {}", tool.name, tool.description));
        if let Some(params) = key_parameters(&tool.parameters) {
            out.push_str(&format!(" (parameters: {})", params));
        }
        out.push('\n');
    }
    out
}

/// The key parameter names out of a JSON-schema-shaped descriptor.
fn key_parameters(parameters: &Value) -> Option<String> {
    let properties = parameters.get("properties")?.as_object()?;
    if properties.is_empty() {
        return None;
    }
    Some(
        properties
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Retry notice injected when the attempt follows a validation failure.
pub fn retry_notice(inputs: &JsonMap) -> Option<String> {
    let attempt = inputs.get("_retryAttempt").and_then(Value::as_u64)?;
    let reason = inputs
        .get("_retryReason")
        .and_then(Value::as_str)
        .unwrap_or("the previous attempt failed validation");
    Some(format!(
        "\n\nIMPORTANT: this is retry attempt {}. The previous attempt \
         failed because: {}. Correct this in your response.",
        attempt, reason
    ))
}

/// Data-context section: current date/time plus a bounded summary of
/// every upstream input.
pub fn data_context(inputs: &JsonMap) -> String {
    let mut out = format!(
        "\n\nCurrent date and time: {}\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );

    let mut entries: Vec<(&String, &Value)> = inputs
        .iter()
        .filter(|(k, v)| !k.starts_with('_') && !v.is_null())
        .collect();
    if entries.is_empty() {
        return out;
    }
    entries.sort_by(|a, b| a.0.cmp(b.0));

    out.push_str("\nData from previous workflow steps:\n");
    for (key, value) in entries {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out.push_str(&format!("- {}: {}\n", key, truncate(&rendered, SUMMARY_CAP)));
    }
    out
}

/// A file reference found in the block's inputs.
#[derive(Debug, Clone)]
pub struct FileRef {
    pub file_id: String,
    pub mime_type: String,
    pub filename: String,
}

impl FileRef {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Collect file references (`{file_id, mime_type, …}` objects) from the
/// inputs, one level of nesting deep.
pub fn find_file_refs(inputs: &JsonMap) -> Vec<FileRef> {
    let mut refs = Vec::new();
    for value in inputs.values() {
        collect_file_ref(value, &mut refs);
        if let Value::Object(map) = value {
            for nested in map.values() {
                collect_file_ref(nested, &mut refs);
            }
        }
    }
    refs
}

fn collect_file_ref(value: &Value, refs: &mut Vec<FileRef>) {
    let Value::Object(map) = value else { return };
    let (Some(file_id), Some(mime_type)) = (
        map.get("file_id").and_then(Value::as_str),
        map.get("mime_type").and_then(Value::as_str),
    ) else {
        return;
    };
    if refs.iter().any(|r| r.file_id == file_id) {
        return;
    }
    refs.push(FileRef {
        file_id: file_id.to_string(),
        mime_type: mime_type.to_string(),
        filename: map
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or("file")
            .to_string(),
    });
}

/// Build the user message. Image attachments on a vision-capable model
/// produce mixed text + image-URL parts; otherwise plain text.
pub async fn build_user_message(
    ctx: &RunContext,
    prompt: &str,
    inputs: &JsonMap,
    model: &str,
) -> Result<Value> {
    let rendered = template::render_string(prompt, &Value::Object(inputs.clone()));
    let mut text = rendered;

    let refs = find_file_refs(inputs);

    // Data files inject a bounded preview as a fenced block.
    for file_ref in refs.iter().filter(|r| is_data_file(&r.mime_type)) {
        if let Some(preview) = read_file_preview(ctx, &file_ref.file_id).await {
            text.push_str(&format!(
                "\n\nAttached file `{}` (first {} lines):\n```\n{}\n```",
                file_ref.filename, DATA_FILE_LINES, preview
            ));
        }
    }

    let images: Vec<&FileRef> = refs.iter().filter(|r| r.is_image()).collect();
    if images.is_empty() || !ctx.agent.supports_vision(model) {
        return Ok(json!({"role": "user", "content": text}));
    }

    let mut parts = vec![json!({"type": "text", "text": text})];
    for image in images {
        match read_file_base64(ctx, &image.file_id).await {
            Some(payload) => parts.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:{};base64,{}", image.mime_type, payload)
                }
            })),
            None => warn!(file = %image.file_id, "image file unavailable, skipping"),
        }
    }
    Ok(json!({"role": "user", "content": parts}))
}

fn is_data_file(mime_type: &str) -> bool {
    matches!(
        mime_type,
        "text/csv" | "application/json" | "text/plain"
    ) || mime_type.contains("spreadsheet")
        || mime_type.contains("excel")
}

/// Read the first [`DATA_FILE_LINES`] lines of a cached file.
pub async fn read_file_preview(ctx: &RunContext, file_id: &str) -> Option<String> {
    let entry = ctx.files.as_ref()?.get(file_id)?;
    let content = tokio::fs::read_to_string(&entry.path).await.ok()?;
    Some(
        content
            .lines()
            .take(DATA_FILE_LINES)
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Read a cached file's full content as standard base64.
pub async fn read_file_base64(ctx: &RunContext, file_id: &str) -> Option<String> {
    let entry = ctx.files.as_ref()?.get(file_id)?;
    let bytes = tokio::fs::read(&entry.path).await.ok()?;
    Some(BASE64.encode(bytes))
}

/// Read a cached file's full text content (for `analyze_data`
/// auto-injection).
pub async fn read_file_text(ctx: &RunContext, file_id: &str) -> Option<String> {
    let entry = ctx.files.as_ref()?.get(file_id)?;
    tokio::fs::read_to_string(&entry.path).await.ok()
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
