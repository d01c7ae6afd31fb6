//! Tool-result sanitizing and artifact extraction.
//!
//! Chart-generating tools embed base64 images in their JSON results.
//! Feeding those back to the model wastes context and confuses it, so
//! the payloads are extracted into [`Artifact`]s and replaced with a
//! `[CHART_IMAGE_SAVED]` marker before the result re-enters the
//! conversation. Results are also capped in size.

use serde::Serialize;
use serde_json::{Map, Value};

/// Marker substituted for extracted image payloads.
pub const CHART_MARKER: &str = "[CHART_IMAGE_SAVED]";

/// Cap applied to sanitized tool results fed back to the model.
pub const TOOL_RESULT_CAP: usize = 20 * 1024;

/// Minimum length before a string is even considered a base64 payload.
const BASE64_MIN_LEN: usize = 512;

/// Result fields treated as image payloads.
const IMAGE_FIELDS: [&str; 5] = ["image", "plot", "chart", "figure", "image_data"];

/// A binary output extracted from a tool result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Artifact kind; currently always `"image"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload format (`png`, unless the data URL says otherwise).
    pub format: String,
    /// Base64 payload, data-URL prefix stripped.
    pub base64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Tool that produced the artifact.
    pub source_tool: String,
    /// Block that ran the tool; filled by the response shaper.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_block: Option<String>,
}

/// Walk a tool result, pull image payloads into `artifacts`, and return
/// the sanitized value with markers in their place.
pub fn extract_artifacts(tool_name: &str, result: &Value, artifacts: &mut Vec<Artifact>) -> Value {
    match result {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                let sanitized = match (key.as_str(), value) {
                    ("plots" | "base64_images", Value::Array(items)) => {
                        let markers: Vec<Value> = items
                            .iter()
                            .map(|item| {
                                if let Some(payload) = image_payload(item) {
                                    push_artifact(tool_name, payload, None, artifacts);
                                    Value::String(CHART_MARKER.into())
                                } else {
                                    extract_artifacts(tool_name, item, artifacts)
                                }
                            })
                            .collect();
                        Value::Array(markers)
                    }
                    (field, value) if IMAGE_FIELDS.contains(&field) => {
                        if let Some(payload) = image_payload(value) {
                            let title = map.get("title").and_then(Value::as_str);
                            push_artifact(tool_name, payload, title, artifacts);
                            Value::String(CHART_MARKER.into())
                        } else {
                            extract_artifacts(tool_name, value, artifacts)
                        }
                    }
                    (_, value) => extract_artifacts(tool_name, value, artifacts),
                };
                out.insert(key.clone(), sanitized);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| extract_artifacts(tool_name, item, artifacts))
                .collect(),
        ),
        Value::String(s) if looks_like_image_payload(s) => {
            push_artifact(tool_name, s, None, artifacts);
            Value::String(CHART_MARKER.into())
        }
        other => other.clone(),
    }
}

/// Sanitize a raw tool result for the conversation: extract artifacts
/// when the result is JSON, then cap the length.
pub fn sanitize_tool_result(
    tool_name: &str,
    raw: &str,
    artifacts: &mut Vec<Artifact>,
) -> String {
    let sanitized = match serde_json::from_str::<Value>(raw) {
        Ok(parsed) => extract_artifacts(tool_name, &parsed, artifacts).to_string(),
        Err(_) => raw.to_string(),
    };
    cap(&sanitized, TOOL_RESULT_CAP)
}

/// Collect file references (`{file_id, filename, …}`) from a tool
/// result's `files` arrays.
pub fn extract_files(result: &Value, files: &mut Vec<Value>) {
    match result {
        Value::Object(map) => {
            if let Some(Value::Array(entries)) = map.get("files") {
                for entry in entries {
                    if entry.get("file_id").is_some() {
                        files.push(entry.clone());
                    }
                }
            }
            for value in map.values() {
                extract_files(value, files);
            }
        }
        Value::Array(items) => {
            for item in items {
                extract_files(item, files);
            }
        }
        _ => {}
    }
}

fn push_artifact(
    tool_name: &str,
    payload: &str,
    title: Option<&str>,
    artifacts: &mut Vec<Artifact>,
) {
    let (format, base64) = split_data_url(payload);
    artifacts.push(Artifact {
        kind: "image".into(),
        format,
        base64: base64.to_string(),
        title: title.map(|t| t.to_string()),
        source_tool: tool_name.to_string(),
        source_block: None,
    });
}

/// The base64 string inside an item: either the value itself or its
/// `image`/`data` field.
fn image_payload(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) if looks_like_image_payload(s) => Some(s),
        Value::Object(map) => map
            .get("image")
            .or_else(|| map.get("data"))
            .and_then(Value::as_str)
            .filter(|s| looks_like_image_payload(s)),
        _ => None,
    }
}

/// Heuristic for base64 image payloads: a data URL, a known magic
/// prefix, or a long unbroken base64 run.
fn looks_like_image_payload(s: &str) -> bool {
    if s.starts_with("data:image/") {
        return true;
    }
    // PNG and JPEG magic bytes in base64.
    if s.starts_with("iVBORw0KGgo") || s.starts_with("/9j/") {
        return true;
    }
    s.len() >= BASE64_MIN_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

/// Split a data URL into (format, payload); bare payloads default to
/// png.
fn split_data_url(payload: &str) -> (String, &str) {
    if let Some(rest) = payload.strip_prefix("data:image/") {
        if let Some((format, data)) = rest.split_once(";base64,") {
            return (format.to_string(), data);
        }
    }
    ("png".to_string(), payload)
}

fn cap(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… [truncated]", &s[..end])
}
