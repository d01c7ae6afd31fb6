//! Projection of an [`ExecutionResult`] into the consumer-facing API
//! response: terminal result + structured data, per-block summaries,
//! aggregated artifacts and files, and run metadata. Engine-internal
//! fields are stripped.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::model::{BlockStatus, ExecutionResult, RunStatus};

/// Keys stripped from user-facing block outputs: internal bookkeeping,
/// model ids, and raw tool-call dumps.
fn is_internal_key(key: &str) -> bool {
    key.starts_with('_') || key == "model" || key == "toolCalls"
}

/// Run metadata attached to the response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub total_tokens: u64,
    pub duration_ms: u64,
    pub engine_version: &'static str,
}

/// Per-block summary in the response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSummary {
    pub status: BlockStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// The consumer-facing projection of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub status: RunStatus,
    /// Flattened text result from the terminal blocks.
    pub result: String,
    /// Structured payload from the last terminal block that had one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Per-block output summaries keyed by block id.
    pub blocks: Map<String, Value>,
    pub artifacts: Vec<Value>,
    pub files: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: ResponseMetadata,
}

/// Shape an execution result for API consumers.
pub fn shape_response(result: &ExecutionResult) -> ApiResponse {
    // Terminal outputs in key order; "last" is well-defined that way.
    let mut terminal_ids: Vec<&String> = result.output.keys().collect();
    terminal_ids.sort();

    let mut text_result = String::new();
    let mut data = None;
    for id in &terminal_ids {
        let Some(output) = result.output.get(*id).and_then(Value::as_object) else {
            continue;
        };
        if let Some(response) = output.get("response") {
            text_result = match response {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if !response.is_string() {
                data = Some(response.clone());
            }
        }
        if let Some(structured) = output.get("data") {
            if structured.is_object() || structured.is_array() {
                data = Some(structured.clone());
            }
        }
    }

    // Per-block summaries plus artifact/file aggregation from every
    // block's state snapshot.
    let mut blocks = Map::new();
    let mut artifacts = Vec::new();
    let mut files = Vec::new();
    let mut ids: Vec<&String> = result.block_states.keys().collect();
    ids.sort();
    for id in ids {
        let state = &result.block_states[id];
        let output = state.outputs.as_ref().and_then(Value::as_object);

        if let Some(output) = output {
            if let Some(Value::Array(block_artifacts)) = output.get("artifacts") {
                for artifact in block_artifacts {
                    let mut tagged = artifact.clone();
                    if let Some(obj) = tagged.as_object_mut() {
                        obj.insert("sourceBlock".into(), Value::String(id.clone()));
                    }
                    artifacts.push(tagged);
                }
            }
            if let Some(Value::Array(block_files)) = output.get("files") {
                files.extend(block_files.iter().cloned());
            }
        }

        let summary = BlockSummary {
            status: state.status,
            error: state.error.clone(),
            output: output.map(|o| Value::Object(strip_internal(o))),
        };
        blocks.insert(
            id.clone(),
            serde_json::to_value(summary).unwrap_or(Value::Null),
        );
    }

    ApiResponse {
        status: result.status,
        result: text_result,
        data,
        blocks,
        artifacts,
        files,
        error: result.error.clone(),
        metadata: ResponseMetadata {
            total_tokens: result.total_tokens,
            duration_ms: result.duration_ms,
            engine_version: env!("CARGO_PKG_VERSION"),
        },
    }
}

fn strip_internal(output: &Map<String, Value>) -> Map<String, Value> {
    output
        .iter()
        .filter(|(k, _)| !is_internal_key(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
