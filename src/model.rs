//! Workflow data model: blocks, connections, variables, per-run block
//! state, and the block status state machine.
//!
//! These types are the wire format the host hands to the engine. All of
//! them derive `Serialize`/`Deserialize`; config payloads stay as raw
//! [`serde_json`] maps because every block type interprets its own keys.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// A JSON object — the wire type for block configs, inputs, and outputs.
pub type JsonMap = Map<String, Value>;

/// Keys the runtime claims for itself. Workflow variables must not use
/// them, and the template pre-flight check treats them as always valid.
pub const RESERVED_KEYS: [&str; 8] = [
    "input", "value", "response", "data", "result", "output", "item", "index",
];

/// The fixed set of block types known to the executor registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Variable,
    LlmInference,
    CodeBlock,
    HttpRequest,
    IfCondition,
    Switch,
    Filter,
    Sort,
    Limit,
    Deduplicate,
    Merge,
    Aggregate,
    Transform,
    ForEach,
    InlineCode,
    SubAgent,
    WebhookTrigger,
    ScheduleTrigger,
    Wait,
}

impl BlockType {
    /// The snake_case name used in workflow definitions and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Variable => "variable",
            BlockType::LlmInference => "llm_inference",
            BlockType::CodeBlock => "code_block",
            BlockType::HttpRequest => "http_request",
            BlockType::IfCondition => "if_condition",
            BlockType::Switch => "switch",
            BlockType::Filter => "filter",
            BlockType::Sort => "sort",
            BlockType::Limit => "limit",
            BlockType::Deduplicate => "deduplicate",
            BlockType::Merge => "merge",
            BlockType::Aggregate => "aggregate",
            BlockType::Transform => "transform",
            BlockType::ForEach => "for_each",
            BlockType::InlineCode => "inline_code",
            BlockType::SubAgent => "sub_agent",
            BlockType::WebhookTrigger => "webhook_trigger",
            BlockType::ScheduleTrigger => "schedule_trigger",
            BlockType::Wait => "wait",
        }
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-block retry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    /// Maximum retries after the initial attempt. 0 disables retry.
    #[serde(default)]
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    #[serde(default)]
    pub backoff_ms: u64,
    /// Backoff cap in milliseconds.
    #[serde(default)]
    pub max_backoff_ms: u64,
    /// Error-type tokens to retry on (`rate_limit`, `server_error`,
    /// `timeout`, `network_error`, `all_transient`). Empty = all retryable.
    #[serde(default)]
    pub retry_on: Vec<String>,
}

/// A node in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Unique within the workflow. Kebab-case by convention.
    pub id: String,
    /// Human-readable label.
    #[serde(default)]
    pub name: String,
    /// Which executor runs this block.
    #[serde(rename = "type")]
    pub block_type: BlockType,
    /// Free-form, executor-interpreted configuration.
    #[serde(default)]
    pub config: JsonMap,
    /// Per-block timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Per-block retry policy.
    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

impl Block {
    /// Minimal constructor for programmatic workflow assembly.
    pub fn new(id: impl Into<String>, block_type: BlockType) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            block_type,
            config: JsonMap::new(),
            timeout: None,
            retry: None,
        }
    }

    /// Set a config key (builder style).
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// String config accessor; empty string if missing or not a string.
    pub fn config_str(&self, key: &str) -> &str {
        self.config.get(key).and_then(Value::as_str).unwrap_or("")
    }

    /// Unsigned config accessor.
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(Value::as_u64)
    }

    /// Boolean config accessor, `false` when absent.
    pub fn config_bool(&self, key: &str) -> bool {
        self.config.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Display name: the block name when set, otherwise the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A directed edge between blocks, optionally tagged with a source port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Upstream block id.
    pub source: String,
    /// Downstream block id.
    pub target: String,
    /// Port name gating this edge. Empty or `"output"` is the default
    /// port; `"true"`/`"false"`, switch case labels, `"loop_body"`, and
    /// `"done"` gate conditional routing.
    #[serde(default)]
    pub source_output: String,
}

impl Connection {
    /// Create a default-port connection.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_output: String::new(),
        }
    }

    /// Create a connection on a named port.
    pub fn on_port(
        source: impl Into<String>,
        target: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_output: port.into(),
        }
    }

    /// Whether this edge rides the default output port.
    pub fn is_default_port(&self) -> bool {
        self.source_output.is_empty() || self.source_output == "output"
    }
}

/// A named workflow input with an optional default value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub default: Option<Value>,
}

/// A workflow definition: blocks, connections, and input variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub variables: Vec<Variable>,
    /// Workflow deadline in seconds. Engine default applies when unset.
    #[serde(default)]
    pub workflow_timeout: Option<u64>,
    /// Per-run parallelism bound. Engine default applies when unset.
    #[serde(default)]
    pub max_parallel_blocks: Option<usize>,
    /// Workflow-level model override for LLM blocks.
    #[serde(default)]
    pub workflow_model_id: Option<String>,
}

impl Workflow {
    /// Look up a block by id.
    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Structural validation: unique block ids, connection endpoints that
    /// exist, and variable names that avoid runtime-reserved keys.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for block in &self.blocks {
            if !seen.insert(block.id.as_str()) {
                return Err(crate::EngineError::InvalidWorkflow(format!(
                    "duplicate block id '{}'",
                    block.id
                )));
            }
        }
        for conn in &self.connections {
            for endpoint in [&conn.source, &conn.target] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(crate::EngineError::InvalidWorkflow(format!(
                        "connection references unknown block '{}'",
                        endpoint
                    )));
                }
            }
        }
        for var in &self.variables {
            if RESERVED_KEYS.contains(&var.name.as_str()) {
                return Err(crate::EngineError::InvalidWorkflow(format!(
                    "variable name '{}' collides with a runtime-reserved key",
                    var.name
                )));
            }
        }
        Ok(())
    }
}

/// Block lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Skipped,
}

impl BlockStatus {
    /// Whether this status ends the block's lifecycle (for-each reset
    /// aside).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BlockStatus::Completed | BlockStatus::Failed | BlockStatus::Skipped
        )
    }

    /// Whether the state machine permits `self -> to`.
    ///
    /// Terminal states may only return to `pending`, which the for-each
    /// driver uses to reset its subgraph between iterations.
    pub fn can_transition(&self, to: BlockStatus) -> bool {
        use BlockStatus::*;
        match (self, to) {
            (Pending, Running) | (Pending, Skipped) => true,
            (Running, Completed) | (Running, Failed) | (Running, Retrying) | (Running, Skipped) => {
                true
            }
            (Retrying, Running) | (Retrying, Completed) | (Retrying, Failed) => true,
            (Completed, Pending) | (Failed, Pending) | (Skipped, Pending) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Pending => "pending",
            BlockStatus::Running => "running",
            BlockStatus::Retrying => "retrying",
            BlockStatus::Completed => "completed",
            BlockStatus::Failed => "failed",
            BlockStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded retry attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryAttempt {
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// The error that triggered the retry.
    pub error: String,
    /// Backoff delay applied before the retry.
    pub delay_ms: u64,
    pub at: DateTime<Utc>,
}

/// Per-run, per-block execution state. Owned exclusively by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockState {
    pub status: BlockStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Snapshot of the inputs the block executed with.
    pub inputs: Option<Value>,
    /// Snapshot of the outputs the block produced.
    pub outputs: Option<Value>,
    pub retry_count: u32,
    pub retry_history: Vec<RetryAttempt>,
}

impl BlockState {
    /// Fresh state in `pending`.
    pub fn new() -> Self {
        Self {
            status: BlockStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            inputs: None,
            outputs: None,
            retry_count: 0,
            retry_history: Vec::new(),
        }
    }

    /// Attempt a status transition. Invalid transitions are rejected:
    /// logged, state preserved, `false` returned.
    pub fn transition(&mut self, block_id: &str, to: BlockStatus) -> bool {
        if !self.status.can_transition(to) {
            warn!(
                block = block_id,
                from = self.status.as_str(),
                to = to.as_str(),
                "rejected invalid block status transition"
            );
            return false;
        }
        match to {
            BlockStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            BlockStatus::Completed | BlockStatus::Failed | BlockStatus::Skipped => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        self.status = to;
        true
    }

    /// Reset to `pending` for a new for-each iteration, clearing all
    /// per-attempt data.
    pub fn reset_for_iteration(&mut self) {
        self.status = BlockStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.inputs = None;
        self.outputs = None;
        self.retry_count = 0;
        self.retry_history.clear();
    }
}

impl Default for BlockState {
    fn default() -> Self {
        Self::new()
    }
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every dispatched block completed.
    Completed,
    /// Some blocks completed, some failed.
    Partial,
    /// No block completed.
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// The outcome of a workflow run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: RunStatus,
    /// Terminal-block outputs keyed by block id.
    pub output: JsonMap,
    /// Final per-block states.
    pub block_states: HashMap<String, BlockState>,
    /// Aggregated error string, when any block failed.
    pub error: Option<String>,
    /// Total LLM tokens consumed across the run.
    pub total_tokens: u64,
    /// Wall-clock duration of the run.
    pub duration_ms: u64,
}

/// Normalize a block id for template references: lowercase, with every
/// non-alphanumeric run collapsed to a single underscore.
pub fn normalize_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    let mut last_underscore = false;
    for ch in id.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore && !out.is_empty() {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Safe-identifier check for file ids: alphanumerics, `-`, `_`, and `.`
/// only, with no traversal sequences.
pub fn is_safe_identifier(s: &str) -> bool {
    !s.is_empty()
        && !s.contains("..")
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
