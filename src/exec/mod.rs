//! Block executors: the object-safe trait, the type registry, and the
//! deterministic executor catalog.
//!
//! Every block type maps to one stateless executor. Executors receive
//! read-only inputs and return a fresh output map; they never retain
//! references after returning and never mutate shared state — the
//! dispatcher owns all bookkeeping.

pub mod collection;
pub mod condition;
pub mod http;
pub mod inline_code;
pub mod subagent;
pub mod tool;
pub mod transform;
pub mod trigger;
pub mod variable;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::context::RunContext;
use crate::error::Result;
use crate::model::{Block, BlockType, JsonMap};

/// A boxed, pinned, Send future — the return type of
/// [`BlockExecutor::execute`].
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe trait implemented by every block executor.
///
/// Executors are pure with respect to the engine: `(ctx, block, inputs)
/// -> output`. They may perform network I/O and must honor the context's
/// cancellation flag around long operations.
pub trait BlockExecutor: Send + Sync {
    /// Stable identifier for logging (matches the block type name).
    fn kind(&self) -> &'static str;

    /// Execute the block against its resolved inputs.
    fn execute<'a>(
        &'a self,
        ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>>;
}

/// Registry mapping block types to executors.
pub struct ExecutorRegistry {
    map: HashMap<BlockType, Arc<dyn BlockExecutor>>,
}

impl ExecutorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Registry with the full built-in executor catalog.
    ///
    /// `for_each` is intentionally absent: the engine drives it through
    /// the dedicated sub-graph iterator rather than a plain executor.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(BlockType::Variable, Arc::new(variable::VariableExecutor));
        registry.register(BlockType::HttpRequest, Arc::new(http::HttpRequestExecutor));
        registry.register(
            BlockType::IfCondition,
            Arc::new(condition::IfConditionExecutor),
        );
        registry.register(BlockType::Switch, Arc::new(condition::SwitchExecutor));
        registry.register(BlockType::Filter, Arc::new(collection::FilterExecutor));
        registry.register(BlockType::Sort, Arc::new(collection::SortExecutor));
        registry.register(BlockType::Limit, Arc::new(collection::LimitExecutor));
        registry.register(
            BlockType::Deduplicate,
            Arc::new(collection::DeduplicateExecutor),
        );
        registry.register(BlockType::Merge, Arc::new(collection::MergeExecutor));
        registry.register(
            BlockType::Aggregate,
            Arc::new(collection::AggregateExecutor),
        );
        registry.register(BlockType::Transform, Arc::new(transform::TransformExecutor));
        registry.register(BlockType::Wait, Arc::new(transform::WaitExecutor));
        registry.register(BlockType::CodeBlock, Arc::new(tool::ToolBlockExecutor));
        registry.register(
            BlockType::InlineCode,
            Arc::new(inline_code::InlineCodeExecutor),
        );
        registry.register(BlockType::SubAgent, Arc::new(subagent::SubAgentExecutor));
        registry.register(
            BlockType::WebhookTrigger,
            Arc::new(trigger::WebhookTriggerExecutor),
        );
        registry.register(
            BlockType::ScheduleTrigger,
            Arc::new(trigger::ScheduleTriggerExecutor),
        );
        registry.register(
            BlockType::LlmInference,
            Arc::new(crate::agent::AgentExecutor::new()),
        );
        registry
    }

    /// Register (or replace) an executor for a block type.
    pub fn register(&mut self, block_type: BlockType, executor: Arc<dyn BlockExecutor>) {
        self.map.insert(block_type, executor);
    }

    /// Look up the executor for a block type.
    pub fn get(&self, block_type: BlockType) -> Option<Arc<dyn BlockExecutor>> {
        self.map.get(&block_type).cloned()
    }

    /// Whether the engine can run this block type. `for_each` is always
    /// supported via the dedicated driver.
    pub fn supports(&self, block_type: BlockType) -> bool {
        block_type == BlockType::ForEach || self.map.contains_key(&block_type)
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Wrap an input map as a template scope.
pub(crate) fn scope_of(inputs: &JsonMap) -> Value {
    Value::Object(inputs.clone())
}

/// Copy non-internal keys (`_`-prefixed keys are engine bookkeeping)
/// from `inputs` into `out`.
pub(crate) fn passthrough_inputs(inputs: &JsonMap, out: &mut JsonMap) {
    for (k, v) in inputs {
        if !k.starts_with('_') && !out.contains_key(k) {
            out.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_covers_catalog() {
        let registry = ExecutorRegistry::with_defaults();
        for block_type in [
            BlockType::Variable,
            BlockType::LlmInference,
            BlockType::CodeBlock,
            BlockType::HttpRequest,
            BlockType::IfCondition,
            BlockType::Switch,
            BlockType::Filter,
            BlockType::Sort,
            BlockType::Limit,
            BlockType::Deduplicate,
            BlockType::Merge,
            BlockType::Aggregate,
            BlockType::Transform,
            BlockType::InlineCode,
            BlockType::SubAgent,
            BlockType::WebhookTrigger,
            BlockType::ScheduleTrigger,
            BlockType::Wait,
        ] {
            assert!(registry.get(block_type).is_some(), "missing {}", block_type);
        }
    }

    #[test]
    fn test_for_each_supported_without_executor() {
        let registry = ExecutorRegistry::with_defaults();
        assert!(registry.get(BlockType::ForEach).is_none());
        assert!(registry.supports(BlockType::ForEach));
    }

    #[test]
    fn test_passthrough_skips_internal_keys() {
        let mut inputs = JsonMap::new();
        inputs.insert("data".into(), serde_json::json!(1));
        inputs.insert("_retryAttempt".into(), serde_json::json!(2));
        let mut out = JsonMap::new();
        passthrough_inputs(&inputs, &mut out);
        assert!(out.contains_key("data"));
        assert!(!out.contains_key("_retryAttempt"));
    }
}
