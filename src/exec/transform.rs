//! Transform block (ordered map operations) and wait block.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::{passthrough_inputs, BlockExecutor, BoxFut};
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::model::{Block, JsonMap};
use crate::template;

/// Ordered operations applied to a per-block copy of the inputs.
pub struct TransformExecutor;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransformOp {
    op: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    template: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    path: String,
}

impl BlockExecutor for TransformExecutor {
    fn kind(&self) -> &'static str {
        "transform"
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let ops: Vec<TransformOp> = block
                .config
                .get("operations")
                .cloned()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();

            // The working copy doubles as the template scope, so each
            // operation sees the effect of the previous ones.
            let mut work = inputs.clone();

            for op in &ops {
                let scope = Value::Object(work.clone());
                match op.op.as_str() {
                    "set" => {
                        work.insert(op.key.clone(), template::render_deep(&op.value, &scope));
                    }
                    "template" => {
                        work.insert(
                            op.key.clone(),
                            Value::String(template::render_string(&op.template, &scope)),
                        );
                    }
                    "delete" => {
                        work.remove(&op.key);
                    }
                    "rename" => {
                        if let Some(v) = work.remove(&op.from) {
                            work.insert(op.to.clone(), v);
                        }
                    }
                    "extract" => {
                        let extracted = template::resolve_path(&scope, &op.path)
                            .cloned()
                            .unwrap_or(Value::Null);
                        work.insert(op.key.clone(), extracted);
                    }
                    other => {
                        return Err(EngineError::BlockConfig {
                            block: block.id.clone(),
                            message: format!("unknown transform operation '{}'", other),
                        })
                    }
                }
            }

            Ok(work)
        })
    }
}

/// Wait block: sleep for a configured duration, capped at 5 minutes,
/// passing non-internal inputs through.
pub struct WaitExecutor;

/// Maximum wait regardless of configuration.
const MAX_WAIT: Duration = Duration::from_secs(300);
/// Cancellation poll interval during the sleep.
const WAIT_SLICE: Duration = Duration::from_millis(250);

impl BlockExecutor for WaitExecutor {
    fn kind(&self) -> &'static str {
        "wait"
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let amount = block
                .config
                .get("duration")
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
                .max(0.0);
            let unit = match block.config_str("unit") {
                "" => "seconds",
                u => u,
            };
            let requested = match unit {
                "ms" | "milliseconds" => Duration::from_secs_f64(amount / 1000.0),
                "seconds" | "s" => Duration::from_secs_f64(amount),
                "minutes" | "m" => Duration::from_secs_f64(amount * 60.0),
                other => {
                    return Err(EngineError::BlockConfig {
                        block: block.id.clone(),
                        message: format!("unknown wait unit '{}'", other),
                    })
                }
            };
            let total = requested.min(MAX_WAIT);

            // Sliced sleep so cancellation interrupts promptly.
            let mut remaining = total;
            while remaining > Duration::ZERO {
                ctx.check_cancelled()?;
                let slice = remaining.min(WAIT_SLICE);
                tokio::time::sleep(slice).await;
                remaining = remaining.saturating_sub(slice);
            }
            ctx.check_cancelled()?;

            let mut out = JsonMap::new();
            out.insert(
                "waitedMs".into(),
                Value::from(total.as_millis() as u64),
            );
            passthrough_inputs(inputs, &mut out);
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::mock::{StaticCatalog, StaticToolRegistry};
    use crate::model::BlockType;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> RunContext {
        RunContext::builder(
            Arc::new(StaticToolRegistry::new()),
            Arc::new(StaticCatalog::new()),
        )
        .build()
    }

    #[tokio::test]
    async fn test_transform_ordered_operations() {
        let block = Block::new("t", BlockType::Transform).with_config(
            "operations",
            json!([
                {"op": "set", "key": "greeting", "value": "hi {{user.name}}"},
                {"op": "extract", "key": "city", "path": "user.address.city"},
                {"op": "rename", "from": "city", "to": "location"},
                {"op": "delete", "key": "user"},
                {"op": "template", "key": "summary", "template": "{{greeting}} from {{location}}"}
            ]),
        );
        let inputs = json!({
            "user": {"name": "Ada", "address": {"city": "Lyon"}}
        })
        .as_object()
        .unwrap()
        .clone();

        let out = TransformExecutor.execute(&ctx(), &block, &inputs).await.unwrap();
        assert_eq!(out["greeting"], json!("hi Ada"));
        assert_eq!(out["location"], json!("Lyon"));
        assert!(!out.contains_key("user"));
        assert!(!out.contains_key("city"));
        assert_eq!(out["summary"], json!("hi Ada from Lyon"));
    }

    #[tokio::test]
    async fn test_transform_set_preserves_raw_values() {
        let block = Block::new("t", BlockType::Transform).with_config(
            "operations",
            json!([{"op": "set", "key": "copy", "value": "{{payload}}"}]),
        );
        let inputs = json!({"payload": {"a": [1, 2]}}).as_object().unwrap().clone();
        let out = TransformExecutor.execute(&ctx(), &block, &inputs).await.unwrap();
        assert_eq!(out["copy"], json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn test_transform_unknown_op_errors() {
        let block = Block::new("t", BlockType::Transform)
            .with_config("operations", json!([{"op": "explode", "key": "x"}]));
        assert!(TransformExecutor
            .execute(&ctx(), &block, &JsonMap::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_wait_passes_through_inputs() {
        let block = Block::new("w", BlockType::Wait)
            .with_config("duration", json!(1))
            .with_config("unit", json!("ms"));
        let inputs = json!({"data": 5, "_internal": true})
            .as_object()
            .unwrap()
            .clone();
        let out = WaitExecutor.execute(&ctx(), &block, &inputs).await.unwrap();
        assert_eq!(out["data"], json!(5));
        assert!(!out.contains_key("_internal"));
        assert!(out.contains_key("waitedMs"));
    }

    #[tokio::test]
    async fn test_wait_caps_duration() {
        let block = Block::new("w", BlockType::Wait)
            .with_config("duration", json!(120))
            .with_config("unit", json!("minutes"));
        // The cap computation happens before sleeping; cancel immediately
        // so the test does not actually wait.
        let ctx = ctx();
        ctx.cancel();
        let err = WaitExecutor
            .execute(&ctx, &block, &JsonMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn test_wait_unknown_unit() {
        let block = Block::new("w", BlockType::Wait)
            .with_config("duration", json!(1))
            .with_config("unit", json!("fortnights"));
        assert!(WaitExecutor
            .execute(&ctx(), &block, &JsonMap::new())
            .await
            .is_err());
    }
}
