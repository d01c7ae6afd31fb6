//! Trigger blocks: passthrough executors shaping webhook and schedule
//! inputs into a response envelope.
//!
//! Real listener and scheduler registration is the host's job; the
//! engine runs these as ordinary start blocks.

use chrono::Utc;
use serde_json::Value;

use super::{BlockExecutor, BoxFut};
use crate::context::RunContext;
use crate::error::Result;
use crate::model::{Block, JsonMap};

/// Shapes webhook delivery data (`body`, `headers`, `method`) into the
/// block's response.
pub struct WebhookTriggerExecutor;

impl BlockExecutor for WebhookTriggerExecutor {
    fn kind(&self) -> &'static str {
        "webhook_trigger"
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a RunContext,
        _block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let body = inputs.get("body").cloned().unwrap_or(Value::Null);
            let mut out = JsonMap::new();
            out.insert("response".into(), body.clone());
            out.insert("body".into(), body);
            out.insert(
                "headers".into(),
                inputs.get("headers").cloned().unwrap_or(Value::Null),
            );
            out.insert(
                "method".into(),
                inputs
                    .get("method")
                    .cloned()
                    .unwrap_or(Value::String("POST".into())),
            );
            Ok(out)
        })
    }
}

/// Shapes schedule metadata (`cron`, `timezone`, `scheduledAt`) into
/// the block's response. The cron string passes through untouched; the
/// host scheduler interprets it.
pub struct ScheduleTriggerExecutor;

impl BlockExecutor for ScheduleTriggerExecutor {
    fn kind(&self) -> &'static str {
        "schedule_trigger"
    }

    fn execute<'a>(
        &'a self,
        _ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let scheduled_at = inputs
                .get("scheduledAt")
                .cloned()
                .unwrap_or_else(|| Value::String(Utc::now().to_rfc3339()));
            let mut out = JsonMap::new();
            out.insert(
                "cron".into(),
                Value::String(block.config_str("cron").to_string()),
            );
            out.insert(
                "timezone".into(),
                Value::String(match block.config_str("timezone") {
                    "" => "UTC".to_string(),
                    tz => tz.to_string(),
                }),
            );
            out.insert("scheduledAt".into(), scheduled_at.clone());
            out.insert("response".into(), scheduled_at);
            Ok(out)
        })
    }
}
