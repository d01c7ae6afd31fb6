//! Sub-agent block: trigger a nested workflow through an external
//! trigger endpoint and optionally poll for its result.

use std::time::{Duration, Instant};

use serde_json::Value;

use super::{scope_of, BlockExecutor, BoxFut};
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::model::{Block, JsonMap};
use crate::template;

pub struct SubAgentExecutor;

/// Default completion-poll window.
const DEFAULT_TIMEOUT_SECS: u64 = 120;
/// Poll interval while waiting for the sub-agent.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

impl BlockExecutor for SubAgentExecutor {
    fn kind(&self) -> &'static str {
        "sub_agent"
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            ctx.check_cancelled()?;
            let scope = scope_of(inputs);
            let trigger_url = template::render_string(block.config_str("triggerUrl"), &scope);
            if trigger_url.is_empty() {
                return Err(EngineError::BlockConfig {
                    block: block.id.clone(),
                    message: "triggerUrl is required".into(),
                });
            }

            // Fire the trigger with rendered input payload.
            let payload = block
                .config
                .get("input")
                .map(|v| template::render_deep(v, &scope))
                .unwrap_or(Value::Object(inputs.clone()));

            let response = ctx.client.post(&trigger_url).json(&payload).send().await?;
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            if status >= 400 {
                return Err(EngineError::Http {
                    status,
                    body,
                    retry_after: None,
                    output: None,
                });
            }
            let triggered: Value =
                serde_json::from_str(&body).unwrap_or_else(|_| Value::String(body));

            let wait_for_completion = block
                .config
                .get("waitForCompletion")
                .and_then(Value::as_bool)
                .unwrap_or(true);

            let result = if wait_for_completion {
                let timeout = Duration::from_secs(
                    block.config_u64("timeoutSeconds").unwrap_or(DEFAULT_TIMEOUT_SECS),
                );
                poll_result(ctx, block, &trigger_url, &triggered, timeout).await?
            } else {
                triggered
            };

            let mut out = JsonMap::new();
            out.insert("response".into(), result.clone());
            out.insert("result".into(), result);
            Ok(out)
        })
    }
}

/// Poll the sub-agent's status endpoint until it reports completion or
/// the window elapses. The trigger response's `runId` composes the poll
/// URL when no explicit `statusUrl` is configured.
async fn poll_result(
    ctx: &RunContext,
    block: &Block,
    trigger_url: &str,
    triggered: &Value,
    timeout: Duration,
) -> Result<Value> {
    let status_url = match block.config_str("statusUrl") {
        "" => match triggered.get("runId").and_then(Value::as_str) {
            Some(run_id) => format!("{}/{}", trigger_url.trim_end_matches('/'), run_id),
            None => return Ok(triggered.clone()),
        },
        url => template::render_string(url, triggered),
    };

    let started = Instant::now();
    loop {
        ctx.check_cancelled()?;
        if started.elapsed() >= timeout {
            return Err(EngineError::Timeout(timeout));
        }

        let response = ctx.client.get(&status_url).send().await?;
        if response.status().is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            match body.get("status").and_then(Value::as_str) {
                Some("completed") | Some("partial") => {
                    return Ok(body.get("output").cloned().unwrap_or(body));
                }
                Some("failed") => {
                    return Err(EngineError::Other(format!(
                        "sub-agent run failed: {}",
                        body.get("error").and_then(Value::as_str).unwrap_or("unknown")
                    )));
                }
                _ => {}
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
