//! Tool block: deterministic single-tool invocation with argument
//! interpolation and credential injection.

use serde_json::{Map, Value};
use tracing::debug;

use super::{scope_of, BlockExecutor, BoxFut};
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::model::{Block, JsonMap};
use crate::template;

pub struct ToolBlockExecutor;

impl BlockExecutor for ToolBlockExecutor {
    fn kind(&self) -> &'static str {
        "code_block"
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            ctx.check_cancelled()?;
            let tool_name = match block.config_str("toolName") {
                "" => block.config_str("tool"),
                name => name,
            };
            if tool_name.is_empty() {
                return Err(EngineError::BlockConfig {
                    block: block.id.clone(),
                    message: "toolName is required".into(),
                });
            }
            if ctx.tools.get(tool_name).is_none() {
                return Err(EngineError::BlockConfig {
                    block: block.id.clone(),
                    message: format!("tool '{}' is not registered", tool_name),
                });
            }

            // Deep-interpolate the argument mapping: a lone `{{path}}`
            // keeps the raw value, mixed text renders to a string.
            let mapping = block
                .config
                .get("argumentMapping")
                .cloned()
                .unwrap_or(Value::Object(Map::new()));
            let args = template::render_deep(&mapping, &scope_of(inputs));

            let credential_id = match block.config_str("credentialId") {
                "" => None,
                id => Some(id),
            };
            let raw = execute_tool(ctx, tool_name, args, credential_id).await?;

            let parsed =
                serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| Value::String(raw.clone()));
            let mut out = JsonMap::new();
            out.insert("response".into(), parsed.clone());
            out.insert("result".into(), parsed.clone());
            out.insert("data".into(), parsed);
            out.insert("raw".into(), Value::String(raw));
            out.insert("toolName".into(), Value::String(tool_name.to_string()));
            Ok(out)
        })
    }
}

/// Execute a tool by name, injecting the resolved credential and user id
/// into the argument map.
///
/// Credential resolution order: the explicit `credential_id`, then
/// auto-selection when the tool declares an integration type and the
/// run's user owns exactly one credential of that type.
pub(crate) async fn execute_tool(
    ctx: &RunContext,
    tool_name: &str,
    args: Value,
    credential_id: Option<&str>,
) -> Result<String> {
    let mut args = match args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("input".into(), other);
            map
        }
    };

    if let Some(credential) = resolve_credential(ctx, tool_name, credential_id).await? {
        args.insert("_credential".into(), credential);
    }
    if let Some(user_id) = &ctx.user_id {
        args.insert("_userId".into(), Value::String(user_id.clone()));
    }

    debug!(tool = tool_name, "executing tool");
    ctx.tools
        .execute(tool_name, &Value::Object(args))
        .await
        .map_err(|e| EngineError::Tool {
            name: tool_name.to_string(),
            message: e.to_string(),
        })
}

/// Resolve the credential payload for a tool call, if any applies.
async fn resolve_credential(
    ctx: &RunContext,
    tool_name: &str,
    credential_id: Option<&str>,
) -> Result<Option<Value>> {
    let (Some(service), Some(user_id)) = (&ctx.credentials, &ctx.user_id) else {
        return Ok(None);
    };

    if let Some(id) = credential_id {
        let resolver = service.resolver(user_id);
        return match resolver(id) {
            Some(cred) => Ok(Some(cred.data)),
            None => Err(EngineError::Tool {
                name: tool_name.to_string(),
                message: format!("credential '{}' not found", id),
            }),
        };
    }

    // Auto-select: the tool needs an integration and the user owns
    // exactly one credential of that type.
    let Some(integration) = ctx.tools.get(tool_name).and_then(|spec| spec.integration) else {
        return Ok(None);
    };
    let candidates = service.list_by_user_and_type(user_id, &integration).await?;
    if candidates.len() == 1 {
        return Ok(Some(candidates.into_iter().next().expect("len checked").data));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::mock::{StaticCatalog, StaticCredentials, StaticToolRegistry};
    use crate::collab::{Credential, ToolSpec};
    use crate::model::BlockType;
    use serde_json::json;
    use std::sync::Arc;

    fn base_ctx(tools: StaticToolRegistry) -> RunContext {
        RunContext::builder(Arc::new(tools), Arc::new(StaticCatalog::new())).build()
    }

    #[tokio::test]
    async fn test_tool_block_interpolates_arguments() {
        let tools = StaticToolRegistry::new().with_tool(
            ToolSpec {
                name: "echo".into(),
                description: "echo args".into(),
                parameters: Value::Null,
                integration: None,
            },
            |args| Ok(args.to_string()),
        );
        let tools = Arc::new(tools);
        let ctx = RunContext::builder(tools.clone(), Arc::new(StaticCatalog::new())).build();

        let block = Block::new("call", BlockType::CodeBlock)
            .with_config("toolName", json!("echo"))
            .with_config(
                "argumentMapping",
                json!({
                    "query": "user {{user.id}}",
                    "payload": "{{user}}"
                }),
            );
        let inputs = json!({"user": {"id": 7, "name": "Ada"}})
            .as_object()
            .unwrap()
            .clone();

        let out = ToolBlockExecutor.execute(&ctx, &block, &inputs).await.unwrap();
        let calls = tools.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1["query"], json!("user 7"));
        // Lone placeholder keeps the raw object.
        assert_eq!(calls[0].1["payload"], json!({"id": 7, "name": "Ada"}));
        assert_eq!(out["toolName"], json!("echo"));
    }

    #[tokio::test]
    async fn test_tool_result_parsed_as_json() {
        let tools =
            StaticToolRegistry::new().with_canned("search", "", r#"{"results": [1, 2]}"#);
        let ctx = base_ctx(tools);
        let block = Block::new("call", BlockType::CodeBlock).with_config("toolName", json!("search"));

        let out = ToolBlockExecutor
            .execute(&ctx, &block, &JsonMap::new())
            .await
            .unwrap();
        assert_eq!(out["response"]["results"], json!([1, 2]));
        assert_eq!(out["data"]["results"], json!([1, 2]));
        assert_eq!(out["raw"], json!(r#"{"results": [1, 2]}"#));
    }

    #[tokio::test]
    async fn test_tool_result_plain_string() {
        let tools = StaticToolRegistry::new().with_canned("greet", "", "hello");
        let ctx = base_ctx(tools);
        let block = Block::new("call", BlockType::CodeBlock).with_config("toolName", json!("greet"));
        let out = ToolBlockExecutor
            .execute(&ctx, &block, &JsonMap::new())
            .await
            .unwrap();
        assert_eq!(out["response"], json!("hello"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_config_error() {
        let ctx = base_ctx(StaticToolRegistry::new());
        let block = Block::new("call", BlockType::CodeBlock).with_config("toolName", json!("ghost"));
        let err = ToolBlockExecutor
            .execute(&ctx, &block, &JsonMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }

    #[tokio::test]
    async fn test_credential_auto_selection() {
        let tools = StaticToolRegistry::new().with_tool(
            ToolSpec {
                name: "send_message".into(),
                description: "".into(),
                parameters: Value::Null,
                integration: Some("discord".into()),
            },
            |args| {
                assert!(args.get("_credential").is_some(), "credential injected");
                assert_eq!(args["_userId"], json!("u1"));
                Ok("sent".into())
            },
        );
        let credentials = StaticCredentials::new().with_credential(
            "u1",
            Credential {
                id: "c1".into(),
                integration: "discord".into(),
                data: json!({"token": "abc"}),
            },
        );
        let mut ctx = RunContext::builder(Arc::new(tools), Arc::new(StaticCatalog::new()))
            .credentials(Arc::new(credentials))
            .build();
        ctx.user_id = Some("u1".into());

        let result = execute_tool(&ctx, "send_message", json!({"text": "hi"}), None)
            .await
            .unwrap();
        assert_eq!(result, "sent");
    }

    #[tokio::test]
    async fn test_explicit_credential_missing_errors() {
        let tools = StaticToolRegistry::new().with_canned("t", "", "ok");
        let mut ctx = RunContext::builder(Arc::new(tools), Arc::new(StaticCatalog::new()))
            .credentials(Arc::new(StaticCredentials::new()))
            .build();
        ctx.user_id = Some("u1".into());

        let err = execute_tool(&ctx, "t", Value::Null, Some("missing"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("credential"));
    }

    #[tokio::test]
    async fn test_ambiguous_credentials_not_injected() {
        let tools = StaticToolRegistry::new().with_tool(
            ToolSpec {
                name: "send".into(),
                description: "".into(),
                parameters: Value::Null,
                integration: Some("slack".into()),
            },
            |args| {
                assert!(args.get("_credential").is_none());
                Ok("ok".into())
            },
        );
        let credentials = StaticCredentials::new()
            .with_credential(
                "u1",
                Credential {
                    id: "c1".into(),
                    integration: "slack".into(),
                    data: json!({}),
                },
            )
            .with_credential(
                "u1",
                Credential {
                    id: "c2".into(),
                    integration: "slack".into(),
                    data: json!({}),
                },
            );
        let mut ctx = RunContext::builder(Arc::new(tools), Arc::new(StaticCatalog::new()))
            .credentials(Arc::new(credentials))
            .build();
        ctx.user_id = Some("u1".into());

        assert_eq!(execute_tool(&ctx, "send", Value::Null, None).await.unwrap(), "ok");
    }
}
