//! Variable block: read a workflow input (with default and file-reference
//! support) or set a named value for downstream blocks.

use serde_json::Value;

use super::{scope_of, BlockExecutor, BoxFut};
use crate::collab::validate_file_id;
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::model::{Block, JsonMap};
use crate::template;

pub struct VariableExecutor;

impl BlockExecutor for VariableExecutor {
    fn kind(&self) -> &'static str {
        "variable"
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            let operation = match block.config_str("operation") {
                "" => "read",
                op => op,
            };
            let name = block.config_str("variableName");
            if name.is_empty() {
                return Err(EngineError::BlockConfig {
                    block: block.id.clone(),
                    message: "variableName is required".into(),
                });
            }

            let value = match operation {
                "read" => read_value(block, inputs, name)?,
                "set" => {
                    let raw = block.config.get("value").cloned().unwrap_or(Value::Null);
                    template::render_deep(&raw, &scope_of(inputs))
                }
                other => {
                    return Err(EngineError::BlockConfig {
                        block: block.id.clone(),
                        message: format!("unknown operation '{}'", other),
                    })
                }
            };

            if let Some(file_ref) = as_file_reference(&value) {
                validate_file_reference(ctx, block, file_ref)?;
            }

            let mut out = JsonMap::new();
            out.insert("response".into(), value.clone());
            out.insert("value".into(), value);
            out.insert("variableName".into(), Value::String(name.to_string()));
            Ok(out)
        })
    }
}

/// Resolution order for reads: runtime input, configured default, then
/// the configured file value for file-typed variables.
fn read_value(block: &Block, inputs: &JsonMap, name: &str) -> Result<Value> {
    if let Some(v) = inputs.get(name) {
        return Ok(v.clone());
    }
    if let Some(v) = block.config.get("defaultValue") {
        if !v.is_null() {
            return Ok(v.clone());
        }
    }
    if block.config_str("inputType") == "file" {
        if let Some(v) = block.config.get("fileValue") {
            return Ok(v.clone());
        }
    }
    Ok(Value::Null)
}

/// A value shaped like `{file_id, filename, mime_type, size, type}`.
fn as_file_reference(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    obj.get("file_id")?.as_str()
}

fn validate_file_reference(ctx: &RunContext, block: &Block, file_id: &str) -> Result<()> {
    if !validate_file_id(file_id) {
        return Err(EngineError::BlockConfig {
            block: block.id.clone(),
            message: format!("unsafe file id '{}'", file_id),
        });
    }
    if let Some(files) = &ctx.files {
        if files.get(file_id).is_none() {
            return Err(EngineError::BlockConfig {
                block: block.id.clone(),
                message: format!("file '{}' not found in cache", file_id),
            });
        }
    }
    Ok(())
}
