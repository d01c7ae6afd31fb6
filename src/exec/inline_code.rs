//! Inline code block: run user-supplied Python or JavaScript in an
//! external interpreter subprocess.
//!
//! Inputs are passed as JSON on stdin; the user script assigns `output`
//! and the harness prints it as the final JSON line. Stdout is captured
//! and JSON-parsed when possible; failures surface stderr.

use std::process::Stdio;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{BlockExecutor, BoxFut};
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::model::{Block, JsonMap};

pub struct InlineCodeExecutor;

impl BlockExecutor for InlineCodeExecutor {
    fn kind(&self) -> &'static str {
        "inline_code"
    }

    fn execute<'a>(
        &'a self,
        ctx: &'a RunContext,
        block: &'a Block,
        inputs: &'a JsonMap,
    ) -> BoxFut<'a, Result<JsonMap>> {
        Box::pin(async move {
            ctx.check_cancelled()?;
            let code = block.config_str("code");
            if code.is_empty() {
                return Err(EngineError::BlockConfig {
                    block: block.id.clone(),
                    message: "code is required".into(),
                });
            }
            let language = match block.config_str("language") {
                "" => "python",
                l => l,
            };
            let (default_interpreter, script_flag, script) = match language {
                "python" => ("python3", "-c", python_harness(code)),
                "javascript" => ("node", "-e", javascript_harness(code)),
                other => {
                    return Err(EngineError::BlockConfig {
                        block: block.id.clone(),
                        message: format!("unsupported language '{}'", other),
                    })
                }
            };
            let interpreter = match block.config_str("interpreterPath") {
                "" => default_interpreter,
                path => path,
            };

            let stdin_payload = serde_json::to_vec(&Value::Object(inputs.clone()))?;

            // The harness travels as the interpreter's inline program;
            // stdin stays free for the JSON input payload.
            let mut child = Command::new(interpreter)
                .arg(script_flag)
                .arg(&script)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    EngineError::Other(format!("failed to spawn {}: {}", interpreter, e))
                })?;

            {
                let mut stdin = child.stdin.take().expect("stdin piped");
                stdin.write_all(&stdin_payload).await.map_err(|e| {
                    EngineError::Other(format!("failed to write script input: {}", e))
                })?;
            }
            let output = child.wait_with_output().await.map_err(|e| {
                EngineError::Other(format!("failed to wait for {}: {}", interpreter, e))
            })?;

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();

            if !output.status.success() {
                return Err(EngineError::Other(format!(
                    "script exited with {}: {}",
                    output.status,
                    if stderr.is_empty() { &stdout } else { &stderr }
                )));
            }

            let parsed = parse_stdout(&stdout);
            let mut out = JsonMap::new();
            out.insert("response".into(), parsed.clone());
            out.insert("result".into(), parsed.clone());
            if let Some(inner) = parsed.get("output") {
                out.insert("output".into(), inner.clone());
            }
            out.insert("stdout".into(), Value::String(stdout));
            if !stderr.is_empty() {
                out.insert("stderr".into(), Value::String(stderr));
            }
            Ok(out)
        })
    }
}

/// Parse captured stdout: the whole text as JSON, then the last
/// non-empty line, then the raw text.
fn parse_stdout(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return v;
    }
    if let Some(last) = trimmed.lines().rev().find(|l| !l.trim().is_empty()) {
        if let Ok(v) = serde_json::from_str::<Value>(last.trim()) {
            return v;
        }
    }
    Value::String(trimmed.to_string())
}

/// Python harness: inputs on stdin, user code assigns `output`.
fn python_harness(code: &str) -> String {
    format!(
        r#"import sys, json
input_data = json.load(sys.stdin)
output = None
{code}
if output is not None:
    print(json.dumps({{"output": output}}))
"#
    )
}

/// Node harness: inputs on fd 0, user code assigns `output`.
fn javascript_harness(code: &str) -> String {
    format!(
        r#"const inputData = JSON.parse(require('fs').readFileSync(0, 'utf8'));
let output = null;
{code}
if (output !== null) console.log(JSON.stringify({{output}}));
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stdout_whole_json() {
        assert_eq!(
            parse_stdout(r#"{"output": 42}"#),
            serde_json::json!({"output": 42})
        );
    }

    #[test]
    fn test_parse_stdout_last_line_json() {
        let text = "debug line\nanother\n{\"output\": [1]}\n";
        assert_eq!(parse_stdout(text), serde_json::json!({"output": [1]}));
    }

    #[test]
    fn test_parse_stdout_plain_text() {
        assert_eq!(parse_stdout("just text\n"), serde_json::json!("just text"));
    }

    #[test]
    fn test_python_harness_shape() {
        let script = python_harness("output = input_data['x'] * 2");
        assert!(script.contains("json.load(sys.stdin)"));
        assert!(script.contains("output = input_data['x'] * 2"));
        assert!(script.contains("json.dumps"));
    }

    #[test]
    fn test_javascript_harness_shape() {
        let script = javascript_harness("output = inputData.x * 2;");
        assert!(script.contains("readFileSync(0"));
        assert!(script.contains("JSON.stringify"));
    }
}
