//! Generic HTTP request block with auth modes and template
//! interpolation across URL, headers, query parameters, and body.
//!
//! Responses with status >= 400 return the parsed body *and* a
//! classified error, so retry logic applies while downstream
//! diagnostics can still inspect the payload.

use std::time::Duration;

use reqwest::Method;
use serde_json::{Map, Value};

use super::{scope_of, BlockExecutor, BoxFut};
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::model::{Block, JsonMap};
use crate::template;

pub struct HttpRequestExecutor;

impl BlockExecutor for HttpRequestExecutor {
    fn kind(&self) -> &'static str {
        "http_request"
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

            let url = template::render_string(block.config_str("url"), &scope);
            if url.is_empty() {
                return Err(EngineError::BlockConfig {
                    block: block.id.clone(),
                    message: "url is required".into(),
                });
            }
            let method = parse_method(block.config_str("method"))?;

            let mut request = ctx.client.request(method, &url);

            // Query parameters.
            if let Some(Value::Object(params)) = block.config.get("queryParams") {
                let rendered: Vec<(String, String)> = params
                    .iter()
                    .map(|(k, v)| {
                        let text = match v {
                            Value::String(s) => template::render_string(s, &scope),
                            other => template::display_value(other),
                        };
                        (k.clone(), text)
                    })
                    .collect();
                request = request.query(&rendered);
            }

            // Headers.
            if let Some(Value::Object(headers)) = block.config.get("headers") {
                for (k, v) in headers {
                    let text = match v {
                        Value::String(s) => template::render_string(s, &scope),
                        other => template::display_value(other),
                    };
                    request = request.header(k.as_str(), text);
                }
            }

            request = apply_auth(request, block, &scope)?;

            // Body: strings go raw (JSON content type when they parse as
            // JSON), maps and arrays are rendered deeply and sent as JSON.
            if let Some(body) = block.config.get("body") {
                request = match body {
                    Value::String(s) => {
                        let rendered = template::render_string(s, &scope);
                        if serde_json::from_str::<Value>(&rendered).is_ok() {
                            request
                                .header("Content-Type", "application/json")
                                .body(rendered)
                        } else {
                            request.body(rendered)
                        }
                    }
                    other => request.json(&template::render_deep(other, &scope)),
                };
            }

            let response = request.send().await?;
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let headers: Map<String, Value> = response
                .headers()
                .iter()
                .filter_map(|(k, v)| {
                    v.to_str()
                        .ok()
                        .map(|s| (k.to_string(), Value::String(s.to_string())))
                })
                .collect();

            let text = response.text().await.unwrap_or_default();
            let parsed = serde_json::from_str::<Value>(&text)
                .unwrap_or_else(|_| Value::String(text.clone()));

            if status >= 400 {
                let mut output = JsonMap::new();
                output.insert("response".into(), parsed.clone());
                output.insert("status".into(), Value::from(status));
                output.insert("headers".into(), Value::Object(headers));
                return Err(EngineError::Http {
                    status,
                    body: truncate(&text, 2000),
                    retry_after,
                    output: Some(Value::Object(output)),
                });
            }

            let mut out = JsonMap::new();
            out.insert("response".into(), parsed.clone());
            out.insert("data".into(), parsed);
            out.insert("status".into(), Value::from(status));
            out.insert("headers".into(), Value::Object(headers));
            Ok(out)
        })
    }
}

fn parse_method(raw: &str) -> Result<Method> {
    let name = if raw.is_empty() { "GET" } else { raw };
    name.to_ascii_uppercase()
        .parse::<Method>()
        .map_err(|_| EngineError::Other(format!("invalid HTTP method '{}'", name)))
}

/// Apply the configured auth mode to the request.
fn apply_auth(
    mut request: reqwest::RequestBuilder,
    block: &Block,
    scope: &Value,
) -> Result<reqwest::RequestBuilder> {
    let Some(Value::Object(auth)) = block.config.get("auth") else {
        return Ok(request);
    };
    let get = |key: &str| -> String {
        auth.get(key)
            .and_then(Value::as_str)
            .map(|s| template::render_string(s, scope))
            .unwrap_or_default()
    };

    match auth.get("mode").and_then(Value::as_str).unwrap_or("none") {
        "none" => {}
        "bearer" => {
            request = request.header("Authorization", format!("Bearer {}", get("token")));
        }
        "basic" => {
            request = request.basic_auth(get("username"), Some(get("password")));
        }
        "api_key" => {
            let header = auth
                .get("headerName")
                .and_then(Value::as_str)
                .unwrap_or("X-API-Key");
            request = request.header(header, get("apiKey"));
        }
        other => {
            return Err(EngineError::BlockConfig {
                block: block.id.clone(),
                message: format!("unknown auth mode '{}'", other),
            })
        }
    }
    Ok(request)
}

/// Parse a `Retry-After` header value given in seconds.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method("").unwrap(), Method::GET);
        assert_eq!(parse_method("post").unwrap(), Method::POST);
        assert_eq!(parse_method("DELETE").unwrap(), Method::DELETE);
        assert!(parse_method("NOT A METHOD").is_err());
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("Wed, 21 Oct"), None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate(s, 3);
        assert!(t.starts_with('h'));
        assert!(t.ends_with('…'));
        assert_eq!(truncate("short", 100), "short");
    }

    #[test]
    fn test_auth_modes_build() {
        let client = reqwest::Client::new();
        let scope = json!({"secrets": {"key": "k-123"}});

        let bearer = Block::new("h", crate::model::BlockType::HttpRequest)
            .with_config("auth", json!({"mode": "bearer", "token": "{{secrets.key}}"}));
        let req = apply_auth(client.get("http://example.com"), &bearer, &scope)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.headers()["Authorization"], "Bearer k-123");

        let api_key = Block::new("h", crate::model::BlockType::HttpRequest).with_config(
            "auth",
            json!({"mode": "api_key", "apiKey": "abc", "headerName": "X-Custom"}),
        );
        let req = apply_auth(client.get("http://example.com"), &api_key, &scope)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.headers()["X-Custom"], "abc");

        let basic = Block::new("h", crate::model::BlockType::HttpRequest)
            .with_config("auth", json!({"mode": "basic", "username": "u", "password": "p"}));
        let req = apply_auth(client.get("http://example.com"), &basic, &scope)
            .unwrap()
            .build()
            .unwrap();
        assert!(req.headers().contains_key("authorization"));
    }

    #[test]
    fn test_unknown_auth_mode_rejected() {
        let client = reqwest::Client::new();
        let block = Block::new("h", crate::model::BlockType::HttpRequest)
            .with_config("auth", json!({"mode": "digest"}));
        assert!(apply_auth(client.get("http://example.com"), &block, &json!({})).is_err());
    }
}
