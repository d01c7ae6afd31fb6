//! Chat-completions client for OpenAI-compatible providers.
//!
//! One POST shape (`{base_url}/chat/completions`) covers OpenAI, Groq,
//! Together, Mistral, Ollama's `/v1/` endpoint, vLLM, and friends; the
//! differences live in [`quirks`]-style adjustments applied while
//! building the request body (token-limit parameter name, reasoning
//! flags). Streaming responses decode through [`sse::SseDecoder`] into a
//! [`stream::StreamAccumulator`].

pub mod json;
pub mod sse;
pub mod stream;

pub use stream::{StreamOutcome, TokenUsage, ToolCallRequest};

use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};

use crate::collab::Provider;
use crate::error::{EngineError, Result};
use sse::{SseDecoder, SseFrame};
use stream::StreamAccumulator;

/// A normalized chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// Full message array in wire form (roles `system`/`user`/
    /// `assistant`/`tool`, string or part-array content).
    pub messages: Vec<Value>,
    pub temperature: f64,
    pub max_tokens: Option<u64>,
    /// Tool definitions in wire form, when tool calling is enabled.
    pub tools: Option<Value>,
    /// `response_format` payload (e.g. native strict JSON schema).
    pub response_format: Option<Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Value>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.7,
            max_tokens: None,
            tools: None,
            response_format: None,
        }
    }
}

/// Stateless chat client.
pub struct ChatClient;

impl ChatClient {
    /// Build the request body, applying provider quirks.
    pub fn build_body(provider: &Provider, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "stream": stream,
        });

        if let Some(max_tokens) = request.max_tokens {
            body[token_limit_param(provider, &request.model)] = json!(max_tokens);
        }
        if let Some(tools) = &request.tools {
            body["tools"] = tools.clone();
        }
        if let Some(format) = &request.response_format {
            body["response_format"] = format.clone();
        }
        if let Some((flag, value)) = reasoning_flag(provider, &request.model) {
            body[flag] = json!(value);
        }
        if stream && provider.name == "openai" {
            body["stream_options"] = json!({"include_usage": true});
        }

        body
    }

    /// Non-streaming completion.
    pub async fn complete(
        client: &Client,
        provider: &Provider,
        request: &ChatRequest,
    ) -> Result<StreamOutcome> {
        let response = Self::post(client, provider, request, false).await?;
        let payload: Value = response.json().await?;

        let mut accumulator = StreamAccumulator::new();
        accumulator.absorb(&payload);
        Ok(accumulator.finish())
    }

    /// Streaming completion. `on_token` receives each content delta.
    pub async fn stream(
        client: &Client,
        provider: &Provider,
        request: &ChatRequest,
        mut on_token: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> Result<StreamOutcome> {
        let response = Self::post(client, provider, request, true).await?;

        let mut byte_stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut accumulator = StreamAccumulator::new();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(EngineError::Request)?;
            for frame in decoder.push(&chunk) {
                match frame {
                    SseFrame::Data(value) => {
                        if let Some(cb) = on_token.as_deref_mut() {
                            if let Some(token) = value
                                .get("choices")
                                .and_then(|c| c.get(0))
                                .and_then(|c| c.get("delta"))
                                .and_then(|d| d.get("content"))
                                .and_then(Value::as_str)
                            {
                                if !token.is_empty() {
                                    cb(token);
                                }
                            }
                        }
                        accumulator.absorb(&value);
                    }
                    SseFrame::Done => {}
                }
            }
        }
        for frame in decoder.finish() {
            if let SseFrame::Data(value) = frame {
                accumulator.absorb(&value);
            }
        }

        Ok(accumulator.finish())
    }

    /// POST the request and surface non-success statuses as classified
    /// HTTP errors (with `Retry-After` when the provider sends one).
    async fn post(
        client: &Client,
        provider: &Provider,
        request: &ChatRequest,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = format!(
            "{}/chat/completions",
            provider.base_url.trim_end_matches('/')
        );
        let body = Self::build_body(provider, request, stream);

        let mut http = client.post(&url).json(&body);
        if let Some(key) = &provider.api_key {
            http = http.header("Authorization", format!("Bearer {}", key));
        }

        let response = http.send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Http {
                status: status.as_u16(),
                body,
                retry_after,
                output: None,
            });
        }
        Ok(response)
    }
}

/// Some OpenAI reasoning models reject `max_tokens` in favor of
/// `max_completion_tokens`.
fn token_limit_param(provider: &Provider, model: &str) -> &'static str {
    if provider.name == "openai"
        && (model.starts_with("o1") || model.starts_with("o3") || model.starts_with("gpt-5"))
    {
        "max_completion_tokens"
    } else {
        "max_tokens"
    }
}

/// Reasoning-capable models stream `<think>` spans unless told not to;
/// the flag name differs per provider family.
fn reasoning_flag(provider: &Provider, model: &str) -> Option<(&'static str, bool)> {
    if model.contains("qwen3") {
        return Some(("enable_thinking", false));
    }
    if provider.name == "ollama" && (model.contains("deepseek-r1") || model.contains("qwen")) {
        return Some(("think", false));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str) -> Provider {
        Provider {
            name: name.into(),
            base_url: "http://localhost:11434/v1".into(),
            api_key: None,
        }
    }

    fn request(model: &str) -> ChatRequest {
        ChatRequest::new(model, vec![json!({"role": "user", "content": "hi"})])
    }

    #[test]
    fn test_body_basic_shape() {
        let mut req = request("llama3.2:3b");
        req.max_tokens = Some(1024);
        let body = ChatClient::build_body(&provider("ollama"), &req, true);
        assert_eq!(body["model"], "llama3.2:3b");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["temperature"], 0.7);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_body_tools_and_response_format() {
        let mut req = request("gpt-4o");
        req.tools = Some(json!([{"type": "function", "function": {"name": "t"}}]));
        req.response_format = Some(json!({"type": "json_object"}));
        let body = ChatClient::build_body(&provider("openai"), &req, false);
        assert!(body["tools"].is_array());
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_openai_reasoning_models_token_param() {
        let mut req = request("o1-mini");
        req.max_tokens = Some(512);
        let body = ChatClient::build_body(&provider("openai"), &req, false);
        assert_eq!(body["max_completion_tokens"], 512);
        assert!(body.get("max_tokens").is_none());

        let mut req = request("gpt-4o");
        req.max_tokens = Some(512);
        let body = ChatClient::build_body(&provider("openai"), &req, false);
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn test_reasoning_flags() {
        let body = ChatClient::build_body(&provider("ollama"), &request("qwen3:8b"), false);
        assert_eq!(body["enable_thinking"], false);

        let body =
            ChatClient::build_body(&provider("ollama"), &request("deepseek-r1:7b"), false);
        assert_eq!(body["think"], false);

        let body = ChatClient::build_body(&provider("openai"), &request("gpt-4o"), false);
        assert!(body.get("think").is_none());
        assert!(body.get("enable_thinking").is_none());
    }

    #[test]
    fn test_stream_options_only_for_openai() {
        let body = ChatClient::build_body(&provider("openai"), &request("gpt-4o"), true);
        assert_eq!(body["stream_options"]["include_usage"], true);

        let body = ChatClient::build_body(&provider("groq"), &request("llama3"), true);
        assert!(body.get("stream_options").is_none());
    }
}
