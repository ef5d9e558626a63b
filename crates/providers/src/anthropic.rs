//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly (not OpenAI-compatible proxy).
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Streaming via SSE with `content_block_delta` events

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tandem_core::error::ProviderError;
use tandem_core::message::{Message, Role};
use tandem_core::provider::*;
use tracing::{debug, trace};

use crate::sse::{SseLineBuffer, data_payload};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 1024;
const SESSION_OPENER: &str = "(focus session started)";

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client: crate::http_client(),
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// The Messages API requires the first message to come from the user.
    fn to_api_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
        let opener = messages
            .first()
            .filter(|m| m.role == Role::Assistant)
            .map(|_| AnthropicMessage {
                role: "user".into(),
                content: SESSION_OPENER.into(),
            });

        opener
            .into_iter()
            .chain(messages.iter().map(|m| AnthropicMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            }))
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature,
        });

        if let Some(ref sys) = request.system {
            body["system"] = serde_json::json!(sys);
        }
        if stream {
            body["stream"] = serde_json::json!(true);
        }
        body
    }

    async fn send(
        &self,
        body: &serde_json::Value,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        let response = builder
            .json(body)
            .send()
            .await
            .map_err(crate::map_transport_error)?;

        crate::check_status(response, "Invalid Anthropic API key").await
    }

    /// Convert Anthropic API response to our ProviderResponse.
    fn response_to_provider_response(resp: AnthropicResponse) -> ProviderResponse {
        let content = resp
            .content
            .iter()
            .filter_map(|block| match block {
                ResponseContentBlock::Text { text } => Some(text.as_str()),
                ResponseContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        ProviderResponse {
            content,
            usage: Some(Usage {
                prompt_tokens: resp.usage.input_tokens,
                completion_tokens: resp.usage.output_tokens,
                total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
            }),
            model: resp.model,
        }
    }
}

#[async_trait]
impl tandem_core::Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = Self::request_body(&request, false);

        debug!(provider = "anthropic", model = %request.model, "Sending completion request");

        let response = self.send(&body, false).await?;
        let api_resp: AnthropicResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse Anthropic response: {e}"),
            })?;

        Ok(Self::response_to_provider_response(api_resp))
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let body = Self::request_body(&request, true);

        debug!(provider = "anthropic", model = %request.model, "Sending streaming request");

        let response = self.send(&body, true).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLineBuffer::new();
            let mut usage = Usage::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for line in lines.push(&bytes) {
                    let Some(data) = data_payload(&line) else {
                        continue;
                    };
                    match parse_stream_event(data) {
                        Some(AnthropicStreamEvent::Text(text)) => {
                            if tx.send(Ok(StreamChunk::text(text))).await.is_err() {
                                return;
                            }
                        }
                        Some(AnthropicStreamEvent::InputTokens(n)) => {
                            usage.prompt_tokens = n;
                        }
                        Some(AnthropicStreamEvent::OutputTokens(n)) => {
                            usage.completion_tokens = n;
                        }
                        Some(AnthropicStreamEvent::Error(message)) => {
                            let _ = tx
                                .send(Err(ProviderError::StreamInterrupted(message)))
                                .await;
                            return;
                        }
                        Some(AnthropicStreamEvent::Stop) => {
                            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
                            let _ = tx.send(Ok(StreamChunk::done(Some(usage)))).await;
                            return;
                        }
                        None => {}
                    }
                }
            }

            // Body ended without message_stop
            let _ = tx
                .send(Err(ProviderError::StreamInterrupted(
                    "Anthropic stream ended before message_stop".into(),
                )))
                .await;
        });

        Ok(rx)
    }
}

/// What a single SSE `data:` payload means for the reply.
#[derive(Debug, PartialEq)]
enum AnthropicStreamEvent {
    Text(String),
    InputTokens(u32),
    OutputTokens(u32),
    Error(String),
    Stop,
}

fn parse_stream_event(data: &str) -> Option<AnthropicStreamEvent> {
    let event: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            trace!(error = %e, data = %data, "Ignoring unparseable Anthropic SSE");
            return None;
        }
    };

    match event["type"].as_str().unwrap_or("") {
        "message_start" => event["message"]["usage"]["input_tokens"]
            .as_u64()
            .map(|n| AnthropicStreamEvent::InputTokens(n as u32)),
        "content_block_delta" => {
            let delta = &event["delta"];
            if delta["type"].as_str() == Some("text_delta") {
                delta["text"]
                    .as_str()
                    .map(|t| AnthropicStreamEvent::Text(t.to_string()))
            } else {
                None
            }
        }
        "message_delta" => event["usage"]["output_tokens"]
            .as_u64()
            .map(|n| AnthropicStreamEvent::OutputTokens(n as u32)),
        "message_stop" => Some(AnthropicStreamEvent::Stop),
        "error" => Some(AnthropicStreamEvent::Error(
            event["error"]["message"]
                .as_str()
                .unwrap_or("unknown Anthropic stream error")
                .to_string(),
        )),
        _ => None,
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<ResponseContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::Provider;

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "claude-sonnet-4-20250514".into(),
            system: Some("You are a focus coach".into()),
            messages: vec![Message::user("Hello"), Message::assistant("Hi!")],
            temperature: 0.7,
            max_tokens: None,
            stream: true,
        }
    }

    #[test]
    fn constructor() {
        let provider = AnthropicProvider::new("sk-ant-test");
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn constructor_with_base_url() {
        let provider =
            AnthropicProvider::new("sk-ant-test").with_base_url("https://custom.proxy.com/");
        assert_eq!(provider.base_url, "https://custom.proxy.com");
    }

    #[test]
    fn request_body_puts_system_at_top_level() {
        let body = AnthropicProvider::request_body(&request(), true);
        assert_eq!(body["system"], "You are a focus coach");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");
    }

    #[test]
    fn leading_assistant_turn_gets_a_user_opener() {
        let messages = vec![Message::assistant("Welcome back!"), Message::user("Thanks")];
        let api = AnthropicProvider::to_api_messages(&messages);
        assert_eq!(api.len(), 3);
        assert_eq!(api[0].role, "user");
        assert_eq!(api[0].content, SESSION_OPENER);
        assert_eq!(api[1].content, "Welcome back!");
    }

    #[test]
    fn request_body_without_system() {
        let mut req = request();
        req.system = None;
        let body = AnthropicProvider::request_body(&req, false);
        assert!(body.get("system").is_none());
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn parse_text_response() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{
                "id": "msg_01",
                "model": "claude-sonnet-4-20250514",
                "content": [{"type": "text", "text": "Hello!"}],
                "usage": {"input_tokens": 10, "output_tokens": 5},
                "stop_reason": "end_turn"
            }"#,
        )
        .unwrap();

        let pr = AnthropicProvider::response_to_provider_response(resp);
        assert_eq!(pr.content, "Hello!");
        assert_eq!(pr.usage.unwrap().total_tokens, 15);
        assert_eq!(pr.model, "claude-sonnet-4-20250514");
    }

    #[test]
    fn unknown_content_blocks_are_skipped() {
        let resp: AnthropicResponse = serde_json::from_str(
            r#"{
                "model": "claude-sonnet-4-20250514",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "Answer."}
                ],
                "usage": {"input_tokens": 1, "output_tokens": 1}
            }"#,
        )
        .unwrap();
        assert_eq!(
            AnthropicProvider::response_to_provider_response(resp).content,
            "Answer."
        );
    }

    #[test]
    fn stream_events() {
        assert_eq!(
            parse_stream_event(
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#
            ),
            Some(AnthropicStreamEvent::Text("Hi".into()))
        );
        assert_eq!(
            parse_stream_event(
                r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1}}}"#
            ),
            Some(AnthropicStreamEvent::InputTokens(12))
        );
        assert_eq!(
            parse_stream_event(r#"{"type":"message_delta","usage":{"output_tokens":7}}"#),
            Some(AnthropicStreamEvent::OutputTokens(7))
        );
        assert_eq!(
            parse_stream_event(r#"{"type":"message_stop"}"#),
            Some(AnthropicStreamEvent::Stop)
        );
        assert_eq!(parse_stream_event(r#"{"type":"ping"}"#), None);
        assert_eq!(parse_stream_event("not json"), None);
    }

    #[test]
    fn stream_error_event() {
        assert_eq!(
            parse_stream_event(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            Some(AnthropicStreamEvent::Error("Overloaded".into()))
        );
    }
}
