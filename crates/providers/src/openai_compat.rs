//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Groq, and any endpoint
//! exposing `/v1/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Health checks via the models listing

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tandem_core::error::ProviderError;
use tandem_core::message::Message;
use tandem_core::provider::*;
use tracing::{debug, trace};

use crate::sse::{SseLineBuffer, data_payload};

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client: crate::http_client(),
        }
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
        )
    }

    /// The system prompt travels as the first message.
    fn to_api_messages(system: Option<&str>, messages: &[Message]) -> Vec<ApiMessage> {
        let system = system.map(|s| ApiMessage {
            role: "system".into(),
            content: s.to_string(),
        });

        system
            .into_iter()
            .chain(messages.iter().map(|m| ApiMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            }))
            .collect()
    }

    fn request_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(request.system.as_deref(), &request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(crate::map_transport_error)?;

        crate::check_status(response, "Invalid API key or insufficient permissions").await
    }
}

#[async_trait]
impl tandem_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let body = Self::request_body(&request, false);

        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self.send(&body).await?;
        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        parse_response(api_response)
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let body = Self::request_body(&request, true);

        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self.send(&body).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLineBuffer::new();
            let mut usage = None;

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
                    match parse_stream_data(data) {
                        StreamData::Done => {
                            let _ = tx.send(Ok(StreamChunk::done(usage))).await;
                            return;
                        }
                        StreamData::Delta { text, usage: u } => {
                            if u.is_some() {
                                usage = u;
                            }
                            if let Some(text) = text
                                && tx.send(Ok(StreamChunk::text(text))).await.is_err()
                            {
                                return;
                            }
                        }
                        StreamData::Skip => {}
                    }
                }
            }

            if let Some(tail) = lines.finish()
                && data_payload(&tail) == Some("[DONE]")
            {
                let _ = tx.send(Ok(StreamChunk::done(usage))).await;
                return;
            }

            let _ = tx
                .send(Err(ProviderError::StreamInterrupted(
                    "stream ended before [DONE]".into(),
                )))
                .await;
        });

        Ok(rx)
    }
}

fn parse_response(api_response: ApiResponse) -> Result<ProviderResponse, ProviderError> {
    let choice = api_response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::ApiError {
            status_code: 200,
            message: "No choices in response".into(),
        })?;

    Ok(ProviderResponse {
        content: choice.message.content.unwrap_or_default(),
        usage: api_response.usage.map(Usage::from),
        model: api_response.model,
    })
}

#[derive(Debug, PartialEq)]
enum StreamData {
    Delta {
        text: Option<String>,
        usage: Option<Usage>,
    },
    Done,
    Skip,
}

fn parse_stream_data(data: &str) -> StreamData {
    if data == "[DONE]" {
        return StreamData::Done;
    }

    let chunk: StreamResponse = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            trace!(error = %e, data = %data, "Ignoring unparseable SSE chunk");
            return StreamData::Skip;
        }
    };

    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|t| !t.is_empty());

    StreamData::Delta {
        text,
        usage: chunk.usage.map(Usage::from),
    }
}

// --- OpenAI API types ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ApiChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::Provider;

    #[test]
    fn constructors() {
        let p = OpenAiCompatProvider::openai("sk-test");
        assert_eq!(p.name(), "openai");
        assert_eq!(p.base_url, "https://api.openai.com/v1");

        let p = OpenAiCompatProvider::ollama(None);
        assert_eq!(p.name(), "ollama");

        let p = OpenAiCompatProvider::new("custom", "http://localhost:8000/v1/", "k");
        assert_eq!(p.base_url, "http://localhost:8000/v1");
    }

    #[test]
    fn system_prompt_becomes_first_message() {
        let messages = vec![Message::user("Hello"), Message::assistant("Hi there!")];
        let api = OpenAiCompatProvider::to_api_messages(Some("Coach"), &messages);
        assert_eq!(api.len(), 3);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[0].content, "Coach");
        assert_eq!(api[1].role, "user");
        assert_eq!(api[2].role, "assistant");

        let api = OpenAiCompatProvider::to_api_messages(None, &messages);
        assert_eq!(api.len(), 2);
    }

    #[test]
    fn streaming_body_requests_usage() {
        let request = ProviderRequest {
            model: "gpt-4o".into(),
            system: None,
            messages: vec![Message::user("hi")],
            temperature: 0.2,
            max_tokens: Some(64),
            stream: true,
        };
        let body = OpenAiCompatProvider::request_body(&request, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 64);
    }

    #[test]
    fn parse_completion() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{
                "id": "chatcmpl-1",
                "model": "gpt-4o",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello!"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            }"#,
        )
        .unwrap();
        let pr = parse_response(resp).unwrap();
        assert_eq!(pr.content, "Hello!");
        assert_eq!(pr.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn parse_completion_without_choices_fails() {
        let resp: ApiResponse = serde_json::from_str(r#"{"model":"m","choices":[]}"#).unwrap();
        assert!(parse_response(resp).is_err());
    }

    #[test]
    fn parse_stream_chunks() {
        assert_eq!(
            parse_stream_data(r#"{"choices":[{"index":0,"delta":{"content":"Hel"}}]}"#),
            StreamData::Delta {
                text: Some("Hel".into()),
                usage: None
            }
        );
        assert_eq!(
            parse_stream_data(
                r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#
            ),
            StreamData::Delta {
                text: None,
                usage: Some(Usage {
                    prompt_tokens: 3,
                    completion_tokens: 2,
                    total_tokens: 5
                })
            }
        );
        assert_eq!(parse_stream_data("[DONE]"), StreamData::Done);
        assert_eq!(parse_stream_data("{broken"), StreamData::Skip);
    }

    #[test]
    fn empty_role_delta_carries_no_text() {
        assert_eq!(
            parse_stream_data(r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#),
            StreamData::Delta {
                text: None,
                usage: None
            }
        );
    }
}
