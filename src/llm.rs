//! LLM gateway: streaming chat with separate content and reasoning channels.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{GatewayConfig, GenerationConfig};

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Request(String),
    #[error("generation stream failed: {0}")]
    Stream(String),
    #[error("generation response malformed: {0}")]
    Response(String),
}

/// Which channel a streamed fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChannel {
    Content,
    Think,
}

#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub channel: StreamChannel,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Starts a streaming generation. Fragments arrive tagged by channel;
    /// the receiver closing means the upstream stream ended.
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, GenerationError>>, GenerationError>;

    /// Single-shot generation, used for short auxiliary calls such as
    /// session title generation.
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, GenerationError>;
}

/// HTTP client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLlmClient {
    pub fn new(gateways: &GatewayConfig, generation: &GenerationConfig) -> Self {
        // Connect timeout only: generation time is unbounded by design.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: gateways.llm_base_url.trim_end_matches('/').to_string(),
            api_key: gateways.llm_api_key.clone(),
            model: generation.chat_model.clone(),
        }
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "stream": stream,
        });

        let mut request = self.client.post(url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        request
    }
}

#[async_trait]
impl LlmGateway for HttpLlmClient {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, GenerationError>>, GenerationError> {
        let request = self.build_request(&messages, max_tokens, temperature, true);
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    let _ = tx.send(Err(GenerationError::Request(err.to_string()))).await;
                    return;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let _ = tx
                    .send(Err(GenerationError::Request(format!("{} {}", status, text))))
                    .await;
                return;
            }

            let mut stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));

                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer = buffer[pos + 1..].to_string();
                            if line.is_empty() {
                                continue;
                            }
                            let Some(payload) = line.strip_prefix("data:") else {
                                continue;
                            };
                            let data = payload.trim();
                            if data == "[DONE]" {
                                return;
                            }
                            if let Ok(json_value) = serde_json::from_str::<Value>(data) {
                                for chunk in extract_delta_chunks(&json_value) {
                                    if tx.send(Ok(chunk)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(GenerationError::Stream(err.to_string()))).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, GenerationError> {
        let response = self
            .build_request(&messages, max_tokens, temperature, false)
            .send()
            .await
            .map_err(|err| GenerationError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GenerationError::Request(format!("{} {}", status, text)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| GenerationError::Response(err.to_string()))?;

        payload
            .get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| GenerationError::Response("missing message content".to_string()))
    }
}

/// Pulls content and reasoning fragments out of one streamed delta. A single
/// delta may carry both.
fn extract_delta_chunks(payload: &Value) -> Vec<StreamChunk> {
    let Some(delta) = payload
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("delta"))
    else {
        return Vec::new();
    };

    let mut chunks = Vec::new();
    if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            chunks.push(StreamChunk {
                channel: StreamChannel::Think,
                text: text.to_string(),
            });
        }
    }
    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            chunks.push(StreamChunk {
                channel: StreamChannel::Content,
                text: text.to_string(),
            });
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_content_delta() {
        let payload = serde_json::json!({
            "choices": [{"delta": {"content": "hello"}}]
        });
        let chunks = extract_delta_chunks(&payload);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].channel, StreamChannel::Content);
        assert_eq!(chunks[0].text, "hello");
    }

    #[test]
    fn extracts_reasoning_before_content() {
        let payload = serde_json::json!({
            "choices": [{"delta": {"content": "answer", "reasoning_content": "thinking"}}]
        });
        let chunks = extract_delta_chunks(&payload);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].channel, StreamChannel::Think);
        assert_eq!(chunks[1].channel, StreamChannel::Content);
    }

    #[test]
    fn ignores_empty_or_missing_deltas() {
        assert!(extract_delta_chunks(&serde_json::json!({"choices": []})).is_empty());
        let payload = serde_json::json!({"choices": [{"delta": {"content": ""}}]});
        assert!(extract_delta_chunks(&payload).is_empty());
    }
}
