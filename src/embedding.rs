//! Embedding gateway: text in, fixed-dimension vector out.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::GatewayConfig;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding input was empty")]
    EmptyInput,
    #[error("embedding request failed: {0}")]
    Request(String),
    #[error("embedding response malformed: {0}")]
    Response(String),
}

#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embeds a batch of texts; the result is index-aligned with the input.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// HTTP client for an OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpEmbeddingClient {
    pub fn new(gateways: &GatewayConfig, model: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(gateways.embedding_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: gateways.embedding_base_url.trim_end_matches('/').to_string(),
            api_key: gateways.embedding_api_key.clone(),
            model: model.to_string(),
        }
    }

    async fn request(&self, input: Value) -> Result<Value, EmbeddingError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
            "encoding_format": "float",
        });

        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| EmbeddingError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Request(format!("{} {}", status, text)));
        }

        response
            .json()
            .await
            .map_err(|err| EmbeddingError::Response(err.to_string()))
    }
}

#[async_trait]
impl EmbeddingGateway for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let payload = self.request(Value::String(text.trim().to_string())).await?;
        let vectors = parse_embedding_data(&payload)?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Response("no embedding in response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let input = Value::Array(texts.iter().map(|t| Value::String(t.clone())).collect());
        let payload = self.request(input).await?;
        let vectors = parse_embedding_data(&payload)?;

        if vectors.len() != texts.len() {
            return Err(EmbeddingError::Response(format!(
                "embedding count mismatch: {} != {}",
                vectors.len(),
                texts.len()
            )));
        }

        Ok(vectors)
    }
}

fn parse_embedding_data(payload: &Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = payload
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| EmbeddingError::Response("missing data array".to_string()))?;

    data.iter()
        .map(|item| {
            item.get("embedding")
                .and_then(|v| v.as_array())
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|v| v.as_f64())
                        .map(|v| v as f32)
                        .collect::<Vec<f32>>()
                })
                .filter(|vector| !vector.is_empty())
                .ok_or_else(|| EmbeddingError::Response("missing embedding values".to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_embedding_payload() {
        let payload = serde_json::json!({
            "data": [
                {"embedding": [0.1, 0.2]},
                {"embedding": [0.3, 0.4]},
            ]
        });

        let vectors = parse_embedding_data(&payload).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1].len(), 2);
    }

    #[test]
    fn rejects_malformed_payload() {
        assert!(parse_embedding_data(&serde_json::json!({"data": "nope"})).is_err());
        assert!(parse_embedding_data(&serde_json::json!({"data": [{"embedding": []}]})).is_err());
    }
}
