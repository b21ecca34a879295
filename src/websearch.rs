//! Web search gateway.
//!
//! An unconfigured endpoint degrades to empty results; only transport and
//! provider failures surface as errors, which callers soften per the
//! retrieval error policy.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::GatewayConfig;
use crate::retrieval::{HitOrigin, RetrievalHit};

/// Providers that report no relevance score get this one.
const DEFAULT_WEB_SCORE: f32 = 0.8;

#[derive(Debug, Error)]
pub enum WebSearchError {
    #[error("web search request failed: {0}")]
    Request(String),
    #[error("web search response malformed: {0}")]
    Response(String),
}

#[async_trait]
pub trait WebSearchGateway: Send + Sync {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<RetrievalHit>, WebSearchError>;
}

/// HTTP client for a JSON web-search API.
///
/// Expects a POST endpoint answering with
/// `{"data": {"webPages": {"value": [{"name", "snippet", "url"}]}}}`.
pub struct HttpWebSearchClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpWebSearchClient {
    pub fn new(gateways: &GatewayConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(gateways.web_search_timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            client,
            endpoint: gateways.web_search_endpoint.clone(),
            api_key: gateways.web_search_api_key.clone(),
        }
    }

    fn configured(&self) -> bool {
        !self.endpoint.is_empty()
    }
}

#[async_trait]
impl WebSearchGateway for HttpWebSearchClient {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<RetrievalHit>, WebSearchError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        if !self.configured() {
            tracing::debug!("Web search endpoint not configured; returning no results");
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "query": query,
            "count": max_results.min(10),
            "freshness": "oneYear",
            "summary": true,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| WebSearchError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(WebSearchError::Request(format!("{} {}", status, text)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| WebSearchError::Response(err.to_string()))?;

        Ok(parse_web_results(&payload, max_results))
    }
}

fn parse_web_results(payload: &Value, max_results: usize) -> Vec<RetrievalHit> {
    let items = payload
        .get("data")
        .and_then(|v| v.get("webPages"))
        .and_then(|v| v.get("value"))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut results = Vec::new();
    for item in items.iter().take(max_results) {
        let title = item
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let content = item
            .get("snippet")
            .or_else(|| item.get("summary"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let url = item
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        if content.is_empty() || url.is_empty() {
            continue;
        }

        results.push(RetrievalHit {
            content,
            score: DEFAULT_WEB_SCORE,
            origin: HitOrigin::WebSearch,
            title,
            locator: url,
        });
    }

    results
}
