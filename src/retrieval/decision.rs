//! Search strategy decision engine.
//!
//! Given a query and a strategy, decides which sources to consult and
//! fetches from them. Gateway failures degrade to empty results for that
//! source; a chat request is never aborted because retrieval misbehaved.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;

use super::RetrievalHit;
use crate::config::SearchConfig;
use crate::embedding::EmbeddingGateway;
use crate::vector::{SearchFilters, VectorStore};
use crate::websearch::WebSearchGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Knowledge base only.
    KnowledgeOnly,
    /// Web only; the query is reduced to salient keywords first.
    WebOnly,
    /// Both sources, unconditionally.
    Hybrid,
    /// Knowledge base always; web only when the query asks for fresh
    /// information.
    Auto,
    /// No augmentation at all.
    #[serde(alias = "none")]
    Disabled,
}

impl SearchStrategy {
    /// Maps the request-level source toggles onto a strategy when the caller
    /// did not pick one explicitly.
    pub fn from_flags(use_knowledge_base: bool, use_web_search: bool) -> Self {
        match (use_knowledge_base, use_web_search) {
            (true, true) => SearchStrategy::Auto,
            (true, false) => SearchStrategy::KnowledgeOnly,
            (false, true) => SearchStrategy::WebOnly,
            (false, false) => SearchStrategy::Disabled,
        }
    }
}

/// What the engine fetched and why.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub knowledge_hits: Vec<RetrievalHit>,
    pub web_hits: Vec<RetrievalHit>,
    /// Which branch fired, for logs and tests; not user-facing.
    pub reasoning: String,
}

pub struct SearchDecisionEngine {
    embeddings: Arc<dyn EmbeddingGateway>,
    vectors: Arc<dyn VectorStore>,
    web: Arc<dyn WebSearchGateway>,
    config: SearchConfig,
}

impl SearchDecisionEngine {
    pub fn new(
        embeddings: Arc<dyn EmbeddingGateway>,
        vectors: Arc<dyn VectorStore>,
        web: Arc<dyn WebSearchGateway>,
        config: SearchConfig,
    ) -> Self {
        Self {
            embeddings,
            vectors,
            web,
            config,
        }
    }

    pub async fn decide_and_fetch(
        &self,
        query: &str,
        strategy: SearchStrategy,
        scope: &SearchFilters,
    ) -> RetrievalOutcome {
        match strategy {
            SearchStrategy::Disabled => RetrievalOutcome {
                reasoning: "strategy=none; augmentation disabled".to_string(),
                ..RetrievalOutcome::default()
            },
            SearchStrategy::KnowledgeOnly => {
                let knowledge_hits = self.fetch_knowledge(query, scope).await;
                RetrievalOutcome {
                    reasoning: format!(
                        "strategy=knowledge_only; kb_hits={}",
                        knowledge_hits.len()
                    ),
                    knowledge_hits,
                    web_hits: Vec::new(),
                }
            }
            SearchStrategy::WebOnly => {
                let keywords = extract_keywords(query, self.config.web_keyword_limit);
                let web_query = if keywords.is_empty() {
                    query
                } else {
                    keywords.as_str()
                };
                let web_hits = self.fetch_web(web_query).await;
                RetrievalOutcome {
                    reasoning: format!(
                        "strategy=web_only; keywords=\"{}\"; web_hits={}",
                        keywords,
                        web_hits.len()
                    ),
                    knowledge_hits: Vec::new(),
                    web_hits,
                }
            }
            SearchStrategy::Hybrid => {
                let knowledge_hits = self.fetch_knowledge(query, scope).await;
                let web_hits = self.fetch_web(query).await;
                RetrievalOutcome {
                    reasoning: format!(
                        "strategy=hybrid; kb_hits={}; web_hits={}",
                        knowledge_hits.len(),
                        web_hits.len()
                    ),
                    knowledge_hits,
                    web_hits,
                }
            }
            SearchStrategy::Auto => {
                let knowledge_hits = self.fetch_knowledge(query, scope).await;
                let trigger = needs_fresh_information(query, &self.config.freshness_keywords);
                let (web_hits, reasoning) = match trigger {
                    Some(keyword) => {
                        let web_hits = self.fetch_web(query).await;
                        let reasoning = format!(
                            "strategy=auto; kb_hits={}; web_trigger=\"{}\"; web_hits={}",
                            knowledge_hits.len(),
                            keyword,
                            web_hits.len()
                        );
                        (web_hits, reasoning)
                    }
                    None => (
                        Vec::new(),
                        format!(
                            "strategy=auto; kb_hits={}; web_trigger=none",
                            knowledge_hits.len()
                        ),
                    ),
                };
                RetrievalOutcome {
                    knowledge_hits,
                    web_hits,
                    reasoning,
                }
            }
        }
    }

    async fn fetch_knowledge(&self, query: &str, scope: &SearchFilters) -> Vec<RetrievalHit> {
        if query.trim().is_empty() {
            return Vec::new();
        }

        let embedding = match self.embeddings.embed(query).await {
            Ok(embedding) => embedding,
            Err(err) => {
                tracing::warn!("Knowledge search skipped (embedding failed): {}", err);
                return Vec::new();
            }
        };

        match self
            .vectors
            .search(
                &embedding,
                self.config.top_k,
                self.config.similarity_threshold,
                scope,
            )
            .await
        {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!("Knowledge search failed: {}", err);
                Vec::new()
            }
        }
    }

    async fn fetch_web(&self, query: &str) -> Vec<RetrievalHit> {
        match self.web.search(query, self.config.web_max_results).await {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!("Web search failed: {}", err);
                Vec::new()
            }
        }
    }
}

fn word_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid word pattern"))
}

const STOPWORDS: [&str; 24] = [
    "a", "an", "the", "is", "are", "was", "were", "be", "of", "to", "in", "on", "for", "and",
    "or", "what", "which", "who", "how", "why", "when", "does", "do", "did",
];

/// Reduces a query to its salient keywords. Pure function of the input.
pub fn extract_keywords(query: &str, max_terms: usize) -> String {
    word_pattern()
        .find_iter(&query.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .take(max_terms)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Returns the first freshness marker found in the query, if any. Pure
/// function of the query text; the marker list is configuration.
pub fn needs_fresh_information<'a>(query: &str, keywords: &'a [String]) -> Option<&'a str> {
    let lowered = query.to_lowercase();
    keywords
        .iter()
        .find(|keyword| !keyword.is_empty() && lowered.contains(keyword.to_lowercase().as_str()))
        .map(|keyword| keyword.as_str())
}
