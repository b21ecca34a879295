//! Retrieval primitives shared by the knowledge base and web search paths.
//!
//! Hits from both sources are normalized to [`RetrievalHit`] so the fusion
//! ranker and the prompt builder never care where a result came from.

pub mod decision;
pub mod fusion;

use serde::{Deserialize, Serialize};

/// Where a retrieval hit originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitOrigin {
    KnowledgeBase,
    WebSearch,
}

/// One retrieval result, normalized across sources.
///
/// `locator` holds the document source path for knowledge-base hits and the
/// URL for web hits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub content: String,
    pub score: f32,
    pub origin: HitOrigin,
    pub title: String,
    pub locator: String,
}
