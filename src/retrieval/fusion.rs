//! Merges knowledge-base and web hits into one ranked, deduplicated list.

use super::{HitOrigin, RetrievalHit};

#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Multiplier applied to knowledge-base scores before ranking.
    pub knowledge_weight: f32,
    /// Multiplier applied to web scores before ranking.
    pub web_weight: f32,
    /// Characters of normalized content used as the dedup key.
    pub dedup_prefix_len: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            knowledge_weight: 1.0,
            web_weight: 1.0,
            dedup_prefix_len: 100,
        }
    }
}

impl From<&crate::config::SearchConfig> for FusionConfig {
    fn from(config: &crate::config::SearchConfig) -> Self {
        Self {
            knowledge_weight: config.knowledge_weight,
            web_weight: config.web_weight,
            dedup_prefix_len: config.dedup_prefix_len,
        }
    }
}

/// Fuses both hit lists into a single list ordered by descending weighted
/// score, deduplicated on a normalized content prefix and capped at
/// `max_results`. Empty inputs produce an empty output.
pub fn fuse(
    knowledge_hits: &[RetrievalHit],
    web_hits: &[RetrievalHit],
    max_results: usize,
    config: &FusionConfig,
) -> Vec<RetrievalHit> {
    let mut scored: Vec<RetrievalHit> = knowledge_hits
        .iter()
        .chain(web_hits.iter())
        .map(|hit| {
            let weight = match hit.origin {
                HitOrigin::KnowledgeBase => config.knowledge_weight,
                HitOrigin::WebSearch => config.web_weight,
            };
            let mut rescored = hit.clone();
            rescored.score = hit.score * weight;
            rescored
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // First-seen wins; the sort above guarantees that is the highest score.
    let mut seen = std::collections::HashSet::new();
    let mut fused = Vec::new();
    for hit in scored {
        let key = normalized_prefix(&hit.content, config.dedup_prefix_len);
        if key.is_empty() || seen.insert(key) {
            fused.push(hit);
        }
        if fused.len() >= max_results {
            break;
        }
    }

    fused
}

/// Dedup key: lowercase, whitespace collapsed to single spaces, first `len`
/// characters.
fn normalized_prefix(text: &str, len: usize) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed.chars().take(len).collect()
}
