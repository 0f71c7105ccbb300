//! Second-stage relevance scoring over a small candidate set.
//!
//! Retrieval hands over at most `top_k` hits; the reranker scores each
//! `(query, text)` pair, orders by score and keeps the best `top_n`.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::env;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::RetrievalHit;

pub const DEFAULT_RERANK_TOP_N: usize = 3;
pub const DEFAULT_RERANK_MODEL: &str = "BAAI/bge-reranker-large";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedHit {
    #[serde(flatten)]
    pub hit: RetrievalHit,
    pub rerank_score: f32,
}

pub trait Reranker {
    /// One score per text, higher is more relevant.
    fn score(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>>;

    fn label(&self) -> String;

    fn rerank(&self, query: &str, hits: Vec<RetrievalHit>, top_n: usize) -> Result<Vec<RankedHit>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<&str> = hits.iter().map(|h| h.text.as_str()).collect();
        let scores = self.score(query, &texts)?;
        if scores.len() != hits.len() {
            return Err(anyhow!(
                "{} returned {} scores for {} hits",
                self.label(),
                scores.len(),
                hits.len()
            ));
        }
        let mut ranked: Vec<RankedHit> = hits
            .into_iter()
            .zip(scores)
            .map(|(hit, rerank_score)| RankedHit { hit, rerank_score })
            .collect();
        // sort_by is stable: ties keep retrieval order
        ranked.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(Ordering::Equal)
        });
        ranked.truncate(top_n);
        Ok(ranked)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankSettings {
    /// Base URL of a cross-encoder server. Unset means lexical reranking.
    pub url: Option<String>,
    pub model: String,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            url: None,
            model: DEFAULT_RERANK_MODEL.to_string(),
        }
    }
}

impl RerankSettings {
    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var("RERANKER_URL") {
            if !url.trim().is_empty() {
                self.url = Some(url);
            }
        }
    }
}

pub fn build_reranker(settings: &RerankSettings) -> Result<Box<dyn Reranker>> {
    match settings.url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Ok(Box::new(CrossEncoderReranker::new(
            url,
            &settings.model,
        )?)),
        _ => Ok(Box::new(LexicalReranker)),
    }
}

/// Cross-encoder served over HTTP, text-embeddings-inference style:
/// `POST {url}/rerank {query, texts, raw_scores}` answering `[{index, score}]`.
/// Cohere/Jina style `{results: [{index, relevance_score}]}` is accepted too.
pub struct CrossEncoderReranker {
    http: Client,
    url: String,
    model: String,
}

impl CrossEncoderReranker {
    pub fn new(url: &str, model: &str) -> Result<Self> {
        Ok(Self {
            http: Client::builder()
                .build()
                .context("failed to build reranker http client")?,
            url: format!("{}/rerank", url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RerankResponse {
    Scores(Vec<ScoredIndex>),
    Results { results: Vec<ScoredIndex> },
}

#[derive(Deserialize)]
struct ScoredIndex {
    index: usize,
    #[serde(alias = "relevance_score")]
    score: f32,
}

impl Reranker for CrossEncoderReranker {
    fn score(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>> {
        let payload = serde_json::json!({
            "model": self.model,
            "query": query,
            "texts": texts,
            "documents": texts,
            "raw_scores": true,
        });
        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .with_context(|| format!("rerank request to {} failed", self.url))?;
        if !response.status().is_success() {
            return Err(anyhow!("rerank request failed: {}", response.status()));
        }
        let entries = match response.json::<RerankResponse>()? {
            RerankResponse::Scores(entries) => entries,
            RerankResponse::Results { results } => results,
        };
        let mut scores = vec![f32::NEG_INFINITY; texts.len()];
        for entry in entries {
            let slot = scores
                .get_mut(entry.index)
                .ok_or_else(|| anyhow!("reranker returned out-of-range index {}", entry.index))?;
            *slot = entry.score;
        }
        Ok(scores)
    }

    fn label(&self) -> String {
        format!("cross-encoder:{}", self.model)
    }
}

/// Offline scorer: share of query terms present in the passage, with a bonus
/// when the passage contains the whole query phrase.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalReranker;

fn terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '%'))
        .filter(|t| t.len() >= 2)
        .map(str::to_string)
        .collect()
}

impl Reranker for LexicalReranker {
    fn score(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>> {
        let query_terms: HashSet<String> = terms(query).into_iter().collect();
        let phrase = query.trim().to_lowercase();
        let scores = texts
            .iter()
            .map(|text| {
                if query_terms.is_empty() {
                    return 0.0;
                }
                let lowered = text.to_lowercase();
                let present: HashSet<String> = terms(&lowered).into_iter().collect();
                let hits = query_terms.intersection(&present).count();
                let mut score = hits as f32 / query_terms.len() as f32;
                if !phrase.is_empty() && lowered.contains(&phrase) {
                    score += 0.5;
                }
                score
            })
            .collect::<Vec<_>>();
        debug!(target: "finrag::rerank", candidates = scores.len(), "lexical scores computed");
        Ok(scores)
    }

    fn label(&self) -> String {
        "lexical".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, text: &str) -> RetrievalHit {
        RetrievalHit {
            id: id.to_string(),
            doc_id: "doc".to_string(),
            text: text.to_string(),
            company: Some("MSFT".to_string()),
            year: Some("2023".to_string()),
            source_pdf: "MSFT_2023.pdf".to_string(),
            page_start: 1,
            page_end: 1,
            distance: 0.4,
        }
    }

    #[test]
    fn lexical_orders_by_overlap_and_truncates() {
        let hits = vec![
            hit("a", "Headcount grew across regions."),
            hit("b", "Operating margin was 42% in fiscal 2023."),
            hit("c", "Margin pressure eased."),
            hit("d", "Nothing relevant here."),
        ];
        let ranked = LexicalReranker
            .rerank("Microsoft operating margin 2023", hits, DEFAULT_RERANK_TOP_N)
            .unwrap();
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].hit.id, "b");
        assert_eq!(ranked[1].hit.id, "c");
        assert!(ranked[0].rerank_score >= ranked[1].rerank_score);
        assert_eq!(ranked[0].hit.company.as_deref(), Some("MSFT"));
    }

    #[test]
    fn ties_keep_retrieval_order() {
        let hits = vec![hit("first", "alpha"), hit("second", "beta")];
        let ranked = LexicalReranker.rerank("gamma", hits, 5).unwrap();
        let ids: Vec<_> = ranked.iter().map(|r| r.hit.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn ranked_hit_serializes_flat() {
        let ranked = RankedHit {
            hit: hit("a", "text"),
            rerank_score: 1.5,
        };
        let value = serde_json::to_value(&ranked).unwrap();
        assert_eq!(value["id"], "a");
        assert_eq!(value["rerank_score"], 1.5);
    }

    #[test]
    fn factory_falls_back_to_lexical() {
        let reranker = build_reranker(&RerankSettings::default()).unwrap();
        assert_eq!(reranker.label(), "lexical");
        let remote = build_reranker(&RerankSettings {
            url: Some("http://localhost:8080/".to_string()),
            ..RerankSettings::default()
        })
        .unwrap();
        assert_eq!(remote.label(), "cross-encoder:BAAI/bge-reranker-large");
    }
}
