use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use finrag_core::{find_metric_value, CompanyRegistry, MetricKey, MetricValue};
use finrag_llm::ChatModel;

use crate::analyst::{Analyst, Intent};
use crate::error::QueryError;
use crate::rerank::{Reranker, DEFAULT_RERANK_TOP_N};
use crate::store::{build_filter, Retriever};

static DIGIT_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("valid digit regex"));

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Hits fetched from the store per sub-query.
    pub top_k: usize,
    /// Hits kept after reranking.
    pub rerank_top_n: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            rerank_top_n: DEFAULT_RERANK_TOP_N,
        }
    }
}

/// One reranked hit seen while answering a sub-query.
#[derive(Debug, Clone, Serialize)]
pub struct SubQueryResult {
    pub sub_query: String,
    pub company: Option<String>,
    pub year: Option<String>,
    pub page: Option<u32>,
    pub metric_key: Option<MetricKey>,
    pub value: Option<MetricValue>,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub company: Option<String>,
    pub year: Option<String>,
    pub excerpt: String,
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query: String,
    pub answer: Option<String>,
    pub reasoning: Option<String>,
    pub intent: Intent,
    pub sub_queries: Vec<String>,
    pub sources: Vec<Source>,
}

/// Years (1900-2099) mentioned in `query`, first occurrence order, no repeats.
/// A year is a run of exactly four digits, so `FY2023` counts and `20231`
/// does not.
pub fn infer_years(query: &str) -> Vec<String> {
    let mut years: Vec<String> = Vec::new();
    for found in DIGIT_RUN_RE.find_iter(query) {
        let digits = found.as_str();
        if digits.len() != 4 || !(digits.starts_with("19") || digits.starts_with("20")) {
            continue;
        }
        let year = digits.to_string();
        if !years.contains(&year) {
            years.push(year);
        }
    }
    years
}

pub struct QueryEngine<R, M> {
    retriever: R,
    reranker: Box<dyn Reranker>,
    analyst: Option<Analyst<M>>,
    registry: CompanyRegistry,
    config: EngineConfig,
}

impl<R: Retriever, M: ChatModel> QueryEngine<R, M> {
    pub fn new(
        retriever: R,
        reranker: Box<dyn Reranker>,
        analyst: Option<Analyst<M>>,
        registry: CompanyRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            retriever,
            reranker,
            analyst,
            registry,
            config,
        }
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    pub fn has_llm(&self) -> bool {
        self.analyst.is_some()
    }

    pub fn ask(&self, query: &str) -> Result<QueryResponse, QueryError> {
        let analyst = self.analyst.as_ref().ok_or_else(|| {
            QueryError::LlmUnavailable("no LLM client is configured".to_string())
        })?;

        let plan = analyst.decompose(query)?;
        info!(
            target: "finrag::engine",
            intent = %plan.intent,
            sub_queries = plan.sub_queries.len(),
            "query planned"
        );

        let years = infer_years(query);
        let mut evidence = Vec::new();
        for sub_query in &plan.sub_queries {
            evidence.extend(self.retrieve_sub_query(sub_query, &years)?);
        }

        let synthesis = analyst.synthesize(query, &plan.sub_queries, &evidence);
        if synthesis.is_none() {
            warn!(target: "finrag::engine", "synthesis produced no answer, returning evidence only");
        }
        let (answer, reasoning) = match synthesis {
            Some(s) => (Some(s.answer), Some(s.reasoning)),
            None => (None, None),
        };

        let sources = evidence
            .into_iter()
            .map(|row| Source {
                company: row.company,
                year: row.year,
                excerpt: row.excerpt,
                page: row.page,
            })
            .collect();

        Ok(QueryResponse {
            query: query.to_string(),
            answer,
            reasoning,
            intent: plan.intent,
            sub_queries: plan.sub_queries,
            sources,
        })
    }

    fn retrieve_sub_query(
        &self,
        sub_query: &str,
        years: &[String],
    ) -> Result<Vec<SubQueryResult>, QueryError> {
        let companies: Vec<String> = self
            .registry
            .match_company(sub_query)
            .map(|company| vec![company.ticker.clone()])
            .unwrap_or_default();
        let filter = build_filter(&companies, years);

        let hits = self
            .retriever
            .retrieve(sub_query, self.config.top_k, filter.as_ref())
            .map_err(|e| QueryError::Retrieval {
                sub_query: sub_query.to_string(),
                message: format!("{e:#}"),
            })?;
        let metric_key = MetricKey::infer(sub_query);
        let retrieved = hits.len();

        let ranked = self
            .reranker
            .rerank(sub_query, hits, self.config.rerank_top_n)
            .map_err(|e| QueryError::Rerank {
                sub_query: sub_query.to_string(),
                message: format!("{e:#}"),
            })?;
        debug!(
            target: "finrag::engine",
            sub_query,
            filter = %filter.as_ref().map(|f| f.to_json()).unwrap_or_default(),
            metric = ?metric_key,
            retrieved,
            kept = ranked.len(),
            "sub-query retrieved"
        );

        Ok(ranked
            .into_iter()
            .map(|ranked| SubQueryResult {
                sub_query: sub_query.to_string(),
                company: ranked.hit.company.clone(),
                year: ranked.hit.year.clone(),
                page: Some(ranked.hit.page_start),
                metric_key,
                value: metric_key.and_then(|key| find_metric_value(&ranked.hit.text, key)),
                excerpt: ranked.hit.text,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn years_are_deduplicated_in_order() {
        assert_eq!(
            infer_years("Compare 2023 vs 2022 margins (FY2023 and 2023)"),
            vec!["2023".to_string(), "2022".to_string()]
        );
        assert_eq!(
            infer_years("What was NVIDIA's FY2023 data center revenue?"),
            vec!["2023".to_string()]
        );
        assert_eq!(infer_years("fiscal-2021 and Q4'1998"), vec!["2021".to_string(), "1998".to_string()]);
        assert_eq!(infer_years("revenue in 1999 and 2101"), vec!["1999".to_string()]);
        assert!(infer_years("no years, only 20231, 120230 and 123").is_empty());
    }
}
