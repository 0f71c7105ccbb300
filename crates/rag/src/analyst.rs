use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};

use finrag_core::{CompanyRegistry, MetricKey, MetricValue};
use finrag_llm::{ChatModel, LlmRequest};

use crate::engine::SubQueryResult;
use crate::error::QueryError;

/// The exact reply the model must give when the evidence cannot answer.
pub const INSUFFICIENT_EVIDENCE: &str = "Insufficient evidence in provided sources.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    CompareMetricOneYear,
    YoyGrowth,
    ShareOfTotal,
    DirectMetric,
    CollectAiMentions,
    Default,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::CompareMetricOneYear,
        Intent::YoyGrowth,
        Intent::ShareOfTotal,
        Intent::DirectMetric,
        Intent::CollectAiMentions,
        Intent::Default,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::CompareMetricOneYear => "compare_metric_one_year",
            Intent::YoyGrowth => "yoy_growth",
            Intent::ShareOfTotal => "share_of_total",
            Intent::DirectMetric => "direct_metric",
            Intent::CollectAiMentions => "collect_ai_mentions",
            Intent::Default => "default",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Intent::ALL
            .into_iter()
            .find(|intent| intent.as_str() == value.trim())
            .ok_or_else(|| format!("unknown intent '{value}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub intent: Intent,
    pub sub_queries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synthesis {
    pub answer: String,
    pub reasoning: String,
}

/// Evidence as shown to the model: no raw hit payloads.
#[derive(Debug, Serialize)]
struct EvidenceRow<'a> {
    company: Option<&'a str>,
    year: Option<&'a str>,
    page: Option<u32>,
    metric_key: Option<MetricKey>,
    value: Option<MetricValue>,
    excerpt: &'a str,
}

fn compact_evidence(rows: &[SubQueryResult]) -> Vec<EvidenceRow<'_>> {
    rows.iter()
        .map(|row| EvidenceRow {
            company: row.company.as_deref(),
            year: row.year.as_deref(),
            page: row.page,
            metric_key: row.metric_key,
            value: row.value,
            excerpt: &row.excerpt,
        })
        .collect()
}

/// Keeps the text between the first `{` and the last `}` when both exist in
/// that order; anything else is returned unchanged.
pub fn trim_to_json_object(text: &str) -> &str {
    let text = text.trim();
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    }
}

pub fn parse_plan(raw: &str) -> Result<QueryPlan, QueryError> {
    let value: Value = serde_json::from_str(trim_to_json_object(raw))
        .map_err(|e| QueryError::decomposition(format!("invalid json: {e}"), raw))?;
    let object = value
        .as_object()
        .ok_or_else(|| QueryError::decomposition("expected a json object", raw))?;

    let intent = object
        .get("intent")
        .and_then(Value::as_str)
        .ok_or_else(|| QueryError::decomposition("missing string field 'intent'", raw))?
        .parse::<Intent>()
        .map_err(|reason| QueryError::decomposition(reason, raw))?;

    let items = object
        .get("sub_queries")
        .and_then(Value::as_array)
        .ok_or_else(|| QueryError::decomposition("missing list field 'sub_queries'", raw))?;
    if items.is_empty() {
        return Err(QueryError::decomposition("'sub_queries' is empty", raw));
    }
    let mut sub_queries = Vec::with_capacity(items.len());
    for item in items {
        match item.as_str().map(str::trim) {
            Some(text) if !text.is_empty() => sub_queries.push(text.to_string()),
            _ => {
                return Err(QueryError::decomposition(
                    format!("sub-query {item} is not a non-blank string"),
                    raw,
                ))
            }
        }
    }
    Ok(QueryPlan {
        intent,
        sub_queries,
    })
}

pub fn parse_synthesis(raw: &str) -> Result<Synthesis, String> {
    let value: Value =
        serde_json::from_str(trim_to_json_object(raw)).map_err(|e| format!("invalid json: {e}"))?;
    let field = |name: &str| -> Result<String, String> {
        match value.get(name) {
            Some(Value::String(text)) => Ok(text.clone()),
            Some(Value::Null) | None => Err(format!("missing field '{name}'")),
            Some(other) => Ok(other.to_string()),
        }
    };
    Ok(Synthesis {
        answer: field("answer")?,
        reasoning: field("reasoning")?,
    })
}

pub fn decomposition_prompt(query: &str, registry: &CompanyRegistry) -> String {
    let names: Vec<&str> = registry.companies().iter().map(|c| c.name.as_str()).collect();
    let compare = json!({
        "intent": Intent::CompareMetricOneYear,
        "sub_queries": names
            .iter()
            .map(|name| format!("{name} operating margin 2023"))
            .collect::<Vec<_>>(),
    });
    let growth_company = names.last().copied().unwrap_or("NVIDIA");
    let growth = json!({
        "intent": Intent::YoyGrowth,
        "sub_queries": [
            format!("{growth_company} data center revenue 2022"),
            format!("{growth_company} data center revenue 2023"),
        ],
    });
    let intents = Intent::ALL
        .iter()
        .map(Intent::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "You are a financial query decomposition engine.\n\n\
         1. Identify the user's intent. Choose exactly one of: [{intents}].\n\
         2. Generate `sub_queries`, a list of simpler queries.\n\
         - If the user asks for a comparison (highest, lowest, compare), ALWAYS include all companies: {all}, even if the question names only one.\n\
         - Each sub-query must name a company, a metric and the year when one is given.\n\
         - Keep them short and consistent.\n\n\
         Respond with VALID JSON ONLY: {{\"intent\": \"...\", \"sub_queries\": [\"...\"]}}\n\n\
         User query: \"{query}\"\n\n\
         Example input: \"Which company had the highest operating margin in 2023?\"\n\
         Example output: {compare}\n\n\
         Example input: \"How much did {growth_company}'s data center revenue grow from 2022 to 2023?\"\n\
         Example output: {growth}\n\n\
         Now decompose the given query.",
        all = registry.display_names(),
    )
}

pub fn synthesis_prompt(query: &str, sub_queries: &[String], evidence: &[SubQueryResult]) -> String {
    let data = json!({
        "query": query,
        "sub_queries": sub_queries,
        "evidence": compact_evidence(evidence),
    });
    format!(
        "You are a financial analysis assistant. Use ONLY the provided evidence, never outside knowledge.\n\
         - Quote financial figures exactly as written, keeping % signs and units.\n\
         - If the question asks for a comparison and numeric values are present for the compared items, compute it and state the winner clearly.\n\
         - If numeric values are missing but relevant qualitative statements exist, answer by quoting those statements verbatim.\n\
         - If nothing in the evidence answers the question, set answer to exactly: \"{INSUFFICIENT_EVIDENCE}\"\n\
         - Never invent numbers, estimates or ranges.\n\n\
         DATA:\n{data}\n\n\
         Respond with JSON only: {{\"answer\": \"...\", \"reasoning\": \"...\"}}"
    )
}

/// Drives the two LLM steps of a query: planning and answer synthesis.
pub struct Analyst<M> {
    model: M,
    registry: CompanyRegistry,
}

impl<M: ChatModel> Analyst<M> {
    pub fn new(model: M, registry: CompanyRegistry) -> Self {
        Self { model, registry }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// A bad plan cannot be worked around, so every failure here is returned.
    pub fn decompose(&self, query: &str) -> Result<QueryPlan, QueryError> {
        let request = LlmRequest::user(decomposition_prompt(query, &self.registry));
        let response = self
            .model
            .complete(&request)
            .map_err(|e| QueryError::Llm(format!("{}: {e:#}", self.model.label())))?;
        let plan = parse_plan(&response.content)?;
        debug!(
            target: "finrag::analyst",
            intent = %plan.intent,
            sub_queries = plan.sub_queries.len(),
            tokens = response.total_tokens(),
            "query decomposed"
        );
        Ok(plan)
    }

    /// Returns `None` when the model fails or answers in the wrong shape; the
    /// caller still has the evidence to show.
    pub fn synthesize(
        &self,
        query: &str,
        sub_queries: &[String],
        evidence: &[SubQueryResult],
    ) -> Option<Synthesis> {
        let request = LlmRequest::user(synthesis_prompt(query, sub_queries, evidence));
        let response = match self.model.complete(&request) {
            Ok(response) => response,
            Err(err) => {
                error!(target: "finrag::analyst", error = %format!("{err:#}"), "synthesis request failed");
                return None;
            }
        };
        debug!(
            target: "finrag::analyst",
            tokens = response.total_tokens(),
            "synthesis received"
        );
        match parse_synthesis(&response.content) {
            Ok(synthesis) => Some(synthesis),
            Err(reason) => {
                error!(
                    target: "finrag::analyst",
                    %reason,
                    raw = %response.content,
                    "synthesis response rejected"
                );
                None
            }
        }
    }
}
