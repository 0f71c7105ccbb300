use thiserror::Error;

/// Failures that abort a whole `ask`. Synthesis problems are not here: they
/// degrade to a response without an answer.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("llm not available for query decomposition: {0}")]
    LlmUnavailable(String),
    #[error("llm request failed: {0}")]
    Llm(String),
    #[error("llm decomposition failed: {reason}\nraw response: {raw}")]
    Decomposition { reason: String, raw: String },
    #[error("retrieval failed for sub-query '{sub_query}': {message}")]
    Retrieval { sub_query: String, message: String },
    #[error("rerank failed for sub-query '{sub_query}': {message}")]
    Rerank { sub_query: String, message: String },
}

impl QueryError {
    pub(crate) fn decomposition(reason: impl Into<String>, raw: &str) -> Self {
        Self::Decomposition {
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }
}
