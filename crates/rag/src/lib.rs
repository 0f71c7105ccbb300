pub mod analyst;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod rerank;
pub mod store;

pub use analyst::{
    parse_plan, parse_synthesis, trim_to_json_object, Analyst, Intent, QueryPlan, Synthesis,
    INSUFFICIENT_EVIDENCE,
};
pub use embedding::{EmbeddingBackend, EmbeddingClient, EmbeddingSettings};
pub use engine::{infer_years, EngineConfig, QueryEngine, QueryResponse, Source, SubQueryResult};
pub use error::QueryError;
pub use indexer::{build_index, discover_pdfs, index_filing, BuildOutcome, BuildSettings, IndexStats};
pub use rerank::{
    build_reranker, CrossEncoderReranker, LexicalReranker, RankedHit, RerankSettings, Reranker,
    DEFAULT_RERANK_TOP_N,
};
pub use store::{
    build_filter, ChunkMetadata, ChunkStore, FilterField, MetadataFilter, RetrievalHit, Retriever,
};
pub use finrag_llm::{ChatModel, LlmClient, LlmProvider, LlmRequest, LlmResponse};
