mod chunk;
mod company;
mod embedding;
mod error;
mod ingest;
mod metrics;
mod parser;
mod tokenizer;

pub use chunk::{Chunk, ChunkConfig, Chunker};
pub use company::{Company, CompanyRegistry};
pub use embedding::{normalize, HashEmbedder, HashEmbedderConfig};
pub use error::{FilingError, Result};
pub use ingest::{
    build_page, extract_pdf_pages, pages_from_texts, persist_markdown, render_markdown,
    table_to_markdown, write_filing, IngestedFiling, PageRecord,
};
pub use metrics::{find_metric_value, money_to_float, MetricKey, MetricValue, ValueKind};
pub use parser::{clean_whitespace, dehyphenate, parse_company_year_from_filename};
pub use tokenizer::{BpeCodec, TokenCodec, TokenizerKind};
