use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use finrag_core::{ChunkConfig, Company, CompanyRegistry};
use finrag_rag::{EmbeddingSettings, EngineConfig, RerankSettings, DEFAULT_RERANK_TOP_N};

pub const DEFAULT_CONFIG: &str = "finrag.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub retrieval: RetrievalConfig,
    pub chunking: ChunkingConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingSettings,
    pub rerank: RerankSettings,
    /// Replaces the built-in GOOGL/MSFT/NVDA registry when non-empty.
    pub companies: Vec<Company>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub pdf_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub db: PathBuf,
    pub history: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            pdf_dir: PathBuf::from("data/pdfs"),
            artifacts_dir: PathBuf::from("artifacts/processed"),
            db: PathBuf::from("finrag.sqlite"),
            history: PathBuf::from("chat_history.json"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub collection: String,
    pub top_k: usize,
    pub rerank_top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            collection: "filings".to_string(),
            top_k: 10,
            rerank_top_k: DEFAULT_RERANK_TOP_N,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_tokens: usize,
    pub overlap_tokens: usize,
    pub tokenizer: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        let base = ChunkConfig::default();
        Self {
            chunk_tokens: base.chunk_tokens,
            overlap_tokens: base.overlap_tokens,
            tokenizer: "cl100k_base".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    /// Falls back to the provider's default model.
    pub model: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: None,
        }
    }
}

impl AppConfig {
    pub fn apply_env(&mut self) {
        if let Ok(provider) = env::var("FINRAG_LLM_PROVIDER") {
            self.llm.provider = provider;
        }
        if let Ok(model) = env::var("FINRAG_LLM_MODEL") {
            self.llm.model = Some(model);
        }
        self.embedding.apply_env();
        self.rerank.apply_env();
    }

    pub fn registry(&self) -> CompanyRegistry {
        if self.companies.is_empty() {
            CompanyRegistry::default()
        } else {
            CompanyRegistry::new(self.companies.clone())
        }
    }

    pub fn chunk_config(&self) -> Result<ChunkConfig> {
        let config = ChunkConfig {
            chunk_tokens: self.chunking.chunk_tokens,
            overlap_tokens: self.chunking.overlap_tokens,
        };
        if config.chunk_tokens == 0 {
            return Err(anyhow!("chunking.chunk_tokens must be positive"));
        }
        Ok(config)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            top_k: self.retrieval.top_k,
            rerank_top_n: self.retrieval.rerank_top_k,
        }
    }
}

/// Missing files are not an error: every field has a default.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).map_err(|e| anyhow!("invalid config: {e}"))
}
