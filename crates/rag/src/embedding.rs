use std::env;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use finrag_core::{normalize, HashEmbedder, HashEmbedderConfig};

/// The embedding family is trained with asymmetric inputs: stored passages and
/// search queries carry different prefixes.
pub const PASSAGE_PREFIX: &str = "passage: ";
pub const QUERY_PREFIX: &str = "query: ";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// `hash` (offline) or `openai` (any OpenAI-compatible `/embeddings` server).
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub dimensions: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            model: "google/embeddinggemma-300m".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            dimensions: 256,
            batch_size: 32,
        }
    }
}

impl EmbeddingSettings {
    pub fn apply_env(&mut self) {
        if let Ok(provider) = env::var("EMBEDDING_PROVIDER") {
            self.provider = provider;
        }
        if let Ok(model) = env::var("EMBEDDING_MODEL") {
            self.model = model;
        }
        if let Ok(url) = env::var("EMBEDDING_BASE_URL") {
            self.base_url = url;
        }
    }
}

#[derive(Clone)]
pub enum EmbeddingBackend {
    Hash(HashEmbedder),
    Http(HttpEmbeddingClient),
}

#[derive(Clone)]
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self> {
        match settings.provider.trim().to_lowercase().as_str() {
            "hash" => Ok(Self::hash(settings.dimensions)),
            "openai" | "http" => Ok(Self {
                backend: EmbeddingBackend::Http(HttpEmbeddingClient::new(settings)?),
            }),
            other => Err(anyhow!("unknown embedding provider {other}")),
        }
    }

    pub fn hash(dimensions: usize) -> Self {
        Self {
            backend: EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig {
                dimensions,
                ..HashEmbedderConfig::default()
            })),
        }
    }

    pub fn label(&self) -> String {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => format!("hash:{}", embedder.dimensions()),
            EmbeddingBackend::Http(client) => format!("http:{}", client.model),
        }
    }

    pub fn embed_passages(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<String> = texts
            .iter()
            .map(|t| format!("{PASSAGE_PREFIX}{t}"))
            .collect();
        self.embed_batch(&inputs)
    }

    pub fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut output = self.embed_batch(&[format!("{QUERY_PREFIX}{text}")])?;
        output
            .pop()
            .ok_or_else(|| anyhow!("embedding backend returned no vector for the query"))
    }

    fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = match &self.backend {
            EmbeddingBackend::Hash(embedder) => inputs
                .iter()
                .map(|text| embedder.embed_text(text))
                .collect(),
            EmbeddingBackend::Http(client) => client.embed_batch(inputs)?,
        };
        if vectors.len() != inputs.len() {
            return Err(anyhow!(
                "embedding backend returned {} vectors for {} inputs",
                vectors.len(),
                inputs.len()
            ));
        }
        Ok(vectors)
    }
}

#[derive(Clone)]
pub struct HttpEmbeddingClient {
    http: Client,
    model: String,
    base_url: String,
    api_key: Option<String>,
    batch_size: usize,
}

impl HttpEmbeddingClient {
    pub fn new(settings: &EmbeddingSettings) -> Result<Self> {
        let api_key = env::var("EMBEDDING_API_KEY")
            .or_else(|_| env::var("OPENAI_API_KEY"))
            .ok();
        Ok(Self {
            http: Client::builder()
                .build()
                .context("failed to build embedding http client")?,
            model: settings.model.clone(),
            base_url: settings.base_url.clone(),
            api_key,
            batch_size: settings.batch_size.max(1),
        })
    }

    pub fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let mut out = Vec::with_capacity(inputs.len());
        for batch in inputs.chunks(self.batch_size) {
            let payload = serde_json::json!({
                "model": self.model,
                "input": batch,
            });
            let mut request = self.http.post(&url).json(&payload);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            let response = request.send().context("embedding request failed")?;
            if !response.status().is_success() {
                return Err(anyhow!(
                    "embedding request failed: {}",
                    response.status()
                ));
            }
            let mut parsed: EmbeddingResponse = response.json()?;
            parsed.data.sort_by_key(|d| d.index.unwrap_or(0));
            for data in parsed.data {
                let mut vector = data.embedding;
                normalize(&mut vector);
                out.push(vector);
            }
        }
        Ok(out)
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passages_and_queries_embed_differently() {
        let client = EmbeddingClient::hash(64);
        let passage = client
            .embed_passages(&["operating margin".to_string()])
            .unwrap()
            .pop()
            .unwrap();
        let query = client.embed_query("operating margin").unwrap();
        assert_eq!(passage.len(), 64);
        assert_ne!(passage, query);
    }

    #[test]
    fn rejects_unknown_provider() {
        let settings = EmbeddingSettings {
            provider: "magic".to_string(),
            ..EmbeddingSettings::default()
        };
        assert!(EmbeddingClient::from_settings(&settings).is_err());
    }
}
