use std::env;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use reqwest::{header::HeaderValue, Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::runtime::Builder;
use tokio::time::{sleep, Duration};

const MAX_RETRIES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Gemini,
    OpenAi,
    Anthropic,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Gemini => "gemini",
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Gemini => "gemini-2.5-pro",
            LlmProvider::OpenAi => "gpt-4.1-mini",
            LlmProvider::Anthropic => "claude-3-5-sonnet-latest",
        }
    }

    fn api_key_var(&self) -> &'static str {
        match self {
            LlmProvider::Gemini => "GEMINI_API_KEY",
            LlmProvider::OpenAi => "OPENAI_API_KEY",
            LlmProvider::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "gemini" | "google" => Ok(LlmProvider::Gemini),
            "openai" => Ok(LlmProvider::OpenAi),
            "anthropic" | "claude" => Ok(LlmProvider::Anthropic),
            other => Err(anyhow!("unknown llm provider {other}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub user: String,
}

impl LlmRequest {
    pub fn user(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            user: prompt.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl LlmResponse {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// Blocking text-completion seam used by the query pipeline.
pub trait ChatModel {
    fn complete(&self, req: &LlmRequest) -> Result<LlmResponse>;

    fn label(&self) -> String {
        "chat-model".to_string()
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    api_key: String,
    base_url: String,
    max_tokens: u32,
}

impl LlmClient {
    /// Fails right away when the provider's API key is missing or malformed.
    pub fn new(provider: LlmProvider, model: impl Into<String>) -> Result<Self> {
        let api_key = read_api_key(provider.api_key_var())?;
        let base_url = match provider {
            LlmProvider::Gemini => env::var("GEMINI_BASE_URL").unwrap_or_else(|_| {
                "https://generativelanguage.googleapis.com/v1beta".to_string()
            }),
            LlmProvider::OpenAi => env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            LlmProvider::Anthropic => env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1".to_string()),
        };
        let max_tokens = env::var("LLM_MAX_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2048);
        let model = model.into();
        tracing::info!(provider = provider.as_str(), model = %model, "llm client initialized");
        Ok(Self {
            http: Client::new(),
            provider,
            model,
            api_key,
            base_url,
            max_tokens,
        })
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        match self.provider {
            LlmProvider::Gemini => self.chat_gemini(req).await,
            LlmProvider::OpenAi => self.chat_openai(req).await,
            LlmProvider::Anthropic => self.chat_anthropic(req).await,
        }
    }

    pub fn chat_blocking(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let rt = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to create tokio runtime")?;
        rt.block_on(self.chat(req))
    }

    async fn chat_gemini(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let mut prompt = String::new();
        if let Some(system) = &req.system {
            prompt.push_str("[SYSTEM]\n");
            prompt.push_str(system.trim());
            prompt.push_str("\n\n");
        }
        prompt.push_str(&req.user);
        let payload = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": 0.0 },
        });
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let value = self
            .send_with_retry("gemini", || {
                self.http
                    .post(&url)
                    .header("x-goog-api-key", &self.api_key)
                    .json(&payload)
            })
            .await?;
        let response: GeminiResponse =
            serde_json::from_value(value).context("failed to decode gemini response")?;
        let text = response
            .candidates
            .and_then(|mut c| c.pop())
            .and_then(|candidate| candidate.content.parts.into_iter().find_map(|p| p.text))
            .ok_or_else(|| anyhow!("missing text in Gemini response"))?;
        let usage = response.usage.unwrap_or_default();
        Ok(LlmResponse {
            content: text,
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens: usage.completion_tokens.unwrap_or(0),
        })
    }

    async fn chat_openai(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": req.user }));
        let payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0,
        });
        let value = self
            .send_with_retry("openai", || {
                self.http.post(&url).bearer_auth(&self.api_key).json(&payload)
            })
            .await?;
        let content = extract_openai_text(&value)
            .ok_or_else(|| anyhow!("missing text in OpenAI response"))?;
        let usage: OpenAiUsage = value
            .get("usage")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default();
        Ok(LlmResponse {
            content,
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens: usage.completion_tokens.unwrap_or(0),
        })
    }

    async fn chat_anthropic(&self, req: &LlmRequest) -> Result<LlmResponse> {
        let mut payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [ { "role": "user", "content": req.user } ],
        });
        if let Some(system) = &req.system {
            payload["system"] = json!(system);
        }
        let url = format!("{}/messages", self.base_url.trim_end_matches('/'));
        let value = self
            .send_with_retry("anthropic", || {
                self.http
                    .post(&url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&payload)
            })
            .await?;
        let response: AnthropicResponse =
            serde_json::from_value(value).context("failed to decode anthropic response")?;
        let text = response
            .content
            .into_iter()
            .find_map(|part| part.text)
            .ok_or_else(|| anyhow!("missing text in Anthropic response"))?;
        let usage = response.usage.unwrap_or_default();
        Ok(LlmResponse {
            content: text,
            prompt_tokens: usage.input_tokens.unwrap_or(0),
            completion_tokens: usage.output_tokens.unwrap_or(0),
        })
    }

    /// Sends the request built by `build`, retrying transport errors and 429s
    /// with exponential backoff (honouring `retry-after`).
    async fn send_with_retry<F>(&self, label: &str, build: F) -> Result<Value>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = match build().send().await {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt > MAX_RETRIES {
                        return Err(err).with_context(|| format!("{label} request failed"));
                    }
                    tracing::warn!(provider = label, attempt, "request failed, retrying: {err}");
                    sleep(backoff_delay(attempt, None)).await;
                    continue;
                }
            };
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt > MAX_RETRIES {
                    return Err(anyhow!("{label} rate limited after {MAX_RETRIES} retries"));
                }
                let wait = backoff_delay(attempt, response.headers().get("retry-after"));
                tracing::warn!(provider = label, attempt, ?wait, "rate limited");
                sleep(wait).await;
                continue;
            }
            return decode_body(label, response).await;
        }
    }
}

impl ChatModel for LlmClient {
    fn complete(&self, req: &LlmRequest) -> Result<LlmResponse> {
        self.chat_blocking(req)
    }

    fn label(&self) -> String {
        format!("{}:{}", self.provider.as_str(), self.model)
    }
}

fn backoff_delay(attempt: usize, retry_after: Option<&HeaderValue>) -> Duration {
    if let Some(secs) = retry_after
        .and_then(|value| value.to_str().ok())
        .and_then(|text| text.parse::<u64>().ok())
    {
        return Duration::from_secs(secs.max(1));
    }
    let capped = attempt.min(5) as u32;
    Duration::from_secs(1u64 << capped)
}

async fn decode_body(label: &str, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!("{label} returned error (status {status}): {body}"));
    }
    serde_json::from_str(&body).with_context(|| format!("failed to decode {label} response"))
}

fn read_api_key(var: &str) -> Result<String> {
    let value = env::var(var).map_err(|_| anyhow!("{var} is not set"))?;
    validate_api_key(var, &value)?;
    Ok(value)
}

fn validate_api_key(var: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{var} is empty"));
    }
    if var.contains("OPENAI") && !value.starts_with("sk-") {
        return Err(anyhow!("{var} must start with 'sk-'"));
    }
    if var.contains("ANTHROPIC") && !value.starts_with("sk-ant-") {
        return Err(anyhow!("{var} must start with 'sk-ant-'"));
    }
    Ok(())
}

fn extract_openai_text(value: &Value) -> Option<String> {
    let choice = value.get("choices")?.as_array()?.first()?;
    if let Some(text) = choice.get("text").and_then(|t| t.as_str()) {
        return Some(text.to_string());
    }
    let content = choice.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    content
        .as_array()?
        .iter()
        .find_map(|part| part.get("text").and_then(|t| t.as_str()))
        .map(str::to_string)
}

#[derive(Default, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Default, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    #[serde(rename = "usageMetadata")]
    usage: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Default, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_tokens: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    completion_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_names() {
        assert_eq!("Gemini".parse::<LlmProvider>().unwrap(), LlmProvider::Gemini);
        assert_eq!("claude".parse::<LlmProvider>().unwrap(), LlmProvider::Anthropic);
        assert!("local".parse::<LlmProvider>().is_err());
    }

    #[test]
    fn validates_key_shapes() {
        assert!(validate_api_key("OPENAI_API_KEY", "sk-abc").is_ok());
        assert!(validate_api_key("OPENAI_API_KEY", "abc").is_err());
        assert!(validate_api_key("GEMINI_API_KEY", " ").is_err());
        assert!(validate_api_key("GEMINI_API_KEY", "AIzaSy").is_ok());
    }

    #[test]
    fn backoff_prefers_retry_after() {
        let header = HeaderValue::from_static("7");
        assert_eq!(backoff_delay(1, Some(&header)), Duration::from_secs(7));
        assert_eq!(backoff_delay(2, None), Duration::from_secs(4));
        assert_eq!(backoff_delay(40, None), Duration::from_secs(32));
    }

    #[test]
    fn extracts_chat_completion_text() {
        let value = json!({
            "choices": [{ "message": { "content": "{\"answer\": \"x\"}" } }]
        });
        assert_eq!(extract_openai_text(&value).unwrap(), "{\"answer\": \"x\"}");
        let parts = json!({
            "choices": [{ "message": { "content": [{ "type": "text", "text": "hi" }] } }]
        });
        assert_eq!(extract_openai_text(&parts).unwrap(), "hi");
        assert!(extract_openai_text(&json!({})).is_none());
    }

    #[test]
    fn token_usage_adds_up_without_overflow() {
        let response = LlmResponse {
            content: String::new(),
            prompt_tokens: 1_200,
            completion_tokens: 80,
        };
        assert_eq!(response.total_tokens(), 1_280);
        let huge = LlmResponse {
            prompt_tokens: u32::MAX,
            ..response
        };
        assert_eq!(huge.total_tokens(), u32::MAX);
    }
}
