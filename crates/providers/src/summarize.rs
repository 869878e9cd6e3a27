//! Summarization providers for chunk enrichment.
//!
//! Summaries are short (a sentence or two) and attached to chunk metadata
//! and the weighted text-search column. Callers treat failures as
//! fail-open, so these providers stay deliberately simple.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use recall_core::config::SummarizationConfig;

use crate::{ProviderError, Result, Summarizer};

const SUMMARY_PROMPT: &str =
  "Summarize the following content in one or two sentences. Reply with the summary only, no preamble.";

fn truncate_chars(text: &str, max_chars: usize) -> String {
  let trimmed = text.trim();
  if trimmed.chars().count() <= max_chars {
    trimmed.to_string()
  } else {
    trimmed.chars().take(max_chars).collect()
  }
}

// ============================================================================
// Ollama
// ============================================================================

/// Summarizer backed by Ollama's `/api/generate` endpoint.
pub struct OllamaSummarizer {
  client: reqwest::Client,
  base_url: String,
  model: String,
  max_chars: usize,
}

impl OllamaSummarizer {
  pub fn new(config: &SummarizationConfig) -> Self {
    Self {
      client: reqwest::Client::new(),
      base_url: config.base_url.clone(),
      model: config.model.clone(),
      max_chars: config.max_chars,
    }
  }
}

#[async_trait::async_trait]
impl Summarizer for OllamaSummarizer {
  fn name(&self) -> &str {
    "ollama"
  }

  fn model(&self) -> &str {
    &self.model
  }

  async fn summarize(&self, text: &str) -> Result<String> {
    let request = GenerateRequest {
      model: &self.model,
      prompt: format!("{}\n\n{}", SUMMARY_PROMPT, text),
      stream: false,
    };

    let url = format!("{}/api/generate", self.base_url);
    let response = self.client.post(&url).json(&request).send().await?;

    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      warn!(status = %status, model = %self.model, "Summarization request failed");
      return Err(ProviderError::Provider(format!("Ollama returned {}: {}", status, body)));
    }

    let result: GenerateResponse = response.json().await?;
    Ok(truncate_chars(&result.response, self.max_chars))
  }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
  model: &'a str,
  prompt: String,
  stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
  response: String,
}

// ============================================================================
// OpenAI-compatible
// ============================================================================

/// Summarizer backed by an OpenAI-compatible chat completions endpoint.
pub struct OpenAiSummarizer {
  client: reqwest::Client,
  base_url: String,
  model: String,
  api_key: String,
  max_chars: usize,
}

impl OpenAiSummarizer {
  pub fn new(config: &SummarizationConfig) -> Result<Self> {
    let env = config
      .api_key_env
      .clone()
      .ok_or_else(|| ProviderError::MissingApiKey("summarization.api_key_env".to_string()))?;
    let api_key = std::env::var(&env).map_err(|_| ProviderError::MissingApiKey(env))?;

    Ok(Self {
      client: reqwest::Client::new(),
      base_url: config.base_url.clone(),
      model: config.model.clone(),
      api_key,
      max_chars: config.max_chars,
    })
  }
}

#[async_trait::async_trait]
impl Summarizer for OpenAiSummarizer {
  fn name(&self) -> &str {
    "openai"
  }

  fn model(&self) -> &str {
    &self.model
  }

  async fn summarize(&self, text: &str) -> Result<String> {
    let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
    let body = json!({
      "model": self.model,
      "messages": [
        { "role": "system", "content": SUMMARY_PROMPT },
        { "role": "user", "content": text },
      ],
    });

    let response = self
      .client
      .post(&url)
      .bearer_auth(&self.api_key)
      .json(&body)
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status();
      let body = response.text().await.unwrap_or_default();
      return Err(ProviderError::Provider(format!(
        "chat completions endpoint returned {}: {}",
        status, body
      )));
    }

    let result: ChatResponse = response.json().await?;
    let content = result
      .choices
      .into_iter()
      .next()
      .map(|c| c.message.content)
      .ok_or_else(|| ProviderError::Provider("empty completion response".to_string()))?;

    Ok(truncate_chars(&content, self.max_chars))
  }
}

#[derive(Deserialize)]
struct ChatResponse {
  choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
  message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
  content: String,
}
