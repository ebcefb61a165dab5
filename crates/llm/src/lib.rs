use std::env;
use std::str::FromStr;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::header::HeaderValue;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

const MAX_RATE_LIMIT_RETRIES: usize = 4;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    OpenAi,
    Anthropic,
    Local,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Local => "local",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "gpt-4",
            LlmProvider::Anthropic => "claude-3-5-sonnet-latest",
            LlmProvider::Local => "local",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "anthropic" => Ok(LlmProvider::Anthropic),
            "local" => Ok(LlmProvider::Local),
            other => Err(anyhow!("unknown llm provider {other}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    provider: LlmProvider,
    model: String,
    config: ProviderConfig,
}

#[derive(Clone)]
enum ProviderConfig {
    OpenAi { api_key: String, base_url: String },
    Anthropic { api_key: String, max_tokens: u32 },
    Local,
}

impl LlmClient {
    pub fn new(provider: LlmProvider, model: impl Into<String>) -> Result<Self> {
        let config = match provider {
            LlmProvider::OpenAi => ProviderConfig::OpenAi {
                api_key: read_api_key("OPENAI_API_KEY")?,
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            },
            LlmProvider::Anthropic => ProviderConfig::Anthropic {
                api_key: read_api_key("ANTHROPIC_API_KEY")?,
                max_tokens: env::var("ANTHROPIC_MAX_TOKENS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1024),
            },
            LlmProvider::Local => ProviderConfig::Local,
        };
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            provider,
            model: model.into(),
            config,
        })
    }

    /// Offline client; needs no credentials or network.
    pub fn local() -> Self {
        Self {
            http: Client::new(),
            provider: LlmProvider::Local,
            model: LlmProvider::Local.default_model().to_string(),
            config: ProviderConfig::Local,
        }
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn chat(&self, req: &LlmRequest) -> Result<LlmResponse> {
        match &self.config {
            ProviderConfig::OpenAi { api_key, base_url } => {
                self.chat_openai(api_key, base_url, req)
            }
            ProviderConfig::Anthropic {
                api_key,
                max_tokens,
            } => self.chat_anthropic(api_key, *max_tokens, req),
            ProviderConfig::Local => Ok(LlmResponse {
                content: local_assessment(&req.user),
                prompt_tokens: 0,
                completion_tokens: 0,
            }),
        }
    }

    fn chat_openai(&self, api_key: &str, base_url: &str, req: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": req.user }));
        let payload = json!({
            "model": self.model,
            "temperature": 0,
            "messages": messages,
        });
        let response = self.send_with_backoff("openai", || {
            self.http.post(&url).bearer_auth(api_key).json(&payload).send()
        })?;
        let value = decode_body("openai", response)?;
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

    fn chat_anthropic(&self, api_key: &str, max_tokens: u32, req: &LlmRequest) -> Result<LlmResponse> {
        let mut payload = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "temperature": 0,
            "messages": [ { "role": "user", "content": req.user } ],
        });
        if let Some(system) = &req.system {
            payload["system"] = json!(system);
        }
        let response = self.send_with_backoff("anthropic", || {
            self.http
                .post("https://api.anthropic.com/v1/messages")
                .header("x-api-key", api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&payload)
                .send()
        })?;
        let value = decode_body("anthropic", response)?;
        let parsed: AnthropicResponse =
            serde_json::from_value(value).context("failed to decode anthropic response")?;
        let text = parsed
            .content
            .into_iter()
            .find_map(|part| part.text)
            .ok_or_else(|| anyhow!("missing text in Anthropic response"))?;
        let usage = parsed.usage.unwrap_or_default();
        Ok(LlmResponse {
            content: text,
            prompt_tokens: usage.input_tokens.unwrap_or(0),
            completion_tokens: usage.output_tokens.unwrap_or(0),
        })
    }

    /// Retries only on HTTP 429; transport errors surface immediately.
    fn send_with_backoff<F>(&self, provider: &str, send: F) -> Result<Response>
    where
        F: Fn() -> reqwest::Result<Response>,
    {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let response = send().with_context(|| format!("{provider} request failed"))?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }
            if attempt > MAX_RATE_LIMIT_RETRIES {
                return Err(anyhow!(
                    "{provider} rate limited after {MAX_RATE_LIMIT_RETRIES} retries"
                ));
            }
            let wait = backoff_delay(attempt, response.headers().get("retry-after"));
            warn!(provider, attempt, wait_secs = wait.as_secs(), "rate limited");
            sleep(wait);
        }
    }
}

fn backoff_delay(attempt: usize, retry_after: Option<&HeaderValue>) -> Duration {
    if let Some(secs) = retry_after
        .and_then(|value| value.to_str().ok())
        .and_then(|text| text.trim().parse::<u64>().ok())
    {
        return Duration::from_secs(secs.max(1));
    }
    let capped = attempt.min(5) as u32;
    Duration::from_secs(1u64 << capped)
}

fn decode_body(provider: &str, response: Response) -> Result<Value> {
    let status = response.status();
    let body = response.text().unwrap_or_default();
    if !status.is_success() {
        return Err(anyhow!("{provider} returned error (status {status}): {body}"));
    }
    serde_json::from_str(&body).with_context(|| format!("failed to decode {provider} response"))
}

fn read_api_key(var: &str) -> Result<String> {
    let value = env::var(var).map_err(|_| anyhow!("{var} is not set"))?;
    if value.trim().is_empty() {
        return Err(anyhow!("{var} is empty"));
    }
    Ok(value.trim().to_string())
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
        .map(|text| text.to_string())
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "of", "to", "for", "in", "on", "is", "are", "be", "by", "does",
    "do", "has", "have", "with", "that", "this", "there", "it", "its", "as", "at", "all", "any",
    "use", "used", "organization", "organisation", "company", "what", "how", "which", "who",
];

/// Deterministic stand-in for a model: rates by how many of the question's
/// key terms occur in the supplied context.
fn local_assessment(prompt: &str) -> String {
    let context = section(prompt, "CONTEXT:", "QUESTION:").to_lowercase();
    let question = section(prompt, "QUESTION:", "RESPONSE:");
    let context_terms: Vec<String> = terms(&context).collect();
    let key_terms: Vec<String> = terms(&question.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect();
    if key_terms.is_empty() {
        return "The question has no assessable terms.\nRating: Fail".to_string();
    }
    let found: Vec<&String> = key_terms
        .iter()
        .filter(|term| context_terms.iter().any(|c| stem(c) == stem(term)))
        .collect();
    let coverage = found.len() as f32 / key_terms.len() as f32;
    let rating = if coverage >= 0.6 {
        "Pass"
    } else if coverage >= 0.3 {
        "Partial"
    } else {
        "Fail"
    };
    format!(
        "Offline assessment: {} of {} key terms from the question appear in the policy excerpts{}.\nRating: {}",
        found.len(),
        key_terms.len(),
        if found.is_empty() {
            String::new()
        } else {
            format!(
                " ({})",
                found.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            )
        },
        rating
    )
}

fn section<'a>(text: &'a str, start: &str, end: &str) -> &'a str {
    let Some(idx) = text.find(start) else {
        return "";
    };
    let after = &text[idx + start.len()..];
    match after.find(end) {
        Some(stop) => after[..stop].trim(),
        None => after.trim(),
    }
}

fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric() && c != '-')
        .map(|t| t.trim_matches('-'))
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
}

fn stem(term: &str) -> &str {
    term.strip_suffix("es")
        .or_else(|| term.strip_suffix('s'))
        .filter(|s| s.len() > 2)
        .unwrap_or(term)
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
