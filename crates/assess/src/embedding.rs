use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use riskshield_core::{HashEmbedder, HashEmbedderConfig};
use serde::Deserialize;

use crate::config::{EmbeddingConfig, EmbeddingProvider};

/// Turns text into vectors for retrieval. Implementations must return one
/// vector per input, in input order.
pub trait Embedder: Send + Sync {
    fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| anyhow!("embedder returned no vector"))
    }
}

#[derive(Clone)]
pub enum EmbeddingBackend {
    Hash(HashEmbedder),
    OpenAi(OpenAiEmbeddingClient),
}

#[derive(Clone)]
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let backend = match config.provider {
            EmbeddingProvider::OpenAi => {
                EmbeddingBackend::OpenAi(OpenAiEmbeddingClient::new(&config.model)?)
            }
            EmbeddingProvider::Hash => EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig {
                dimensions: config.dimensions,
                ..HashEmbedderConfig::default()
            })),
        };
        Ok(Self { backend })
    }

    pub fn hash() -> Self {
        Self {
            backend: EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig::default())),
        }
    }

    pub fn backend(&self) -> &EmbeddingBackend {
        &self.backend
    }
}

impl Embedder for EmbeddingClient {
    fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => Ok(inputs
                .iter()
                .map(|text| embedder.embed_text(text))
                .collect()),
            EmbeddingBackend::OpenAi(client) => client.embed_batch(inputs),
        }
    }
}

// OpenAI caps the number of inputs per embeddings request.
const OPENAI_BATCH: usize = 256;

#[derive(Clone)]
pub struct OpenAiEmbeddingClient {
    http: Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(model: &str) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY is required for openai embeddings"))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            model: model.to_string(),
            api_key,
            base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
        })
    }

    pub fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(inputs.len());
        for batch in inputs.chunks(OPENAI_BATCH) {
            out.extend(self.request(batch)?);
        }
        Ok(out)
    }

    fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let payload = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .context("openai embeddings request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "openai embeddings request failed: {}",
                response.status()
            ));
        }
        let mut parsed: OpenAiEmbeddingResponse = response.json()?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_backend_embeds_in_order() {
        let client = EmbeddingClient::from_config(&EmbeddingConfig {
            dimensions: 32,
            ..EmbeddingConfig::default()
        })
        .unwrap();
        let inputs = vec!["mfa".to_string(), "backups".to_string()];
        let vectors = client.embed_batch(&inputs).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == 32));
        assert_eq!(client.embed("backups").unwrap(), vectors[1]);
    }
}
