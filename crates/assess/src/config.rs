use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use riskshield_core::{CharsetPolicy, ChunkConfig};
use riskshield_llm::LlmProvider;
use riskshield_report::{ReportOptions, DEFAULT_MAX_LINE_LENGTH};
use serde::Deserialize;

use crate::engine::{DEFAULT_MAX_CONTEXT_CHARS, DEFAULT_TOP_K};

pub const CONFIG_ENV_VAR: &str = "RISKSHIELD_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "riskshield.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RiskShieldConfig {
    pub chunking: ChunkConfig,
    pub retrieval: RetrievalConfig,
    pub assessment: AssessmentConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub report: ReportConfig,
    pub questionnaire: QuestionnaireConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub max_context_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssessmentConfig {
    pub workers: usize,
}

impl Default for AssessmentConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    #[default]
    Hash,
    OpenAi,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
    /// Bucket count for the hashing embedder.
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hash,
            model: "text-embedding-3-small".to_string(),
            dimensions: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn model_name(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| self.provider.default_model().to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub max_line_length: usize,
    pub ascii_only: bool,
    pub output_dir: PathBuf,
    pub public_base_url: String,
    /// TrueType files replacing the bundled DejaVu Sans, e.g. a CJK face.
    pub regular_font: Option<PathBuf>,
    pub bold_font: Option<PathBuf>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            ascii_only: false,
            output_dir: PathBuf::from("reports"),
            public_base_url: "http://localhost:8000".to_string(),
            regular_font: None,
            bold_font: None,
        }
    }
}

impl ReportConfig {
    pub fn options(&self) -> ReportOptions {
        ReportOptions {
            max_line_length: self.max_line_length,
            charset: if self.ascii_only {
                CharsetPolicy::AsciiOnly
            } else {
                CharsetPolicy::Printable
            },
            regular_font: self.regular_font.clone(),
            bold_font: self.bold_font.clone(),
            ..ReportOptions::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuestionnaireConfig {
    pub path: PathBuf,
    /// Leading rows before the header; defaults by file type when unset.
    pub skip_rows: Option<usize>,
}

impl Default for QuestionnaireConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("questionnaire.xlsx"),
            skip_rows: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
        }
    }
}

impl RiskShieldConfig {
    /// Resolution order: explicit path, `RISKSHIELD_CONFIG`, then
    /// `riskshield.toml` in the working directory. A missing default file
    /// means built-in defaults; a missing explicit file is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => match env::var(CONFIG_ENV_VAR) {
                Ok(value) if !value.trim().is_empty() => (PathBuf::from(value), true),
                _ => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
            },
        };
        if !required && !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.chunking.validate()?;
        Ok(config)
    }
}
