pub mod config;
pub mod embedding;
pub mod engine;
pub mod pipeline;
pub mod retrieval;
pub mod storage;
pub mod verdict;

pub use config::{EmbeddingProvider, RiskShieldConfig};
pub use embedding::{Embedder, EmbeddingBackend, EmbeddingClient};
pub use engine::{build_prompt, AssessmentEngine, EngineOptions, Reasoner};
pub use pipeline::{Pipeline, PipelineSettings, RunOutcome};
pub use retrieval::{Evidence, RetrievalIndex};
pub use storage::{LocalReportStore, ReportStorage};
pub use verdict::parse_rating;
pub use riskshield_llm::{LlmClient, LlmProvider, LlmRequest, LlmResponse};
