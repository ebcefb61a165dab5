use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use riskshield_core::{
    decrypt, encrypt, extract, sanitize, AssessmentResult, ChunkConfig, Chunker, ControlQuestion,
    EncryptedBlob, EncryptionKey, RawDocument, Result,
};
use riskshield_llm::LlmClient;
use riskshield_report::{write_report, ReportOptions};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::RiskShieldConfig;
use crate::embedding::{Embedder, EmbeddingClient};
use crate::engine::{AssessmentEngine, EngineOptions, Reasoner};
use crate::retrieval::RetrievalIndex;
use crate::storage::{LocalReportStore, ReportStorage};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub chunking: ChunkConfig,
    pub engine: EngineOptions,
    pub report: ReportOptions,
    pub upload_dir: PathBuf,
    pub report_dir: PathBuf,
}

impl PipelineSettings {
    pub fn from_config(config: &RiskShieldConfig) -> Self {
        Self {
            chunking: config.chunking,
            engine: EngineOptions {
                top_k: config.retrieval.top_k,
                max_context_chars: config.retrieval.max_context_chars,
                workers: config.assessment.workers,
            },
            report: config.report.options(),
            upload_dir: config.storage.upload_dir.clone(),
            report_dir: config.report.output_dir.clone(),
        }
    }
}

/// What one run produced. `report_url` is absent when publishing failed;
/// the results and the local report are still valid then.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub report_file: String,
    #[serde(skip)]
    pub report_path: PathBuf,
    pub report_url: Option<String>,
    pub results: Vec<AssessmentResult>,
}

/// Document in, assessed results and a published report out.
pub struct Pipeline {
    key: Arc<EncryptionKey>,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    engine: AssessmentEngine,
    storage: Arc<dyn ReportStorage>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        key: Arc<EncryptionKey>,
        embedder: Arc<dyn Embedder>,
        reasoner: Arc<dyn Reasoner>,
        storage: Arc<dyn ReportStorage>,
    ) -> Result<Self> {
        let chunker = Chunker::new(settings.chunking)?;
        let engine = AssessmentEngine::new(reasoner, settings.engine);
        Ok(Self {
            key,
            chunker,
            embedder,
            engine,
            storage,
            settings,
        })
    }

    /// Wires the configured embedding provider, reasoning provider and local
    /// report store.
    pub fn from_config(config: &RiskShieldConfig, key: Arc<EncryptionKey>) -> anyhow::Result<Self> {
        let embedder = EmbeddingClient::from_config(&config.embedding)?;
        let reasoner = LlmClient::new(config.llm.provider, config.llm.model_name())?;
        let storage = LocalReportStore::new(
            config.report.output_dir.clone(),
            config.report.public_base_url.clone(),
        );
        let pipeline = Self::new(
            PipelineSettings::from_config(config),
            key,
            Arc::new(embedder),
            Arc::new(reasoner),
            Arc::new(storage),
        )?;
        Ok(pipeline)
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn run(&self, document: RawDocument, questions: &[ControlQuestion]) -> Result<RunOutcome> {
        let started = Instant::now();
        let file_type = document.file_type;
        let plaintext = self.store_and_reload(document)?;

        let segments = extract(&plaintext, file_type)?;
        drop(plaintext);
        info!(file_type = %file_type, segments = segments.len(), "document extracted");

        let chunks = self.chunker.chunk(&segments)?;
        info!(chunks = chunks.len(), "document chunked");

        let index = RetrievalIndex::build(chunks, Arc::clone(&self.embedder))?;
        let results = sanitize(self.engine.assess(&index, questions));

        let report_file = format!("{}_report.pdf", Uuid::new_v4());
        let report_path = write_report(
            &results,
            &self.settings.report_dir,
            &report_file,
            &self.settings.report,
        )?;
        let report_url = match self.storage.publish(&report_path, &report_file) {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(error = %err, report = %report_file, "report publish failed");
                None
            }
        };
        info!(
            results = results.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run finished"
        );
        Ok(RunOutcome {
            report_file,
            report_path,
            report_url,
            results,
        })
    }

    /// Plaintext only ever exists in memory; the upload directory holds the
    /// sealed envelope under a generated name, removed once read back.
    fn store_and_reload(&self, document: RawDocument) -> Result<Vec<u8>> {
        let blob = encrypt(&document.bytes, &self.key)?;
        drop(document);
        fs::create_dir_all(&self.settings.upload_dir)?;
        let path = self
            .settings
            .upload_dir
            .join(format!("{}.enc", Uuid::new_v4()));
        fs::write(&path, blob.to_bytes())?;
        let sealed = fs::read(&path);
        remove_upload(&path);
        let blob = EncryptedBlob::from_bytes(&sealed?)?;
        let plaintext = decrypt(&blob, &self.key)?;
        info!(key_id = %blob.key_id, bytes = plaintext.len(), "upload decrypted");
        Ok(plaintext)
    }
}

fn remove_upload(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        warn!(error = %err, path = %path.display(), "could not remove sealed upload");
    }
}
