use std::sync::Arc;

use riskshield_core::{Chunk, PipelineError, Result};
use riskshield_index::VectorIndex;
use tracing::info;

use crate::embedding::Embedder;

/// A retrieved chunk and its cosine similarity to the query.
#[derive(Debug, Clone)]
pub struct Evidence<'a> {
    pub chunk: &'a Chunk,
    pub score: f32,
}

/// Chunks of one document with their embeddings. Built once per run and only
/// read afterwards.
pub struct RetrievalIndex {
    index: VectorIndex<Chunk>,
    embedder: Arc<dyn Embedder>,
}

impl RetrievalIndex {
    /// Embeds every chunk. Any failure discards the whole index.
    pub fn build(chunks: Vec<Chunk>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder
            .embed_batch(&texts)
            .map_err(|e| PipelineError::IndexBuild(format!("embedding failed: {e:#}")))?;
        if vectors.len() != chunks.len() {
            return Err(PipelineError::IndexBuild(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        let index = VectorIndex::build(vectors.into_iter().zip(chunks))
            .map_err(|e| PipelineError::IndexBuild(e.to_string()))?;
        info!(
            chunks = index.len(),
            dimensions = index.dimensions(),
            "retrieval index built"
        );
        Ok(Self { index, embedder })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.index.payloads()
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    /// Top `k` chunks for `query`, best first; ties keep chunk order.
    pub fn search(&self, query: &str, k: usize) -> anyhow::Result<Vec<Evidence<'_>>> {
        if self.index.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(query)?;
        let hits = self.index.search(&vector, k)?;
        Ok(hits
            .into_iter()
            .map(|hit| Evidence {
                chunk: hit.payload,
                score: hit.score,
            })
            .collect())
    }
}
