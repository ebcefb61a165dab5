use std::collections::HashMap;
use std::ops::Range;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tiktoken_rs::CoreBPE;

use crate::document::{SegmentLocation, TextSegment};
use crate::error::{PipelineError, Result};

static CL100K: Lazy<std::result::Result<CoreBPE, String>> =
    Lazy::new(|| tiktoken_rs::cl100k_base().map_err(|e| e.to_string()));
const CHUNK_VERSION: u32 = 1;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 150;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    #[default]
    Cl100k,
    Whitespace,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    pub overlap: usize,
    pub tokenizer: TokenizerKind,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
            tokenizer: TokenizerKind::Cl100k,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.overlap >= self.chunk_size {
            return Err(PipelineError::Configuration(format!(
                "chunk_size ({}) must be greater than overlap ({})",
                self.chunk_size, self.overlap
            )));
        }
        Ok(())
    }

    fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub index: usize,
    pub token_start: usize,
    pub token_end: usize,
    pub text: String,
    pub locations: Vec<SegmentLocation>,
}

impl Chunk {
    pub fn token_count(&self) -> usize {
        self.token_end - self.token_start
    }

    /// Human readable origin, e.g. `page 2` or `page 2 to page 3`.
    pub fn source_label(&self) -> String {
        match (self.locations.first(), self.locations.last()) {
            (Some(first), Some(last)) if first != last => format!("{first} to {last}"),
            (Some(first), _) => first.to_string(),
            _ => "document".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkConfig,
}

impl Chunker {
    pub fn new(config: ChunkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn chunk(&self, segments: &[TextSegment]) -> Result<Vec<Chunk>> {
        let mut codec = Codec::for_kind(self.config.tokenizer)?;
        let mut tokens = Vec::new();
        let mut owners = Vec::new();
        for (seg_idx, segment) in segments.iter().enumerate() {
            let ids = codec.encode(&segment.text);
            owners.extend(std::iter::repeat(seg_idx).take(ids.len()));
            tokens.extend(ids);
        }
        let chunks = windows(tokens.len(), &self.config)
            .into_iter()
            .enumerate()
            .map(|(index, range)| {
                let text = codec.decode(&tokens[range.clone()]);
                let mut locations: Vec<SegmentLocation> = Vec::new();
                for owner in &owners[range.clone()] {
                    let location = segments[*owner].location;
                    if locations.last() != Some(&location) {
                        locations.push(location);
                    }
                }
                Chunk {
                    chunk_id: stable_chunk_id(index, &range, &text),
                    index,
                    token_start: range.start,
                    token_end: range.end,
                    text,
                    locations,
                }
            })
            .collect();
        Ok(chunks)
    }
}

/// Splits segments into `chunk_size`-token windows advancing by
/// `chunk_size - overlap`, using the default BPE tokenizer.
pub fn chunk(segments: &[TextSegment], chunk_size: usize, overlap: usize) -> Result<Vec<Chunk>> {
    Chunker::new(ChunkConfig {
        chunk_size,
        overlap,
        tokenizer: TokenizerKind::Cl100k,
    })?
    .chunk(segments)
}

fn windows(len: usize, config: &ChunkConfig) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut start = 0usize;
    while start < len {
        let end = (start + config.chunk_size).min(len);
        out.push(start..end);
        if end == len {
            break;
        }
        start += config.stride();
    }
    out
}

enum Codec {
    Bpe(&'static CoreBPE),
    Words {
        vocab: Vec<String>,
        index: HashMap<String, usize>,
    },
}

impl Codec {
    fn for_kind(kind: TokenizerKind) -> Result<Self> {
        match kind {
            TokenizerKind::Cl100k => CL100K
                .as_ref()
                .map(Codec::Bpe)
                .map_err(|e| PipelineError::Tokenizer(e.clone())),
            TokenizerKind::Whitespace => Ok(Codec::Words {
                vocab: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }

    fn encode(&mut self, text: &str) -> Vec<usize> {
        match self {
            Codec::Bpe(bpe) => {
                let mut ids = bpe.encode_ordinary(text);
                // keeps segments from fusing into one word at the boundary
                ids.extend(bpe.encode_ordinary("\n"));
                ids
            }
            Codec::Words { vocab, index } => text
                .split_whitespace()
                .map(|word| {
                    *index.entry(word.to_string()).or_insert_with(|| {
                        vocab.push(word.to_string());
                        vocab.len() - 1
                    })
                })
                .collect(),
        }
    }

    fn decode(&self, ids: &[usize]) -> String {
        match self {
            Codec::Bpe(bpe) => match bpe.decode(ids.to_vec()) {
                Ok(text) => text,
                // a window edge cut through a multi-byte character
                Err(_) => ids
                    .iter()
                    .filter_map(|id| bpe.decode(vec![*id]).ok())
                    .collect(),
            },
            Codec::Words { vocab, .. } => ids
                .iter()
                .map(|id| vocab[*id].as_str())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

fn stable_chunk_id(index: usize, range: &Range<usize>, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(CHUNK_VERSION.to_be_bytes());
    hasher.update(index.to_be_bytes());
    hasher.update(range.start.to_be_bytes());
    hasher.update(range.end.to_be_bytes());
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> Vec<TextSegment> {
        let text = (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        vec![TextSegment::new(text, SegmentLocation::Page(1))]
    }

    fn whitespace(chunk_size: usize, overlap: usize) -> Chunker {
        Chunker::new(ChunkConfig {
            chunk_size,
            overlap,
            tokenizer: TokenizerKind::Whitespace,
        })
        .unwrap()
    }

    #[test]
    fn default_window_math_yields_three_chunks() {
        let chunks = whitespace(1000, 150).chunk(&words(2500)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!((chunks[0].token_start, chunks[0].token_end), (0, 1000));
        assert_eq!((chunks[1].token_start, chunks[1].token_end), (850, 1850));
        assert_eq!((chunks[2].token_start, chunks[2].token_end), (1700, 2500));

        let first: Vec<&str> = chunks[0].text.split(' ').collect();
        let second: Vec<&str> = chunks[1].text.split(' ').collect();
        assert_eq!(&first[850..], &second[..150]);
        assert_eq!(first[850], "w850");
        assert_ne!(first[849], second[0]);
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        assert!(matches!(
            Chunker::new(ChunkConfig {
                chunk_size: 100,
                overlap: 100,
                tokenizer: TokenizerKind::Whitespace,
            }),
            Err(PipelineError::Configuration(_))
        ));
        assert!(chunk(&words(3), 0, 0).is_err());
    }

    #[test]
    fn chunking_is_reproducible() {
        let segments = vec![
            TextSegment::new("Access control policy text.", SegmentLocation::Page(1)),
            TextSegment::new("MFA is required everywhere.", SegmentLocation::Page(2)),
        ];
        let a = chunk(&segments, 6, 2).unwrap();
        let b = chunk(&segments, 6, 2).unwrap();
        assert_eq!(a, b);
        assert!(a.len() > 1);
    }

    #[test]
    fn chunks_track_segment_locations() {
        let segments = vec![
            TextSegment::new("alpha beta gamma", SegmentLocation::Page(1)),
            TextSegment::new("delta epsilon", SegmentLocation::Page(2)),
        ];
        let chunks = whitespace(4, 1).chunk(&segments).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0].locations,
            vec![SegmentLocation::Page(1), SegmentLocation::Page(2)]
        );
        assert_eq!(chunks[0].source_label(), "page 1 to page 2");
        assert_eq!(chunks[1].text, "delta epsilon");
        assert_eq!(chunks[1].source_label(), "page 2");
    }

    #[test]
    fn bpe_chunks_respect_the_token_budget() {
        let text = "We require MFA for all accounts. ".repeat(40);
        let segments = vec![TextSegment::new(text, SegmentLocation::Block(1))];
        let chunks = chunk(&segments, 50, 10).unwrap();
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].token_count(), 50);
            assert_eq!(pair[1].token_start, pair[0].token_end - 10);
        }
        assert!(chunks.last().unwrap().token_count() <= 50);
    }

    #[test]
    fn empty_input_has_no_chunks() {
        assert!(whitespace(10, 2).chunk(&[]).unwrap().is_empty());
    }
}
