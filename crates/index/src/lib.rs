use std::io::Write;

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    #[error("vector {position} has {found} dimensions, expected {expected}")]
    DimensionMismatch {
        position: usize,
        expected: usize,
        found: usize,
    },
    #[error("vector {position} contains non-finite values")]
    NonFinite { position: usize },
    #[error("query has {found} dimensions, index has {expected}")]
    QueryDimension { expected: usize, found: usize },
}

struct Entry<T> {
    vector: Vec<f32>,
    norm: f32,
    payload: T,
}

/// Exact cosine-similarity index. Built once, then only read.
pub struct VectorIndex<T> {
    dimensions: usize,
    entries: Vec<Entry<T>>,
}

#[derive(Debug, Clone, Copy)]
pub struct Hit<'a, T> {
    pub position: usize,
    pub score: f32,
    pub payload: &'a T,
}

impl<T> VectorIndex<T> {
    pub fn build<I>(items: I) -> Result<Self, IndexError>
    where
        I: IntoIterator<Item = (Vec<f32>, T)>,
    {
        let mut dimensions = None;
        let mut entries = Vec::new();
        for (position, (vector, payload)) in items.into_iter().enumerate() {
            let expected = *dimensions.get_or_insert(vector.len());
            if vector.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    position,
                    expected,
                    found: vector.len(),
                });
            }
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(IndexError::NonFinite { position });
            }
            let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            entries.push(Entry {
                vector,
                norm,
                payload,
            });
        }
        Ok(Self {
            dimensions: dimensions.unwrap_or(0),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn payloads(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.payload)
    }

    /// Top `k` entries by cosine similarity; equal scores keep insertion
    /// order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Hit<'_, T>>, IndexError> {
        if self.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimensions {
            return Err(IndexError::QueryDimension {
                expected: self.dimensions,
                found: query.len(),
            });
        }
        let query_norm = query.iter().map(|v| v * v).sum::<f32>().sqrt();
        let mut hits: Vec<Hit<'_, T>> = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| Hit {
                position,
                score: cosine(query, query_norm, &entry.vector, entry.norm),
                payload: &entry.payload,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        Ok(hits)
    }
}

fn cosine(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (a_norm * b_norm)
}

pub struct JsonlWriter<W> {
    writer: W,
    written: usize,
}

impl<W: Write> JsonlWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn write_record<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let mut buf = serde_json::to_vec(record)?;
        buf.push(b'\n');
        self.writer.write_all(&buf)?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn index() -> VectorIndex<&'static str> {
        VectorIndex::build(vec![
            (vec![1.0, 0.0, 0.0], "mfa"),
            (vec![0.0, 1.0, 0.0], "backups"),
            (vec![0.7, 0.7, 0.0], "mixed"),
            (vec![1.0, 0.0, 0.0], "mfa-duplicate"),
        ])
        .unwrap()
    }

    #[test]
    fn returns_top_k_in_score_order() {
        let index = index();
        let hits = index.search(&[1.0, 0.1, 0.0], 3).unwrap();
        let names: Vec<&str> = hits.iter().map(|h| *h.payload).collect();
        assert_eq!(names, vec!["mfa", "mfa-duplicate", "mixed"]);
        assert!(hits[0].score >= hits[2].score);
        assert_eq!(hits[1].position, 3);
    }

    #[test]
    fn k_larger_than_index_returns_everything() {
        assert_eq!(index().search(&[0.0, 1.0, 0.0], 10).unwrap().len(), 4);
    }

    #[test]
    fn rejects_inconsistent_dimensions() {
        let err = VectorIndex::build(vec![(vec![1.0, 0.0], 1), (vec![1.0], 2)])
            .err()
            .unwrap();
        assert_eq!(
            err,
            IndexError::DimensionMismatch {
                position: 1,
                expected: 2,
                found: 1
            }
        );
        assert!(index().search(&[1.0], 2).is_err());
    }

    #[test]
    fn rejects_non_finite_vectors() {
        let err = VectorIndex::build(vec![(vec![f32::NAN], ())]).err().unwrap();
        assert_eq!(err, IndexError::NonFinite { position: 0 });
    }

    #[test]
    fn zero_query_scores_zero() {
        let index = index();
        let hits = index.search(&[0.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].score, 0.0);
        assert_eq!(*hits[0].payload, "mfa");
    }

    #[derive(Serialize, Deserialize)]
    struct Row {
        question: String,
        rating: String,
    }

    #[test]
    fn jsonl_writer_emits_one_record_per_line() {
        let mut writer = JsonlWriter::new(Vec::new());
        for rating in ["Pass", "Fail"] {
            writer
                .write_record(&Row {
                    question: "Is MFA enforced?".into(),
                    rating: rating.into(),
                })
                .unwrap();
        }
        assert_eq!(writer.written(), 2);
        let buf = writer.finish().unwrap();
        let text = String::from_utf8(buf).unwrap();
        let rows: Vec<Row> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(rows[1].rating, "Fail");
        assert!(text.ends_with('\n'));
    }
}
