use std::sync::Arc;

use anyhow::{Context, Result};
use rayon::prelude::*;
use riskshield_core::{AssessmentResult, ControlQuestion};
use riskshield_llm::{LlmClient, LlmRequest};
use tracing::{debug, info, warn};

use crate::retrieval::{Evidence, RetrievalIndex};
use crate::verdict::parse_rating;

pub const DEFAULT_TOP_K: usize = 4;
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 12_000;

/// Answers a fully built prompt with free text.
pub trait Reasoner: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String>;
}

impl Reasoner for LlmClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        let response = self.chat(&LlmRequest {
            system: None,
            user: prompt.to_string(),
        })?;
        debug!(
            provider = self.provider().as_str(),
            prompt_tokens = response.prompt_tokens,
            completion_tokens = response.completion_tokens,
            "completion received"
        );
        Ok(response.content)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub top_k: usize,
    pub max_context_chars: usize,
    pub workers: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            workers: 1,
        }
    }
}

pub struct AssessmentEngine {
    reasoner: Arc<dyn Reasoner>,
    options: EngineOptions,
}

impl AssessmentEngine {
    pub fn new(reasoner: Arc<dyn Reasoner>, options: EngineOptions) -> Self {
        Self { reasoner, options }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// One result per question, in question order. A failing question turns
    /// into an `Incomplete` result and never stops the batch.
    pub fn assess(
        &self,
        index: &RetrievalIndex,
        questions: &[ControlQuestion],
    ) -> Vec<AssessmentResult> {
        let results: Vec<AssessmentResult> = if self.options.workers > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(self.options.workers)
                .build()
            {
                Ok(pool) => pool.install(|| {
                    questions
                        .par_iter()
                        .map(|question| self.assess_one(index, question))
                        .collect()
                }),
                Err(err) => {
                    warn!(error = %err, "worker pool unavailable, assessing sequentially");
                    self.assess_sequential(index, questions)
                }
            }
        } else {
            self.assess_sequential(index, questions)
        };
        let incomplete = results.iter().filter(|r| r.rating.is_incomplete()).count();
        info!(
            questions = questions.len(),
            incomplete,
            workers = self.options.workers.max(1),
            "assessment finished"
        );
        results
    }

    fn assess_sequential(
        &self,
        index: &RetrievalIndex,
        questions: &[ControlQuestion],
    ) -> Vec<AssessmentResult> {
        questions
            .iter()
            .map(|question| self.assess_one(index, question))
            .collect()
    }

    fn assess_one(&self, index: &RetrievalIndex, question: &ControlQuestion) -> AssessmentResult {
        match self.try_assess(index, question) {
            Ok(result) => result,
            Err(err) => {
                warn!(
                    category = %question.category,
                    error = %format!("{err:#}"),
                    "question could not be assessed"
                );
                AssessmentResult::failed(question, format!("Error: {err:#}"))
            }
        }
    }

    fn try_assess(
        &self,
        index: &RetrievalIndex,
        question: &ControlQuestion,
    ) -> Result<AssessmentResult> {
        let evidence = index
            .search(&question.question, self.options.top_k)
            .context("retrieval failed")?;
        let prompt = build_prompt(&evidence, &question.question, self.options.max_context_chars);
        let response = self
            .reasoner
            .complete(&prompt)
            .context("reasoning failed")?;
        let rating = parse_rating(&response);
        Ok(AssessmentResult {
            category: question.category.clone(),
            question: question.question.clone(),
            raw_response: response.trim().to_string(),
            rating,
            evidence_score: Some(mean_score(&evidence)),
            evidence: evidence.iter().map(|e| e.chunk.source_label()).collect(),
        })
    }
}

/// NaN when nothing was retrieved.
fn mean_score(evidence: &[Evidence<'_>]) -> f64 {
    let sum: f64 = evidence.iter().map(|e| e.score as f64).sum();
    sum / evidence.len() as f64
}

/// Context excerpts in retrieval order, cut off once `max_context_chars`
/// characters are used, followed by the verbatim question.
pub fn build_prompt(evidence: &[Evidence<'_>], question: &str, max_context_chars: usize) -> String {
    let mut context = String::new();
    let mut budget = max_context_chars;
    for item in evidence {
        if budget == 0 {
            break;
        }
        if !context.is_empty() {
            context.push_str("\n\n");
        }
        let text = item.chunk.text.trim();
        let taken: String = text.chars().take(budget).collect();
        budget -= taken.chars().count();
        context.push_str(&taken);
    }
    format!(
        "You are a cybersecurity assessor. Use the CONTEXT to answer the QUESTION below.\n\
         After your explanation, add exactly one final line in this format:\n\n\
         Rating: <Pass|Partial|Fail>\n\n\
         CONTEXT:\n{context}\n\n\
         QUESTION:\n{question}\n\n\
         RESPONSE:\n"
    )
}
