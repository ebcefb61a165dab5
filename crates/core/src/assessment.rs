use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlQuestion {
    pub category: String,
    pub question: String,
}

impl ControlQuestion {
    pub fn new(category: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            question: question.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncompleteReason {
    NoClearRating,
    ErrorOccurred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Rating {
    Pass,
    Partial,
    Fail,
    Incomplete(IncompleteReason),
}

impl Rating {
    pub fn label(&self) -> &'static str {
        match self {
            Rating::Pass => "Pass",
            Rating::Partial => "Partial",
            Rating::Fail => "Fail",
            Rating::Incomplete(IncompleteReason::NoClearRating) => {
                "Incomplete — no clear rating found"
            }
            Rating::Incomplete(IncompleteReason::ErrorOccurred) => "Incomplete — error occurred",
        }
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, Rating::Incomplete(_))
    }

    /// Parses a bare verdict word (`pass`, `Partial`, ...).
    pub fn from_verdict(word: &str) -> Option<Self> {
        match word.trim().to_lowercase().as_str() {
            "pass" => Some(Rating::Pass),
            "partial" => Some(Rating::Partial),
            "fail" => Some(Rating::Fail),
            _ => None,
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<Rating> for String {
    fn from(value: Rating) -> Self {
        value.label().to_string()
    }
}

impl TryFrom<String> for Rating {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if let Some(rating) = Rating::from_verdict(&value) {
            return Ok(rating);
        }
        [
            Rating::Incomplete(IncompleteReason::NoClearRating),
            Rating::Incomplete(IncompleteReason::ErrorOccurred),
        ]
        .into_iter()
        .find(|rating| rating.label() == value)
        .ok_or_else(|| format!("unknown rating {value:?}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentResult {
    pub category: String,
    pub question: String,
    pub raw_response: String,
    pub rating: Rating,
    /// Mean similarity of the retrieved evidence; NaN when nothing was
    /// retrieved, until sanitized.
    pub evidence_score: Option<f64>,
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl AssessmentResult {
    pub fn failed(question: &ControlQuestion, diagnostic: impl Into<String>) -> Self {
        Self {
            category: question.category.clone(),
            question: question.question.clone(),
            raw_response: diagnostic.into(),
            rating: Rating::Incomplete(IncompleteReason::ErrorOccurred),
            evidence_score: None,
            evidence: Vec::new(),
        }
    }
}
