use crate::assessment::AssessmentResult;

pub fn sanitize_value(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// Drops non-finite numbers so every row serializes to plain JSON. Text
/// fields are left untouched.
pub fn sanitize(results: Vec<AssessmentResult>) -> Vec<AssessmentResult> {
    results
        .into_iter()
        .map(|mut row| {
            row.evidence_score = sanitize_value(row.evidence_score);
            row
        })
        .collect()
}
