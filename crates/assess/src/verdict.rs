use once_cell::sync::Lazy;
use regex::Regex;
use riskshield_core::{IncompleteReason, Rating};

// `Rating: Pass`, `**Rating:** partial.`, `_rating_: FAIL` ...
static RATING_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*[*_]*\s*rating\s*[*_]*\s*:\s*[*_]*\s*(pass|partial|fail)\b",
    )
    .expect("valid regex")
});

/// Verdict of a model response, taken from the last line that states a
/// rating. Without one the result is `Incomplete`.
pub fn parse_rating(response: &str) -> Rating {
    response
        .lines()
        .rev()
        .find_map(|line| {
            RATING_LINE
                .captures(line)
                .and_then(|caps| caps.get(1))
                .and_then(|m| Rating::from_verdict(m.as_str()))
        })
        .unwrap_or(Rating::Incomplete(IncompleteReason::NoClearRating))
}
