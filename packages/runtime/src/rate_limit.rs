//! Rate-limit detection over agent output text.
//!
//! This is substring matching on free text and is acknowledged best-effort:
//! a miss only means no fallback attempt. Detection triggers exactly one
//! transparent re-execution with a relaxed profile before failure surfaces.

const RATE_LIMIT_PHRASES: &[&str] = &[
    "rate limit",
    "rate-limited",
    "429",
    "overloaded_error",
    "usage limit reached",
];

pub fn detect(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    RATE_LIMIT_PHRASES
        .iter()
        .any(|phrase| lowered.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_known_phrasing() {
        assert!(detect("Error: rate limit exceeded, retry later"));
        assert!(detect("HTTP 429 Too Many Requests"));
        assert!(detect("{\"type\":\"overloaded_error\"}"));
    }

    #[test]
    fn plain_output_does_not_match() {
        assert!(!detect("wrote 3 files and ran the tests"));
    }
}
