// ── Text Similarity ────────────────────────────────────────────────────────
// Tokenization and Jaccard similarity on token sets. Pure functions — these
// sit on the verification hot path, so callers that compare one candidate
// against many existing entries should precompute sets once and use
// `jaccard_tokenized`.

use std::collections::HashSet;

/// Lowercase, split on ASCII whitespace, deduplicate into a set.
/// Unicode word bytes are preserved as-is.
pub fn tokenize(s: &str) -> HashSet<String> {
    s.to_lowercase()
        .split_ascii_whitespace()
        .map(|w| w.to_string())
        .collect()
}

/// |A ∩ B| / |A ∪ B| over the token sets of two strings.
/// Defined as 0 when either set is empty.
pub fn jaccard(a: &str, b: &str) -> f64 {
    jaccard_tokenized(&tokenize(a), &tokenize(b))
}

/// Precomputed-sets variant of `jaccard` for hot paths.
pub fn jaccard_tokenized(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}
