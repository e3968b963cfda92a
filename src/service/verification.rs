// Three-layer verification pipeline for extracted memory candidates.
// Deterministic — no model calls. For each candidate, against the agent's
// existing active entries (token sets precomputed by the caller):
//
//   Layer 1  word-overlap dedup   same type, jaccard > dedup threshold
//   Layer 2  contradiction        contradictable pair, jaccard > 0.3,
//                                 different content → supersede
//   Layer 3  semantic             top vector match ≥ semantic threshold →
//                                 dedup or supersede by the same rules
//
// The decision is a total function of (jaccard, semantic score, type
// compatibility, content equality, thresholds).

use std::collections::HashSet;

use crate::atoms::constants::CONTRADICTION_JACCARD_THRESHOLD;
use crate::atoms::error::MemoryResult;
use crate::atoms::types::MemoryEntry;
use crate::search::SearchService;
use crate::similarity::{jaccard_tokenized, tokenize};

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Layer 1: near-duplicate of an existing same-type entry.
    SkipDuplicate { existing_id: String },
    /// Layer 2 or 3: contradicts an existing entry; supersede it.
    Supersede { old_id: String, semantic: bool },
    /// Layer 3: semantically identical to an existing entry.
    SkipSemanticDuplicate { existing_id: String },
    /// Novel — insert.
    InsertNovel,
}

impl Decision {
    /// Short tag for the processing log.
    pub fn log_tag(&self) -> &'static str {
        match self {
            Decision::SkipDuplicate { .. } => "skip_duplicate",
            Decision::Supersede { semantic: false, .. } => "supersede",
            Decision::Supersede { semantic: true, .. } => "semantic_supersede",
            Decision::SkipSemanticDuplicate { .. } => "skip_semantic_duplicate",
            Decision::InsertNovel => "keep_novel",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VerificationThresholds {
    pub jaccard_dedup: f64,
    pub semantic_dedup: f64,
}

/// Content equality for contradiction checks: case- and whitespace-folded.
fn same_content(a: &str, b: &str) -> bool {
    a.split_whitespace()
        .map(|w| w.to_lowercase())
        .eq(b.split_whitespace().map(|w| w.to_lowercase()))
}

/// Run the pipeline for one candidate.
pub async fn verify_candidate(
    candidate: &MemoryEntry,
    existing: &[(MemoryEntry, HashSet<String>)],
    search: &SearchService,
    thresholds: VerificationThresholds,
) -> MemoryResult<Decision> {
    let candidate_tokens = tokenize(&candidate.content);

    // ── Layer 1: word-overlap dedup ──────────────────────────────────
    for (entry, tokens) in existing {
        if entry.entry_type == candidate.entry_type
            && jaccard_tokenized(&candidate_tokens, tokens) > thresholds.jaccard_dedup
        {
            return Ok(Decision::SkipDuplicate {
                existing_id: entry.id.clone(),
            });
        }
    }

    // ── Layer 2: contradiction supersession ──────────────────────────
    for (entry, tokens) in existing {
        if entry.entry_type.contradictable_with(candidate.entry_type)
            && jaccard_tokenized(&candidate_tokens, tokens) > CONTRADICTION_JACCARD_THRESHOLD
            && !same_content(&entry.content, &candidate.content)
        {
            return Ok(Decision::Supersede {
                old_id: entry.id.clone(),
                semantic: false,
            });
        }
    }

    // ── Layer 3: semantic dedup / supersession ───────────────────────
    // Lexical-only mode returns no matches, which skips this layer.
    let matches = search
        .search_entries_with_scores(&candidate.content, &candidate.agent_id, 1)
        .await?;
    if let Some((top, score)) = matches.into_iter().next() {
        if score >= thresholds.semantic_dedup {
            let sim = jaccard_tokenized(&candidate_tokens, &tokenize(&top.content));
            if sim >= thresholds.jaccard_dedup {
                return Ok(Decision::SkipSemanticDuplicate {
                    existing_id: top.id,
                });
            }
            if top.entry_type.contradictable_with(candidate.entry_type)
                && !same_content(&top.content, &candidate.content)
            {
                return Ok(Decision::Supersede {
                    old_id: top.id,
                    semantic: true,
                });
            }
        }
    }

    Ok(Decision::InsertNovel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::EntryType;
    use crate::embedding::Embedder;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn lexical_search() -> SearchService {
        SearchService::new(
            Arc::new(MemoryStore::open_in_memory().unwrap()),
            Arc::new(Embedder::disabled()),
            0.0,
        )
    }

    fn thresholds() -> VerificationThresholds {
        VerificationThresholds {
            jaccard_dedup: 0.6,
            semantic_dedup: 0.85,
        }
    }

    fn entry(entry_type: EntryType, content: &str) -> MemoryEntry {
        MemoryEntry::new("a", entry_type, content, 0.9, "m", None, vec![])
    }

    fn with_tokens(entries: Vec<MemoryEntry>) -> Vec<(MemoryEntry, HashSet<String>)> {
        entries
            .into_iter()
            .map(|e| {
                let tokens = tokenize(&e.content);
                (e, tokens)
            })
            .collect()
    }

    #[tokio::test]
    async fn near_duplicate_is_skipped() {
        let search = lexical_search();
        let existing = with_tokens(vec![entry(EntryType::Fact, "User likes Swift")]);
        let candidate = entry(EntryType::Fact, "user likes swift");

        let decision = verify_candidate(&candidate, &existing, &search, thresholds())
            .await
            .unwrap();
        assert!(matches!(decision, Decision::SkipDuplicate { ref existing_id }
            if *existing_id == existing[0].0.id));
        assert_eq!(decision.log_tag(), "skip_duplicate");
    }

    #[tokio::test]
    async fn contradiction_supersedes() {
        let search = lexical_search();
        let existing = with_tokens(vec![entry(EntryType::Fact, "Terence lives in Los Angeles")]);
        let candidate = entry(EntryType::Fact, "Terence lives in Irvine");

        // Jaccard = 3/6 = 0.5: above 0.3, below 0.6.
        let decision = verify_candidate(&candidate, &existing, &search, thresholds())
            .await
            .unwrap();
        assert!(matches!(decision, Decision::Supersede { ref old_id, semantic: false }
            if *old_id == existing[0].0.id));
    }

    #[tokio::test]
    async fn cross_type_non_contradiction_inserts() {
        let search = lexical_search();
        let existing = with_tokens(vec![entry(EntryType::Preference, "Terence lives in LA")]);
        let candidate = entry(EntryType::Fact, "Terence lives in Irvine");

        // preference vs fact is not a contradictable pair.
        let decision = verify_candidate(&candidate, &existing, &search, thresholds())
            .await
            .unwrap();
        assert_eq!(decision, Decision::InsertNovel);
    }

    #[tokio::test]
    async fn correction_contradicts_fact() {
        let search = lexical_search();
        let existing = with_tokens(vec![entry(EntryType::Fact, "The deploy target is staging")]);
        let candidate = entry(EntryType::Correction, "The deploy target is production");

        let decision = verify_candidate(&candidate, &existing, &search, thresholds())
            .await
            .unwrap();
        assert!(matches!(decision, Decision::Supersede { semantic: false, .. }));
    }

    #[tokio::test]
    async fn unrelated_candidate_is_novel() {
        let search = lexical_search();
        let existing = with_tokens(vec![entry(EntryType::Fact, "User likes Swift")]);
        let candidate = entry(EntryType::Fact, "Deploys happen on Fridays");

        let decision = verify_candidate(&candidate, &existing, &search, thresholds())
            .await
            .unwrap();
        assert_eq!(decision, Decision::InsertNovel);
    }

    #[tokio::test]
    async fn decision_is_deterministic() {
        // Total-function property: the same inputs always give the same
        // decision, across a grid of type pairs and overlap levels.
        let search = lexical_search();
        let contents = [
            "alpha beta gamma delta",
            "alpha beta gamma epsilon",
            "completely different words here",
        ];
        for existing_type in EntryType::ALL {
            for candidate_type in EntryType::ALL {
                for existing_content in contents {
                    for candidate_content in contents {
                        let existing =
                            with_tokens(vec![entry(existing_type, existing_content)]);
                        let candidate = entry(candidate_type, candidate_content);
                        let first =
                            verify_candidate(&candidate, &existing, &search, thresholds())
                                .await
                                .unwrap();
                        let second =
                            verify_candidate(&candidate, &existing, &search, thresholds())
                                .await
                                .unwrap();
                        // Ids differ per run, so compare the tags.
                        assert_eq!(first.log_tag(), second.log_tag());
                    }
                }
            }
        }
    }

    #[test]
    fn same_content_folds_case_and_whitespace() {
        assert!(same_content("User likes  Swift", "user LIKES swift"));
        assert!(!same_content("User likes Swift", "User likes Rust"));
    }
}
