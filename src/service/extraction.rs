// Extraction prompt construction and response parsing.
//
// The core model is asked for a single JSON object. Small local models
// decorate JSON with prose and code fences anyway, so parsing is layered:
//   1. strict `serde_json` parse of the whole response
//   2. fenced ```json block, then the largest balanced {…} substring
//   3. lenient field coercion (string confidences → float, string tag →
//      one-element list, unknown entry types → fact)
// Giving up silently yields zero entries — extraction failures must never
// fail the chat path.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::atoms::constants::EXTRACTION_PROMPT_ENTRY_LIMIT;
use crate::atoms::types::{EntityType, EntryType, MemoryEntry};

pub const EXTRACTION_SYSTEM_PROMPT: &str = "\
You extract durable memories from a conversation turn for a personal AI assistant.\n\
Respond with a single JSON object and nothing else — no prose, no code fences.\n\
Schema:\n\
{\n\
  \"memories\": [{\"type\": \"fact|preference|decision|correction|commitment|relationship|skill\",\n\
                \"content\": \"one self-contained statement\",\n\
                \"confidence\": 0.0-1.0,\n\
                \"tags\": [\"short-tag\"]}],\n\
  \"profile_facts\": [\"stable fact about the user worth keeping in their profile\"],\n\
  \"entities\": [{\"name\": \"...\", \"type\": \"person|company|place|project|tool|concept|event|unknown\"}],\n\
  \"relationships\": [{\"source\": \"entity name\", \"relation\": \"verb_phrase\",\n\
                      \"target\": \"entity name\", \"confidence\": 0.0-1.0}]\n\
}\n\
Only extract what the conversation actually establishes. Empty arrays are fine.";

/// Build the user-side extraction prompt: session date, existing-memory
/// stubs, and the turn itself.
pub fn build_extraction_prompt(
    session_date: Option<&str>,
    existing: &[MemoryEntry],
    user_message: &str,
    assistant_message: Option<&str>,
) -> String {
    let mut prompt = String::new();
    if let Some(date) = session_date {
        prompt.push_str(&format!("Session date: {}\n\n", date));
    }
    if !existing.is_empty() {
        prompt.push_str("Existing memories (do not re-extract near-duplicates):\n");
        for entry in existing.iter().take(EXTRACTION_PROMPT_ENTRY_LIMIT) {
            prompt.push_str(&format!(
                "- [{}] {}\n",
                entry.entry_type.as_str(),
                crate::tokenizer::truncate_to_budget(&entry.content, 40)
            ));
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!("User: {}\n", user_message));
    if let Some(assistant) = assistant_message {
        prompt.push_str(&format!("Assistant: {}\n", assistant));
    }
    prompt
}

// ── Parsed output ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedMemory {
    pub entry_type: EntryType,
    pub content: String,
    pub confidence: f64,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: EntityType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelationship {
    pub source: String,
    pub relation: String,
    pub target: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionOutput {
    pub memories: Vec<ExtractedMemory>,
    pub profile_facts: Vec<String>,
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,
}

impl ExtractionOutput {
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
            && self.profile_facts.is_empty()
            && self.entities.is_empty()
            && self.relationships.is_empty()
    }
}

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"```(?:json)?\s*([\s\S]*?)```").expect("fenced-json regex")
});

/// Parse a model response into extraction output. Never errors: anything
/// unsalvageable becomes an empty output.
pub fn parse_extraction(raw: &str) -> ExtractionOutput {
    let value = parse_json_value(raw);
    match value {
        Some(v) => lenient_convert(&v),
        None => ExtractionOutput::default(),
    }
}

fn parse_json_value(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();

    // 1. Strict.
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }

    // 2. Fenced code block.
    if let Some(caps) = FENCED_JSON.captures(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(caps[1].trim()) {
            if v.is_object() {
                return Some(v);
            }
        }
    }

    // 3. Largest balanced {…} substring.
    for candidate in balanced_objects(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(candidate) {
            if v.is_object() {
                return Some(v);
            }
        }
    }

    None
}

/// Top-level balanced `{…}` spans, longest first. Brace tracking skips
/// string literals so embedded braces don't break the depth count.
fn balanced_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        spans.push((start, i + 1));
                    }
                }
            }
            _ => {}
        }
    }

    spans.sort_by_key(|(s, e)| std::cmp::Reverse(e - s));
    spans.into_iter().map(|(s, e)| &text[s..e]).collect()
}

/// Coercion helpers tolerate the usual small-model sloppiness.
fn lenient_convert(v: &Value) -> ExtractionOutput {
    let mut out = ExtractionOutput::default();

    if let Some(memories) = v["memories"].as_array() {
        for m in memories {
            let Some(content) = m["content"].as_str() else {
                continue;
            };
            if content.trim().is_empty() {
                continue;
            }
            let entry_type = m["type"]
                .as_str()
                .and_then(EntryType::parse)
                .unwrap_or(EntryType::Fact);
            out.memories.push(ExtractedMemory {
                entry_type,
                content: content.trim().to_string(),
                confidence: coerce_f64(&m["confidence"]).unwrap_or(0.5),
                tags: coerce_string_list(&m["tags"]),
            });
        }
    }

    if let Some(facts) = v["profile_facts"].as_array() {
        for f in facts {
            if let Some(s) = f.as_str() {
                if !s.trim().is_empty() {
                    out.profile_facts.push(s.trim().to_string());
                }
            }
        }
    }

    if let Some(entities) = v["entities"].as_array() {
        for e in entities {
            let Some(name) = e["name"].as_str() else {
                continue;
            };
            if name.trim().is_empty() {
                continue;
            }
            let entity_type = e["type"]
                .as_str()
                .and_then(EntityType::parse)
                .unwrap_or(EntityType::Unknown);
            out.entities.push(ExtractedEntity {
                name: name.trim().to_string(),
                entity_type,
            });
        }
    }

    if let Some(relationships) = v["relationships"].as_array() {
        for r in relationships {
            let (Some(source), Some(relation), Some(target)) = (
                r["source"].as_str(),
                r["relation"].as_str(),
                r["target"].as_str(),
            ) else {
                continue;
            };
            if source.trim().is_empty() || relation.trim().is_empty() || target.trim().is_empty() {
                continue;
            }
            out.relationships.push(ExtractedRelationship {
                source: source.trim().to_string(),
                relation: relation.trim().to_string(),
                target: target.trim().to_string(),
                confidence: coerce_f64(&r["confidence"]).unwrap_or(0.5),
            });
        }
    }

    out
}

fn coerce_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn coerce_string_list(v: &Value) -> Vec<String> {
    match v {
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.as_str())
            .map(|s| s.to_string())
            .collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_parses() {
        let raw = r#"{"memories": [{"type": "preference", "content": "User prefers dark mode",
                        "confidence": 0.9, "tags": ["ui"]}]}"#;
        let out = parse_extraction(raw);
        assert_eq!(out.memories.len(), 1);
        assert_eq!(out.memories[0].entry_type, EntryType::Preference);
        assert_eq!(out.memories[0].confidence, 0.9);
        assert_eq!(out.memories[0].tags, vec!["ui"]);
    }

    #[test]
    fn fenced_block_parses() {
        let raw = "Here is the extraction:\n```json\n{\"memories\": [{\"type\": \"fact\", \"content\": \"User lives in Irvine\"}]}\n```";
        let out = parse_extraction(raw);
        assert_eq!(out.memories.len(), 1);
        assert_eq!(out.memories[0].content, "User lives in Irvine");
    }

    #[test]
    fn balanced_substring_parses() {
        let raw = "Sure! The result is {\"profile_facts\": [\"Works at Acme\"]} — done.";
        let out = parse_extraction(raw);
        assert_eq!(out.profile_facts, vec!["Works at Acme"]);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let raw = r#"{"memories": [{"type": "fact", "content": "Uses {braces} in code", "confidence": 0.8}]}"#;
        let out = parse_extraction(raw);
        assert_eq!(out.memories.len(), 1);
        assert!(out.memories[0].content.contains("{braces}"));
    }

    #[test]
    fn lenient_coercions() {
        let raw = r#"{"memories": [{"type": "mystery", "content": "Something",
                        "confidence": "0.7", "tags": "solo-tag"}]}"#;
        let out = parse_extraction(raw);
        assert_eq!(out.memories[0].entry_type, EntryType::Fact);
        assert_eq!(out.memories[0].confidence, 0.7);
        assert_eq!(out.memories[0].tags, vec!["solo-tag"]);
    }

    #[test]
    fn garbage_yields_empty_output() {
        assert!(parse_extraction("I could not find anything.").is_empty());
        assert!(parse_extraction("").is_empty());
        assert!(parse_extraction("[1, 2, 3]").is_empty());
    }

    #[test]
    fn incomplete_rows_are_dropped() {
        let raw = r#"{"memories": [{"type": "fact"}, {"content": ""}],
                      "entities": [{"type": "person"}],
                      "relationships": [{"source": "A", "target": "B"}]}"#;
        let out = parse_extraction(raw);
        assert!(out.is_empty());
    }

    #[test]
    fn relationships_parse() {
        let raw = r#"{"relationships": [{"source": "Terence", "relation": "works_at",
                       "target": "Acme", "confidence": 0.85}],
                      "entities": [{"name": "Terence", "type": "person"},
                                   {"name": "Acme", "type": "company"}]}"#;
        let out = parse_extraction(raw);
        assert_eq!(out.relationships.len(), 1);
        assert_eq!(out.entities.len(), 2);
        assert_eq!(out.relationships[0].relation, "works_at");
    }

    #[test]
    fn prompt_includes_stubs_and_date() {
        let existing = vec![MemoryEntry::new(
            "a",
            EntryType::Fact,
            "User lives in Irvine",
            0.9,
            "m",
            None,
            vec![],
        )];
        let prompt = build_extraction_prompt(
            Some("2026-08-01"),
            &existing,
            "I moved recently",
            Some("Noted!"),
        );
        assert!(prompt.contains("Session date: 2026-08-01"));
        assert!(prompt.contains("- [fact] User lives in Irvine"));
        assert!(prompt.contains("User: I moved recently"));
        assert!(prompt.contains("Assistant: Noted!"));
    }
}
