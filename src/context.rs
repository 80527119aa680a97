//! Token-budgeted context assembly.
//!
//! Walks a ranked match list and emits passages until the configured
//! token budget would be exceeded. Token counts use the ~4 chars/token
//! heuristic shared with the chunker; the budget is a cap on retained
//! passages, not a hard guarantee about any downstream prompt.

use serde::Serialize;

use crate::chunk::CHARS_PER_TOKEN;
use crate::models::SearchMatch;

/// One passage selected for the answer context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextPassage {
    pub document_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub text: String,
    pub score: f64,
}

/// Estimated token count of a passage's text.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Select passages from ranked matches until `max_tokens` is reached.
/// Matches with empty text are skipped; order is preserved.
pub fn assemble(matches: &[SearchMatch], max_tokens: usize) -> Vec<ContextPassage> {
    let mut passages = Vec::new();
    let mut used_tokens = 0usize;

    for m in matches {
        if m.text.trim().is_empty() {
            continue;
        }
        let cost = estimate_tokens(&m.text);
        if used_tokens + cost > max_tokens {
            tracing::debug!(
                selected = passages.len(),
                used_tokens,
                budget = max_tokens,
                "context budget reached"
            );
            break;
        }
        used_tokens += cost;

        passages.push(ContextPassage {
            document_id: m.metadata.document_id().unwrap_or_default().to_string(),
            title: m.metadata.title().unwrap_or("(untitled)").to_string(),
            section: m.metadata.section().map(str::to_string),
            url: m.metadata.url().map(str::to_string),
            text: m.text.clone(),
            score: m.rerank_score.unwrap_or(m.score),
        });
    }

    passages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;

    fn search_match(id: &str, text: &str, score: f64) -> SearchMatch {
        let mut metadata = ChunkMetadata::new();
        metadata.insert("document_id", "doc");
        metadata.insert("title", "Title");
        SearchMatch {
            id: id.to_string(),
            text: text.to_string(),
            metadata,
            score,
            rerank_score: None,
        }
    }

    #[test]
    fn test_assemble_respects_budget() {
        let matches = vec![
            search_match("doc-0", &"a".repeat(40), 0.9), // 10 tokens
            search_match("doc-1", &"b".repeat(40), 0.8), // 10 tokens
            search_match("doc-2", &"c".repeat(40), 0.7), // 10 tokens
        ];
        let passages = assemble(&matches, 25);
        assert_eq!(passages.len(), 2);
        assert_eq!(passages[0].text.chars().next(), Some('a'));
    }

    #[test]
    fn test_assemble_skips_empty_text() {
        let matches = vec![
            search_match("doc-0", "   ", 0.9),
            search_match("doc-1", "real content", 0.8),
        ];
        let passages = assemble(&matches, 100);
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].text, "real content");
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
