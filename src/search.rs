//! Retrieval and ranking engine.
//!
//! `search` runs a fixed pipeline over the chunk store:
//!
//! 1. Vectorize the query (dense + sparse). Vectorization or store failure
//!    yields an empty result with an `error` field, never a panic or `Err`.
//! 2. Retrieve `3 × n_results` nearest chunks by dense similarity, then
//!    add the lexical-overlap boost (`+0.1` per shared sparse term index).
//! 3. Title boost: candidates whose document title shares ≥ 2 query
//!    keywords (or ≥ 1 configured domain term) get `score × 1.5`.
//! 4. Cross-encoder rerank with a minimum-score cutoff; reranker failure
//!    degrades to pre-rerank score order.
//! 5. Group by document; documents contributing more matched chunks order
//!    ahead of single high-scoring outliers.
//! 6. Adaptive neighbor expansion for the top document groups: stronger
//!    groups pull a wider window of adjacent chunks, weaker ones stay
//!    narrow, bounding result growth. Never recursive.
//! 7. Final ordering by rerank score (base score fallback) and truncation.
//!
//! The pipeline is deterministic for a fixed index snapshot, query, and
//! configuration: every sort breaks ties on chunk id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::lexical::tokenize;
use crate::models::{ChunkId, ChunkMetadata, ChunkRecord, SearchMatch, SearchResponse, SparseVector};
use crate::store::{ChunkStore, ScoredChunk};

/// Multiplier applied by the title/heading boost.
const TITLE_BOOST: f64 = 1.5;
/// Score added per overlapping sparse term index.
const SPARSE_OVERLAP_BOOST: f64 = 0.1;
/// Number of document groups eligible for neighbor expansion.
const MAX_EXPANDED_GROUPS: usize = 5;

/// The read path: turns a query into a ranked, deduplicated set of
/// context chunks. Stateless per call; safe to share across tasks.
pub struct RetrievalEngine {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn Embedder>,
    params: RetrievalConfig,
}

/// A chunk moving through the ranking pipeline.
#[derive(Debug, Clone)]
struct Candidate {
    id: String,
    text: String,
    metadata: ChunkMetadata,
    sparse: SparseVector,
    score: f64,
    rerank_score: Option<f64>,
}

impl Candidate {
    fn from_scored(scored: ScoredChunk) -> Self {
        Self {
            id: scored.record.id,
            text: scored.record.text,
            metadata: scored.record.metadata,
            sparse: scored.record.sparse,
            score: scored.score,
            rerank_score: None,
        }
    }

    fn from_neighbor(record: ChunkRecord, score: f64) -> Self {
        Self {
            id: record.id,
            text: record.text,
            metadata: record.metadata,
            sparse: record.sparse,
            score,
            rerank_score: None,
        }
    }

    /// Ranking key: rerank score when present, base score otherwise.
    fn effective_score(&self) -> f64 {
        self.rerank_score.unwrap_or(self.score)
    }

    fn into_match(self) -> SearchMatch {
        SearchMatch {
            id: self.id,
            text: self.text,
            metadata: self.metadata,
            score: self.score,
            rerank_score: self.rerank_score,
        }
    }
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn Embedder>,
        params: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            params,
        }
    }

    /// Run the full pipeline. Always returns a value: failures surface in
    /// `SearchResponse::error` with an empty match list.
    pub async fn search(&self, query: &str) -> SearchResponse {
        if query.trim().is_empty() {
            return SearchResponse::empty(query);
        }

        // 1. Vectorize
        let dense = match self.embedder.embed_dense(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "query vectorization failed");
                return SearchResponse::failed(query, e);
            }
        };
        let query_sparse = self.embedder.embed_sparse(query);

        // 2. Candidate retrieval
        let k_retrieve = self.params.n_results * 3;
        let scored = match self.store.query(&dense, None, k_retrieve).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "candidate retrieval failed");
                return SearchResponse::failed(query, e);
            }
        };
        if scored.is_empty() {
            return SearchResponse::empty(query);
        }

        let mut candidates: Vec<Candidate> = scored.into_iter().map(Candidate::from_scored).collect();
        tracing::debug!(count = candidates.len(), "retrieved candidates");

        if !query_sparse.is_sentinel() {
            for cand in &mut candidates {
                let overlap = query_sparse.overlap(&cand.sparse);
                if overlap > 0 {
                    cand.score += SPARSE_OVERLAP_BOOST * overlap as f64;
                }
            }
        }

        // 3. Title boost
        let query_keywords: HashSet<String> = tokenize(query).into_iter().collect();
        let domain_terms: HashSet<String> = self
            .params
            .domain_terms
            .iter()
            .map(|t| t.to_lowercase())
            .collect();

        for cand in &mut candidates {
            let title = cand.metadata.title().unwrap_or("");
            if title_boost_applies(&query_keywords, title, &domain_terms) {
                cand.score *= TITLE_BOOST;
            }
        }
        sort_by_base_score(&mut candidates);

        // 4. Rerank
        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        match self.embedder.rerank(query, &texts).await {
            Ok(scores) => {
                for (cand, score) in candidates.iter_mut().zip(scores) {
                    cand.rerank_score = Some(score);
                }
                candidates.retain(|c| c.rerank_score.unwrap_or(0.0) >= self.params.min_rerank_score);
                sort_by_effective_score(&mut candidates);
            }
            Err(e) => {
                tracing::warn!(error = %e, "rerank unavailable, falling back to base score order");
                sort_by_base_score(&mut candidates);
            }
        }
        if candidates.is_empty() {
            return SearchResponse::empty(query);
        }

        // 5. Document grouping
        let groups = group_by_document(candidates);

        // 6. Neighbor expansion
        let mut emitted: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for (group_index, group) in groups.into_iter().enumerate() {
            let max_score = group
                .iter()
                .map(Candidate::effective_score)
                .fold(f64::NEG_INFINITY, f64::max);
            let expand = group_index < MAX_EXPANDED_GROUPS;
            let window = window_for_score(max_score);

            let direct: Vec<Candidate> = group
                .into_iter()
                .filter(|c| seen.insert(c.id.clone()))
                .collect();

            if expand {
                let mut neighbors = Vec::new();
                for cand in &direct {
                    // Ids that don't parse stay direct matches but are
                    // excluded from expansion.
                    let Some(chunk_id) = ChunkId::parse(&cand.id) else {
                        continue;
                    };
                    for offset in -window..=window {
                        if offset == 0 {
                            continue;
                        }
                        let Some(neighbor_id) = chunk_id.neighbor(offset) else {
                            continue;
                        };
                        let neighbor_id = neighbor_id.to_string();
                        if seen.contains(&neighbor_id) {
                            continue;
                        }
                        match self.store.get(&neighbor_id).await {
                            Ok(Some(record)) => {
                                seen.insert(neighbor_id);
                                neighbors.push(Candidate::from_neighbor(
                                    record,
                                    cand.score * self.params.neighbor_score_factor,
                                ));
                            }
                            Ok(None) => {}
                            Err(e) => {
                                tracing::debug!(id = %neighbor_id, error = %e, "neighbor fetch failed");
                            }
                        }
                    }
                }
                emitted.extend(direct);
                emitted.extend(neighbors);
            } else {
                emitted.extend(direct);
            }
        }

        // 7. Final ordering and truncation
        sort_by_effective_score(&mut emitted);
        emitted.truncate(self.params.rerank_top_k);

        SearchResponse {
            matches: emitted.into_iter().map(Candidate::into_match).collect(),
            query: query.to_string(),
            error: None,
        }
    }
}

/// Whether the title boost fires: ≥ 2 shared keywords between query and
/// title, or a single shared keyword that is a configured domain term.
fn title_boost_applies(
    query_keywords: &HashSet<String>,
    title: &str,
    domain_terms: &HashSet<String>,
) -> bool {
    if title.is_empty() || query_keywords.is_empty() {
        return false;
    }
    let title_words: HashSet<String> = tokenize(title).into_iter().collect();
    let shared: Vec<&String> = title_words.intersection(query_keywords).collect();
    shared.len() >= 2 || shared.iter().any(|w| domain_terms.contains(w.as_str()))
}

/// Expansion window from a group's best score: strong documents pull
/// three neighbors each side, weak ones a single neighbor.
fn window_for_score(max_score: f64) -> i64 {
    if max_score >= 0.6 {
        3
    } else if max_score >= 0.4 {
        2
    } else {
        1
    }
}

/// Grouping key: the document id prefix of the chunk id. Ids that do not
/// parse group under their full string.
fn group_key(id: &str) -> String {
    ChunkId::parse(id).map_or_else(|| id.to_string(), |c| c.document_id)
}

/// Partition candidates by document and order groups by
/// (chunk count desc, max effective score desc, document id asc).
fn group_by_document(candidates: Vec<Candidate>) -> Vec<Vec<Candidate>> {
    let mut by_doc: HashMap<String, Vec<Candidate>> = HashMap::new();
    for cand in candidates {
        by_doc.entry(group_key(&cand.id)).or_default().push(cand);
    }

    let mut groups: Vec<(String, Vec<Candidate>)> = by_doc.into_iter().collect();
    groups.sort_by(|(a_key, a), (b_key, b)| {
        let a_max = a.iter().map(Candidate::effective_score).fold(f64::NEG_INFINITY, f64::max);
        let b_max = b.iter().map(Candidate::effective_score).fold(f64::NEG_INFINITY, f64::max);
        b.len()
            .cmp(&a.len())
            .then_with(|| b_max.partial_cmp(&a_max).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a_key.cmp(b_key))
    });

    groups.into_iter().map(|(_, group)| group).collect()
}

fn sort_by_base_score(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn sort_by_effective_score(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.effective_score()
            .partial_cmp(&a.effective_score())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords(s: &str) -> HashSet<String> {
        tokenize(s).into_iter().collect()
    }

    fn candidate(id: &str, score: f64, rerank: Option<f64>) -> Candidate {
        Candidate {
            id: id.to_string(),
            text: String::new(),
            metadata: ChunkMetadata::new(),
            sparse: SparseVector::sentinel(),
            score,
            rerank_score: rerank,
        }
    }

    #[test]
    fn test_title_boost_two_shared_words() {
        let q = keywords("vpn access policy");
        assert!(title_boost_applies(&q, "VPN Access Guide", &HashSet::new()));
        assert!(!title_boost_applies(&q, "Access Guide", &HashSet::new()));
        assert!(!title_boost_applies(&q, "", &HashSet::new()));
    }

    #[test]
    fn test_title_boost_single_domain_term() {
        let q = keywords("kubernetes upgrade");
        let domain: HashSet<String> = ["kubernetes".to_string()].into_iter().collect();
        assert!(title_boost_applies(&q, "Kubernetes Cluster", &domain));
        assert!(!title_boost_applies(&q, "Cluster Upgrades", &domain));
    }

    #[test]
    fn test_window_thresholds() {
        assert_eq!(window_for_score(0.65), 3);
        assert_eq!(window_for_score(0.6), 3);
        assert_eq!(window_for_score(0.45), 2);
        assert_eq!(window_for_score(0.4), 2);
        assert_eq!(window_for_score(0.39), 1);
        assert_eq!(window_for_score(0.0), 1);
    }

    #[test]
    fn test_group_key_unparseable_id() {
        assert_eq!(group_key("doc-3"), "doc");
        assert_eq!(group_key("weird_id"), "weird_id");
    }

    #[test]
    fn test_group_ordering_count_beats_score() {
        let candidates = vec![
            candidate("a-0", 0.5, Some(0.5)),
            candidate("a-1", 0.5, Some(0.55)),
            candidate("b-0", 0.9, Some(0.95)),
        ];
        let groups = group_by_document(candidates);
        assert_eq!(groups.len(), 2);
        // Document A contributed two chunks and orders first even though
        // document B holds the single best score.
        assert_eq!(group_key(&groups[0][0].id), "a");
        assert_eq!(group_key(&groups[1][0].id), "b");
    }

    #[test]
    fn test_group_ordering_tie_on_count_uses_max_score() {
        let candidates = vec![
            candidate("a-0", 0.5, Some(0.4)),
            candidate("b-0", 0.5, Some(0.8)),
        ];
        let groups = group_by_document(candidates);
        assert_eq!(group_key(&groups[0][0].id), "b");
    }

    #[test]
    fn test_sort_deterministic_on_equal_scores() {
        let mut candidates = vec![
            candidate("b-0", 0.5, None),
            candidate("a-0", 0.5, None),
        ];
        sort_by_effective_score(&mut candidates);
        assert_eq!(candidates[0].id, "a-0");
    }

    #[test]
    fn test_effective_score_prefers_rerank() {
        let with = candidate("a-0", 0.9, Some(0.2));
        let without = candidate("a-1", 0.3, None);
        assert_eq!(with.effective_score(), 0.2);
        assert_eq!(without.effective_score(), 0.3);
    }
}
