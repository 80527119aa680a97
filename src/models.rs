//! Core data types used throughout the engine.
//!
//! These types represent the chunks, metadata, and search results that flow
//! through the sync and retrieval pipelines. Chunks are addressed by a
//! composite id of the form `{document_id}-{chunk_index}`, which both cores
//! rely on for neighbor lookups.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Composite chunk identifier: `{document_id}-{chunk_index}`.
///
/// The document id may itself contain `-`; parsing always splits on the
/// *last* separator, so `"2384-85654-3"` is chunk 3 of document
/// `"2384-85654"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub document_id: String,
    pub chunk_index: u32,
}

impl ChunkId {
    pub fn new(document_id: impl Into<String>, chunk_index: u32) -> Self {
        Self {
            document_id: document_id.into(),
            chunk_index,
        }
    }

    /// Parse a composite id. Returns `None` when the string has no `-`
    /// separator or the suffix is not a non-negative integer.
    pub fn parse(id: &str) -> Option<Self> {
        let (document_id, index) = id.rsplit_once('-')?;
        if document_id.is_empty() {
            return None;
        }
        let chunk_index: u32 = index.parse().ok()?;
        Some(Self {
            document_id: document_id.to_string(),
            chunk_index,
        })
    }

    /// The id of the chunk `offset` positions away within the same document.
    /// Returns `None` when the offset would move before index 0.
    pub fn neighbor(&self, offset: i64) -> Option<Self> {
        let index = i64::from(self.chunk_index) + offset;
        let chunk_index = u32::try_from(index).ok()?;
        Some(Self {
            document_id: self.document_id.clone(),
            chunk_index,
        })
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.document_id, self.chunk_index)
    }
}

/// Sparse lexical vector: parallel `indices`/`values` arrays over the
/// fitted term vocabulary. Most indices are implicitly zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    /// Placeholder emitted before the lexical model has been fit.
    /// Carries no lexical signal and is excluded from overlap boosting.
    pub fn sentinel() -> Self {
        Self {
            indices: vec![0],
            values: vec![1e-9],
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.indices == [0]
    }

    /// Number of term indices shared with `other`.
    pub fn overlap(&self, other: &SparseVector) -> usize {
        let mine: std::collections::HashSet<u32> = self.indices.iter().copied().collect();
        other.indices.iter().filter(|i| mine.contains(i)).count()
    }
}

/// A single metadata value. Replaces the ad hoc "stringify anything"
/// fallback with an explicit closed set of shapes; list values are only
/// ever stored non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<String>),
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::Str(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::Str(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Int(v)
    }
}

impl From<u32> for MetadataValue {
    fn from(v: u32) -> Self {
        MetadataValue::Int(i64::from(v))
    }
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(v: Vec<String>) -> Self {
        MetadataValue::List(v)
    }
}

/// Chunk metadata document. Backed by a `BTreeMap` so serialization and
/// iteration order are deterministic.
///
/// Absence is the only representation of "no value": inserting an empty
/// list is a no-op, and readers must treat a missing key as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkMetadata(BTreeMap<String, MetadataValue>);

impl ChunkMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value. Empty lists collapse to absence rather than being
    /// stored as empty collections.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        let value = value.into();
        if let MetadataValue::List(ref items) = value {
            if items.is_empty() {
                return;
            }
        }
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(MetadataValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn int_field(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(MetadataValue::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn document_id(&self) -> Option<&str> {
        self.str_field("document_id")
    }

    pub fn title(&self) -> Option<&str> {
        self.str_field("title")
    }

    pub fn section(&self) -> Option<&str> {
        self.str_field("section")
    }

    pub fn url(&self) -> Option<&str> {
        self.str_field("url")
    }

    pub fn chunk_index(&self) -> Option<i64> {
        self.int_field("chunk_index")
    }

    pub fn total_chunks(&self) -> Option<i64> {
        self.int_field("total_chunks")
    }

    pub fn tags(&self) -> Option<&[String]> {
        match self.0.get("tags") {
            Some(MetadataValue::List(items)) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Copy every entry of `other` into `self` (`other` wins on conflict).
    pub fn extend_from(&mut self, other: &ChunkMetadata) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetadataValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A fully embedded chunk as persisted by the store. The sync controller
/// is the only writer; retrieval reads it back as [`SearchMatch`]es.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub text: String,
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
    pub metadata: ChunkMetadata,
}

/// Ephemeral result unit for one query's ranking pipeline. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// Base relevance: cosine similarity plus boosts.
    pub score: f64,
    /// Cross-encoder relevance in `[0, 1]`; absent when the reranker was
    /// unavailable and for neighbor-expanded chunks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
}

/// The value returned to every `search` caller. Failures are carried in
/// `error` with an empty match list; the call itself never fails.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub matches: Vec<SearchMatch>,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SearchResponse {
    pub fn empty(query: &str) -> Self {
        Self {
            matches: Vec::new(),
            query: query.to_string(),
            error: None,
        }
    }

    pub fn failed(query: &str, error: impl fmt::Display) -> Self {
        Self {
            matches: Vec::new(),
            query: query.to_string(),
            error: Some(error.to_string()),
        }
    }
}

/// Counters returned by one incremental sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub checked: u64,
    pub updated: u64,
    pub new: u64,
    pub errors: u64,
}

/// One document as enumerated by the source, before any content fetch.
#[derive(Debug, Clone)]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
    pub version: i64,
    pub url: String,
}

/// Full document payload from the source: raw body plus document-level
/// metadata shared by every chunk of that document.
#[derive(Debug, Clone)]
pub struct DocumentContent {
    pub body_html: String,
    pub metadata: ChunkMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_round_trip() {
        let id = ChunkId::new("238485654", 7);
        assert_eq!(id.to_string(), "238485654-7");
        assert_eq!(ChunkId::parse("238485654-7"), Some(id));
    }

    #[test]
    fn test_chunk_id_document_with_dashes() {
        let parsed = ChunkId::parse("space-overview-12").unwrap();
        assert_eq!(parsed.document_id, "space-overview");
        assert_eq!(parsed.chunk_index, 12);
    }

    #[test]
    fn test_chunk_id_malformed() {
        assert_eq!(ChunkId::parse("no_separator"), None);
        assert_eq!(ChunkId::parse("doc-"), None);
        assert_eq!(ChunkId::parse("doc-abc"), None);
        assert_eq!(ChunkId::parse("-3"), None);
    }

    #[test]
    fn test_chunk_id_neighbor() {
        let id = ChunkId::new("doc", 1);
        assert_eq!(id.neighbor(1).unwrap().chunk_index, 2);
        assert_eq!(id.neighbor(-1).unwrap().chunk_index, 0);
        assert_eq!(id.neighbor(-2), None);
    }

    #[test]
    fn test_metadata_empty_list_collapsed() {
        let mut meta = ChunkMetadata::new();
        meta.insert("tags", Vec::<String>::new());
        assert!(meta.get("tags").is_none());

        meta.insert("tags", vec!["runbook".to_string()]);
        assert_eq!(meta.tags(), Some(&["runbook".to_string()][..]));
    }

    #[test]
    fn test_metadata_serde_round_trip() {
        let mut meta = ChunkMetadata::new();
        meta.insert("document_id", "42");
        meta.insert("chunk_index", 3i64);
        meta.insert("tags", vec!["a".to_string(), "b".to_string()]);

        let json = serde_json::to_string(&meta).unwrap();
        let back: ChunkMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
        assert_eq!(back.chunk_index(), Some(3));
    }

    #[test]
    fn test_sparse_overlap() {
        let a = SparseVector {
            indices: vec![1, 4, 9],
            values: vec![0.5, 0.2, 0.1],
        };
        let b = SparseVector {
            indices: vec![4, 9, 17],
            values: vec![0.3, 0.3, 0.3],
        };
        assert_eq!(a.overlap(&b), 2);
        assert!(SparseVector::sentinel().is_sentinel());
    }
}
