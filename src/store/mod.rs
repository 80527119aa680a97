//! Storage abstraction for the engine.
//!
//! [`ChunkStore`] defines every operation the retrieval and sync cores
//! need from the index, enabling pluggable backends (SQLite, in-memory).
//! [`TimestampStore`] persists the per-document last-successful-sync
//! stamps that drive change detection.
//!
//! Implementations must be `Send + Sync`; they are shared as
//! `Arc<dyn ...>` between the foreground retrieval engine and the
//! background sync task. Per-chunk upserts are atomic at single-id
//! granularity; a whole document's chunk set is deliberately not
//! transactional (readers tolerate a mid-update window).

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChunkRecord, MetadataValue};

/// A stored chunk paired with its similarity score for one query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub record: ChunkRecord,
    /// `1 − cosine distance` against the query vector.
    pub score: f64,
}

/// Equality filter over a single metadata field, applied during
/// similarity queries.
#[derive(Debug, Clone)]
pub struct MetadataFilter {
    pub key: String,
    pub value: MetadataValue,
}

impl MetadataFilter {
    pub fn new(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, record: &ChunkRecord) -> bool {
        record.metadata.get(&self.key) == Some(&self.value)
    }
}

/// Key-value index of embedded chunks, keyed by `{document_id}-{chunk_index}`.
///
/// The sync controller is the only writer; retrieval is read-only.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert or overwrite the chunk stored under `record.id`.
    async fn upsert(&self, record: ChunkRecord) -> Result<()>;

    /// Return the `k` nearest chunks by dense cosine similarity, scored as
    /// `1 − distance`, best first. Ties break on id for determinism.
    async fn query(
        &self,
        dense: &[f32],
        filter: Option<&MetadataFilter>,
        k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    /// Point lookup by chunk id.
    async fn get(&self, id: &str) -> Result<Option<ChunkRecord>>;

    /// Number of stored chunks.
    async fn count(&self) -> Result<usize>;

    /// Order-independent digest of the stored content (ids + text hashes).
    /// Two stores with identical chunk sets produce identical digests.
    async fn content_hash(&self) -> Result<String>;
}

/// Persisted `document_id → last-successful-sync timestamp` map with TTL.
///
/// Expired entries read as absent, so stale records self-heal into a
/// re-index instead of suppressing one.
#[async_trait]
pub trait TimestampStore: Send + Sync {
    async fn get(&self, document_id: &str) -> Result<Option<String>>;

    async fn set_with_expiry(&self, document_id: &str, stamp: &str, ttl: Duration) -> Result<()>;
}

/// Cosine similarity between two vectors (0.0 on mismatch or zero norm).
pub fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector (reverses [`vec_to_blob`]).
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_round_trip() {
        let v = vec![1.0f32, -2.5, 3.125];
        let blob = vec_to_blob(&v);
        assert_eq!(blob.len(), 12);
        assert_eq!(blob_to_vec(&blob), v);
    }

    #[test]
    fn test_cosine_basics() {
        assert!((cosine_sim(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_sim(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_sim(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_sim(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
