//! In-memory [`ChunkStore`] and [`TimestampStore`] implementations.
//!
//! `BTreeMap`s behind `std::sync::RwLock` for thread safety and
//! deterministic iteration. Vector search is brute-force cosine over all
//! stored chunks. Suitable for tests and small ephemeral corpora.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::chunk::text_hash;
use crate::models::ChunkRecord;

use super::{cosine_sim, ChunkStore, MetadataFilter, ScoredChunk, TimestampStore};

/// In-memory chunk index.
#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<BTreeMap<String, ChunkRecord>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn upsert(&self, record: ChunkRecord) -> Result<()> {
        let mut chunks = self.chunks.write().unwrap();
        chunks.insert(record.id.clone(), record);
        Ok(())
    }

    async fn query(
        &self,
        dense: &[f32],
        filter: Option<&MetadataFilter>,
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let chunks = self.chunks.read().unwrap();
        let mut matches: Vec<ScoredChunk> = chunks
            .values()
            .filter(|record| filter.map_or(true, |f| f.matches(record)))
            .map(|record| ScoredChunk {
                record: record.clone(),
                score: f64::from(cosine_sim(dense, &record.dense)),
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        matches.truncate(k);
        Ok(matches)
    }

    async fn get(&self, id: &str) -> Result<Option<ChunkRecord>> {
        let chunks = self.chunks.read().unwrap();
        Ok(chunks.get(id).cloned())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.chunks.read().unwrap().len())
    }

    async fn content_hash(&self) -> Result<String> {
        let chunks = self.chunks.read().unwrap();
        let mut hasher = Sha256::new();
        // BTreeMap iterates in id order, so the digest is order-independent
        // with respect to insertion.
        for (id, record) in chunks.iter() {
            hasher.update(id.as_bytes());
            hasher.update(text_hash(&record.text).as_bytes());
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

struct StampEntry {
    stamp: String,
    written_at: Instant,
    ttl: Duration,
}

impl StampEntry {
    fn is_expired(&self) -> bool {
        self.written_at.elapsed() >= self.ttl
    }
}

/// In-memory sync-stamp map with TTL semantics.
#[derive(Default)]
pub struct MemoryTimestampStore {
    entries: RwLock<BTreeMap<String, StampEntry>>,
}

impl MemoryTimestampStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimestampStore for MemoryTimestampStore {
    async fn get(&self, document_id: &str) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .get(document_id)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.stamp.clone()))
    }

    async fn set_with_expiry(&self, document_id: &str, stamp: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            document_id.to_string(),
            StampEntry {
                stamp: stamp.to_string(),
                written_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, SparseVector};

    fn record(id: &str, dense: Vec<f32>) -> ChunkRecord {
        let mut metadata = ChunkMetadata::new();
        if let Some(parsed) = crate::models::ChunkId::parse(id) {
            metadata.insert("document_id", parsed.document_id.clone());
        }
        ChunkRecord {
            id: id.to_string(),
            text: format!("text of {id}"),
            dense,
            sparse: SparseVector::sentinel(),
            metadata,
        }
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let store = MemoryChunkStore::new();
        store.upsert(record("a-0", vec![1.0, 0.0])).await.unwrap();
        store.upsert(record("a-0", vec![0.0, 1.0])).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        let stored = store.get("a-0").await.unwrap().unwrap();
        assert_eq!(stored.dense, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_query_orders_by_similarity() {
        let store = MemoryChunkStore::new();
        store.upsert(record("a-0", vec![1.0, 0.0])).await.unwrap();
        store.upsert(record("b-0", vec![0.6, 0.8])).await.unwrap();
        store.upsert(record("c-0", vec![0.0, 1.0])).await.unwrap();

        let matches = store.query(&[1.0, 0.0], None, 10).await.unwrap();
        let ids: Vec<&str> = matches.iter().map(|m| m.record.id.as_str()).collect();
        assert_eq!(ids, vec!["a-0", "b-0", "c-0"]);
        assert!((matches[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_query_metadata_filter() {
        let store = MemoryChunkStore::new();
        store.upsert(record("a-0", vec![1.0, 0.0])).await.unwrap();
        store.upsert(record("b-0", vec![1.0, 0.0])).await.unwrap();

        let filter = MetadataFilter::new("document_id", "a");
        let matches = store.query(&[1.0, 0.0], Some(&filter), 10).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].record.id, "a-0");
    }

    #[tokio::test]
    async fn test_content_hash_insertion_order_independent() {
        let left = MemoryChunkStore::new();
        left.upsert(record("a-0", vec![1.0])).await.unwrap();
        left.upsert(record("b-0", vec![1.0])).await.unwrap();

        let right = MemoryChunkStore::new();
        right.upsert(record("b-0", vec![1.0])).await.unwrap();
        right.upsert(record("a-0", vec![1.0])).await.unwrap();

        assert_eq!(
            left.content_hash().await.unwrap(),
            right.content_hash().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_stamp_ttl_expiry() {
        let stamps = MemoryTimestampStore::new();
        stamps
            .set_with_expiry("doc", "2026-01-01T00:00:00Z", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(stamps.get("doc").await.unwrap().is_some());

        stamps
            .set_with_expiry("doc", "2026-01-01T00:00:00Z", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(stamps.get("doc").await.unwrap(), None);
    }
}
