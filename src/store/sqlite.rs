//! SQLite-backed [`ChunkStore`] and [`TimestampStore`].
//!
//! Dense vectors are stored as little-endian f32 BLOBs; sparse vectors and
//! metadata as JSON text. Similarity queries are brute-force cosine over
//! all stored vectors, computed in Rust. Sync stamps live in their own
//! table with an absolute `expires_at`; expired rows read as absent.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::models::{ChunkMetadata, ChunkRecord, SparseVector};

use super::{
    blob_to_vec, cosine_sim, vec_to_blob, ChunkStore, MetadataFilter, ScoredChunk, TimestampStore,
};

/// Open (creating if missing) the database at `path` with WAL enabled.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create all tables and indexes. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            dense BLOB NOT NULL,
            sparse_json TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            text_hash TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_stamps (
            document_id TEXT PRIMARY KEY,
            stamp TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Chunk index persisted in SQLite.
pub struct SqliteChunkStore {
    pool: SqlitePool,
}

impl SqliteChunkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<ChunkRecord> {
    let sparse_json: String = row.get("sparse_json");
    let metadata_json: String = row.get("metadata_json");
    let dense_blob: Vec<u8> = row.get("dense");

    let sparse: SparseVector =
        serde_json::from_str(&sparse_json).context("malformed sparse_json")?;
    let metadata: ChunkMetadata =
        serde_json::from_str(&metadata_json).context("malformed metadata_json")?;

    Ok(ChunkRecord {
        id: row.get("id"),
        text: row.get("text"),
        dense: blob_to_vec(&dense_blob),
        sparse,
        metadata,
    })
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn upsert(&self, record: ChunkRecord) -> Result<()> {
        let parsed = crate::models::ChunkId::parse(&record.id);
        let (document_id, chunk_index) = match &parsed {
            Some(id) => (id.document_id.clone(), i64::from(id.chunk_index)),
            None => (record.id.clone(), 0),
        };

        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, chunk_index, text, dense, sparse_json, metadata_json, text_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                document_id = excluded.document_id,
                chunk_index = excluded.chunk_index,
                text = excluded.text,
                dense = excluded.dense,
                sparse_json = excluded.sparse_json,
                metadata_json = excluded.metadata_json,
                text_hash = excluded.text_hash
            "#,
        )
        .bind(&record.id)
        .bind(&document_id)
        .bind(chunk_index)
        .bind(&record.text)
        .bind(vec_to_blob(&record.dense))
        .bind(serde_json::to_string(&record.sparse)?)
        .bind(serde_json::to_string(&record.metadata)?)
        .bind(crate::chunk::text_hash(&record.text))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(
        &self,
        dense: &[f32],
        filter: Option<&MetadataFilter>,
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(
            "SELECT id, text, dense, sparse_json, metadata_json FROM chunks",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut matches: Vec<ScoredChunk> = Vec::new();
        for row in &rows {
            let record = row_to_record(row)?;
            if let Some(f) = filter {
                if !f.matches(&record) {
                    continue;
                }
            }
            let score = f64::from(cosine_sim(dense, &record.dense));
            matches.push(ScoredChunk { record, score });
        }

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
        let row = sqlx::query(
            "SELECT id, text, dense, sparse_json, metadata_json FROM chunks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn content_hash(&self) -> Result<String> {
        let rows = sqlx::query("SELECT id, text_hash FROM chunks ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut hasher = Sha256::new();
        for row in &rows {
            let id: String = row.get("id");
            let text_hash: String = row.get("text_hash");
            hasher.update(id.as_bytes());
            hasher.update(text_hash.as_bytes());
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Sync-stamp map persisted in SQLite.
pub struct SqliteTimestampStore {
    pool: SqlitePool,
}

impl SqliteTimestampStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TimestampStore for SqliteTimestampStore {
    async fn get(&self, document_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT stamp, expires_at FROM sync_stamps WHERE document_id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at: i64 = row.get("expires_at");
        if expires_at <= chrono::Utc::now().timestamp() {
            return Ok(None);
        }
        Ok(Some(row.get("stamp")))
    }

    async fn set_with_expiry(&self, document_id: &str, stamp: &str, ttl: Duration) -> Result<()> {
        let expires_at = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
        sqlx::query(
            r#"
            INSERT INTO sync_stamps (document_id, stamp, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                stamp = excluded.stamp,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(document_id)
        .bind(stamp)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, SqliteChunkStore, SqliteTimestampStore) {
        let tmp = TempDir::new().unwrap();
        let pool = connect(&tmp.path().join("engine.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (
            tmp,
            SqliteChunkStore::new(pool.clone()),
            SqliteTimestampStore::new(pool),
        )
    }

    fn record(id: &str, dense: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            text: format!("text of {id}"),
            dense,
            sparse: SparseVector::sentinel(),
            metadata: ChunkMetadata::new(),
        }
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let tmp = TempDir::new().unwrap();
        let pool = connect(&tmp.path().join("engine.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_get_round_trip() {
        let (_tmp, store, _) = open_store().await;
        let mut rec = record("doc-0", vec![0.6, 0.8]);
        rec.metadata.insert("title", "Runbook");
        store.upsert(rec.clone()).await.unwrap();

        let loaded = store.get("doc-0").await.unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert_eq!(store.get("doc-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_query_ranks_and_truncates() {
        let (_tmp, store, _) = open_store().await;
        store.upsert(record("a-0", vec![1.0, 0.0])).await.unwrap();
        store.upsert(record("b-0", vec![0.6, 0.8])).await.unwrap();
        store.upsert(record("c-0", vec![0.0, 1.0])).await.unwrap();

        let matches = store.query(&[1.0, 0.0], None, 2).await.unwrap();
        let ids: Vec<&str> = matches.iter().map(|m| m.record.id.as_str()).collect();
        assert_eq!(ids, vec!["a-0", "b-0"]);
    }

    #[tokio::test]
    async fn test_content_hash_stable_across_reupsert() {
        let (_tmp, store, _) = open_store().await;
        store.upsert(record("a-0", vec![1.0])).await.unwrap();
        let before = store.content_hash().await.unwrap();
        store.upsert(record("a-0", vec![1.0])).await.unwrap();
        assert_eq!(store.content_hash().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_stamp_expiry() {
        let (_tmp, _, stamps) = open_store().await;
        stamps
            .set_with_expiry("doc", "2026-01-01T00:00:00Z", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(
            stamps.get("doc").await.unwrap().as_deref(),
            Some("2026-01-01T00:00:00Z")
        );

        stamps
            .set_with_expiry("doc", "2026-01-01T00:00:00Z", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(stamps.get("doc").await.unwrap(), None);
    }
}
