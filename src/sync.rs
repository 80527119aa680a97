//! Incremental synchronization controller.
//!
//! Keeps the chunk store consistent with the source corpus without full
//! reprocessing. Change detection compares the source's last-modified
//! timestamp against a persisted last-successful-sync stamp:
//!
//! - no stored stamp → **new**
//! - source stamp strictly newer → **changed**
//! - otherwise → **unchanged**, skipped
//!
//! A timestamp that fails to parse classifies the document as new — a
//! spurious re-index is safe, a silently skipped update is not. Stamps
//! are written with a bounded TTL after each successful per-document
//! index, so stale records self-heal if the stamp store is wiped.
//!
//! One bad document never aborts a batch: per-document failures are
//! counted in [`SyncReport::errors`] and retried on the next cycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use tokio::sync::watch;

use crate::chunk::split_text;
use crate::config::{ChunkingConfig, SyncConfig};
use crate::embedding::Embedder;
use crate::models::{ChunkId, ChunkMetadata, ChunkRecord, DocumentSummary, SyncReport};
use crate::source::{html_to_text, SourceClient};
use crate::store::{ChunkStore, TimestampStore};

/// Per-document change classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    Changed,
    Unchanged,
}

/// The write path: enumerates the source, classifies each document, and
/// (re)indexes the ones that need it. The only writer of the chunk store
/// and the stamp store.
pub struct SyncController {
    source: Arc<dyn SourceClient>,
    store: Arc<dyn ChunkStore>,
    stamps: Arc<dyn TimestampStore>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    params: SyncConfig,
}

impl SyncController {
    pub fn new(
        source: Arc<dyn SourceClient>,
        store: Arc<dyn ChunkStore>,
        stamps: Arc<dyn TimestampStore>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkingConfig,
        params: SyncConfig,
    ) -> Self {
        Self {
            source,
            store,
            stamps,
            embedder,
            chunking,
            params,
        }
    }

    /// Classify one document against its stored sync stamp.
    pub async fn classify(&self, document_id: &str) -> Result<ChangeKind> {
        let Some(stored) = self.stamps.get(document_id).await? else {
            return Ok(ChangeKind::New);
        };

        let source_stamp = self.source.last_modified(document_id).await?;
        let Some(source_ts) = parse_timestamp(&source_stamp) else {
            tracing::warn!(document_id, stamp = %source_stamp, "unparseable source timestamp, treating as new");
            return Ok(ChangeKind::New);
        };
        let Some(stored_ts) = parse_timestamp(&stored) else {
            tracing::warn!(document_id, stamp = %stored, "unparseable stored stamp, treating as new");
            return Ok(ChangeKind::New);
        };

        if source_ts > stored_ts {
            Ok(ChangeKind::Changed)
        } else {
            Ok(ChangeKind::Unchanged)
        }
    }

    /// One incremental pass: check every enumerated document (capped to
    /// `max_pages`), re-index the new/changed ones. Never fails as a
    /// whole; everything that goes wrong lands in the `errors` counter.
    pub async fn sync_changed(&self, max_pages: Option<usize>) -> SyncReport {
        let mut report = SyncReport::default();

        let mut documents = match self.source.list_documents().await {
            Ok(docs) => docs,
            Err(e) => {
                tracing::error!(error = %e, "document enumeration failed");
                report.errors += 1;
                return report;
            }
        };

        if let Some(cap) = max_pages.or(self.params.max_pages_per_cycle) {
            documents.truncate(cap);
        }

        for doc in &documents {
            report.checked += 1;

            let kind = match self.classify(&doc.id).await {
                Ok(kind) => kind,
                Err(e) => {
                    tracing::warn!(document_id = %doc.id, error = %e, "classification failed, skipping");
                    report.errors += 1;
                    continue;
                }
            };

            match kind {
                ChangeKind::Unchanged => continue,
                ChangeKind::New => {
                    tracing::info!(document_id = %doc.id, title = %doc.title, "new document");
                    report.new += 1;
                }
                ChangeKind::Changed => {
                    tracing::info!(document_id = %doc.id, title = %doc.title, "changed document");
                }
            }

            match self.index_document(doc).await {
                Ok(chunks) if chunks > 0 => report.updated += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(document_id = %doc.id, error = %e, "index failed, skipping");
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            checked = report.checked,
            updated = report.updated,
            new = report.new,
            errors = report.errors,
            "sync pass complete"
        );
        report
    }

    /// Fetch and re-index a single document.
    pub async fn index_document(&self, doc: &DocumentSummary) -> Result<usize> {
        let content = self.source.fetch_document(&doc.id).await?;
        let text = html_to_text(&content.body_html);
        self.index_text(&doc.id, &text, &content.metadata).await
    }

    /// Full rebuild: fit the lexical model over the entire corpus's plain
    /// text, then index every document. The pre-fit must cover the whole
    /// corpus before any chunk is embedded, otherwise early documents get
    /// sparse vectors from a partial term universe.
    pub async fn index_all(&self) -> Result<()> {
        let documents = self.source.list_documents().await?;
        let total = documents.len();
        tracing::info!(total, "full rebuild started");

        let mut cache: HashMap<String, (String, ChunkMetadata)> = HashMap::new();
        let mut corpus: Vec<String> = Vec::new();

        for (i, doc) in documents.iter().enumerate() {
            match self.source.fetch_document(&doc.id).await {
                Ok(content) => {
                    let text = html_to_text(&content.body_html);
                    if !text.trim().is_empty() {
                        corpus.push(text.clone());
                        cache.insert(doc.id.clone(), (text, content.metadata));
                    }
                }
                Err(e) => {
                    tracing::warn!(document_id = %doc.id, error = %e, "fetch failed, skipping");
                }
            }
            if (i + 1) % 100 == 0 || i + 1 == total {
                tracing::info!(fetched = i + 1, total, "corpus collection progress");
            }
        }

        self.embedder.fit_lexical(&corpus);

        let mut indexed = 0usize;
        for doc in &documents {
            let Some((text, metadata)) = cache.get(&doc.id) else {
                continue;
            };
            match self.index_text(&doc.id, text, metadata).await {
                Ok(_) => indexed += 1,
                Err(e) => {
                    tracing::warn!(document_id = %doc.id, error = %e, "index failed, skipping");
                }
            }
        }

        tracing::info!(indexed, total, "full rebuild complete");
        Ok(())
    }

    /// Chunk, embed, and upsert one document's text, then persist its
    /// sync stamp. Returns the number of chunks written; zero means the
    /// document was empty and nothing (including the stamp) was written.
    async fn index_text(
        &self,
        document_id: &str,
        text: &str,
        document_metadata: &ChunkMetadata,
    ) -> Result<usize> {
        let pieces = split_text(text, self.chunking.max_tokens);
        if pieces.is_empty() {
            tracing::warn!(document_id, "document has no indexable text");
            return Ok(0);
        }

        let dense_vectors = self.embedder.embed_dense_batch(&pieces).await?;
        let total_chunks = pieces.len();

        for (index, (piece, dense)) in pieces.iter().zip(dense_vectors).enumerate() {
            let sparse = self.embedder.embed_sparse(piece);
            let id = ChunkId::new(document_id, index as u32);

            let mut metadata = document_metadata.clone();
            metadata.insert("chunk_index", index as u32);
            metadata.insert("total_chunks", total_chunks as i64);

            self.store
                .upsert(ChunkRecord {
                    id: id.to_string(),
                    text: piece.clone(),
                    dense,
                    sparse,
                    metadata,
                })
                .await?;
        }

        // TODO: prune chunks with index >= total_chunks that a previous,
        // longer version of this document left behind.

        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        self.stamps
            .set_with_expiry(
                document_id,
                &stamp,
                Duration::from_secs(self.params.stamp_ttl_secs),
            )
            .await?;

        tracing::debug!(document_id, chunks = total_chunks, "document indexed");
        Ok(total_chunks)
    }

    /// Run `sync_changed` on a fixed interval until `shutdown` flips to
    /// true. The signal is observed at iteration boundaries only, so an
    /// in-flight document update always completes. A failed cycle is
    /// logged and the loop continues at the same cadence.
    pub async fn run_periodic(&self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.params.interval_secs);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_secs = self.params.interval_secs, "periodic sync started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sync_changed(None).await;
                    if report.updated > 0 {
                        tracing::info!(updated = report.updated, checked = report.checked, "cycle updated documents");
                    } else {
                        tracing::info!(checked = report.checked, "cycle found no changes");
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        tracing::info!("periodic sync stopping");
                        return;
                    }
                }
            }
        }
    }
}

/// Parse a source or stored timestamp with one robust parser: RFC 3339
/// first, then the legacy `%Y-%m-%dT%H:%M:%S%.f%z` shape (numeric zone
/// without a colon). Returns `None` for anything else.
pub fn parse_timestamp(value: &str) -> Option<DateTime<FixedOffset>> {
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .or_else(|| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z").ok())
}
