//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`DisabledEmbedder`]** — returns errors; used when embeddings are
//!   not configured. Search degrades to its empty-result-with-error path.
//! - **[`HttpEmbedder`]** — calls a remote dense-embedding endpoint
//!   (OpenAI-style `POST /embeddings`) and a cross-encoder rerank endpoint
//!   (`POST /rerank`), with bounded retry and backoff. Sparse vectors are
//!   produced in-process by the BM25 [`LexicalModel`], fit over the corpus
//!   during a full rebuild.
//!
//! Dense vectors are unit-normalized after decode, so cosine similarity
//! downstream reduces to a dot product.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited, `Retry-After` honored) and 5xx → retry
//! - HTTP 4xx (not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - 3 attempts total, delays doubling from 1s

use std::sync::RwLock;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{classify_status, with_backoff, EngineError};
use crate::lexical::LexicalModel;
use crate::models::SparseVector;

/// Produces dense vectors, sparse lexical vectors, and pairwise relevance
/// scores. One instance is constructed at startup and shared by the
/// retrieval engine and the sync controller.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text into a unit-normalized dense vector.
    async fn embed_dense(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, preserving input order.
    async fn embed_dense_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Encode text into a sparse lexical vector. Never fails: an unfit
    /// lexical model yields the sentinel vector.
    fn embed_sparse(&self, text: &str) -> SparseVector;

    /// Score `(query, text)` relevance for each text, in `[0, 1]`,
    /// preserving input order.
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<f64>>;

    /// Fit the lexical model over the whole corpus's plain text. Must run
    /// before chunks are embedded in a full rebuild, so the term universe
    /// reflects the entire corpus.
    fn fit_lexical(&self, corpus: &[String]);
}

// ============ Disabled provider ============

/// A no-op embedder that always returns errors for model-backed calls.
///
/// Used when `embedding.provider = "disabled"`. Sparse encoding still
/// yields the sentinel so callers need no special casing.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    async fn embed_dense(&self, _text: &str) -> Result<Vec<f32>> {
        bail!("Embedding provider is disabled")
    }

    async fn embed_dense_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled")
    }

    fn embed_sparse(&self, _text: &str) -> SparseVector {
        SparseVector::sentinel()
    }

    async fn rerank(&self, _query: &str, _texts: &[String]) -> Result<Vec<f64>> {
        bail!("Embedding provider is disabled")
    }

    fn fit_lexical(&self, _corpus: &[String]) {}
}

// ============ HTTP provider ============

/// Embedder backed by remote HTTP endpoints plus an in-process BM25 model.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    rerank_endpoint: Option<String>,
    model: Option<String>,
    dims: usize,
    batch_size: usize,
    lexical: RwLock<LexicalModel>,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.endpoint required for http provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for http provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            rerank_endpoint: config.rerank_endpoint.clone(),
            model: config.model.clone(),
            dims,
            batch_size: config.batch_size.max(1),
            lexical: RwLock::new(LexicalModel::new()),
        })
    }

    async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, EngineError> {
        with_backoff(url, || async {
            let resp = self
                .client
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(|e| EngineError::transient(format!("request failed: {e}")))?;

            let status = resp.status();
            if status.is_success() {
                return resp
                    .json::<serde_json::Value>()
                    .await
                    .map_err(|e| EngineError::Permanent(format!("malformed response: {e}")));
            }

            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let preview: String = resp.text().await.unwrap_or_default().chars().take(300).collect();

            if status.as_u16() == 429 {
                Err(EngineError::rate_limited(
                    format!("HTTP 429: {preview}"),
                    retry_after,
                ))
            } else {
                Err(classify_status(status, &preview))
            }
        })
        .await
    }

    async fn embed_batch_inner(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut body = serde_json::json!({ "input": texts });
        if let Some(model) = &self.model {
            body["model"] = serde_json::Value::String(model.clone());
        }

        let json = self.post_json(&self.endpoint, &body).await?;
        let mut vectors = parse_embeddings_response(&json)?;

        for vec in &mut vectors {
            if vec.len() != self.dims {
                bail!(
                    "embedding dimensionality mismatch: expected {}, got {}",
                    self.dims,
                    vec.len()
                );
            }
            normalize(vec);
        }

        if vectors.len() != texts.len() {
            bail!(
                "embedding count mismatch: sent {}, received {}",
                texts.len(),
                vectors.len()
            );
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_dense(&self, text: &str) -> Result<Vec<f32>> {
        let batch = self.embed_dense_batch(&[text.to_string()]).await?;
        batch
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }

    async fn embed_dense_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            all.extend(self.embed_batch_inner(batch).await?);
        }
        Ok(all)
    }

    fn embed_sparse(&self, text: &str) -> SparseVector {
        self.lexical.read().unwrap().encode(text)
    }

    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<f64>> {
        let endpoint = self
            .rerank_endpoint
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("rerank endpoint not configured"))?;

        let body = serde_json::json!({ "query": query, "texts": texts });
        let json = self.post_json(endpoint, &body).await?;
        let scores = parse_rerank_response(&json)?;

        if scores.len() != texts.len() {
            bail!(
                "rerank score count mismatch: sent {}, received {}",
                texts.len(),
                scores.len()
            );
        }
        Ok(scores)
    }

    fn fit_lexical(&self, corpus: &[String]) {
        let mut model = self.lexical.write().unwrap();
        model.fit(corpus);
        tracing::info!(
            documents = corpus.len(),
            vocabulary = model.vocab_size(),
            "lexical model fitted"
        );
    }
}

/// Create the configured [`Embedder`].
pub fn create_embedder(config: &EmbeddingConfig) -> Result<std::sync::Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(std::sync::Arc::new(DisabledEmbedder)),
        "http" => Ok(std::sync::Arc::new(HttpEmbedder::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Scale a vector to unit length. Zero vectors are left untouched.
fn normalize(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Extract `data[].embedding` arrays from an OpenAI-style response.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

/// Extract relevance scores from a rerank response. Accepts either a flat
/// `{"scores": [...]}` shape or `{"results": [{"index": i, "score": s}]}`.
fn parse_rerank_response(json: &serde_json::Value) -> Result<Vec<f64>> {
    if let Some(scores) = json.get("scores").and_then(|s| s.as_array()) {
        return Ok(scores.iter().map(|v| v.as_f64().unwrap_or(0.0)).collect());
    }

    if let Some(results) = json.get("results").and_then(|r| r.as_array()) {
        let mut indexed: Vec<(usize, f64)> = results
            .iter()
            .map(|item| {
                let index = item.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
                let score = item.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0);
                (index, score)
            })
            .collect();
        indexed.sort_by_key(|(index, _)| *index);
        return Ok(indexed.into_iter().map(|(_, score)| score).collect());
    }

    bail!("Invalid rerank response: expected scores or results")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_unit_length() {
        let mut v = vec![3.0f32, 4.0];
        normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);

        let mut zero = vec![0.0f32, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_parse_embeddings_response() {
        let json = serde_json::json!({
            "data": [
                { "embedding": [1.0, 0.0] },
                { "embedding": [0.0, 1.0] },
            ]
        });
        let vectors = parse_embeddings_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);

        assert!(parse_embeddings_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_parse_rerank_flat_and_indexed() {
        let flat = serde_json::json!({ "scores": [0.9, 0.1] });
        assert_eq!(parse_rerank_response(&flat).unwrap(), vec![0.9, 0.1]);

        // Indexed results arrive sorted by score; output must be input order.
        let indexed = serde_json::json!({
            "results": [
                { "index": 1, "score": 0.8 },
                { "index": 0, "score": 0.2 },
            ]
        });
        assert_eq!(parse_rerank_response(&indexed).unwrap(), vec![0.2, 0.8]);
    }

    #[tokio::test]
    async fn test_disabled_embedder() {
        let embedder = DisabledEmbedder;
        assert!(embedder.embed_dense("x").await.is_err());
        assert!(embedder.rerank("q", &["x".to_string()]).await.is_err());
        assert!(embedder.embed_sparse("x").is_sentinel());
    }

    #[test]
    fn test_http_embedder_sparse_after_fit() {
        let config = EmbeddingConfig {
            provider: "http".to_string(),
            endpoint: Some("http://localhost:9000/embeddings".to_string()),
            dims: Some(4),
            ..Default::default()
        };
        let embedder = HttpEmbedder::new(&config).unwrap();
        assert!(embedder.embed_sparse("deployment").is_sentinel());

        embedder.fit_lexical(&["deployment pipeline notes".to_string()]);
        assert!(!embedder.embed_sparse("deployment").is_sentinel());
    }
}
