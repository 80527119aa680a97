use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Storage backend: `sqlite` (persistent) or `memory` (ephemeral).
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Database file path; required for the sqlite backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_backend() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Base URL of the document source REST API.
    #[serde(default)]
    pub base_url: String,
    /// Space/collection key to enumerate.
    #[serde(default)]
    pub space: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            space: String::new(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_page_size() -> usize {
    100
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `http` (remote dense + rerank endpoints) or `disabled`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Dense embedding endpoint (OpenAI-style `POST /embeddings`).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Cross-encoder endpoint (`POST /rerank`). Rerank degrades to
    /// score-order fallback when absent or unreachable.
    #[serde(default)]
    pub rerank_endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            endpoint: None,
            rerank_endpoint: None,
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Top-K retained from candidate retrieval; the store is asked for
    /// `3 × n_results` nearest chunks.
    #[serde(default = "default_n_results")]
    pub n_results: usize,
    /// Final result-set size after neighbor expansion.
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: usize,
    /// Candidates scoring below this after rerank are dropped.
    #[serde(default = "default_min_rerank_score")]
    pub min_rerank_score: f64,
    /// Score multiplier inherited by neighbor-expanded chunks.
    #[serde(default = "default_neighbor_score_factor")]
    pub neighbor_score_factor: f64,
    /// Exact-terminology words that trigger the title boost on a single
    /// overlap (product names, internal jargon).
    #[serde(default)]
    pub domain_terms: Vec<String>,
    /// Token budget for assembled context passages.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            n_results: default_n_results(),
            rerank_top_k: default_rerank_top_k(),
            min_rerank_score: default_min_rerank_score(),
            neighbor_score_factor: default_neighbor_score_factor(),
            domain_terms: Vec::new(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

fn default_n_results() -> usize {
    20
}
fn default_rerank_top_k() -> usize {
    10
}
fn default_min_rerank_score() -> f64 {
    0.3
}
fn default_neighbor_score_factor() -> f64 {
    0.8
}
fn default_max_context_tokens() -> usize {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Seconds between periodic sync cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Cap on documents examined per cycle; unset checks the whole corpus.
    #[serde(default = "default_max_pages")]
    pub max_pages_per_cycle: Option<usize>,
    /// Sync-stamp time-to-live; expired stamps self-heal as "new".
    #[serde(default = "default_stamp_ttl_secs")]
    pub stamp_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_pages_per_cycle: default_max_pages(),
            stamp_ttl_secs: default_stamp_ttl_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    300
}
fn default_max_pages() -> Option<usize> {
    Some(50)
}
fn default_stamp_ttl_secs() -> u64 {
    60 * 60 * 24 * 30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.store.backend.as_str() {
        "sqlite" => {
            if config.store.path.is_none() {
                anyhow::bail!("store.path is required for the sqlite backend");
            }
        }
        "memory" => {}
        other => anyhow::bail!("Unknown store backend: '{}'. Use sqlite or memory.", other),
    }

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if config.retrieval.n_results == 0 {
        anyhow::bail!("retrieval.n_results must be >= 1");
    }
    if config.retrieval.rerank_top_k == 0 {
        anyhow::bail!("retrieval.rerank_top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.min_rerank_score) {
        anyhow::bail!("retrieval.min_rerank_score must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.retrieval.neighbor_score_factor) {
        anyhow::bail!("retrieval.neighbor_score_factor must be in [0.0, 1.0]");
    }

    match config.embedding.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.embedding.endpoint.is_none() {
                anyhow::bail!("embedding.endpoint must be set when provider is 'http'");
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0 when provider is 'http'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    if config.sync.interval_secs == 0 {
        anyhow::bail!("sync.interval_secs must be > 0");
    }

    Ok(())
}
