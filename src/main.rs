//! # Context Engine CLI (`ctxe`)
//!
//! The `ctxe` binary is the operational front end for the engine. It
//! provides commands for database initialization, full and incremental
//! indexing, the periodic sync loop, and search.
//!
//! ## Usage
//!
//! ```bash
//! ctxe --config ./config/ctxe.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ctxe init` | Create the SQLite database and run schema migrations |
//! | `ctxe index-all` | Full rebuild: fit the lexical model, index every document |
//! | `ctxe sync` | One incremental pass over new/changed documents |
//! | `ctxe watch` | Run the periodic sync loop until Ctrl-C |
//! | `ctxe search "<query>"` | Run the retrieval pipeline and print matches |
//!
//! ## Examples
//!
//! ```bash
//! # First-run bootstrap
//! ctxe init --config ./config/ctxe.toml
//! ctxe index-all --config ./config/ctxe.toml
//!
//! # Incremental sync, capped to 25 documents
//! ctxe sync --max-pages 25 --config ./config/ctxe.toml
//!
//! # Search with assembled context passages
//! ctxe search "how do I rotate the VPN certificates" --context
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use context_engine::config::{self, Config};
use context_engine::context;
use context_engine::embedding::{create_embedder, Embedder};
use context_engine::search::RetrievalEngine;
use context_engine::source::{SourceClient, WikiClient};
use context_engine::store::memory::{MemoryChunkStore, MemoryTimestampStore};
use context_engine::store::sqlite::{self, SqliteChunkStore, SqliteTimestampStore};
use context_engine::store::{ChunkStore, TimestampStore};
use context_engine::sync::SyncController;

/// Context Engine CLI — hybrid retrieval and incremental sync for
/// document Q&A corpora.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ctxe.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ctxe",
    about = "Context Engine — hybrid retrieval and incremental sync for document Q&A corpora",
    version,
    long_about = "Context Engine keeps a chunk index synchronized with a changing document \
    source and answers queries with ranked, deduplicated, token-budgeted context passages. \
    Ranking combines dense similarity, lexical overlap, cross-encoder reranking, and title \
    heuristics with document grouping and adaptive neighbor expansion."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ctxe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (chunks,
    /// sync_stamps). Idempotent — running it multiple times is safe.
    Init,

    /// Full rebuild of the index.
    ///
    /// Fits the lexical model over the entire corpus, then chunks, embeds,
    /// and upserts every document. Intended for first-run bootstrap;
    /// long-running on large corpora.
    IndexAll,

    /// One incremental sync pass.
    ///
    /// Enumerates the source, classifies each document as new, changed, or
    /// unchanged, and re-indexes only the first two. Prints the pass
    /// counters when done.
    Sync {
        /// Maximum number of documents to examine in this pass.
        #[arg(long)]
        max_pages: Option<usize>,
    },

    /// Run the periodic sync loop until Ctrl-C.
    ///
    /// Repeats the incremental pass at the configured interval. A failed
    /// cycle is logged and the loop continues; an in-flight document
    /// update always completes before shutdown.
    Watch,

    /// Search indexed documents.
    ///
    /// Runs the full retrieval pipeline and prints ranked matches with
    /// scores and excerpts.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of matches to print.
        #[arg(long)]
        limit: Option<usize>,

        /// Also print the token-budgeted context passages.
        #[arg(long)]
        context: bool,
    },
}

struct Components {
    store: Arc<dyn ChunkStore>,
    stamps: Arc<dyn TimestampStore>,
    embedder: Arc<dyn Embedder>,
}

async fn build_components(cfg: &Config) -> Result<Components> {
    let (store, stamps): (Arc<dyn ChunkStore>, Arc<dyn TimestampStore>) =
        match cfg.store.backend.as_str() {
            "memory" => (
                Arc::new(MemoryChunkStore::new()),
                Arc::new(MemoryTimestampStore::new()),
            ),
            _ => {
                let path = cfg
                    .store
                    .path
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("store.path required for sqlite backend"))?;
                let pool = sqlite::connect(path).await?;
                sqlite::run_migrations(&pool).await?;
                (
                    Arc::new(SqliteChunkStore::new(pool.clone())),
                    Arc::new(SqliteTimestampStore::new(pool)),
                )
            }
        };

    let embedder = create_embedder(&cfg.embedding)?;

    Ok(Components {
        store,
        stamps,
        embedder,
    })
}

fn build_source(cfg: &Config) -> Result<Arc<dyn SourceClient>> {
    Ok(Arc::new(WikiClient::new(&cfg.source)?))
}

fn build_controller(cfg: &Config, components: &Components) -> Result<SyncController> {
    Ok(SyncController::new(
        build_source(cfg)?,
        components.store.clone(),
        components.stamps.clone(),
        components.embedder.clone(),
        cfg.chunking.clone(),
        cfg.sync.clone(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            match cfg.store.backend.as_str() {
                "memory" => println!("Memory backend needs no initialization."),
                _ => {
                    let path = cfg
                        .store
                        .path
                        .as_ref()
                        .ok_or_else(|| anyhow::anyhow!("store.path required for sqlite backend"))?;
                    let pool = sqlite::connect(path).await?;
                    sqlite::run_migrations(&pool).await?;
                    pool.close().await;
                    println!("Database initialized successfully.");
                }
            }
        }
        Commands::IndexAll => {
            let components = build_components(&cfg).await?;
            let controller = build_controller(&cfg, &components)?;
            controller.index_all().await?;
            println!("index-all");
            println!("  chunks stored: {}", components.store.count().await?);
            println!("ok");
        }
        Commands::Sync { max_pages } => {
            let components = build_components(&cfg).await?;
            let controller = build_controller(&cfg, &components)?;
            let report = controller.sync_changed(max_pages).await;
            println!("sync");
            println!("  checked: {}", report.checked);
            println!("  updated: {}", report.updated);
            println!("  new: {}", report.new);
            println!("  errors: {}", report.errors);
            println!("ok");
        }
        Commands::Watch => {
            let components = build_components(&cfg).await?;
            let controller = Arc::new(build_controller(&cfg, &components)?);

            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let task = tokio::spawn({
                let controller = controller.clone();
                async move { controller.run_periodic(shutdown_rx).await }
            });

            tokio::signal::ctrl_c().await?;
            let _ = shutdown_tx.send(true);
            task.await?;
        }
        Commands::Search {
            query,
            limit,
            context: with_context,
        } => {
            let components = build_components(&cfg).await?;
            let engine = RetrievalEngine::new(
                components.store.clone(),
                components.embedder.clone(),
                cfg.retrieval.clone(),
            );

            let response = engine.search(&query).await;
            if let Some(error) = &response.error {
                println!("search failed: {error}");
                return Ok(());
            }
            if response.matches.is_empty() {
                println!("No results.");
                return Ok(());
            }

            let shown = limit.unwrap_or(response.matches.len());
            for (i, m) in response.matches.iter().take(shown).enumerate() {
                let title = m.metadata.title().unwrap_or("(untitled)");
                let display_score = m.rerank_score.unwrap_or(m.score);
                println!("{}. [{:.2}] {}", i + 1, display_score, title);
                println!("    id: {}", m.id);
                if let Some(url) = m.metadata.url() {
                    println!("    url: {url}");
                }
                let excerpt: String = m.text.chars().take(200).collect();
                println!("    excerpt: \"{}\"", excerpt.replace('\n', " "));
                println!();
            }

            if with_context {
                let passages =
                    context::assemble(&response.matches, cfg.retrieval.max_context_tokens);
                println!("context passages: {}", passages.len());
                for passage in &passages {
                    println!("--- {} [{}]", passage.title, passage.document_id);
                    println!("{}", passage.text);
                    println!();
                }
            }
        }
    }

    Ok(())
}
