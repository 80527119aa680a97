//! # Context Engine
//!
//! A hybrid retrieval and incremental-sync engine for document Q&A corpora.
//!
//! Context Engine keeps a chunk index consistent with a periodically
//! changing document source and turns natural-language queries into
//! ranked, deduplicated, token-budgeted context passages. Ranking blends
//! dense similarity, lexical overlap, cross-encoder reranking, and title
//! heuristics; matched chunks are grouped by document and expanded with
//! adjacent chunks so answers keep their surrounding context.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────┐   ┌───────────┐
//! │  Source    │──▶│ SyncController    │──▶│ ChunkStore │
//! │ (wiki API) │   │ classify+reindex  │   │ SQLite/mem │
//! └────────────┘   └──────────────────┘   └─────┬─────┘
//!                                               │
//!                      ┌────────────────────────┤
//!                      ▼                        ▼
//!               ┌──────────────┐         ┌──────────┐
//!               │ Retrieval    │         │   CLI    │
//!               │ Engine       │         │  (ctxe)  │
//!               └──────────────┘         └──────────┘
//! ```
//!
//! The sync controller runs in a background task next to the foreground
//! retrieval engine; the chunk store and the sync-stamp map are the only
//! shared state. Every component behind a trait is constructed once at
//! startup and passed down as an `Arc` handle.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and the chunk id scheme |
//! | [`error`] | Transient/permanent taxonomy and bounded retry |
//! | [`source`] | Document source client and HTML conversion |
//! | [`chunk`] | Text chunking |
//! | [`lexical`] | BM25 lexical model behind sparse vectors |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Chunk and sync-stamp storage backends |
//! | [`search`] | The ranked retrieval pipeline |
//! | [`context`] | Token-budgeted context assembly |
//! | [`sync`] | Incremental sync controller and periodic loop |

pub mod chunk;
pub mod config;
pub mod context;
pub mod embedding;
pub mod error;
pub mod lexical;
pub mod models;
pub mod search;
pub mod source;
pub mod store;
pub mod sync;
