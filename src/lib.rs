//! # rag-context
//!
//! Per-collection semantic retrieval and budgeted context assembly for
//! language-model prompts.
//!
//! Documents are grouped into isolated collections. Each document is split
//! into overlapping chunks, embedded, and stored in SQLite; each collection
//! gets its own HNSW index, cached on disk and rebuilt whenever the set of
//! live chunks changes. At query time the engine searches any number of
//! collections and the context assembler merges the hits with rule-matched
//! topic snippets into one string under a fixed character budget.
//!
//! ## Architecture
//!
//! ```text
//!  ingest:  text ──▶ chunk ──▶ embedding ──▶ store (SQLite) ──▶ index rebuild
//!
//!  query:   text ──▶ embedding ──▶ index search ──▶ hydrate ──▶ Hit list
//!                                                                  │
//!           topic names ──▶ TopicSource ─────────────────▶ context::assemble
//!                                                                  │
//!                                                         bounded context string
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ragctx init
//! ragctx collection create handbook
//! ragctx ingest 1 ./docs/returns.md
//! ragctx search "refund window" --collection 1
//! ragctx context "refund window" --collection 1 --topic "return policy"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Library error type |
//! | [`models`] | Collections, documents, chunks, hits |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`chunk`] | Recursive separator chunker |
//! | [`embedding`] | Embedding providers and warm-up tasks |
//! | [`store`] | Persistence and lifecycle queries |
//! | [`index`] | Per-collection HNSW indexes |
//! | [`engine`] | Ingest and document lifecycle |
//! | [`search`] | Cross-collection search |
//! | [`topics`] | Topic snippet sources |
//! | [`context`] | Budgeted context assembly |
//! | [`stats`] | Storage and index overview |
//! | [`logger`] | tracing subscriber setup |

pub mod chunk;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod logger;
pub mod migrate;
pub mod models;
pub mod search;
pub mod stats;
pub mod store;
pub mod topics;

pub use engine::RetrievalEngine;
pub use error::{RagError, Result};
