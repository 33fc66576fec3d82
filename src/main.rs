//! # rag-context CLI (`ragctx`)
//!
//! Operator interface to the retrieval subsystem: manage collections and
//! documents, run searches, assemble prompt context and maintain indexes.
//!
//! ## Usage
//!
//! ```bash
//! ragctx --config ./config/ragctx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragctx init` | Create the SQLite database and run schema migrations |
//! | `ragctx collection create\|list\|delete` | Manage collections |
//! | `ragctx ingest <collection> <file>` | Chunk, embed and index a UTF-8 file |
//! | `ragctx doc <action>` | Document lifecycle (move, archive, reprocess, ...) |
//! | `ragctx search "<query>"` | Semantic search across collections |
//! | `ragctx context "<query>"` | Assemble budgeted prompt context |
//! | `ragctx maintain <action>` | Orphan cleanup, collection recovery, index rebuild |
//! | `ragctx embed warm\|info` | Embedding provider warm-up and status |
//! | `ragctx stats` | Per-collection storage and index overview |

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use rag_context::config;

/// rag-context CLI: per-collection semantic retrieval and budgeted context
/// assembly.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ragctx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ragctx",
    about = "Per-collection semantic retrieval and budgeted context assembly",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragctx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage collections.
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Ingest a UTF-8 text file into a collection.
    ///
    /// Identical content already present in the collection is not stored
    /// twice; the existing document id is reported instead.
    Ingest {
        /// Target collection id.
        collection: i64,
        /// File to read.
        file: PathBuf,
        /// Display name (defaults to the file name).
        #[arg(long)]
        name: Option<String>,
    },

    /// Document lifecycle operations.
    Doc {
        #[command(subcommand)]
        action: DocAction,
    },

    /// Search one or more collections.
    Search {
        /// The search query string.
        query: String,

        /// Collection id to search. Repeat for several collections.
        #[arg(long = "collection", required = true)]
        collections: Vec<i64>,

        /// Hits per collection (defaults to `[retrieval] top_k`).
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Assemble prompt context from topics and retrieval hits.
    Context {
        /// The query used for retrieval.
        query: String,

        /// Collection id to search. Repeat for several collections.
        #[arg(long = "collection")]
        collections: Vec<i64>,

        /// Matched topic name. Repeat for several topics.
        #[arg(long = "topic")]
        topics: Vec<String>,
    },

    /// Repair and maintenance.
    Maintain {
        #[command(subcommand)]
        action: MaintainAction,
    },

    /// Embedding provider management.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Show per-collection statistics.
    Stats,
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Create a collection.
    Create {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List collections.
    List,
    /// Delete a collection with all its documents and index files.
    Delete { id: i64 },
}

#[derive(Subcommand)]
enum DocAction {
    /// List documents in a collection.
    List {
        collection: i64,
        /// Include archived documents.
        #[arg(long)]
        all: bool,
    },
    /// Show a document's metadata and chunks.
    Show { id: i64 },
    /// Change a document's display name.
    Rename { id: i64, name: String },
    /// Move a document to another collection.
    Move { id: i64, collection: i64 },
    /// Copy a document into another collection.
    Duplicate { id: i64, collection: i64 },
    /// Re-chunk and re-embed a document from its stored text.
    Reprocess {
        id: i64,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        chunk_overlap: Option<usize>,
    },
    /// Hide a document from search, or restore it with `--undo`.
    Archive {
        id: i64,
        #[arg(long)]
        undo: bool,
    },
    /// Delete a document and its chunks.
    Delete { id: i64 },
}

#[derive(Subcommand)]
enum MaintainAction {
    /// Remove chunks whose document no longer exists.
    Orphans,
    /// Recreate collections that documents still reference.
    Recover,
    /// Rebuild one collection's index from storage.
    Rebuild { collection: i64 },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Load the embedding model and wait for it to become ready.
    Warm,
    /// Print the provider's identity and readiness.
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    rag_context::logger::init(&cfg.logging.level)?;

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Collection { action } => match action {
            CollectionAction::Create { name, description } => {
                commands::run_collection_create(&cfg, &name, &description).await?
            }
            CollectionAction::List => commands::run_collection_list(&cfg).await?,
            CollectionAction::Delete { id } => commands::run_collection_delete(&cfg, id).await?,
        },
        Commands::Ingest {
            collection,
            file,
            name,
        } => commands::run_ingest(&cfg, collection, &file, name.as_deref()).await?,
        Commands::Doc { action } => match action {
            DocAction::List { collection, all } => {
                commands::run_doc_list(&cfg, collection, all).await?
            }
            DocAction::Show { id } => commands::run_doc_show(&cfg, id).await?,
            DocAction::Rename { id, name } => commands::run_doc_rename(&cfg, id, &name).await?,
            DocAction::Move { id, collection } => {
                commands::run_doc_move(&cfg, id, collection).await?
            }
            DocAction::Duplicate { id, collection } => {
                commands::run_doc_duplicate(&cfg, id, collection).await?
            }
            DocAction::Reprocess {
                id,
                chunk_size,
                chunk_overlap,
            } => commands::run_doc_reprocess(&cfg, id, chunk_size, chunk_overlap).await?,
            DocAction::Archive { id, undo } => commands::run_doc_archive(&cfg, id, !undo).await?,
            DocAction::Delete { id } => commands::run_doc_delete(&cfg, id).await?,
        },
        Commands::Search {
            query,
            collections,
            top_k,
        } => commands::run_search(&cfg, &query, &collections, top_k).await?,
        Commands::Context {
            query,
            collections,
            topics,
        } => commands::run_context(&cfg, &query, &collections, &topics).await?,
        Commands::Maintain { action } => match action {
            MaintainAction::Orphans => commands::run_maintain_orphans(&cfg).await?,
            MaintainAction::Recover => commands::run_maintain_recover(&cfg).await?,
            MaintainAction::Rebuild { collection } => {
                commands::run_maintain_rebuild(&cfg, collection).await?
            }
        },
        Commands::Embed { action } => match action {
            EmbedAction::Warm => commands::run_embed_warm(&cfg).await?,
            EmbedAction::Info => commands::run_embed_info(&cfg).await?,
        },
        Commands::Stats => commands::run_stats(&cfg).await?,
    }

    Ok(())
}
