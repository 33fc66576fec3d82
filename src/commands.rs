//! Command handlers for the `ragctx` binary.
//!
//! Each handler opens the engine from config, performs one operation and
//! prints a short human-readable summary to stdout.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use rag_context::config::Config;
use rag_context::context::assemble_context;
use rag_context::embedding::warmup::WarmupState;
use rag_context::embedding::EmbeddingProvider;
use rag_context::models::{CollectionId, DocumentId};
use rag_context::stats;
use rag_context::topics::{DirTopicSource, MapTopicSource, TopicSource};
use rag_context::RetrievalEngine;

async fn open(config: &Config) -> Result<RetrievalEngine> {
    RetrievalEngine::open(config)
        .await
        .with_context(|| format!("failed to open database {}", config.db.path.display()))
}

fn collection_ids(ids: &[i64]) -> Vec<CollectionId> {
    ids.iter().map(|&id| CollectionId(id)).collect()
}

pub async fn run_init(config: &Config) -> Result<()> {
    open(config).await?;
    println!("Database initialized at {}", config.db.path.display());
    Ok(())
}

// ============ Collections ============

pub async fn run_collection_create(config: &Config, name: &str, description: &str) -> Result<()> {
    let engine = open(config).await?;
    let collection = engine.create_collection(name, description).await?;
    println!("Created collection {} ({})", collection.id, collection.name);
    Ok(())
}

pub async fn run_collection_list(config: &Config) -> Result<()> {
    let engine = open(config).await?;
    let collections = engine.list_collections().await?;
    if collections.is_empty() {
        println!("No collections.");
        return Ok(());
    }
    println!("{:>4}  {:<24} DESCRIPTION", "ID", "NAME");
    for c in collections {
        println!("{:>4}  {:<24} {}", c.id, c.name, c.description);
    }
    Ok(())
}

pub async fn run_collection_delete(config: &Config, id: i64) -> Result<()> {
    let engine = open(config).await?;
    let docs = engine.delete_collection(CollectionId(id)).await?;
    println!("Deleted collection {} ({} documents)", id, docs);
    Ok(())
}

// ============ Ingest & documents ============

pub async fn run_ingest(
    config: &Config,
    collection: i64,
    file: &Path,
    name: Option<&str>,
) -> Result<()> {
    let engine = open(config).await?;
    let collection = CollectionId(collection);
    let id = match name {
        Some(name) => {
            let text = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            engine.add_document(collection, name, &text).await?
        }
        None => engine.ingest_file(collection, file).await?,
    };
    let chunks = engine.document_chunks(id).await?.len();
    println!("Document {} in collection {} ({} chunks)", id, collection, chunks);
    Ok(())
}

pub async fn run_doc_list(config: &Config, collection: i64, include_archived: bool) -> Result<()> {
    let engine = open(config).await?;
    let docs = engine
        .list_documents(CollectionId(collection), include_archived)
        .await?;
    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    println!("{:>6}  {:<32} {:>8} {:>6}  FLAGS", "ID", "NAME", "BYTES", "CHUNKS");
    for d in docs {
        println!(
            "{:>6}  {:<32} {:>8} {:>6}  {}",
            d.id,
            d.display_name,
            d.byte_size,
            d.chunk_count,
            if d.archived { "archived" } else { "" }
        );
    }
    Ok(())
}

pub async fn run_doc_show(config: &Config, id: i64) -> Result<()> {
    let engine = open(config).await?;
    let id = DocumentId(id);
    let Some(doc) = engine.get_document(id).await? else {
        bail!("document not found: {}", id);
    };
    let chunks = engine.document_chunks(id).await?;

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("collection:   {}", doc.collection_id);
    println!("name:         {}", doc.display_name);
    println!("original:     {}", doc.original_name);
    println!("hash:         {}", doc.content_hash);
    println!("bytes:        {}", doc.byte_size);
    println!("archived:     {}", doc.archived);
    println!();
    println!("--- Chunks ({}) ---", chunks.len());
    for c in chunks {
        println!("[{}] {}", c.chunk_index, c.text);
    }
    Ok(())
}

pub async fn run_doc_rename(config: &Config, id: i64, name: &str) -> Result<()> {
    let engine = open(config).await?;
    engine.rename_document(DocumentId(id), name).await?;
    println!("Renamed document {} to {}", id, name);
    Ok(())
}

pub async fn run_doc_move(config: &Config, id: i64, collection: i64) -> Result<()> {
    let engine = open(config).await?;
    engine
        .move_document(DocumentId(id), CollectionId(collection))
        .await?;
    println!("Moved document {} to collection {}", id, collection);
    Ok(())
}

pub async fn run_doc_duplicate(config: &Config, id: i64, collection: i64) -> Result<()> {
    let engine = open(config).await?;
    let copy = engine
        .duplicate_document(DocumentId(id), CollectionId(collection))
        .await?;
    println!("Document {} copied to collection {} as {}", id, collection, copy);
    Ok(())
}

pub async fn run_doc_reprocess(
    config: &Config,
    id: i64,
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
) -> Result<()> {
    let engine = open(config).await?;
    let chunks = engine
        .reprocess_document(DocumentId(id), chunk_size, chunk_overlap)
        .await?;
    println!("Reprocessed document {} ({} chunks)", id, chunks);
    Ok(())
}

pub async fn run_doc_archive(config: &Config, id: i64, archived: bool) -> Result<()> {
    let engine = open(config).await?;
    engine.set_archived(DocumentId(id), archived).await?;
    if archived {
        println!("Archived document {}", id);
    } else {
        println!("Restored document {}", id);
    }
    Ok(())
}

pub async fn run_doc_delete(config: &Config, id: i64) -> Result<()> {
    let engine = open(config).await?;
    engine.delete_document(DocumentId(id)).await?;
    println!("Deleted document {}", id);
    Ok(())
}

// ============ Retrieval ============

pub async fn run_search(
    config: &Config,
    query: &str,
    collections: &[i64],
    top_k: Option<usize>,
) -> Result<()> {
    let engine = open(config).await?;
    let top_k = top_k.unwrap_or(engine.default_top_k());
    let hits = engine
        .search(query, &collection_ids(collections), top_k)
        .await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} (collection {}, document {})",
            i + 1,
            hit.score,
            hit.document_name,
            hit.collection_id,
            hit.document_id
        );
        println!("   {}", hit.text.replace('\n', " "));
    }
    Ok(())
}

pub async fn run_context(
    config: &Config,
    query: &str,
    collections: &[i64],
    topics: &[String],
) -> Result<()> {
    let engine = open(config).await?;
    let source: Box<dyn TopicSource> = match &config.topics.dir {
        Some(dir) => Box::new(DirTopicSource::new(dir)),
        None => Box::new(MapTopicSource::new()),
    };
    let text = assemble_context(
        &engine,
        source.as_ref(),
        query,
        topics,
        &collection_ids(collections),
        &config.context,
    )
    .await;
    println!("{}", text);
    Ok(())
}

// ============ Maintenance ============

pub async fn run_maintain_orphans(config: &Config) -> Result<()> {
    let engine = open(config).await?;
    let removed = engine.delete_orphan_chunks().await?;
    println!("Removed {} orphan chunks", removed);
    Ok(())
}

pub async fn run_maintain_recover(config: &Config) -> Result<()> {
    let engine = open(config).await?;
    let recovered = engine.recover_missing_collections().await?;
    if recovered.is_empty() {
        println!("No missing collections.");
    }
    for c in recovered {
        println!("Recreated collection {} ({})", c.id, c.name);
    }
    Ok(())
}

pub async fn run_maintain_rebuild(config: &Config, collection: i64) -> Result<()> {
    let engine = open(config).await?;
    let vectors = engine.rebuild_index(CollectionId(collection)).await?;
    println!("Rebuilt index for collection {} ({} vectors)", collection, vectors);
    Ok(())
}

// ============ Embedding ============

pub async fn run_embed_warm(config: &Config) -> Result<()> {
    let engine = open(config).await?;
    let id = engine.start_warmup();
    let Some(status) = engine.warmups().wait(&id, Duration::from_millis(200)).await else {
        bail!("warm-up task {} disappeared", id);
    };
    match status.state {
        WarmupState::Completed => {
            let info = engine.provider().info();
            println!("Provider {} ready ({}, {} dims)", info.kind, info.model_id, info.dimension);
            Ok(())
        }
        _ => bail!(
            "warm-up failed: {}",
            status.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

pub async fn run_embed_info(config: &Config) -> Result<()> {
    let engine = open(config).await?;
    let info = engine.provider().info();
    println!("provider:   {}", info.kind);
    println!("model:      {}", info.model_id);
    println!("dimension:  {}", info.dimension);
    println!("ready:      {}", info.ready);
    Ok(())
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let engine = open(config).await?;
    let stats = stats::collect_stats(&engine).await?;
    stats::print_stats(&stats, &config.db.path);
    Ok(())
}
